//! Minimal element tree over xml-rs, plus the value encodings KeePass uses
//!
//! KeePass documents never mix text and child elements, so an element holds
//! either text or children. The tree is built and emitted in document order,
//! which keeps inner-stream masking aligned between reader and writer.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use std::io::Write;
use uuid::Uuid;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    /// Append `<name>text</name>`
    pub fn push_text(&mut self, name: &str, text: impl Into<String>) {
        self.children.push(Self::with_text(name, text));
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Parse a complete document and return its root element
    pub fn parse(data: &[u8]) -> Result<Self> {
        let config = ParserConfig::new()
            .trim_whitespace(false)
            .whitespace_to_characters(true)
            .cdata_to_characters(true)
            .ignore_comments(true);
        let reader = EventReader::new_with_config(data, config);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root = None;
        for event in reader {
            match event? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    let mut element = XmlElement::new(name.local_name);
                    element.attributes = attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect();
                    stack.push(element);
                }
                XmlEvent::Characters(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                XmlEvent::EndElement { .. } => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| Error::MalformedXml("unbalanced end tag".to_string()))?;
                    if !element.children.is_empty() && element.text.trim().is_empty() {
                        element.text.clear();
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                _ => {}
            }
        }

        root.ok_or_else(|| Error::MalformedXml("document has no root element".to_string()))
    }

    /// Serialize as an indented UTF-8 document with an XML declaration
    pub fn write_document(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut writer = EmitterConfig::new()
            .perform_indent(true)
            .indent_string("\t")
            .create_writer(&mut out);
        writer.write(WriterEvent::StartDocument {
            version: xml::common::XmlVersion::Version10,
            encoding: Some("utf-8"),
            standalone: Some(true),
        })?;
        self.write_to(&mut writer)?;
        drop(writer);
        Ok(out)
    }

    fn write_to<W: Write>(&self, writer: &mut EventWriter<W>) -> Result<()> {
        let mut start = WriterEvent::start_element(self.name.as_str());
        for (key, value) in &self.attributes {
            start = start.attr(key.as_str(), value.as_str());
        }
        writer.write(start)?;
        if !self.text.is_empty() {
            writer.write(WriterEvent::characters(&self.text))?;
        }
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer.write(WriterEvent::end_element())?;
        Ok(())
    }
}

pub fn parse_bool(text: &str) -> Result<bool> {
    match text.trim() {
        t if t.eq_ignore_ascii_case("true") => Ok(true),
        t if t.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(Error::MalformedXml(format!("expected a boolean, got {:?}", other))),
    }
}

pub fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Tri-state flag: `null` means inherit from the parent group
pub fn parse_nullable_bool(text: &str) -> Result<Option<bool>> {
    match text.trim() {
        "" => Ok(None),
        t if t.eq_ignore_ascii_case("null") => Ok(None),
        t => parse_bool(t).map(Some),
    }
}

pub fn format_nullable_bool(value: Option<bool>) -> &'static str {
    match value {
        None => "null",
        Some(true) => "true",
        Some(false) => "false",
    }
}

pub fn parse_number<T: std::str::FromStr>(text: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| Error::MalformedXml(format!("expected a number, got {:?}", text)))
}

/// Base64 of the 16 raw bytes; empty text is the nil UUID
pub fn parse_uuid(text: &str) -> Result<Uuid> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Uuid::nil());
    }
    let bytes = BASE64
        .decode(text)
        .map_err(|_| Error::MalformedXml(format!("bad UUID {:?}", text)))?;
    Uuid::from_slice(&bytes).map_err(|_| Error::MalformedXml(format!("bad UUID {:?}", text)))
}

pub fn format_uuid(uuid: &Uuid) -> String {
    BASE64.encode(uuid.as_bytes())
}

pub fn parse_base64(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| Error::MalformedXml(format!("bad base64: {}", e)))
}

pub fn format_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

fn date_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// The current time at the precision the file format stores
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Accepts both the ISO form and the base64 seconds-since-year-1 form
pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc).trunc_subsecs(0));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, ISO_FORMAT) {
        return Ok(naive.and_utc());
    }

    let bytes = BASE64
        .decode(text)
        .map_err(|_| Error::MalformedXml(format!("bad timestamp {:?}", text)))?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::MalformedXml(format!("bad timestamp {:?}", text)))?;
    let seconds = i64::from_le_bytes(raw);
    Duration::try_seconds(seconds)
        .and_then(|delta| date_epoch().checked_add_signed(delta))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::MalformedXml(format!("timestamp out of range: {}", seconds)))
}

/// `binary` selects the 4.x encoding
pub fn format_datetime(dt: &DateTime<Utc>, binary: bool) -> String {
    if binary {
        let seconds = (dt.naive_utc() - date_epoch()).num_seconds();
        BASE64.encode(seconds.to_le_bytes())
    } else {
        dt.format(ISO_FORMAT).to_string()
    }
}

/// `#RRGGBB` display colour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub [u8; 3]);

impl Color {
    /// Empty text means no colour
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let hex_part = text
            .strip_prefix('#')
            .ok_or_else(|| Error::MalformedXml(format!("bad colour {:?}", text)))?;
        let bytes =
            hex::decode(hex_part).map_err(|_| Error::MalformedXml(format!("bad colour {:?}", text)))?;
        let rgb: [u8; 3] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedXml(format!("bad colour {:?}", text)))?;
        Ok(Some(Self(rgb)))
    }

    pub fn format(&self) -> String {
        format!("#{}", hex::encode_upper(self.0))
    }
}
