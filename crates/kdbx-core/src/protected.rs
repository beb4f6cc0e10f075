//! Protected string fields and the cursor that masks them in the XML

use crate::dom::{self, XmlElement};
use crate::error::{Error, Result};
use crate::header::KdbxVersion;
use crate::inner_stream::InnerRandomStream;
use crate::random_bytes;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// State shared by one top-to-bottom walk of the document XML.
///
/// Reader and writer both visit protected values in document order, and
/// every value advances `stream` by its own length.
pub struct XmlContext<'a> {
    pub version: KdbxVersion,
    pub stream: &'a mut InnerRandomStream,
}

impl<'a> XmlContext<'a> {
    pub fn new(version: KdbxVersion, stream: &'a mut InnerRandomStream) -> Self {
        Self { version, stream }
    }

    /// 4.x stores dates as base64 seconds
    pub fn binary_dates(&self) -> bool {
        self.version >= KdbxVersion::V4
    }

    pub fn format_date(&self, dt: &chrono::DateTime<chrono::Utc>) -> String {
        dom::format_datetime(dt, self.binary_dates())
    }
}

/// A named entry field whose value may be protected.
///
/// The value is never kept as plain text: it is stored XOR-ed with a pad.
/// For values read from a file the pad is the inner stream keystream at the
/// value's position; for values set in memory the pad is fresh randomness.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProtectedString {
    key: String,
    protected: bool,
    masked: Vec<u8>,
    pad: Vec<u8>,
}

impl ProtectedString {
    pub fn new(key: impl Into<String>, value: &str, protected: bool) -> Self {
        let pad = random_bytes(value.len());
        let masked = value.bytes().zip(&pad).map(|(v, p)| v ^ p).collect();
        Self {
            key: key.into(),
            protected,
            masked,
            pad,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn set_protected(&mut self, protected: bool) {
        self.protected = protected;
    }

    /// The masked bytes as held in memory
    pub fn raw_value(&self) -> &[u8] {
        &self.masked
    }

    pub fn clear_value(&self) -> Zeroizing<String> {
        let bytes = self.clear_bytes();
        let text = std::str::from_utf8(&bytes).unwrap_or_default().to_string();
        Zeroizing::new(text)
    }

    pub fn is_empty(&self) -> bool {
        self.masked.is_empty()
    }

    fn clear_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(
            self.masked
                .iter()
                .zip(&self.pad)
                .map(|(m, p)| m ^ p)
                .collect(),
        )
    }

    /// Parse `<String><Key/><Value/></String>`, unmasking with the context stream
    pub(crate) fn from_xml(element: &XmlElement, ctx: &mut XmlContext<'_>) -> Result<Self> {
        let key = element
            .child("Key")
            .map(|k| k.text.clone())
            .ok_or_else(|| Error::MalformedXml("String without Key".to_string()))?;
        let Some(value) = element.child("Value") else {
            return Ok(Self::new(key, "", false));
        };

        if flagged(value, "Protected") {
            let masked = dom::parse_base64(&value.text)?;
            let pad = ctx.stream.next_bytes(masked.len());
            let parsed = Self {
                key,
                protected: true,
                masked,
                pad,
            };
            if std::str::from_utf8(&parsed.clear_bytes()).is_err() {
                return Err(Error::MalformedXml(format!(
                    "protected value {:?} is not valid UTF-8",
                    parsed.key
                )));
            }
            Ok(parsed)
        } else {
            Ok(Self::new(key, &value.text, flagged(value, "ProtectInMemory")))
        }
    }

    pub(crate) fn to_xml(&self, ctx: &mut XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("String");
        element.push_text("Key", self.key.as_str());
        let value = if self.protected {
            let mut bytes = self.clear_bytes();
            ctx.stream.apply(&mut bytes);
            XmlElement::with_text("Value", dom::format_base64(&bytes)).with_attr("Protected", "True")
        } else {
            XmlElement::with_text("Value", self.clear_value().as_str())
        };
        element.push(value);
        element
    }
}

fn flagged(element: &XmlElement, attr: &str) -> bool {
    element
        .attr(attr)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Copy an element the document model does not know, unmasking every
/// `Protected="True"` value inside it in document order.
///
/// The copy keeps the attribute but holds base64 of the clear bytes, which
/// [`mask_unknown`] masks again on write.
pub(crate) fn unmask_unknown(element: &XmlElement, ctx: &mut XmlContext<'_>) -> Result<XmlElement> {
    let mut copy = element.clone();
    unmask_in_place(&mut copy, ctx)?;
    Ok(copy)
}

fn unmask_in_place(element: &mut XmlElement, ctx: &mut XmlContext<'_>) -> Result<()> {
    if flagged(element, "Protected") {
        let mut bytes = Zeroizing::new(dom::parse_base64(&element.text)?);
        ctx.stream.apply(&mut bytes);
        element.text = dom::format_base64(&bytes);
    }
    for child in &mut element.children {
        unmask_in_place(child, ctx)?;
    }
    Ok(())
}

/// Inverse of [`unmask_unknown`], masking with the writer's stream
pub(crate) fn mask_unknown(element: &XmlElement, ctx: &mut XmlContext<'_>) -> XmlElement {
    let mut copy = element.clone();
    mask_in_place(&mut copy, ctx);
    copy
}

fn mask_in_place(element: &mut XmlElement, ctx: &mut XmlContext<'_>) {
    if flagged(element, "Protected") {
        // elements added in memory may carry plain text rather than base64
        let mut bytes = Zeroizing::new(
            dom::parse_base64(&element.text).unwrap_or_else(|_| element.text.as_bytes().to_vec()),
        );
        ctx.stream.apply(&mut bytes);
        element.text = dom::format_base64(&bytes);
    }
    for child in &mut element.children {
        mask_in_place(child, ctx);
    }
}

impl PartialEq for ProtectedString {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.protected == other.protected
            && *self.clear_bytes() == *other.clear_bytes()
    }
}

impl Eq for ProtectedString {}

impl std::fmt::Debug for ProtectedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.protected {
            write!(f, "ProtectedString({:?}: ***)", self.key)
        } else {
            write!(f, "ProtectedString({:?}: {:?})", self.key, self.clear_value().as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inner_stream::InnerStreamAlgorithm;

    fn stream() -> InnerRandomStream {
        InnerRandomStream::new(InnerStreamAlgorithm::ChaCha20, &[7u8; 64]).unwrap()
    }

    #[test]
    fn test_value_is_masked_in_memory() {
        let s = ProtectedString::new("Password", "hunter2", true);
        assert_eq!(s.clear_value().as_str(), "hunter2");
        assert_eq!(s.raw_value().len(), 7);
        assert_ne!(s.raw_value(), b"hunter2");
        assert_eq!(format!("{:?}", s), "ProtectedString(\"Password\": ***)");
    }

    #[test]
    fn test_equality_ignores_pad() {
        let a = ProtectedString::new("Password", "hunter2", true);
        let b = ProtectedString::new("Password", "hunter2", true);
        assert_eq!(a, b);
        assert_ne!(a, ProtectedString::new("Password", "hunter2", false));
        assert_ne!(a, ProtectedString::new("Password", "hunter3", true));
    }

    #[test]
    fn test_xml_uses_stream_in_order() {
        let first = ProtectedString::new("Password", "hunter2", true);
        let second = ProtectedString::new("Secret", "swordfish", true);
        let plain = ProtectedString::new("Title", "Example", false);

        let mut write_stream = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut write_stream);
        let elements = [first.to_xml(&mut ctx), plain.to_xml(&mut ctx), second.to_xml(&mut ctx)];
        assert_eq!(elements[0].child("Value").unwrap().attr("Protected"), Some("True"));
        assert_eq!(elements[1].child("Value").unwrap().text, "Example");

        let mut read_stream = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut read_stream);
        let parsed: Vec<ProtectedString> = elements
            .iter()
            .map(|e| ProtectedString::from_xml(e, &mut ctx).unwrap())
            .collect();
        assert_eq!(parsed, vec![first, plain, second]);
    }

    #[test]
    fn test_out_of_order_reads_give_wrong_plaintext() {
        let first = ProtectedString::new("A", "aaaa", true);
        let second = ProtectedString::new("B", "bbbb", true);

        let mut write_stream = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut write_stream);
        let _skipped = first.to_xml(&mut ctx);
        let b = second.to_xml(&mut ctx);

        let mut read_stream = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut read_stream);
        match ProtectedString::from_xml(&b, &mut ctx) {
            Ok(parsed) => assert_ne!(parsed.clear_value().as_str(), "bbbb"),
            Err(e) => assert!(matches!(e, Error::MalformedXml(_))),
        }
    }

    #[test]
    fn test_unknown_protected_values_keep_stream_aligned() {
        let mut extra = XmlElement::new("PluginData");
        extra.push(
            XmlElement::with_text("Value", dom::format_base64(b"opaque"))
                .with_attr("Protected", "True"),
        );
        extra.push_text("Plain", "visible");
        let password = ProtectedString::new("Password", "hunter2", true);

        let mut write_stream = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut write_stream);
        let masked = mask_unknown(&extra, &mut ctx);
        let element = password.to_xml(&mut ctx);
        assert_ne!(masked.child("Value").unwrap().text, dom::format_base64(b"opaque"));
        assert_eq!(masked.child("Plain").unwrap().text, "visible");

        let mut read_stream = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut read_stream);
        assert_eq!(unmask_unknown(&masked, &mut ctx).unwrap(), extra);
        let parsed = ProtectedString::from_xml(&element, &mut ctx).unwrap();
        assert_eq!(parsed.clear_value().as_str(), "hunter2");
    }

    #[test]
    fn test_missing_value_is_empty() {
        let mut element = XmlElement::new("String");
        element.push_text("Key", "Notes");
        let mut s = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V3, &mut s);
        let parsed = ProtectedString::from_xml(&element, &mut ctx).unwrap();
        assert!(parsed.is_empty());
        assert!(!parsed.is_protected());
    }
}
