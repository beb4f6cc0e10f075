//! Entry types and operations

use crate::dom::{self, Color, XmlElement};
use crate::error::{Error, Result};
use crate::meta::{CustomData, MemoryProtection};
use crate::protected::{mask_unknown, unmask_unknown, ProtectedString, XmlContext};
use crate::times::Times;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const TITLE: &str = "Title";
pub const USER_NAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

/// Fields every new entry starts with, in KeePass order
pub const STANDARD_FIELDS: [&str; 5] = [TITLE, USER_NAME, PASSWORD, URL, NOTES];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub keystroke_sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub data_transfer_obfuscation: i64,
    pub default_sequence: Option<String>,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            data_transfer_obfuscation: 0,
            default_sequence: None,
            associations: Vec::new(),
        }
    }
}

impl AutoType {
    fn from_xml(element: &XmlElement) -> Result<Self> {
        let mut auto_type = Self::default();
        for child in &element.children {
            match child.name.as_str() {
                "Enabled" => auto_type.enabled = dom::parse_bool(&child.text)?,
                "DataTransferObfuscation" => {
                    auto_type.data_transfer_obfuscation = dom::parse_number(&child.text)?
                }
                "DefaultSequence" => auto_type.default_sequence = Some(child.text.clone()),
                "Association" => auto_type.associations.push(AutoTypeAssociation {
                    window: child.child("Window").map(|w| w.text.clone()).unwrap_or_default(),
                    keystroke_sequence: child
                        .child("KeystrokeSequence")
                        .map(|k| k.text.clone())
                        .unwrap_or_default(),
                }),
                _ => {}
            }
        }
        Ok(auto_type)
    }

    fn to_xml(&self) -> XmlElement {
        let mut element = XmlElement::new("AutoType");
        element.push_text("Enabled", dom::format_bool(self.enabled));
        element.push_text("DataTransferObfuscation", self.data_transfer_obfuscation.to_string());
        if let Some(sequence) = &self.default_sequence {
            element.push_text("DefaultSequence", sequence.as_str());
        }
        for association in &self.associations {
            let mut node = XmlElement::new("Association");
            node.push_text("Window", association.window.as_str());
            node.push_text("KeystrokeSequence", association.keystroke_sequence.as_str());
            element.push(node);
        }
        element
    }
}

/// A named attachment; `reference` indexes the document binary pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryBinary {
    pub key: String,
    pub reference: usize,
}

/// A password entry.
///
/// `parent` is a non-owning back-reference resolved through the owning
/// [`KdbxDocument`](crate::KdbxDocument). History snapshots carry no parent
/// and no history of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub uuid: Uuid,
    pub parent: Option<Uuid>,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub foreground_color: Option<Color>,
    pub background_color: Option<Color>,
    pub override_url: String,
    pub tags: Vec<String>,
    pub times: Times,
    pub custom_data: CustomData,
    fields: Vec<ProtectedString>,
    pub binaries: Vec<EntryBinary>,
    pub auto_type: AutoType,
    /// Older snapshots first
    pub history: Vec<Entry>,
    pub unknown: Vec<XmlElement>,
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

impl Entry {
    /// A fresh entry with empty standard fields and only the password protected
    pub fn new() -> Self {
        Self::with_protection(&MemoryProtection::default())
    }

    pub fn with_protection(protection: &MemoryProtection) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            parent: None,
            icon_id: 0,
            custom_icon: None,
            foreground_color: None,
            background_color: None,
            override_url: String::new(),
            tags: Vec::new(),
            times: Times::now(),
            custom_data: CustomData::default(),
            fields: STANDARD_FIELDS
                .iter()
                .map(|key| ProtectedString::new(*key, "", protection.should_protect(key)))
                .collect(),
            binaries: Vec::new(),
            auto_type: AutoType::default(),
            history: Vec::new(),
            unknown: Vec::new(),
        }
    }

    pub fn fields(&self) -> &[ProtectedString] {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&ProtectedString> {
        self.fields.iter().find(|f| f.key() == key)
    }

    pub fn field_value(&self, key: &str) -> Option<Zeroizing<String>> {
        self.field(key).map(|f| f.clear_value())
    }

    /// Set a field, replacing any existing one with the same key in place
    pub fn set_field(&mut self, key: impl Into<String>, value: &str, protected: bool) {
        self.put_field(ProtectedString::new(key, value, protected));
    }

    /// Set a field keeping its current protection, or the default for new keys
    pub fn set_field_value(&mut self, key: &str, value: &str) {
        let protected = match self.field(key) {
            Some(existing) => existing.is_protected(),
            None => MemoryProtection::default().should_protect(key),
        };
        self.set_field(key, value, protected);
    }

    pub fn remove_field(&mut self, key: &str) -> Option<ProtectedString> {
        let pos = self.fields.iter().position(|f| f.key() == key)?;
        Some(self.fields.remove(pos))
    }

    fn put_field(&mut self, field: ProtectedString) {
        match self.fields.iter_mut().find(|f| f.key() == field.key()) {
            Some(slot) => *slot = field,
            None => self.fields.push(field),
        }
    }

    pub fn title(&self) -> String {
        self.plain_field(TITLE)
    }

    pub fn username(&self) -> String {
        self.plain_field(USER_NAME)
    }

    pub fn url(&self) -> String {
        self.plain_field(URL)
    }

    pub fn password(&self) -> Option<Zeroizing<String>> {
        self.field_value(PASSWORD)
    }

    fn plain_field(&self, key: &str) -> String {
        self.field_value(key)
            .map(|v| v.as_str().to_string())
            .unwrap_or_default()
    }

    /// A copy without history or parent, as stored in `history`
    pub fn snapshot(&self) -> Entry {
        Entry {
            parent: None,
            history: Vec::new(),
            ..self.clone()
        }
    }

    /// Push a snapshot of the current state and enforce the history cap
    pub fn add_history(&mut self, history_max_items: i32) {
        let snapshot = self.snapshot();
        self.history.push(snapshot);
        self.truncate_history(history_max_items);
    }

    /// Drop the oldest snapshots beyond `max_items`; negative means unlimited
    pub fn truncate_history(&mut self, max_items: i32) {
        let Ok(max) = usize::try_from(max_items) else {
            return;
        };
        if self.history.len() > max {
            let excess = self.history.len() - max;
            self.history.drain(..excess);
        }
    }

    /// Whether the user-visible content differs, ignoring identity, times and history
    pub fn content_differs(&self, other: &Entry) -> bool {
        self.fields != other.fields
            || self.binaries != other.binaries
            || self.auto_type != other.auto_type
            || self.icon_id != other.icon_id
            || self.custom_icon != other.custom_icon
            || self.foreground_color != other.foreground_color
            || self.background_color != other.background_color
            || self.override_url != other.override_url
            || self.tags != other.tags
            || self.custom_data != other.custom_data
            || self.times.expires != other.times.expires
            || self.times.expiry_time != other.times.expiry_time
    }

    /// Copy the content of `template` onto this entry.
    ///
    /// When anything changes, the previous state is first pushed onto the
    /// history, which is then capped at `history_max_items`. Returns whether
    /// the entry changed.
    pub fn update(&mut self, template: &Entry, history_max_items: i32, update_mod_time: bool) -> bool {
        if !self.content_differs(template) {
            return false;
        }
        self.add_history(history_max_items);

        self.fields = template.fields.clone();
        self.binaries = template.binaries.clone();
        self.auto_type = template.auto_type.clone();
        self.icon_id = template.icon_id;
        self.custom_icon = template.custom_icon;
        self.foreground_color = template.foreground_color;
        self.background_color = template.background_color;
        self.override_url = template.override_url.clone();
        self.tags = template.tags.clone();
        self.custom_data = template.custom_data.clone();
        self.times.expires = template.times.expires;
        self.times.expiry_time = template.times.expiry_time;
        if update_mod_time {
            self.times.last_modification_time = dom::now();
        }
        true
    }

    /// Parse `<Entry>`; protected values consume the context stream in document order
    pub(crate) fn from_xml(element: &XmlElement, ctx: &mut XmlContext<'_>, in_history: bool) -> Result<Self> {
        let mut entry = Self {
            fields: Vec::new(),
            ..Self::new()
        };
        let mut uuid = None;

        for child in &element.children {
            let text = child.text.as_str();
            match child.name.as_str() {
                "UUID" => uuid = Some(dom::parse_uuid(text)?),
                "IconID" => entry.icon_id = dom::parse_number(text)?,
                "CustomIconUUID" => {
                    entry.custom_icon = Some(dom::parse_uuid(text)?).filter(|u| !u.is_nil())
                }
                "ForegroundColor" => entry.foreground_color = Color::parse(text)?,
                "BackgroundColor" => entry.background_color = Color::parse(text)?,
                "OverrideURL" => entry.override_url = text.to_string(),
                "Tags" => entry.tags = parse_tags(text),
                "Times" => entry.times = Times::from_xml(child)?,
                "CustomData" => entry.custom_data = CustomData::from_xml(child)?,
                "String" => {
                    let field = ProtectedString::from_xml(child, ctx)?;
                    entry.put_field(field);
                }
                "Binary" => entry.binaries.push(parse_binary_ref(child)?),
                "AutoType" => entry.auto_type = AutoType::from_xml(child)?,
                "History" if !in_history => {
                    for snapshot in child.children_named("Entry") {
                        entry.history.push(Entry::from_xml(snapshot, ctx, true)?);
                    }
                }
                _ => entry.unknown.push(unmask_unknown(child, ctx)?),
            }
        }

        entry.uuid = uuid.ok_or_else(|| Error::MalformedXml("Entry without UUID".to_string()))?;
        Ok(entry)
    }

    pub(crate) fn to_xml(&self, ctx: &mut XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("Entry");
        element.push_text("UUID", dom::format_uuid(&self.uuid));
        element.push_text("IconID", self.icon_id.to_string());
        if let Some(icon) = &self.custom_icon {
            element.push_text("CustomIconUUID", dom::format_uuid(icon));
        }
        element.push_text(
            "ForegroundColor",
            self.foreground_color.map(|c| c.format()).unwrap_or_default(),
        );
        element.push_text(
            "BackgroundColor",
            self.background_color.map(|c| c.format()).unwrap_or_default(),
        );
        element.push_text("OverrideURL", self.override_url.as_str());
        element.push_text("Tags", self.tags.join(";"));
        element.push(self.times.to_xml(ctx));
        if !self.custom_data.is_empty() {
            element.push(self.custom_data.to_xml(ctx));
        }
        for field in &self.fields {
            element.push(field.to_xml(ctx));
        }
        for binary in &self.binaries {
            let mut node = XmlElement::new("Binary");
            node.push_text("Key", binary.key.as_str());
            node.push(XmlElement::new("Value").with_attr("Ref", binary.reference.to_string()));
            element.push(node);
        }
        element.push(self.auto_type.to_xml());

        if !self.history.is_empty() {
            let mut history = XmlElement::new("History");
            for snapshot in &self.history {
                history.push(snapshot.to_xml(ctx));
            }
            element.push(history);
        }
        for extra in &self.unknown {
            element.push(mask_unknown(extra, ctx));
        }
        element
    }
}

/// KeePass separates tags with `;`, some other clients with `,`
fn parse_tags(text: &str) -> Vec<String> {
    text.split([';', ','])
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_binary_ref(element: &XmlElement) -> Result<EntryBinary> {
    let key = element
        .child("Key")
        .map(|k| k.text.clone())
        .ok_or_else(|| Error::MalformedXml("Binary without Key".to_string()))?;
    let reference = element
        .child("Value")
        .and_then(|v| v.attr("Ref"))
        .ok_or_else(|| Error::MalformedXml(format!("Binary {:?} has no Ref", key)))?;
    Ok(EntryBinary {
        key,
        reference: dom::parse_number(reference)?,
    })
}

/// Builder for creating entries
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: &str) -> Self {
        let mut entry = Entry::new();
        entry.set_field_value(TITLE, title);
        Self { entry }
    }

    pub fn username(mut self, username: &str) -> Self {
        self.entry.set_field_value(USER_NAME, username);
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.entry.set_field_value(PASSWORD, password);
        self
    }

    pub fn url(mut self, url: &str) -> Self {
        self.entry.set_field_value(URL, url);
        self
    }

    pub fn notes(mut self, notes: &str) -> Self {
        self.entry.set_field_value(NOTES, notes);
        self
    }

    pub fn field(mut self, key: &str, value: &str, protected: bool) -> Self {
        self.entry.set_field(key, value, protected);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.entry.tags.push(tag.into());
        self
    }

    pub fn attachment(mut self, key: impl Into<String>, reference: usize) -> Self {
        self.entry.binaries.push(EntryBinary {
            key: key.into(),
            reference,
        });
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::KdbxVersion;
    use crate::inner_stream::{InnerRandomStream, InnerStreamAlgorithm};

    fn stream() -> InnerRandomStream {
        InnerRandomStream::new(InnerStreamAlgorithm::ChaCha20, &[4u8; 64]).unwrap()
    }

    #[test]
    fn test_entry_creation() {
        let entry = Entry::new();
        let keys: Vec<&str> = entry.fields().iter().map(|f| f.key()).collect();
        assert_eq!(keys, STANDARD_FIELDS);
        assert!(entry.field(PASSWORD).unwrap().is_protected());
        assert!(!entry.field(TITLE).unwrap().is_protected());
        assert_eq!(entry.title(), "");
    }

    #[test]
    fn test_entry_builder() {
        let entry = EntryBuilder::new("GitHub")
            .username("user@example.com")
            .password("secret123")
            .url("https://github.com")
            .notes("My GitHub account")
            .tag("work")
            .tag("dev")
            .field("2FA", "enabled", false)
            .build();

        assert_eq!(entry.title(), "GitHub");
        assert_eq!(entry.username(), "user@example.com");
        assert_eq!(entry.password().unwrap().as_str(), "secret123");
        assert!(entry.field(PASSWORD).unwrap().is_protected());
        assert_eq!(entry.url(), "https://github.com");
        assert_eq!(entry.tags, vec!["work", "dev"]);
        assert_eq!(entry.field_value("2FA").unwrap().as_str(), "enabled");
    }

    #[test]
    fn test_set_field_is_unique_last_write_wins() {
        let mut entry = Entry::new();
        entry.set_field("Custom", "one", false);
        entry.set_field("Custom", "two", true);
        let count = entry.fields().iter().filter(|f| f.key() == "Custom").count();
        assert_eq!(count, 1);
        assert_eq!(entry.field_value("Custom").unwrap().as_str(), "two");
        assert!(entry.field("Custom").unwrap().is_protected());
        assert!(entry.remove_field("Custom").is_some());
        assert!(entry.field("Custom").is_none());
    }

    #[test]
    fn test_history_cap_evicts_oldest() {
        let mut entry = EntryBuilder::new("v0").build();
        for title in ["v1", "v2", "v3"] {
            let mut template = entry.clone();
            template.set_field_value(TITLE, title);
            assert!(entry.update(&template, 2, true));
        }
        assert_eq!(entry.title(), "v3");
        let titles: Vec<String> = entry.history.iter().map(|h| h.title()).collect();
        assert_eq!(titles, ["v1", "v2"]);
        assert!(entry.history.iter().all(|h| h.history.is_empty()));
    }

    #[test]
    fn test_update_without_change_keeps_history() {
        let mut entry = EntryBuilder::new("Same").build();
        let template = entry.clone();
        assert!(!entry.update(&template, 10, true));
        assert!(entry.history.is_empty());
    }

    #[test]
    fn test_negative_history_cap_is_unlimited() {
        let mut entry = Entry::new();
        for i in 0..15 {
            let mut template = entry.clone();
            template.set_field_value(NOTES, &i.to_string());
            entry.update(&template, -1, false);
        }
        assert_eq!(entry.history.len(), 15);
    }

    #[test]
    fn test_tags_accept_both_separators() {
        assert_eq!(parse_tags("a; b;;c"), ["a", "b", "c"]);
        assert_eq!(parse_tags("x, y"), ["x", "y"]);
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn test_entry_xml_with_history() {
        let mut entry = EntryBuilder::new("Bank")
            .password("hunter2")
            .field("PIN", "1234", true)
            .attachment("scan.pdf", 0)
            .tag("finance")
            .build();
        entry.parent = Some(Uuid::new_v4());
        entry.foreground_color = Some(Color([0xFF, 0, 0]));
        entry.auto_type.associations.push(AutoTypeAssociation {
            window: "Bank*".to_string(),
            keystroke_sequence: "{USERNAME}{TAB}{PASSWORD}{ENTER}".to_string(),
        });
        let mut template = entry.clone();
        template.set_field_value(PASSWORD, "hunter3");
        entry.update(&template, 10, true);
        entry.unknown.push(XmlElement::with_text("QualityCheck", "False"));

        for version in [KdbxVersion::V3, KdbxVersion::V4] {
            let mut write_stream = stream();
            let mut ctx = XmlContext::new(version, &mut write_stream);
            let element = entry.to_xml(&mut ctx);

            let mut read_stream = stream();
            let mut ctx = XmlContext::new(version, &mut read_stream);
            let mut parsed = Entry::from_xml(&element, &mut ctx, false).unwrap();
            parsed.parent = entry.parent;
            assert_eq!(parsed, entry, "{:?}", version);
            assert_eq!(parsed.history[0].password().unwrap().as_str(), "hunter2");
        }
    }

    #[test]
    fn test_entry_without_uuid_is_malformed() {
        let element = XmlElement::new("Entry");
        let mut s = stream();
        let mut ctx = XmlContext::new(KdbxVersion::V4, &mut s);
        assert!(matches!(
            Entry::from_xml(&element, &mut ctx, false),
            Err(Error::MalformedXml(_))
        ));
    }
}
