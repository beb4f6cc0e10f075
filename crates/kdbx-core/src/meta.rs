//! Database-wide metadata, custom data, icons and the attachment pool

use crate::blocks::{gzip_compress, gzip_decompress};
use crate::dom::{self, Color, XmlElement};
use crate::error::{Error, Result};
use crate::protected::{mask_unknown, unmask_unknown, XmlContext};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const DEFAULT_GENERATOR: &str = "kdbx-core";
pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;
const DEFAULT_MAINTENANCE_HISTORY_DAYS: u32 = 365;
const MAX_BINARY_ID: usize = 0xFFFF;

/// An attachment in the document-wide pool; entries refer to it by index
#[derive(Clone, PartialEq, Eq)]
pub struct Binary {
    pub data: Vec<u8>,
    pub protected: bool,
}

impl std::fmt::Debug for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binary")
            .field("len", &self.data.len())
            .field("protected", &self.protected)
            .finish()
    }
}

/// Which standard fields new entries protect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_user_name: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_user_name: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

impl MemoryProtection {
    /// Whether a field with this key should be protected; custom keys are not
    pub fn should_protect(&self, key: &str) -> bool {
        match key {
            "Title" => self.protect_title,
            "UserName" => self.protect_user_name,
            "Password" => self.protect_password,
            "URL" => self.protect_url,
            "Notes" => self.protect_notes,
            _ => false,
        }
    }

    fn from_xml(element: &XmlElement) -> Result<Self> {
        let mut protection = Self::default();
        for child in &element.children {
            let slot = match child.name.as_str() {
                "ProtectTitle" => &mut protection.protect_title,
                "ProtectUserName" => &mut protection.protect_user_name,
                "ProtectPassword" => &mut protection.protect_password,
                "ProtectURL" => &mut protection.protect_url,
                "ProtectNotes" => &mut protection.protect_notes,
                _ => continue,
            };
            *slot = dom::parse_bool(&child.text)?;
        }
        Ok(protection)
    }

    fn to_xml(&self) -> XmlElement {
        let mut element = XmlElement::new("MemoryProtection");
        element.push_text("ProtectTitle", dom::format_bool(self.protect_title));
        element.push_text("ProtectUserName", dom::format_bool(self.protect_user_name));
        element.push_text("ProtectPassword", dom::format_bool(self.protect_password));
        element.push_text("ProtectURL", dom::format_bool(self.protect_url));
        element.push_text("ProtectNotes", dom::format_bool(self.protect_notes));
        element
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDataItem {
    pub key: String,
    pub value: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Plugin-owned key/value pairs, kept in document order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomData {
    items: Vec<CustomDataItem>,
}

impl CustomData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    /// Insert or replace; replacing keeps the position
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let now = dom::now();
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => {
                item.value = value;
                item.last_modified = Some(now);
            }
            None => self.items.push(CustomDataItem {
                key,
                value,
                last_modified: Some(now),
            }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.items.iter().position(|item| item.key == key)?;
        Some(self.items.remove(pos).value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustomDataItem> {
        self.items.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self> {
        let mut data = Self::default();
        for item in element.children_named("Item") {
            let key = item
                .child("Key")
                .map(|k| k.text.clone())
                .ok_or_else(|| Error::MalformedXml("CustomData item without Key".to_string()))?;
            let value = item.child("Value").map(|v| v.text.clone()).unwrap_or_default();
            let last_modified = item
                .child("LastModificationTime")
                .map(|t| dom::parse_datetime(&t.text))
                .transpose()?;
            data.items.push(CustomDataItem {
                key,
                value,
                last_modified,
            });
        }
        Ok(data)
    }

    pub(crate) fn to_xml(&self, ctx: &XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("CustomData");
        for item in &self.items {
            let mut node = XmlElement::new("Item");
            node.push_text("Key", item.key.as_str());
            node.push_text("Value", item.value.as_str());
            if let Some(modified) = &item.last_modified {
                node.push_text("LastModificationTime", ctx.format_date(modified));
            }
            element.push(node);
        }
        element
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
    pub name: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl CustomIcon {
    fn from_xml(element: &XmlElement) -> Result<Self> {
        let mut icon = Self {
            uuid: Uuid::nil(),
            data: Vec::new(),
            name: None,
            last_modified: None,
        };
        for child in &element.children {
            match child.name.as_str() {
                "UUID" => icon.uuid = dom::parse_uuid(&child.text)?,
                "Data" => icon.data = dom::parse_base64(&child.text)?,
                "Name" => icon.name = Some(child.text.clone()),
                "LastModificationTime" => {
                    icon.last_modified = Some(dom::parse_datetime(&child.text)?)
                }
                _ => {}
            }
        }
        Ok(icon)
    }

    fn to_xml(&self, ctx: &XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("Icon");
        element.push_text("UUID", dom::format_uuid(&self.uuid));
        element.push_text("Data", dom::format_base64(&self.data));
        if let Some(name) = &self.name {
            element.push_text("Name", name.as_str());
        }
        if let Some(modified) = &self.last_modified {
            element.push_text("LastModificationTime", ctx.format_date(modified));
        }
        element
    }
}

/// Tombstone for a removed group or entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

impl DeletedObject {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self> {
        let uuid = element
            .child("UUID")
            .map(|u| dom::parse_uuid(&u.text))
            .transpose()?
            .ok_or_else(|| Error::MalformedXml("DeletedObject without UUID".to_string()))?;
        let deletion_time = element
            .child("DeletionTime")
            .map(|t| dom::parse_datetime(&t.text))
            .transpose()?
            .unwrap_or_else(dom::now);
        Ok(Self {
            uuid,
            deletion_time,
        })
    }

    pub(crate) fn to_xml(&self, ctx: &XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("DeletedObject");
        element.push_text("UUID", dom::format_uuid(&self.uuid));
        element.push_text("DeletionTime", ctx.format_date(&self.deletion_time));
        element
    }
}

/// Contents of `<Meta>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub generator: String,
    pub database_name: String,
    pub database_name_changed: DateTime<Utc>,
    pub database_description: String,
    pub database_description_changed: DateTime<Utc>,
    pub default_user_name: String,
    pub default_user_name_changed: DateTime<Utc>,
    pub maintenance_history_days: u32,
    pub color: Option<Color>,
    pub master_key_changed: DateTime<Utc>,
    pub master_key_change_rec: i64,
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub custom_icons: Vec<CustomIcon>,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Uuid,
    pub recycle_bin_changed: DateTime<Utc>,
    pub entry_templates_group: Uuid,
    pub entry_templates_group_changed: DateTime<Utc>,
    /// Negative means unlimited
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub last_selected_group: Uuid,
    pub last_top_visible_group: Uuid,
    pub custom_data: CustomData,
    /// Elements this crate does not model, written back verbatim
    pub unknown: Vec<XmlElement>,
}

impl Default for Metadata {
    fn default() -> Self {
        let now = dom::now();
        Self {
            generator: DEFAULT_GENERATOR.to_string(),
            database_name: String::new(),
            database_name_changed: now,
            database_description: String::new(),
            database_description_changed: now,
            default_user_name: String::new(),
            default_user_name_changed: now,
            maintenance_history_days: DEFAULT_MAINTENANCE_HISTORY_DAYS,
            color: None,
            master_key_changed: now,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            custom_icons: Vec::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: Uuid::nil(),
            recycle_bin_changed: now,
            entry_templates_group: Uuid::nil(),
            entry_templates_group_changed: now,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            last_selected_group: Uuid::nil(),
            last_top_visible_group: Uuid::nil(),
            custom_data: CustomData::default(),
            unknown: Vec::new(),
        }
    }
}

/// What `<Meta>` yields besides the metadata itself
pub(crate) struct MetaExtras {
    pub header_hash: Option<Vec<u8>>,
    pub binaries: Vec<Binary>,
}

impl Metadata {
    pub(crate) fn from_xml(element: &XmlElement, ctx: &mut XmlContext<'_>) -> Result<(Self, MetaExtras)> {
        let mut meta = Self::default();
        let mut extras = MetaExtras {
            header_hash: None,
            binaries: Vec::new(),
        };

        for child in &element.children {
            let text = child.text.as_str();
            match child.name.as_str() {
                "Generator" => meta.generator = text.to_string(),
                "HeaderHash" => extras.header_hash = Some(dom::parse_base64(text)?),
                "DatabaseName" => meta.database_name = text.to_string(),
                "DatabaseNameChanged" => meta.database_name_changed = dom::parse_datetime(text)?,
                "DatabaseDescription" => meta.database_description = text.to_string(),
                "DatabaseDescriptionChanged" => {
                    meta.database_description_changed = dom::parse_datetime(text)?
                }
                "DefaultUserName" => meta.default_user_name = text.to_string(),
                "DefaultUserNameChanged" => {
                    meta.default_user_name_changed = dom::parse_datetime(text)?
                }
                "MaintenanceHistoryDays" => meta.maintenance_history_days = dom::parse_number(text)?,
                "Color" => meta.color = Color::parse(text)?,
                "MasterKeyChanged" => meta.master_key_changed = dom::parse_datetime(text)?,
                "MasterKeyChangeRec" => meta.master_key_change_rec = dom::parse_number(text)?,
                "MasterKeyChangeForce" => meta.master_key_change_force = dom::parse_number(text)?,
                "MemoryProtection" => meta.memory_protection = MemoryProtection::from_xml(child)?,
                "CustomIcons" => {
                    meta.custom_icons = child
                        .children_named("Icon")
                        .map(CustomIcon::from_xml)
                        .collect::<Result<_>>()?
                }
                "RecycleBinEnabled" => meta.recycle_bin_enabled = dom::parse_bool(text)?,
                "RecycleBinUUID" => meta.recycle_bin_uuid = dom::parse_uuid(text)?,
                "RecycleBinChanged" => meta.recycle_bin_changed = dom::parse_datetime(text)?,
                "EntryTemplatesGroup" => meta.entry_templates_group = dom::parse_uuid(text)?,
                "EntryTemplatesGroupChanged" => {
                    meta.entry_templates_group_changed = dom::parse_datetime(text)?
                }
                "HistoryMaxItems" => meta.history_max_items = dom::parse_number(text)?,
                "HistoryMaxSize" => meta.history_max_size = dom::parse_number(text)?,
                "LastSelectedGroup" => meta.last_selected_group = dom::parse_uuid(text)?,
                "LastTopVisibleGroup" => meta.last_top_visible_group = dom::parse_uuid(text)?,
                "Binaries" => extras.binaries = parse_binaries(child, ctx)?,
                "CustomData" => meta.custom_data = CustomData::from_xml(child)?,
                _ => meta.unknown.push(unmask_unknown(child, ctx)?),
            }
        }

        Ok((meta, extras))
    }

    /// `binaries` is only written for 3.x; 4.x keeps them in the inner header
    pub(crate) fn to_xml(
        &self,
        ctx: &mut XmlContext<'_>,
        header_hash: Option<&[u8]>,
        binaries: &[Binary],
    ) -> Result<XmlElement> {
        let mut element = XmlElement::new("Meta");
        element.push_text("Generator", self.generator.as_str());
        if let Some(hash) = header_hash {
            element.push_text("HeaderHash", dom::format_base64(hash));
        }
        element.push_text("DatabaseName", self.database_name.as_str());
        element.push_text("DatabaseNameChanged", ctx.format_date(&self.database_name_changed));
        element.push_text("DatabaseDescription", self.database_description.as_str());
        element.push_text(
            "DatabaseDescriptionChanged",
            ctx.format_date(&self.database_description_changed),
        );
        element.push_text("DefaultUserName", self.default_user_name.as_str());
        element.push_text(
            "DefaultUserNameChanged",
            ctx.format_date(&self.default_user_name_changed),
        );
        element.push_text("MaintenanceHistoryDays", self.maintenance_history_days.to_string());
        element.push_text("Color", self.color.map(|c| c.format()).unwrap_or_default());
        element.push_text("MasterKeyChanged", ctx.format_date(&self.master_key_changed));
        element.push_text("MasterKeyChangeRec", self.master_key_change_rec.to_string());
        element.push_text("MasterKeyChangeForce", self.master_key_change_force.to_string());
        element.push(self.memory_protection.to_xml());

        let mut icons = XmlElement::new("CustomIcons");
        for icon in &self.custom_icons {
            icons.push(icon.to_xml(ctx));
        }
        element.push(icons);

        element.push_text("RecycleBinEnabled", dom::format_bool(self.recycle_bin_enabled));
        element.push_text("RecycleBinUUID", dom::format_uuid(&self.recycle_bin_uuid));
        element.push_text("RecycleBinChanged", ctx.format_date(&self.recycle_bin_changed));
        element.push_text("EntryTemplatesGroup", dom::format_uuid(&self.entry_templates_group));
        element.push_text(
            "EntryTemplatesGroupChanged",
            ctx.format_date(&self.entry_templates_group_changed),
        );
        element.push_text("HistoryMaxItems", self.history_max_items.to_string());
        element.push_text("HistoryMaxSize", self.history_max_size.to_string());
        element.push_text("LastSelectedGroup", dom::format_uuid(&self.last_selected_group));
        element.push_text("LastTopVisibleGroup", dom::format_uuid(&self.last_top_visible_group));

        if !ctx.binary_dates() {
            element.push(write_binaries(binaries, ctx)?);
        }
        element.push(self.custom_data.to_xml(ctx));
        for extra in &self.unknown {
            element.push(mask_unknown(extra, ctx));
        }
        Ok(element)
    }
}

fn parse_binaries(element: &XmlElement, ctx: &mut XmlContext<'_>) -> Result<Vec<Binary>> {
    let mut indexed = Vec::new();
    for node in element.children_named("Binary") {
        let id: usize = node
            .attr("ID")
            .map(dom::parse_number)
            .transpose()?
            .unwrap_or(indexed.len());
        if id > MAX_BINARY_ID {
            return Err(Error::MalformedXml(format!("binary id {} out of range", id)));
        }
        let flagged = |attr: &str| {
            node.attr(attr)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        let mut data = dom::parse_base64(&node.text)?;
        let protected = flagged("Protected");
        if protected {
            ctx.stream.apply(&mut data);
        }
        if flagged("Compressed") {
            data = gzip_decompress(&data)?.to_vec();
        }
        indexed.push((id, Binary { data, protected }));
    }

    // Ids are normally 0..n; place each at its id and leave gaps empty
    let len = indexed.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
    let mut binaries = vec![
        Binary {
            data: Vec::new(),
            protected: false,
        };
        len
    ];
    for (id, binary) in indexed {
        binaries[id] = binary;
    }
    Ok(binaries)
}

fn write_binaries(binaries: &[Binary], ctx: &mut XmlContext<'_>) -> Result<XmlElement> {
    let mut element = XmlElement::new("Binaries");
    for (id, binary) in binaries.iter().enumerate() {
        let mut node = XmlElement::new("Binary").with_attr("ID", id.to_string());
        if binary.protected {
            let mut data = binary.data.clone();
            ctx.stream.apply(&mut data);
            node = node.with_attr("Protected", "True");
            node.text = dom::format_base64(&data);
        } else {
            node = node.with_attr("Compressed", "True");
            node.text = dom::format_base64(&gzip_compress(&binary.data)?);
        }
        element.push(node);
    }
    Ok(element)
}
