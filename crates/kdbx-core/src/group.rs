//! Group types and operations

use crate::dom::{self, XmlElement};
use crate::error::Result;
use crate::meta::CustomData;
use crate::protected::XmlContext;
use crate::times::Times;
use uuid::Uuid;

/// Default folder icon
pub const GROUP_ICON: u32 = 48;

/// A child slot of a group; order is display order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Group(Uuid),
    Entry(Uuid),
}

impl Node {
    pub fn uuid(&self) -> Uuid {
        match self {
            Node::Group(uuid) | Node::Entry(uuid) => *uuid,
        }
    }
}

/// A group (folder) that contains entries and subgroups.
///
/// Children are stored as ids into the owning document; `parent` is `None`
/// only for the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub uuid: Uuid,
    pub parent: Option<Uuid>,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub times: Times,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    /// `None` inherits from the parent group
    pub enable_auto_type: Option<bool>,
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Uuid,
    pub custom_data: CustomData,
    pub(crate) children: Vec<Node>,
    pub unknown: Vec<XmlElement>,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            parent: None,
            name: name.into(),
            notes: String::new(),
            icon_id: GROUP_ICON,
            custom_icon: None,
            times: Times::now(),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: Uuid::nil(),
            custom_data: CustomData::default(),
            children: Vec::new(),
            unknown: Vec::new(),
        }
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn groups(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.children.iter().filter_map(|node| match node {
            Node::Group(uuid) => Some(*uuid),
            Node::Entry(_) => None,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.children.iter().filter_map(|node| match node {
            Node::Entry(uuid) => Some(*uuid),
            Node::Group(_) => None,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn add_child(&mut self, node: Node) {
        if !self.children.contains(&node) {
            self.children.push(node);
        }
    }

    pub(crate) fn remove_child(&mut self, uuid: &Uuid) -> bool {
        match self.children.iter().position(|n| n.uuid() == *uuid) {
            Some(pos) => {
                self.children.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Copy properties from `template`; identity, parent and children are kept
    pub fn update(&mut self, template: &Group, update_mod_time: bool) {
        self.name = template.name.clone();
        self.notes = template.notes.clone();
        self.icon_id = template.icon_id;
        self.custom_icon = template.custom_icon;
        self.is_expanded = template.is_expanded;
        self.default_auto_type_sequence = template.default_auto_type_sequence.clone();
        self.enable_auto_type = template.enable_auto_type;
        self.enable_searching = template.enable_searching;
        self.last_top_visible_entry = template.last_top_visible_entry;
        self.custom_data = template.custom_data.clone();
        self.times.expires = template.times.expires;
        self.times.expiry_time = template.times.expiry_time;
        if update_mod_time {
            self.times.last_modification_time = dom::now();
        }
    }

    /// Apply one non-child element of `<Group>`; returns false if it is not a known field
    pub(crate) fn apply_xml_field(&mut self, child: &XmlElement) -> Result<bool> {
        let text = child.text.as_str();
        match child.name.as_str() {
            "UUID" => self.uuid = dom::parse_uuid(text)?,
            "Name" => self.name = text.to_string(),
            "Notes" => self.notes = text.to_string(),
            "IconID" => self.icon_id = dom::parse_number(text)?,
            "CustomIconUUID" => self.custom_icon = Some(dom::parse_uuid(text)?).filter(|u| !u.is_nil()),
            "Times" => self.times = Times::from_xml(child)?,
            "IsExpanded" => self.is_expanded = dom::parse_bool(text)?,
            "DefaultAutoTypeSequence" => self.default_auto_type_sequence = text.to_string(),
            "EnableAutoType" => self.enable_auto_type = dom::parse_nullable_bool(text)?,
            "EnableSearching" => self.enable_searching = dom::parse_nullable_bool(text)?,
            "LastTopVisibleEntry" => self.last_top_visible_entry = dom::parse_uuid(text)?,
            "CustomData" => self.custom_data = CustomData::from_xml(child)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// `<Group>` with its own fields only; the caller appends children
    pub(crate) fn to_xml_fields(&self, ctx: &XmlContext<'_>) -> XmlElement {
        let mut element = XmlElement::new("Group");
        element.push_text("UUID", dom::format_uuid(&self.uuid));
        element.push_text("Name", self.name.as_str());
        element.push_text("Notes", self.notes.as_str());
        element.push_text("IconID", self.icon_id.to_string());
        if let Some(icon) = &self.custom_icon {
            element.push_text("CustomIconUUID", dom::format_uuid(icon));
        }
        element.push(self.times.to_xml(ctx));
        element.push_text("IsExpanded", dom::format_bool(self.is_expanded));
        element.push_text("DefaultAutoTypeSequence", self.default_auto_type_sequence.as_str());
        element.push_text("EnableAutoType", dom::format_nullable_bool(self.enable_auto_type));
        element.push_text("EnableSearching", dom::format_nullable_bool(self.enable_searching));
        element.push_text("LastTopVisibleEntry", dom::format_uuid(&self.last_top_visible_entry));
        if !self.custom_data.is_empty() {
            element.push(self.custom_data.to_xml(ctx));
        }
        element
    }
}

/// Builder for creating groups
pub struct GroupBuilder {
    group: Group,
}

impl GroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group: Group::new(name),
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.group.notes = notes.into();
        self
    }

    pub fn icon_id(mut self, icon_id: u32) -> Self {
        self.group.icon_id = icon_id;
        self
    }

    pub fn expanded(mut self, expanded: bool) -> Self {
        self.group.is_expanded = expanded;
        self
    }

    pub fn searching(mut self, enabled: Option<bool>) -> Self {
        self.group.enable_searching = enabled;
        self
    }

    pub fn build(self) -> Group {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::KdbxVersion;
    use crate::inner_stream::{InnerRandomStream, InnerStreamAlgorithm};

    #[test]
    fn test_group_creation() {
        let group = Group::new("My Passwords");
        assert_eq!(group.name, "My Passwords");
        assert!(group.is_root());
        assert!(group.children().is_empty());
        assert_eq!(group.icon_id, GROUP_ICON);
    }

    #[test]
    fn test_group_builder() {
        let group = GroupBuilder::new("Work")
            .notes("Work-related passwords")
            .icon_id(1)
            .expanded(false)
            .searching(Some(false))
            .build();

        assert_eq!(group.name, "Work");
        assert_eq!(group.notes, "Work-related passwords");
        assert_eq!(group.icon_id, 1);
        assert!(!group.is_expanded);
        assert_eq!(group.enable_searching, Some(false));
    }

    #[test]
    fn test_group_children_keep_mixed_order() {
        let mut group = Group::new("Parent");
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        group.add_child(Node::Entry(a));
        group.add_child(Node::Group(b));
        group.add_child(Node::Entry(c));
        group.add_child(Node::Entry(a));
        assert_eq!(group.children(), [Node::Entry(a), Node::Group(b), Node::Entry(c)]);
        assert_eq!(group.entries().collect::<Vec<_>>(), [a, c]);
        assert_eq!(group.groups().collect::<Vec<_>>(), [b]);

        assert!(group.remove_child(&b));
        assert!(!group.remove_child(&b));
        assert_eq!(group.children().len(), 2);
    }

    #[test]
    fn test_update_keeps_identity() {
        let mut group = Group::new("Old");
        let child = Uuid::new_v4();
        group.add_child(Node::Entry(child));
        let uuid = group.uuid;

        let template = GroupBuilder::new("New").notes("n").build();
        group.update(&template, true);
        assert_eq!(group.name, "New");
        assert_eq!(group.notes, "n");
        assert_eq!(group.uuid, uuid);
        assert_eq!(group.children(), [Node::Entry(child)]);
    }

    #[test]
    fn test_group_fields_xml() {
        let mut group = GroupBuilder::new("Email").notes("mail").build();
        group.enable_auto_type = Some(true);
        group.custom_data.set("k", "v");

        let mut stream = InnerRandomStream::new(InnerStreamAlgorithm::Salsa20, &[1u8; 32]).unwrap();
        let ctx = XmlContext::new(KdbxVersion::V4, &mut stream);
        let element = group.to_xml_fields(&ctx);
        assert_eq!(element.child("EnableSearching").unwrap().text, "null");

        let mut parsed = Group::new("");
        for child in &element.children {
            assert!(parsed.apply_xml_field(child).unwrap(), "{}", child.name);
        }
        assert_eq!(parsed, group);
    }
}
