//! The in-memory document tree and its XML mapping

use crate::dom::{self, XmlElement};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::group::{Group, Node};
use crate::header::KdbxVersion;
use crate::inner_stream::InnerRandomStream;
use crate::meta::{Binary, DeletedObject, Metadata};
use crate::protected::{mask_unknown, unmask_unknown, XmlContext};
use std::collections::HashMap;
use uuid::Uuid;

/// A decrypted KeePass database.
///
/// Groups and entries live in maps keyed by UUID; the tree shape is carried
/// by each group's ordered `children` and each node's `parent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdbxDocument {
    pub meta: Metadata,
    root: Uuid,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
    pub deleted_objects: Vec<DeletedObject>,
    /// Attachment pool referenced by `EntryBinary::reference`
    pub binaries: Vec<Binary>,
    /// Unmodelled children of `<Root>`
    pub unknown_root: Vec<XmlElement>,
    /// Unmodelled children of `<KeePassFile>`
    pub unknown: Vec<XmlElement>,
}

impl KdbxDocument {
    /// Create an empty database whose root group carries `name`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Group::new(name.clone());
        let root_uuid = root.uuid;

        let mut groups = HashMap::new();
        groups.insert(root_uuid, root);

        let mut meta = Metadata::default();
        meta.database_name = name;

        Self {
            meta,
            root: root_uuid,
            groups,
            entries: HashMap::new(),
            deleted_objects: Vec::new(),
            binaries: Vec::new(),
            unknown_root: Vec::new(),
            unknown: Vec::new(),
        }
    }

    pub fn root(&self) -> Uuid {
        self.root
    }

    pub fn root_group(&self) -> &Group {
        &self.groups[&self.root]
    }

    pub fn group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    pub fn group_mut(&mut self, uuid: &Uuid) -> Option<&mut Group> {
        self.groups.get_mut(uuid)
    }

    pub fn entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    pub fn entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(uuid)
    }

    /// All groups, in no particular order
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// All entries, in no particular order
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Entries directly inside a group, in display order
    pub fn entries_in_group(&self, group_uuid: &Uuid) -> Vec<&Entry> {
        self.groups
            .get(group_uuid)
            .map(|group| group.entries().filter_map(|uuid| self.entries.get(&uuid)).collect())
            .unwrap_or_default()
    }

    /// Entries matching `predicate`, in document order
    pub fn find_entries<F>(&self, predicate: F) -> Vec<&Entry>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut found = Vec::new();
        self.collect_entries(&self.root, &predicate, &mut found);
        found
    }

    fn collect_entries<'a, F>(&'a self, group: &Uuid, predicate: &F, found: &mut Vec<&'a Entry>)
    where
        F: Fn(&Entry) -> bool,
    {
        let Some(group) = self.groups.get(group) else {
            return;
        };
        for node in group.children() {
            match node {
                Node::Entry(uuid) => {
                    if let Some(entry) = self.entries.get(uuid).filter(|e| predicate(e)) {
                        found.push(entry);
                    }
                }
                Node::Group(uuid) => self.collect_entries(uuid, predicate, found),
            }
        }
    }

    /// Add a group under `parent`
    pub fn add_group(&mut self, parent: Uuid, mut group: Group) -> Result<Uuid> {
        let uuid = group.uuid;
        self.check_insertable(uuid, parent)?;
        group.parent = Some(parent);
        self.attach(parent, Node::Group(uuid))?;
        self.groups.insert(uuid, group);
        Ok(uuid)
    }

    /// Add an entry under `parent`
    pub fn add_entry(&mut self, parent: Uuid, mut entry: Entry) -> Result<Uuid> {
        let uuid = entry.uuid;
        self.check_insertable(uuid, parent)?;
        entry.parent = Some(parent);
        self.attach(parent, Node::Entry(uuid))?;
        self.entries.insert(uuid, entry);
        Ok(uuid)
    }

    /// Create an empty entry under `parent` using the database memory protection
    pub fn new_entry(&mut self, parent: Uuid) -> Result<Uuid> {
        let entry = Entry::with_protection(&self.meta.memory_protection);
        self.add_entry(parent, entry)
    }

    /// Add an attachment to the pool and return its reference
    pub fn add_binary(&mut self, data: Vec<u8>, protected: bool) -> usize {
        self.binaries.push(Binary { data, protected });
        self.binaries.len() - 1
    }

    fn check_insertable(&self, uuid: Uuid, parent: Uuid) -> Result<()> {
        if !self.groups.contains_key(&parent) {
            return Err(Error::GroupNotFound(parent));
        }
        if self.groups.contains_key(&uuid) || self.entries.contains_key(&uuid) {
            return Err(Error::InvalidAdoption {
                node: uuid,
                target: parent,
            });
        }
        Ok(())
    }

    fn attach(&mut self, parent: Uuid, node: Node) -> Result<()> {
        let group = self
            .groups
            .get_mut(&parent)
            .ok_or(Error::GroupNotFound(parent))?;
        group.add_child(node);
        Ok(())
    }

    /// Delete an entry and record a tombstone
    pub fn remove_entry(&mut self, uuid: &Uuid) -> Result<Entry> {
        let entry = self
            .entries
            .remove(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;

        if let Some(group) = entry.parent.and_then(|p| self.groups.get_mut(&p)) {
            group.remove_child(uuid);
        }
        self.record_deletion(*uuid);
        Ok(entry)
    }

    /// Delete a group with everything below it
    pub fn remove_group(&mut self, uuid: &Uuid) -> Result<Group> {
        if *uuid == self.root {
            return Err(Error::RootGroupImmutable);
        }
        let group = self
            .groups
            .remove(uuid)
            .ok_or(Error::GroupNotFound(*uuid))?;

        if let Some(parent) = group.parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.remove_child(uuid);
        }

        for node in group.children() {
            match node {
                Node::Entry(child) => {
                    self.remove_entry(child)?;
                }
                Node::Group(child) => {
                    self.remove_group(child)?;
                }
            }
        }
        self.record_deletion(*uuid);
        Ok(group)
    }

    fn record_deletion(&mut self, uuid: Uuid) {
        self.deleted_objects.push(DeletedObject {
            uuid,
            deletion_time: dom::now(),
        });
    }

    /// True if `ancestor` is `node` or lies on the path from `node` to the root
    fn is_ancestor_or_self(&self, ancestor: &Uuid, node: &Uuid) -> bool {
        let mut current = Some(*node);
        while let Some(uuid) = current {
            if uuid == *ancestor {
                return true;
            }
            current = self.groups.get(&uuid).and_then(|g| g.parent);
        }
        false
    }

    /// Whether `node` (a group or entry) may be moved under group `target`
    pub fn can_adopt(&self, node: &Uuid, target: &Uuid) -> bool {
        if *node == self.root || !self.groups.contains_key(target) {
            return false;
        }
        if self.entries.contains_key(node) {
            return true;
        }
        self.groups.contains_key(node) && !self.is_ancestor_or_self(node, target)
    }

    /// Move `node` under `target`; the tree is unchanged on error
    pub fn try_adopt(&mut self, node: &Uuid, target: &Uuid) -> Result<()> {
        if !self.groups.contains_key(target) {
            return Err(Error::GroupNotFound(*target));
        }
        if !self.groups.contains_key(node) && !self.entries.contains_key(node) {
            return Err(Error::EntryNotFound(*node));
        }
        if !self.can_adopt(node, target) {
            return Err(Error::InvalidAdoption {
                node: *node,
                target: *target,
            });
        }

        let now = dom::now();
        let (old_parent, child) = match self.entries.get_mut(node) {
            Some(entry) => {
                let old = entry.parent.replace(*target);
                entry.times.location_changed = now;
                (old, Node::Entry(*node))
            }
            None => {
                let group = self
                    .groups
                    .get_mut(node)
                    .ok_or(Error::GroupNotFound(*node))?;
                let old = group.parent.replace(*target);
                group.times.location_changed = now;
                (old, Node::Group(*node))
            }
        };

        if let Some(parent) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.remove_child(node);
        }
        self.attach(*target, child)?;
        tracing::debug!(node = %node, target = %target, "Moved node");
        Ok(())
    }

    /// Apply `template` to an entry, keeping history per `HistoryMaxItems`
    pub fn update_entry(&mut self, uuid: &Uuid, template: &Entry, update_mod_time: bool) -> Result<bool> {
        let max_items = self.meta.history_max_items;
        let entry = self
            .entries
            .get_mut(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;
        Ok(entry.update(template, max_items, update_mod_time))
    }

    /// Build the document from its XML.
    ///
    /// `inner_binaries` is the 4.x inner header pool; 3.x documents carry
    /// theirs in `Meta`. Returns the `Meta/HeaderHash` value if present.
    pub(crate) fn from_xml(
        data: &[u8],
        version: KdbxVersion,
        stream: &mut InnerRandomStream,
        inner_binaries: Vec<Binary>,
    ) -> Result<(Self, Option<Vec<u8>>)> {
        let document = XmlElement::parse(data)?;
        if document.name != "KeePassFile" {
            return Err(Error::MalformedXml(format!(
                "unexpected document element <{}>",
                document.name
            )));
        }

        let mut ctx = XmlContext::new(version, stream);
        let mut meta = None;
        let mut header_hash = None;
        let mut binaries = inner_binaries;
        let mut root_element = None;
        let mut unknown = Vec::new();

        for child in &document.children {
            match child.name.as_str() {
                "Meta" => {
                    let (parsed, extras) = Metadata::from_xml(child, &mut ctx)?;
                    meta = Some(parsed);
                    header_hash = extras.header_hash;
                    if version < KdbxVersion::V4 {
                        binaries = extras.binaries;
                    }
                }
                "Root" => {
                    // Root always follows Meta, so the stream position is right
                    root_element = Some(child);
                    break;
                }
                _ => unknown.push(unmask_unknown(child, &mut ctx)?),
            }
        }
        let root_element =
            root_element.ok_or_else(|| Error::MalformedXml("missing <Root>".to_string()))?;

        let mut builder = TreeBuilder::default();
        let mut root = None;
        let mut deleted_objects = Vec::new();
        let mut unknown_root = Vec::new();
        for child in &root_element.children {
            match child.name.as_str() {
                "Group" if root.is_none() => {
                    root = Some(builder.parse_group(child, None, &mut ctx)?);
                }
                "DeletedObjects" => {
                    for object in child.children_named("DeletedObject") {
                        deleted_objects.push(DeletedObject::from_xml(object)?);
                    }
                }
                _ => unknown_root.push(unmask_unknown(child, &mut ctx)?),
            }
        }
        let root = root.ok_or_else(|| Error::MalformedXml("missing root group".to_string()))?;

        // Elements after <Root> are rare but kept
        for child in document
            .children
            .iter()
            .skip_while(|c| c.name != "Root")
            .skip(1)
        {
            unknown.push(unmask_unknown(child, &mut ctx)?);
        }

        let document = Self {
            meta: meta.unwrap_or_default(),
            root,
            groups: builder.groups,
            entries: builder.entries,
            deleted_objects,
            binaries,
            unknown_root,
            unknown,
        };
        document.warn_dangling_binaries();
        Ok((document, header_hash))
    }

    fn warn_dangling_binaries(&self) {
        for entry in self.entries.values() {
            for binary in &entry.binaries {
                if binary.reference >= self.binaries.len() {
                    tracing::warn!(
                        entry = %entry.uuid,
                        reference = binary.reference,
                        "Attachment refers past the binary pool"
                    );
                }
            }
        }
    }

    /// Serialize to XML, masking protected values with `stream` in document order
    pub(crate) fn to_xml(
        &self,
        version: KdbxVersion,
        stream: &mut InnerRandomStream,
        header_hash: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let mut ctx = XmlContext::new(version, stream);
        let mut document = XmlElement::new("KeePassFile");
        document.push(self.meta.to_xml(&mut ctx, header_hash, &self.binaries)?);

        let mut root = XmlElement::new("Root");
        root.push(self.group_to_xml(&self.root, &mut ctx)?);
        let mut deleted = XmlElement::new("DeletedObjects");
        for object in &self.deleted_objects {
            deleted.push(object.to_xml(&ctx));
        }
        root.push(deleted);
        for extra in &self.unknown_root {
            root.push(mask_unknown(extra, &mut ctx));
        }

        document.push(root);
        for extra in &self.unknown {
            document.push(mask_unknown(extra, &mut ctx));
        }
        document.write_document()
    }

    fn group_to_xml(&self, uuid: &Uuid, ctx: &mut XmlContext<'_>) -> Result<XmlElement> {
        let group = self.groups.get(uuid).ok_or(Error::GroupNotFound(*uuid))?;
        let mut element = group.to_xml_fields(ctx);
        for node in group.children() {
            match node {
                Node::Entry(child) => {
                    let entry = self.entries.get(child).ok_or(Error::EntryNotFound(*child))?;
                    element.push(entry.to_xml(ctx));
                }
                Node::Group(child) => element.push(self.group_to_xml(child, ctx)?),
            }
        }
        for extra in &group.unknown {
            element.push(mask_unknown(extra, ctx));
        }
        Ok(element)
    }
}

/// Accumulates nodes during the single pass over `<Root>`
#[derive(Default)]
struct TreeBuilder {
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
}

impl TreeBuilder {
    fn claim(&self, uuid: Uuid) -> Result<()> {
        if self.groups.contains_key(&uuid) || self.entries.contains_key(&uuid) {
            return Err(Error::MalformedXml(format!("duplicate UUID {}", uuid)));
        }
        Ok(())
    }

    fn parse_group(
        &mut self,
        element: &XmlElement,
        parent: Option<Uuid>,
        ctx: &mut XmlContext<'_>,
    ) -> Result<Uuid> {
        let uuid = element
            .child("UUID")
            .map(|u| dom::parse_uuid(&u.text))
            .transpose()?
            .ok_or_else(|| Error::MalformedXml("Group without UUID".to_string()))?;
        self.claim(uuid)?;

        let mut group = Group::new("");
        group.uuid = uuid;
        group.parent = parent;

        for child in &element.children {
            match child.name.as_str() {
                "Entry" => {
                    let mut entry = Entry::from_xml(child, ctx, false)?;
                    self.claim(entry.uuid)?;
                    entry.parent = Some(uuid);
                    group.children.push(Node::Entry(entry.uuid));
                    self.entries.insert(entry.uuid, entry);
                }
                "Group" => {
                    let child_uuid = self.parse_group(child, Some(uuid), ctx)?;
                    group.children.push(Node::Group(child_uuid));
                }
                _ => {
                    if !group.apply_xml_field(child)? {
                        group.unknown.push(unmask_unknown(child, ctx)?);
                    }
                }
            }
        }

        self.groups.insert(uuid, group);
        Ok(uuid)
    }
}
