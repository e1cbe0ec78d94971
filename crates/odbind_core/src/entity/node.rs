//! Property access and snapshot handling for entity nodes.

use super::id::{CollectionId, NodeId};
use super::notify::ChangeEvent;
use super::store::{effective, EntityStore};
use crate::definition::{EntityDefinition, FieldKind};
use crate::error::{CoreError, CoreResult};
use crate::value::{Record, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Lifecycle state of an entity node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Created locally, never confirmed by the server.
    Create,
    /// In sync with the last server snapshot.
    Read,
    /// Locally edited since the last snapshot.
    Update,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Create => "create",
            Lifecycle::Read => "read",
            Lifecycle::Update => "update",
        };
        f.write_str(name)
    }
}

/// Result of reading a field from a node.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyRef {
    /// Tracked property (changed value, else stored value).
    Value(Value),
    /// Detail blob.
    Detail(Value),
    /// Child collection.
    Collection(CollectionId),
    /// Nothing under that name.
    Missing,
}

impl PropertyRef {
    /// The property or detail value, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            PropertyRef::Value(v) | PropertyRef::Detail(v) => Some(v),
            _ => None,
        }
    }

    /// The child collection, if any.
    pub fn collection(&self) -> Option<CollectionId> {
        match self {
            PropertyRef::Collection(c) => Some(*c),
            _ => None,
        }
    }

    /// True if nothing was found.
    pub fn is_missing(&self) -> bool {
        matches!(self, PropertyRef::Missing)
    }
}

/// Options for [`EntityStore::request_payload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOptions {
    /// Omit the top-level primary key field.
    pub remove_primary_key: bool,
    /// Omit detail blobs at every level.
    pub without_details: bool,
    /// Omit child arrays.
    pub without_children: bool,
    /// Maximum child nesting; `None` is unbounded.
    pub depth: Option<usize>,
}

impl PayloadOptions {
    /// Payload used to create an entity on the server.
    pub fn for_create() -> Self {
        Self {
            remove_primary_key: true,
            without_details: true,
            ..Self::default()
        }
    }
}

/// Options for [`EntityStore::clone_node`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneOptions {
    /// Record the source as the clone's base so a save propagates back.
    pub as_working_copy: bool,
}

impl EntityStore {
    /// Reads a field: changed value, else stored value, else detail, else
    /// child collection.
    pub fn get(&self, node: NodeId, name: &str) -> CoreResult<PropertyRef> {
        let state = self.node(node)?;
        if let Some(value) = effective(state, name) {
            return Ok(PropertyRef::Value(value.clone()));
        }
        if let Some(value) = state.details.get(name) {
            return Ok(PropertyRef::Detail(value.clone()));
        }
        if let FieldKind::Child(index) = state.definition.classify(name) {
            return Ok(PropertyRef::Collection(state.children[index]));
        }
        Ok(PropertyRef::Missing)
    }

    /// Writes a field, routed by its classification.
    ///
    /// Tracked properties are diffed against the stored value: writing the
    /// stored value back removes the key from the changed set. An absent
    /// stored value compares equal to `Null`. Writing an array to a child
    /// navigation key re-syncs that collection.
    pub fn set(&mut self, node: NodeId, name: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        let kind = self.node(node)?.definition.classify(name);
        match kind {
            FieldKind::Property => {
                let state = self.node_mut(node)?;
                let unchanged = state.stored.get(name).unwrap_or(&Value::Null) == &value;
                if unchanged {
                    state.changed.remove(name);
                } else {
                    state.changed.insert(name.to_string(), value);
                    if state.lifecycle == Lifecycle::Read {
                        state.lifecycle = Lifecycle::Update;
                    }
                }
                self.emit(ChangeEvent::PropertyChanged {
                    node,
                    name: name.to_string(),
                });
                Ok(())
            }
            FieldKind::Detail => self.set_detail(node, name, value),
            FieldKind::Child(index) => {
                let collection = self.node(node)?.children[index];
                let records = match value {
                    Value::Array(items) => records_of(items, name),
                    Value::Null => Vec::new(),
                    _ => {
                        return Err(CoreError::invalid(format!(
                            "child collection '{name}' can only be set from an array"
                        )))
                    }
                };
                self.sync_from(collection, &records)
            }
        }
    }

    /// Overwrites a detail blob; `Null` removes it.
    pub fn set_detail(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        let value = value.into();
        let state = self.node_mut(node)?;
        if value.is_null() {
            state.details.remove(name);
        } else {
            state.details.insert(name.to_string(), value);
        }
        self.emit(ChangeEvent::DetailChanged {
            node,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Replaces the node's whole state with server data.
    ///
    /// Properties and details absent from `data` are dropped. Child
    /// collections are emptied and repopulated as stored members. The node
    /// ends in `Read`.
    pub fn import_snapshot(&mut self, node: NodeId, data: &Record) -> CoreResult<()> {
        self.reset_from(node, data)?;
        self.emit(ChangeEvent::SnapshotImported { node });
        Ok(())
    }

    /// Builds a plain nested record of the node's effective state.
    pub fn request_payload(&self, node: NodeId, options: PayloadOptions) -> CoreResult<Record> {
        let state = self.node(node)?;
        let mut payload = state.stored.clone();
        payload.extend(state.changed.iter().map(|(k, v)| (k.clone(), v.clone())));
        if options.remove_primary_key {
            payload.remove(&state.definition.primary_key);
        }
        if !options.without_details {
            payload.extend(state.details.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if options.without_children || options.depth == Some(0) {
            return Ok(payload);
        }

        let nested = PayloadOptions {
            remove_primary_key: false,
            depth: options.depth.map(|d| d - 1),
            ..options
        };
        for (definition, collection) in state.definition.children.iter().zip(&state.children) {
            let members = self
                .entities(*collection)?
                .into_iter()
                .map(|member| self.request_payload(member, nested).map(Value::Object))
                .collect::<CoreResult<Vec<_>>>()?;
            payload.insert(definition.navigation().to_string(), Value::Array(members));
        }
        Ok(payload)
    }

    /// Stamps `data[foreign_key]` with the node's primary value when the
    /// child definition declares a foreign key and the node is persisted.
    pub fn assign_foreign_key(
        &self,
        node: NodeId,
        child: &EntityDefinition,
        data: &mut Record,
    ) -> CoreResult<()> {
        let Some(foreign_key) = &child.foreign_key else {
            return Ok(());
        };
        let primary = self.primary_value(node)?;
        if !primary.is_null() {
            data.insert(foreign_key.clone(), primary);
        }
        Ok(())
    }

    /// Applies a server response body to a node.
    ///
    /// Properties are replaced, returned details override existing ones,
    /// and child collections are re-synced only when the body carries
    /// their navigation key. The node ends in `Read`.
    pub fn apply_server_response(&mut self, node: NodeId, body: &Record) -> CoreResult<()> {
        let definition = self.definition(node)?;
        let mut properties = Record::new();
        let mut details = Vec::new();
        let mut children = Vec::new();
        for (name, value) in body {
            match definition.classify(name) {
                FieldKind::Property => {
                    properties.insert(name.clone(), value.clone());
                }
                FieldKind::Detail => details.push((name.clone(), value.clone())),
                FieldKind::Child(index) => children.push((index, name.as_str(), value.clone())),
            }
        }

        let (created, collections) = {
            let state = self.node_mut(node)?;
            let created = state.lifecycle == Lifecycle::Create;
            state.stored = properties;
            state.changed.clear();
            state.details.extend(details);
            state.lifecycle = Lifecycle::Read;
            (created, state.children.clone())
        };
        let mut echoed = vec![false; collections.len()];
        for (index, name, value) in children {
            let records = match value {
                Value::Array(items) => records_of(items, name),
                Value::Object(record) => vec![record],
                _ => Vec::new(),
            };
            self.sync_from(collections[index], &records)?;
            echoed[index] = true;
        }
        if created {
            for (index, collection) in collections.iter().enumerate() {
                if !echoed[index] {
                    self.drop_unconfirmed(*collection)?;
                }
            }
        }
        self.emit(ChangeEvent::SnapshotImported { node });
        Ok(())
    }

    /// Drops new members that were deep-inserted with their parent but
    /// whose keys the server did not echo back. A later load brings them
    /// back as server rows.
    fn drop_unconfirmed(&mut self, collection: CollectionId) -> CoreResult<()> {
        let new = self.collection(collection)?.new.clone();
        let mut dropped = 0usize;
        for member in new {
            if self.primary_value(member)?.is_null() {
                self.detach_member(collection, member)?;
                self.free_node(member);
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(%collection, dropped, "create response omitted deep-inserted members");
        }
        Ok(())
    }

    /// Clears the node and repopulates it from server data in `Read`.
    pub(super) fn reset_from(&mut self, node: NodeId, data: &Record) -> CoreResult<()> {
        let children = self.node(node)?.children.clone();
        for collection in children {
            self.free_members(collection);
        }
        {
            let state = self.node_mut(node)?;
            state.stored.clear();
            state.changed.clear();
            state.details.clear();
            state.lifecycle = Lifecycle::Read;
        }
        self.populate(node, data, Lifecycle::Read)
    }

    /// Fills an empty node from `data`. Nested child records become stored
    /// members for `Read` and new members for `Create`.
    pub(super) fn populate(
        &mut self,
        node: NodeId,
        data: &Record,
        lifecycle: Lifecycle,
    ) -> CoreResult<()> {
        let definition = self.definition(node)?;
        let collections = self.node(node)?.children.clone();
        for (name, value) in data {
            match definition.classify(name) {
                FieldKind::Property => {
                    self.node_mut(node)?
                        .stored
                        .insert(name.clone(), value.clone());
                }
                FieldKind::Detail => {
                    self.node_mut(node)?
                        .details
                        .insert(name.clone(), value.clone());
                }
                FieldKind::Child(index) => {
                    let child = Arc::clone(&definition.children[index]);
                    let collection = collections[index];
                    let records = match value {
                        Value::Array(items) => records_of(items.clone(), name),
                        Value::Object(record) => vec![record.clone()],
                        _ => Vec::new(),
                    };
                    for mut record in records {
                        if lifecycle == Lifecycle::Create {
                            self.assign_foreign_key(node, &child, &mut record)?;
                        }
                        let member =
                            self.alloc_node(Arc::clone(&child), lifecycle, Some(collection));
                        self.populate(member, &record, lifecycle)?;
                        let coll = self.collection_mut(collection)?;
                        if lifecycle == Lifecycle::Create {
                            coll.new.push(member);
                        } else {
                            coll.stored.push(member);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Keeps the object elements of an incoming child array.
pub(super) fn records_of(items: Vec<Value>, navigation: &str) -> Vec<Record> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) => Some(record),
            other => {
                warn!(%navigation, value = ?other, "skipping non-object child element");
                None
            }
        })
        .collect()
}
