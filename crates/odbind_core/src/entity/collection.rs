//! Child collection operations.
//!
//! A collection keeps server-confirmed members (`stored`), locally added
//! members (`new`) and tombstones: indices into `stored` marked for
//! deletion. The public view is `remaining ++ new`.

use super::id::{CollectionId, NodeId};
use super::node::{Lifecycle, PayloadOptions};
use super::notify::ChangeEvent;
use super::store::{EntityStore, Slot};
use crate::error::{CoreError, CoreResult};
use crate::value::Record;
use std::sync::Arc;
use tracing::debug;

/// What to add to a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum AddSource {
    /// An existing node.
    Node(NodeId),
    /// Raw data materialized as a new node.
    Data(Record),
}

impl From<NodeId> for AddSource {
    fn from(node: NodeId) -> Self {
        AddSource::Node(node)
    }
}

impl From<Record> for AddSource {
    fn from(record: Record) -> Self {
        AddSource::Data(record)
    }
}

impl EntityStore {
    /// Creates an unattached node in `Create` state whose parent is the
    /// collection. It becomes a member once passed to [`EntityStore::add`].
    pub fn create(&mut self, collection: CollectionId) -> CoreResult<NodeId> {
        let definition = Arc::clone(&self.collection(collection)?.definition);
        Ok(self.alloc_node(definition, Lifecycle::Create, Some(collection)))
    }

    /// Appends a member to the collection's new list.
    ///
    /// A node of the same tree that is not yet a member is adopted. A node
    /// of another tree is copied. Raw data becomes a fresh `Create` node
    /// with the owner's foreign key stamped.
    pub fn add(&mut self, collection: CollectionId, source: impl Into<AddSource>) -> CoreResult<NodeId> {
        let node = match source.into() {
            AddSource::Data(record) => self.add_data(collection, record)?,
            AddSource::Node(node) => {
                let same_tree =
                    self.tree_of_node(node)? == self.tree_of_collection(collection)?;
                if !same_tree {
                    let data = self.request_payload(node, PayloadOptions::default())?;
                    self.add_data(collection, data)?
                } else {
                    if self.slot_of(node)?.is_some() {
                        return Err(CoreError::AlreadyAttached(node));
                    }
                    let definition = Arc::clone(&self.collection(collection)?.definition);
                    let state = self.node(node)?;
                    if !Arc::ptr_eq(&state.definition, &definition) {
                        return Err(CoreError::IdentityMismatch {
                            target_entity: definition.entity_name.clone(),
                            source_entity: state.definition.entity_name.clone(),
                        });
                    }
                    if let Some(owner) = self.collection(collection)?.owner {
                        if self.is_within(owner, node)? {
                            return Err(CoreError::invalid(format!(
                                "{node} cannot be added beneath itself"
                            )));
                        }
                    }
                    self.node_mut(node)?.parent = Some(collection);
                    self.collection_mut(collection)?.new.push(node);
                    node
                }
            }
        };
        self.emit(ChangeEvent::MemberAdded { collection, node });
        Ok(node)
    }

    fn add_data(&mut self, collection: CollectionId, mut record: Record) -> CoreResult<NodeId> {
        let (definition, owner) = {
            let coll = self.collection(collection)?;
            (Arc::clone(&coll.definition), coll.owner)
        };
        if let Some(owner) = owner {
            self.assign_foreign_key(owner, &definition, &mut record)?;
        }
        let node = self.alloc_node(definition, Lifecycle::Create, Some(collection));
        self.populate(node, &record, Lifecycle::Create)?;
        self.collection_mut(collection)?.new.push(node);
        Ok(node)
    }

    /// Removes the member at `index` of the public view.
    ///
    /// Remaining stored members are tombstoned; new members are spliced
    /// out and released.
    pub fn remove(&mut self, collection: CollectionId, index: usize) -> CoreResult<NodeId> {
        let coll = self.collection_mut(collection)?;
        let remaining = coll.remaining_len();
        let node = if index < remaining {
            let (stored_index, node) = coll
                .remaining()
                .nth(index)
                .ok_or(CoreError::IndexOutOfRange {
                    index,
                    len: remaining + coll.new.len(),
                })?;
            coll.deleted.insert(stored_index);
            node
        } else if index < remaining + coll.new.len() {
            let node = coll.new.remove(index - remaining);
            self.free_node(node);
            node
        } else {
            return Err(CoreError::IndexOutOfRange {
                index,
                len: remaining + coll.new.len(),
            });
        };
        self.emit(ChangeEvent::MemberRemoved { collection, node });
        Ok(node)
    }

    /// Puts `new` into the slot held by `old` and releases `old`.
    pub fn replace_member(
        &mut self,
        collection: CollectionId,
        old: NodeId,
        new: NodeId,
    ) -> CoreResult<()> {
        if old == new {
            return Ok(());
        }
        let slot = match self.slot_of(old)? {
            Some((parent, slot)) if parent == collection => slot,
            _ => return Err(CoreError::NotAMember { node: old, collection }),
        };
        if self.slot_of(new)?.is_some() {
            return Err(CoreError::AlreadyAttached(new));
        }
        let definition = Arc::clone(&self.collection(collection)?.definition);
        let new_definition = self.definition(new)?;
        if !Arc::ptr_eq(&definition, &new_definition) {
            return Err(CoreError::IdentityMismatch {
                target_entity: definition.entity_name.clone(),
                source_entity: new_definition.entity_name.clone(),
            });
        }
        if self.is_within(new, old)? {
            return Err(CoreError::invalid(format!(
                "{new} lies inside the member it would replace"
            )));
        }

        let coll = self.collection_mut(collection)?;
        match slot {
            Slot::Stored(i) => coll.stored[i] = new,
            Slot::New(i) => coll.new[i] = new,
        }
        let state = self.node_mut(new)?;
        state.parent = Some(collection);
        state.base = None;
        self.free_node(old);
        self.emit(ChangeEvent::MemberReplaced {
            collection,
            old,
            new,
        });
        Ok(())
    }

    /// Re-syncs the collection from incoming records.
    ///
    /// Pending new members are discarded and every stored member is
    /// tombstoned. Each stored member with a primary value is matched to the
    /// first unclaimed record carrying an equal primary key, re-imported in
    /// place and un-tombstoned. Unmatched records are added as new members.
    pub fn sync_from(&mut self, collection: CollectionId, data: &[Record]) -> CoreResult<()> {
        let (definition, discarded, stored) = {
            let coll = self.collection_mut(collection)?;
            let discarded = std::mem::take(&mut coll.new);
            coll.deleted = (0..coll.stored.len()).collect();
            (Arc::clone(&coll.definition), discarded, coll.stored.clone())
        };
        for node in discarded {
            self.free_node(node);
        }

        let primary_key = definition.primary_key.as_str();
        let mut claimed = vec![false; data.len()];
        let mut matched = 0usize;
        for (index, member) in stored.into_iter().enumerate() {
            let primary = self.primary_value(member)?;
            if primary.is_null() {
                continue;
            }
            let found = data.iter().enumerate().position(|(i, record)| {
                !claimed[i] && record.get(primary_key) == Some(&primary)
            });
            if let Some(i) = found {
                claimed[i] = true;
                matched += 1;
                self.reset_from(member, &data[i])?;
                self.collection_mut(collection)?.deleted.remove(&index);
            }
        }

        for (record, _) in data.iter().zip(&claimed).filter(|(_, claimed)| !**claimed) {
            self.add_data(collection, record.clone())?;
        }
        debug!(
            %collection,
            incoming = data.len(),
            matched,
            "synced collection"
        );
        self.emit(ChangeEvent::CollectionSynced { collection });
        Ok(())
    }

    /// Physically removes a member without releasing it.
    ///
    /// Removing stored index `i` drops `i` from the tombstones and shifts
    /// every higher tombstone down by one. The node becomes a root.
    pub fn detach(&mut self, collection: CollectionId, node: NodeId) -> CoreResult<()> {
        self.detach_member(collection, node)?;
        self.emit(ChangeEvent::MemberRemoved { collection, node });
        Ok(())
    }

    pub(super) fn detach_member(&mut self, collection: CollectionId, node: NodeId) -> CoreResult<()> {
        let coll = self.collection_mut(collection)?;
        if let Some(i) = coll.stored.iter().position(|m| *m == node) {
            coll.stored.remove(i);
            coll.deleted = coll
                .deleted
                .iter()
                .filter(|&&d| d != i)
                .map(|&d| if d > i { d - 1 } else { d })
                .collect();
        } else if let Some(i) = coll.new.iter().position(|m| *m == node) {
            coll.new.remove(i);
        } else {
            return Err(CoreError::NotAMember { node, collection });
        }
        self.node_mut(node)?.parent = None;
        Ok(())
    }

    /// Moves a persisted node from its collection's new list to the end of
    /// the stored list. Returns whether it moved.
    pub fn promote(&mut self, node: NodeId) -> CoreResult<bool> {
        if !self.is_persisted(node)? {
            return Ok(false);
        }
        let Some((collection, Slot::New(i))) = self.slot_of(node)? else {
            return Ok(false);
        };
        let coll = self.collection_mut(collection)?;
        coll.new.remove(i);
        coll.stored.push(node);
        Ok(true)
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Public view: remaining stored members followed by new members.
    pub fn entities(&self, collection: CollectionId) -> CoreResult<Vec<NodeId>> {
        let coll = self.collection(collection)?;
        Ok(coll
            .remaining()
            .map(|(_, node)| node)
            .chain(coll.new.iter().copied())
            .collect())
    }

    /// Stored members that are not tombstoned.
    pub fn remaining(&self, collection: CollectionId) -> CoreResult<Vec<NodeId>> {
        Ok(self
            .collection(collection)?
            .remaining()
            .map(|(_, node)| node)
            .collect())
    }

    /// Server-confirmed members, tombstoned ones included.
    pub fn stored_entities(&self, collection: CollectionId) -> CoreResult<&[NodeId]> {
        Ok(&self.collection(collection)?.stored)
    }

    /// Locally added members.
    pub fn new_entities(&self, collection: CollectionId) -> CoreResult<&[NodeId]> {
        Ok(&self.collection(collection)?.new)
    }

    /// Tombstoned indices into the stored list, ascending.
    pub fn deleted_indices(&self, collection: CollectionId) -> CoreResult<Vec<usize>> {
        Ok(self.collection(collection)?.deleted.iter().copied().collect())
    }

    /// Length of the public view.
    pub fn len(&self, collection: CollectionId) -> CoreResult<usize> {
        let coll = self.collection(collection)?;
        Ok(coll.remaining_len() + coll.new.len())
    }

    /// True if the public view is empty.
    pub fn is_empty(&self, collection: CollectionId) -> CoreResult<bool> {
        Ok(self.len(collection)? == 0)
    }

    /// Member at `index` of the public view.
    pub fn member(&self, collection: CollectionId, index: usize) -> CoreResult<NodeId> {
        let entities = self.entities(collection)?;
        entities
            .get(index)
            .copied()
            .ok_or(CoreError::IndexOutOfRange {
                index,
                len: entities.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::EntityDefinition;
    use crate::value::Value;
    use proptest::prelude::*;
    use serde_json::json;

    fn line_definition() -> Arc<EntityDefinition> {
        EntityDefinition::new("OrderLines", "LineID")
            .with_navigation_key("Lines")
            .with_foreign_key("OrderID")
            .shared()
    }

    fn order_definition(lines: Arc<EntityDefinition>) -> Arc<EntityDefinition> {
        EntityDefinition::new("Orders", "OrderID")
            .with_shared_child(lines)
            .shared()
    }

    fn record(json: serde_json::Value) -> Record {
        Value::from(json).into_object().unwrap()
    }

    fn order_with_lines(store: &mut EntityStore, count: i64) -> (NodeId, CollectionId) {
        let order = store.create_root(order_definition(line_definition()));
        let lines = (1..=count)
            .map(|id| json!({"LineID": id, "Name": format!("line {id}")}))
            .collect::<Vec<_>>();
        store
            .import_snapshot(order, &record(json!({"OrderID": 100, "Lines": lines})))
            .unwrap();
        let collection = store.child(order, "Lines").unwrap();
        (order, collection)
    }

    fn ids(store: &EntityStore, nodes: &[NodeId]) -> Vec<i64> {
        nodes
            .iter()
            .map(|n| store.primary_value(*n).unwrap().as_i64().unwrap_or(-1))
            .collect()
    }

    #[test]
    fn tombstones_address_current_stored_list() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 4);

        store.remove(lines, 1).unwrap();
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![1]);
        store.remove(lines, 1).unwrap();
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![1, 2]);
        assert_eq!(ids(&store, &store.entities(lines).unwrap()), vec![1, 4]);
    }

    #[test]
    fn detach_remaps_tombstones() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 5);
        store.remove(lines, 1).unwrap();
        store.remove(lines, 2).unwrap();
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![1, 3]);

        let first = store.stored_entities(lines).unwrap()[0];
        store.detach(lines, first).unwrap();
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![0, 2]);
        assert_eq!(store.parent(first).unwrap(), None);

        let tombstoned = store.stored_entities(lines).unwrap()[0];
        store.detach(lines, tombstoned).unwrap();
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![1]);
        assert_eq!(ids(&store, &store.entities(lines).unwrap()), vec![3, 5]);

        assert!(matches!(
            store.detach(lines, first),
            Err(CoreError::NotAMember { .. })
        ));
    }

    #[test]
    fn remove_new_member_releases_it() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 1);
        let added = store
            .add(lines, AddSource::Data(record(json!({"Name": "new"}))))
            .unwrap();
        assert_eq!(store.len(lines).unwrap(), 2);

        assert_eq!(store.remove(lines, 1).unwrap(), added);
        assert!(!store.contains(added));
        assert!(store.deleted_indices(lines).unwrap().is_empty());
        assert!(matches!(
            store.remove(lines, 1),
            Err(CoreError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn add_data_stamps_foreign_key() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 0);
        let added = store.add(lines, record(json!({"Name": "x"}))).unwrap();
        assert_eq!(store.lifecycle(added).unwrap(), Lifecycle::Create);
        assert_eq!(
            store.get(added, "OrderID").unwrap().value(),
            Some(&Value::from(100))
        );
        assert_eq!(store.new_entities(lines).unwrap(), &[added]);
    }

    #[test]
    fn add_adopts_created_node() {
        let mut store = EntityStore::new();
        let (order, lines) = order_with_lines(&mut store, 0);
        let created = store.create(lines).unwrap();
        assert!(store.entities(lines).unwrap().is_empty());

        store.add(lines, created).unwrap();
        assert_eq!(store.entities(lines).unwrap(), vec![created]);
        assert_eq!(store.root(created).unwrap(), order);

        assert!(matches!(
            store.add(lines, created),
            Err(CoreError::AlreadyAttached(id)) if id == created
        ));
    }

    #[test]
    fn add_copies_node_from_another_tree() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 0);
        let (_, other_lines) = order_with_lines(&mut store, 1);
        let foreign = store.member(other_lines, 0).unwrap();

        let copy = store.add(lines, foreign).unwrap();
        assert_ne!(copy, foreign);
        assert_eq!(store.entities(other_lines).unwrap(), vec![foreign]);
        assert_eq!(store.lifecycle(copy).unwrap(), Lifecycle::Create);
        assert_eq!(
            store.get(copy, "Name").unwrap().value(),
            Some(&Value::from("line 1"))
        );
    }

    #[test]
    fn add_rejects_other_definition_in_same_tree() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 0);
        let lookalike = store.create(lines).unwrap();
        // A definition equal in content but not shared
        let stranger_def = line_definition();
        let stranger = store.create(lines).unwrap();
        store.nodes.get_mut(&stranger).unwrap().definition = stranger_def;

        store.add(lines, lookalike).unwrap();
        assert!(matches!(
            store.add(lines, stranger),
            Err(CoreError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn sync_from_matches_by_primary_key() {
        let mut store = EntityStore::new();
        let order = store.create_root(order_definition(line_definition()));
        store
            .import_snapshot(
                order,
                &record(json!({"OrderID": 100, "Lines": [{"LineID": 1, "Name": "a"}]})),
            )
            .unwrap();
        let lines = store.child(order, "Lines").unwrap();
        let existing = store.member(lines, 0).unwrap();
        let pending = store.add(lines, record(json!({"Name": "pending"}))).unwrap();

        store
            .sync_from(
                lines,
                &[
                    record(json!({"LineID": 1, "Name": "a2"})),
                    record(json!({"LineID": 2, "Name": "b"})),
                ],
            )
            .unwrap();

        assert!(!store.contains(pending));
        assert_eq!(store.stored_entities(lines).unwrap(), &[existing]);
        assert!(store.deleted_indices(lines).unwrap().is_empty());
        assert_eq!(
            store.get(existing, "Name").unwrap().value(),
            Some(&Value::from("a2"))
        );
        assert_eq!(store.lifecycle(existing).unwrap(), Lifecycle::Read);
        let new = store.new_entities(lines).unwrap().to_vec();
        assert_eq!(ids(&store, &new), vec![2]);
    }

    #[test]
    fn sync_from_tombstones_unmatched_stored() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 3);
        store
            .sync_from(lines, &[record(json!({"LineID": 2}))])
            .unwrap();
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![0, 2]);
        assert_eq!(ids(&store, &store.entities(lines).unwrap()), vec![2]);
    }

    #[test]
    fn replace_member_swaps_slot() {
        let mut store = EntityStore::new();
        let (order, lines) = order_with_lines(&mut store, 2);
        let old = store.member(lines, 1).unwrap();
        let copy = store
            .clone_node(old, crate::entity::CloneOptions { as_working_copy: true })
            .unwrap();
        store.set(copy, "Name", "edited").unwrap();

        store.replace_member(lines, old, copy).unwrap();

        assert!(!store.contains(old));
        assert_eq!(store.member(lines, 1).unwrap(), copy);
        assert_eq!(store.base(copy).unwrap(), None);
        assert_eq!(store.root(copy).unwrap(), order);

        let outsider = store.create_root(line_definition());
        assert!(matches!(
            store.replace_member(lines, outsider, copy),
            Err(CoreError::NotAMember { .. })
        ));
    }

    #[test]
    fn standalone_collection_members_are_roots() {
        let mut store = EntityStore::new();
        let collection = store.create_collection(line_definition());
        store
            .sync_from(collection, &[record(json!({"LineID": 1}))])
            .unwrap();
        store.consolidate_collection(collection).unwrap();
        let member = store.member(collection, 0).unwrap();
        assert_eq!(store.root(member).unwrap(), member);
        assert_eq!(store.lifecycle(member).unwrap(), Lifecycle::Read);
        assert_eq!(store.owner(collection).unwrap(), None);
    }

    #[test]
    fn promote_moves_persisted_new_member() {
        let mut store = EntityStore::new();
        let (_, lines) = order_with_lines(&mut store, 1);
        let added = store.add(lines, record(json!({"Name": "x"}))).unwrap();
        assert!(!store.promote(added).unwrap());
        store.set(added, "LineID", 9).unwrap();
        assert!(store.promote(added).unwrap());
        assert_eq!(store.stored_entities(lines).unwrap().last(), Some(&added));
        assert!(store.new_entities(lines).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn removal_keeps_public_view_consistent(
            count in 1usize..12,
            removals in proptest::collection::vec(0usize..12, 0..12),
            detaches in proptest::collection::vec(0usize..12, 0..4),
        ) {
            let mut store = EntityStore::new();
            let (_, lines) = order_with_lines(&mut store, count as i64);
            let mut expected = ids(&store, &store.entities(lines).unwrap());

            for index in removals {
                let result = store.remove(lines, index);
                if index < expected.len() {
                    prop_assert!(result.is_ok());
                    expected.remove(index);
                } else {
                    prop_assert!(result.is_err());
                }
            }
            for index in detaches {
                let stored = store.stored_entities(lines).unwrap().to_vec();
                if let Some(node) = stored.get(index) {
                    let id = store.primary_value(*node).unwrap().as_i64().unwrap();
                    store.detach(lines, *node).unwrap();
                    expected.retain(|e| *e != id);
                }
            }

            prop_assert_eq!(ids(&store, &store.entities(lines).unwrap()), expected);
            let stored_len = store.stored_entities(lines).unwrap().len();
            prop_assert!(store.deleted_indices(lines).unwrap().iter().all(|i| *i < stored_len));
        }
    }
}
