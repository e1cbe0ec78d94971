//! The arena owning every node and collection.

use super::id::{CollectionId, NodeId};
use super::node::{CloneOptions, Lifecycle};
use super::notify::{ChangeEvent, Listeners, SubscriptionId};
use crate::definition::EntityDefinition;
use crate::error::{CoreError, CoreResult};
use crate::value::{Record, Value};
use odbind_protocol::parse_member_path;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
pub(super) struct NodeState {
    pub(super) definition: Arc<EntityDefinition>,
    pub(super) stored: Record,
    pub(super) changed: Record,
    pub(super) details: Record,
    /// One collection per child definition, in definition order.
    pub(super) children: Vec<CollectionId>,
    pub(super) lifecycle: Lifecycle,
    pub(super) parent: Option<CollectionId>,
    pub(super) base: Option<NodeId>,
}

#[derive(Debug)]
pub(super) struct CollectionState {
    pub(super) definition: Arc<EntityDefinition>,
    pub(super) owner: Option<NodeId>,
    pub(super) stored: Vec<NodeId>,
    pub(super) new: Vec<NodeId>,
    /// Indices into `stored`.
    pub(super) deleted: BTreeSet<usize>,
}

impl CollectionState {
    pub(super) fn remaining(&self) -> impl Iterator<Item = (usize, NodeId)> + '_ {
        self.stored
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, _)| !self.deleted.contains(i))
    }

    pub(super) fn remaining_len(&self) -> usize {
        self.stored.len() - self.deleted.len()
    }
}

/// Where a member sits inside its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Slot {
    Stored(usize),
    New(usize),
}

/// Identity of the tree a node or collection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum TreeKey {
    Node(NodeId),
    Collection(CollectionId),
}

/// Arena of entity nodes and entity collections.
///
/// The store is the single owner of every tree it holds; mutation goes
/// through `&mut self`.
#[derive(Debug, Default)]
pub struct EntityStore {
    pub(super) nodes: HashMap<NodeId, NodeState>,
    pub(super) collections: HashMap<CollectionId, CollectionState>,
    next_id: u64,
    listeners: Listeners,
    saving: HashSet<NodeId>,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live collections.
    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Returns true if the handle refers to a live node.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Creates a root node in `Create` state.
    pub fn create_root(&mut self, definition: Arc<EntityDefinition>) -> NodeId {
        self.alloc_node(definition, Lifecycle::Create, None)
    }

    /// Creates a standalone top-level collection.
    pub fn create_collection(&mut self, definition: Arc<EntityDefinition>) -> CollectionId {
        self.alloc_collection(definition, None)
    }

    // =========================================================================
    // Change notification
    // =========================================================================

    /// Registers a listener called after every public mutation.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(Box::new(listener))
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub(super) fn emit(&self, event: ChangeEvent) {
        self.listeners.emit(event);
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Definition of a node.
    pub fn definition(&self, node: NodeId) -> CoreResult<Arc<EntityDefinition>> {
        Ok(Arc::clone(&self.node(node)?.definition))
    }

    /// Definition of a collection's members.
    pub fn collection_definition(
        &self,
        collection: CollectionId,
    ) -> CoreResult<Arc<EntityDefinition>> {
        Ok(Arc::clone(&self.collection(collection)?.definition))
    }

    /// Lifecycle state of a node.
    pub fn lifecycle(&self, node: NodeId) -> CoreResult<Lifecycle> {
        Ok(self.node(node)?.lifecycle)
    }

    /// Collection the node belongs (or is about to belong) to.
    pub fn parent(&self, node: NodeId) -> CoreResult<Option<CollectionId>> {
        Ok(self.node(node)?.parent)
    }

    /// Node owning a collection; `None` for standalone collections.
    pub fn owner(&self, collection: CollectionId) -> CoreResult<Option<NodeId>> {
        Ok(self.collection(collection)?.owner)
    }

    /// Node this one was cloned from as a working copy, if still live.
    pub fn base(&self, node: NodeId) -> CoreResult<Option<NodeId>> {
        Ok(self
            .node(node)?
            .base
            .filter(|base| self.nodes.contains_key(base)))
    }

    /// Top-most node reached by walking parent links.
    pub fn root(&self, node: NodeId) -> CoreResult<NodeId> {
        let mut current = node;
        loop {
            let state = self.node(current)?;
            let owner = match state.parent {
                Some(parent) => self.collection(parent)?.owner,
                None => None,
            };
            match owner {
                Some(owner) => current = owner,
                None => return Ok(current),
            }
        }
    }

    /// Effective primary key value; `Null` when unset.
    pub fn primary_value(&self, node: NodeId) -> CoreResult<Value> {
        let state = self.node(node)?;
        Ok(effective(state, &state.definition.primary_key)
            .cloned()
            .unwrap_or_default())
    }

    /// True if the node has a non-null primary key value.
    pub fn is_persisted(&self, node: NodeId) -> CoreResult<bool> {
        Ok(!self.primary_value(node)?.is_null())
    }

    /// Child collections in definition order.
    pub fn children(&self, node: NodeId) -> CoreResult<Vec<CollectionId>> {
        Ok(self.node(node)?.children.clone())
    }

    /// Child collection by navigation key.
    pub fn child(&self, node: NodeId, navigation: &str) -> CoreResult<CollectionId> {
        let state = self.node(node)?;
        state
            .definition
            .children
            .iter()
            .position(|c| c.navigation() == navigation)
            .map(|i| state.children[i])
            .ok_or_else(|| CoreError::UnknownChild {
                entity: state.definition.entity_name.clone(),
                navigation: navigation.to_string(),
            })
    }

    /// Server-confirmed property values.
    pub fn stored_properties(&self, node: NodeId) -> CoreResult<&Record> {
        Ok(&self.node(node)?.stored)
    }

    /// Local edits not yet confirmed by the server.
    pub fn changed_properties(&self, node: NodeId) -> CoreResult<&Record> {
        Ok(&self.node(node)?.changed)
    }

    /// Detail blobs.
    pub fn details(&self, node: NodeId) -> CoreResult<&Record> {
        Ok(&self.node(node)?.details)
    }

    /// Names of all tracked properties with a stored or changed value.
    pub fn property_names(&self, node: NodeId) -> CoreResult<Vec<String>> {
        let state = self.node(node)?;
        let names = state
            .stored
            .keys()
            .chain(state.changed.keys())
            .cloned()
            .collect::<BTreeSet<_>>();
        Ok(names.into_iter().collect())
    }

    /// Names of the detail blobs currently held.
    pub fn detail_names(&self, node: NodeId) -> CoreResult<Vec<String>> {
        Ok(self.node(node)?.details.keys().cloned().collect())
    }

    /// Navigation keys of the node's child collections.
    pub fn child_names(&self, node: NodeId) -> CoreResult<Vec<String>> {
        Ok(self
            .node(node)?
            .definition
            .children
            .iter()
            .map(|c| c.navigation().to_string())
            .collect())
    }

    /// True if the node or anything beneath it has unsaved changes.
    pub fn is_dirty(&self, node: NodeId) -> CoreResult<bool> {
        let state = self.node(node)?;
        if !state.changed.is_empty() {
            return Ok(true);
        }
        for collection in &state.children {
            let coll = self.collection(*collection)?;
            if !coll.new.is_empty() || !coll.deleted.is_empty() {
                return Ok(true);
            }
            for member in &coll.stored {
                // Members that never got a key still need a create
                if self.node(*member)?.lifecycle == Lifecycle::Create || self.is_dirty(*member)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Resolves a member path such as `/Lines[2]/Notes[0]` from `node`
    /// through the public entities views.
    pub fn locate(&self, node: NodeId, path: &str) -> CoreResult<NodeId> {
        let mut current = node;
        self.node(current)?;
        for step in parse_member_path(path)? {
            let collection = self.child(current, &step.navigation)?;
            current = self.member(collection, step.index)?;
        }
        Ok(current)
    }

    /// Detaches the node from its collection and frees it with its
    /// descendants.
    pub fn release(&mut self, node: NodeId) -> CoreResult<()> {
        if let Some((collection, _)) = self.slot_of(node)? {
            self.detach_member(collection, node)?;
        }
        self.free_node(node);
        self.emit(ChangeEvent::Released { node });
        Ok(())
    }

    // =========================================================================
    // Clone and state transfer
    // =========================================================================

    /// Deep-copies a node and its children into a new root.
    pub fn clone_node(&mut self, node: NodeId, options: CloneOptions) -> CoreResult<NodeId> {
        let copy = self.copy_subtree(node, None)?;
        if options.as_working_copy {
            if let Some(state) = self.nodes.get_mut(&copy) {
                state.base = Some(node);
            }
        }
        debug!(source = %node, %copy, working_copy = options.as_working_copy, "cloned node");
        Ok(copy)
    }

    /// Overwrites `target` with the state of `source`.
    ///
    /// Child members of `target` are released and replaced with fresh
    /// copies of the source's stored, new and tombstoned members.
    pub fn sync_state_from(&mut self, target: NodeId, source: NodeId) -> CoreResult<()> {
        if target == source {
            self.node(target)?;
            return Ok(());
        }
        let (stored, changed, details, lifecycle, source_children) = {
            let src = self.node(source)?;
            let dst = self.node(target)?;
            if !Arc::ptr_eq(&src.definition, &dst.definition) {
                return Err(CoreError::IdentityMismatch {
                    target_entity: dst.definition.entity_name.clone(),
                    source_entity: src.definition.entity_name.clone(),
                });
            }
            (
                src.stored.clone(),
                src.changed.clone(),
                src.details.clone(),
                src.lifecycle,
                src.children.clone(),
            )
        };
        let target_children = self.node(target)?.children.clone();

        for (target_coll, source_coll) in target_children.into_iter().zip(source_children) {
            let (src_stored, src_new, src_deleted) = {
                let coll = self.collection(source_coll)?;
                (coll.stored.clone(), coll.new.clone(), coll.deleted.clone())
            };
            let mut stored = Vec::with_capacity(src_stored.len());
            for member in src_stored {
                stored.push(self.copy_subtree(member, Some(target_coll))?);
            }
            let mut new = Vec::with_capacity(src_new.len());
            for member in src_new {
                new.push(self.copy_subtree(member, Some(target_coll))?);
            }
            self.free_members(target_coll);
            let coll = self.collection_mut(target_coll)?;
            coll.stored = stored;
            coll.new = new;
            coll.deleted = src_deleted;
        }

        let state = self.node_mut(target)?;
        state.stored = stored;
        state.changed = changed;
        state.details = details;
        state.lifecycle = lifecycle;
        self.emit(ChangeEvent::StateSynced { target, source });
        Ok(())
    }

    // =========================================================================
    // Consolidate and clear
    // =========================================================================

    /// Merges changes into stored values, removes tombstoned members and
    /// promotes new members, recursively.
    pub fn consolidate(&mut self, node: NodeId) -> CoreResult<()> {
        self.consolidate_node(node)?;
        trace!(%node, "consolidated");
        self.emit(ChangeEvent::Consolidated { node });
        Ok(())
    }

    /// Consolidates every member of a collection.
    pub fn consolidate_collection(&mut self, collection: CollectionId) -> CoreResult<()> {
        self.consolidate_members(collection)
    }

    /// Drops all values, details and child members of a node. The
    /// lifecycle is unchanged.
    pub fn clear(&mut self, node: NodeId) -> CoreResult<()> {
        let children = {
            let state = self.node_mut(node)?;
            state.stored.clear();
            state.changed.clear();
            state.details.clear();
            state.children.clone()
        };
        for collection in children {
            self.free_members(collection);
        }
        self.emit(ChangeEvent::Cleared { node });
        Ok(())
    }

    /// Releases every member of a collection.
    pub fn clear_collection(&mut self, collection: CollectionId) -> CoreResult<()> {
        self.collection(collection)?;
        self.free_members(collection);
        self.emit(ChangeEvent::CollectionSynced { collection });
        Ok(())
    }

    // =========================================================================
    // Save slots
    // =========================================================================

    /// Marks the tree rooted at `root` as having a save in flight.
    /// Returns false if one already is.
    pub fn acquire_save_slot(&mut self, root: NodeId) -> bool {
        self.saving.insert(root)
    }

    /// Clears the in-flight mark of `root`.
    pub fn release_save_slot(&mut self, root: NodeId) {
        self.saving.remove(&root);
    }

    /// True if a save of the tree rooted at `root` is in flight.
    pub fn is_saving(&self, root: NodeId) -> bool {
        self.saving.contains(&root)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    pub(super) fn node(&self, id: NodeId) -> CoreResult<&NodeState> {
        self.nodes.get(&id).ok_or(CoreError::NodeNotFound(id))
    }

    pub(super) fn node_mut(&mut self, id: NodeId) -> CoreResult<&mut NodeState> {
        self.nodes.get_mut(&id).ok_or(CoreError::NodeNotFound(id))
    }

    pub(super) fn collection(&self, id: CollectionId) -> CoreResult<&CollectionState> {
        self.collections
            .get(&id)
            .ok_or(CoreError::CollectionNotFound(id))
    }

    pub(super) fn collection_mut(&mut self, id: CollectionId) -> CoreResult<&mut CollectionState> {
        self.collections
            .get_mut(&id)
            .ok_or(CoreError::CollectionNotFound(id))
    }

    fn next_raw(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(super) fn alloc_node(
        &mut self,
        definition: Arc<EntityDefinition>,
        lifecycle: Lifecycle,
        parent: Option<CollectionId>,
    ) -> NodeId {
        let id = NodeId::new(self.next_raw());
        let children = definition
            .children
            .iter()
            .map(|child| {
                let raw = self.next_raw();
                let collection = CollectionId::new(raw);
                self.collections.insert(
                    collection,
                    CollectionState {
                        definition: Arc::clone(child),
                        owner: Some(id),
                        stored: Vec::new(),
                        new: Vec::new(),
                        deleted: BTreeSet::new(),
                    },
                );
                collection
            })
            .collect();
        self.nodes.insert(
            id,
            NodeState {
                definition,
                stored: Record::new(),
                changed: Record::new(),
                details: Record::new(),
                children,
                lifecycle,
                parent,
                base: None,
            },
        );
        id
    }

    fn alloc_collection(
        &mut self,
        definition: Arc<EntityDefinition>,
        owner: Option<NodeId>,
    ) -> CollectionId {
        let id = CollectionId::new(self.next_raw());
        self.collections.insert(
            id,
            CollectionState {
                definition,
                owner,
                stored: Vec::new(),
                new: Vec::new(),
                deleted: BTreeSet::new(),
            },
        );
        id
    }

    /// Frees a node, its child collections and all their members.
    pub(super) fn free_node(&mut self, node: NodeId) {
        let mut pending = vec![node];
        while let Some(id) = pending.pop() {
            let Some(state) = self.nodes.remove(&id) else {
                continue;
            };
            self.saving.remove(&id);
            for collection in state.children {
                if let Some(coll) = self.collections.remove(&collection) {
                    pending.extend(coll.stored);
                    pending.extend(coll.new);
                }
            }
        }
    }

    /// Frees every member of a collection and clears its tombstones.
    pub(super) fn free_members(&mut self, collection: CollectionId) {
        let members = match self.collections.get_mut(&collection) {
            Some(coll) => {
                coll.deleted.clear();
                let mut members = std::mem::take(&mut coll.stored);
                members.append(&mut coll.new);
                members
            }
            None => return,
        };
        for member in members {
            self.free_node(member);
        }
    }

    /// Position of a node in its parent collection, if it is a member.
    pub(super) fn slot_of(&self, node: NodeId) -> CoreResult<Option<(CollectionId, Slot)>> {
        let Some(parent) = self.node(node)?.parent else {
            return Ok(None);
        };
        let Some(coll) = self.collections.get(&parent) else {
            return Ok(None);
        };
        if let Some(i) = coll.stored.iter().position(|m| *m == node) {
            return Ok(Some((parent, Slot::Stored(i))));
        }
        if let Some(i) = coll.new.iter().position(|m| *m == node) {
            return Ok(Some((parent, Slot::New(i))));
        }
        Ok(None)
    }

    pub(super) fn tree_of_node(&self, node: NodeId) -> CoreResult<TreeKey> {
        let root = self.root(node)?;
        match self.node(root)?.parent {
            Some(collection) => Ok(TreeKey::Collection(collection)),
            None => Ok(TreeKey::Node(root)),
        }
    }

    pub(super) fn tree_of_collection(&self, collection: CollectionId) -> CoreResult<TreeKey> {
        match self.collection(collection)?.owner {
            Some(owner) => self.tree_of_node(owner),
            None => Ok(TreeKey::Collection(collection)),
        }
    }

    /// True if `node` lies in the subtree rooted at `ancestor`.
    pub(super) fn is_within(&self, node: NodeId, ancestor: NodeId) -> CoreResult<bool> {
        let mut current = node;
        loop {
            if current == ancestor {
                return Ok(true);
            }
            let owner = match self.node(current)?.parent {
                Some(parent) => self.collection(parent)?.owner,
                None => None,
            };
            match owner {
                Some(owner) => current = owner,
                None => return Ok(false),
            }
        }
    }

    /// Copies a node and its descendants. The copy has no base.
    fn copy_subtree(&mut self, node: NodeId, parent: Option<CollectionId>) -> CoreResult<NodeId> {
        let (definition, stored, changed, details, lifecycle, children) = {
            let state = self.node(node)?;
            (
                Arc::clone(&state.definition),
                state.stored.clone(),
                state.changed.clone(),
                state.details.clone(),
                state.lifecycle,
                state.children.clone(),
            )
        };
        let copy = self.alloc_node(definition, lifecycle, parent);
        let copy_children = {
            let state = self.node_mut(copy)?;
            state.stored = stored;
            state.changed = changed;
            state.details = details;
            state.children.clone()
        };

        for (source_coll, target_coll) in children.into_iter().zip(copy_children) {
            let (src_stored, src_new, src_deleted) = {
                let coll = self.collection(source_coll)?;
                (coll.stored.clone(), coll.new.clone(), coll.deleted.clone())
            };
            let mut stored = Vec::with_capacity(src_stored.len());
            for member in src_stored {
                stored.push(self.copy_subtree(member, Some(target_coll))?);
            }
            let mut new = Vec::with_capacity(src_new.len());
            for member in src_new {
                new.push(self.copy_subtree(member, Some(target_coll))?);
            }
            let coll = self.collection_mut(target_coll)?;
            coll.stored = stored;
            coll.new = new;
            coll.deleted = src_deleted;
        }
        Ok(copy)
    }

    fn consolidate_node(&mut self, node: NodeId) -> CoreResult<()> {
        let children = {
            let state = self.node_mut(node)?;
            let changed = std::mem::take(&mut state.changed);
            state.stored.extend(changed);
            let persisted = state
                .stored
                .get(&state.definition.primary_key)
                .is_some_and(|v| !v.is_null());
            state.lifecycle = match state.lifecycle {
                Lifecycle::Update => Lifecycle::Read,
                Lifecycle::Create if persisted => Lifecycle::Read,
                other => other,
            };
            state.children.clone()
        };
        for collection in children {
            self.consolidate_members(collection)?;
        }
        Ok(())
    }

    fn consolidate_members(&mut self, collection: CollectionId) -> CoreResult<()> {
        let (removed, members) = {
            let coll = self.collection_mut(collection)?;
            let tombstones = std::mem::take(&mut coll.deleted);
            let mut removed = Vec::with_capacity(tombstones.len());
            for index in tombstones.into_iter().rev() {
                if index < coll.stored.len() {
                    removed.push(coll.stored.remove(index));
                }
            }
            let mut new = std::mem::take(&mut coll.new);
            coll.stored.append(&mut new);
            (removed, coll.stored.clone())
        };
        if !removed.is_empty() {
            debug!(%collection, removed = removed.len(), "dropped tombstoned members");
        }
        for member in removed {
            self.free_node(member);
        }
        for member in members {
            self.consolidate_node(member)?;
        }
        Ok(())
    }
}

pub(super) fn effective<'a>(state: &'a NodeState, name: &str) -> Option<&'a Value> {
    state.changed.get(name).or_else(|| state.stored.get(name))
}
