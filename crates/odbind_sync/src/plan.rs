//! Save planning: the batch of operations reconciling a tree with the
//! server.

use crate::error::SyncResult;
use odbind_core::{EntityStore, NodeId, PayloadOptions, Record, Value};
use odbind_protocol::{
    entity_key_segment, member_path, tombstone_path, BatchOperation, OperationAction, OperationId,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Operations computed for one save, with the node each operation targets.
///
/// Responses are correlated through node handles, so collections may be
/// edited between planning and applying.
#[derive(Debug, Clone)]
pub struct SavePlan {
    root: NodeId,
    node: NodeId,
    group: String,
    operations: Vec<BatchOperation>,
    targets: HashMap<String, NodeId>,
    counts: [usize; 3],
}

impl SavePlan {
    /// Plans the save of `node` with every operation in `group`.
    pub fn build(store: &EntityStore, node: NodeId, group: impl Into<String>) -> SyncResult<Self> {
        let mut plan = Self {
            root: store.root(node)?,
            node,
            group: group.into(),
            operations: Vec::new(),
            targets: HashMap::new(),
            counts: [0; 3],
        };
        plan.walk(store, node, "")?;
        Ok(plan)
    }

    /// Root of the saved tree.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The saved node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Atomicity group shared by every operation.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Operations in submission order.
    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Node targeted by a create or update operation.
    pub fn target(&self, operation_id: &str) -> Option<NodeId> {
        self.targets.get(operation_id).copied()
    }

    /// Number of operations performing `action`.
    pub fn count(&self, action: OperationAction) -> usize {
        self.counts[action_slot(action)]
    }

    fn push(&mut self, id: OperationId, url: String, body: Option<JsonValue>, target: Option<NodeId>) {
        let id_text = id.to_string();
        let mut operation =
            BatchOperation::new(id_text.clone(), id.action.method(), url).in_group(self.group.clone());
        if let Some(body) = body {
            operation = operation.with_body(body);
        }
        if let Some(target) = target {
            self.targets.insert(id_text, target);
        }
        self.counts[action_slot(id.action)] += 1;
        self.operations.push(operation);
    }

    fn walk(&mut self, store: &EntityStore, node: NodeId, prefix: &str) -> SyncResult<()> {
        let definition = store.definition(node)?;
        let primary = store.primary_value(node)?;

        if primary.is_null() {
            // Children are deep-inserted with the parent.
            let payload = store.request_payload(node, PayloadOptions::for_create())?;
            self.push(
                OperationId::new(prefix, OperationAction::Create),
                definition.entity_name.clone(),
                Some(record_json(&payload)),
                Some(node),
            );
            return Ok(());
        }

        let changed = store.changed_properties(node)?;
        if !changed.is_empty() {
            self.push(
                OperationId::new(prefix, OperationAction::Update),
                entity_key_segment(&definition.entity_name, &primary.to_json()),
                Some(record_json(changed)),
                Some(node),
            );
        }

        for (child, collection) in definition.children.iter().zip(store.children(node)?) {
            let navigation = child.navigation();
            let stored = store.stored_entities(collection)?;
            for index in store.deleted_indices(collection)? {
                let key = store.primary_value(stored[index])?;
                if key.is_null() {
                    continue;
                }
                let key = key.to_json();
                self.push(
                    OperationId::new(
                        tombstone_path(prefix, navigation, &key),
                        OperationAction::Delete,
                    ),
                    entity_key_segment(&child.entity_name, &key),
                    None,
                    None,
                );
            }
            for (index, member) in store.entities(collection)?.into_iter().enumerate() {
                self.walk(store, member, &member_path(prefix, navigation, index))?;
            }
        }
        Ok(())
    }
}

fn action_slot(action: OperationAction) -> usize {
    match action {
        OperationAction::Create => 0,
        OperationAction::Update => 1,
        OperationAction::Delete => 2,
    }
}

pub(crate) fn record_json(record: &Record) -> JsonValue {
    JsonValue::Object(
        record
            .iter()
            .map(|(name, value)| (name.clone(), Value::to_json(value)))
            .collect(),
    )
}
