//! The sync engine: load, query, save and delete against a remote service.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::plan::SavePlan;
use crate::query::entity_query;
use crate::transport::RemoteTransport;
use odbind_core::{strip_envelope, CollectionId, EntityDefinition, EntityStore, NodeId, Record, Value};
use odbind_protocol::{entity_key_segment, OperationAction, OperationResponse, QueryOptions};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Statistics about remote operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Entities loaded by key.
    pub loads: u64,
    /// Collection and raw queries issued.
    pub queries: u64,
    /// Batches submitted.
    pub saves: u64,
    /// Batch operations submitted.
    pub operations_submitted: u64,
    /// Entities deleted directly.
    pub deletes: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Paging information returned by a collection load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionPage {
    /// Total row count, when `$count` was requested.
    pub count: Option<u64>,
    /// Link to the next page, when the server paginates.
    pub next_link: Option<String>,
}

/// Result of a raw query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    /// Envelope-stripped records.
    pub records: Vec<Record>,
    /// Total row count, when `$count` was requested.
    pub count: Option<u64>,
    /// Link to the next page.
    pub next_link: Option<String>,
}

/// Result of a save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Create operations submitted.
    pub created: usize,
    /// Update operations submitted.
    pub updated: usize,
    /// Delete operations submitted.
    pub deleted: usize,
    /// Responses skipped because their target was released or their body
    /// was not an entity object.
    pub skipped: usize,
    /// Wall time of the save.
    pub duration: Duration,
}

impl SaveReport {
    /// True if nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.created + self.updated + self.deleted == 0
    }
}

/// The sync engine moves entity trees between an [`EntityStore`] and a
/// remote OData service.
///
/// The engine never retries; transport errors reach the caller unchanged.
pub struct SyncEngine<T: RemoteTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    stats: RwLock<SyncStats>,
}

impl<T: RemoteTransport> SyncEngine<T> {
    /// Creates a new sync engine.
    pub fn new(config: SyncConfig, transport: T) -> Self {
        Self::with_shared_transport(config, Arc::new(transport))
    }

    /// Creates a sync engine over a shared transport.
    pub fn with_shared_transport(config: SyncConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn record_error(&self, error: &SyncError) {
        self.stats.write().last_error = Some(error.to_string());
    }

    fn tracked<R>(&self, result: SyncResult<R>) -> SyncResult<R> {
        if let Err(err) = &result {
            self.record_error(err);
        }
        result
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Loads the entity with key `id` into `node`, replacing its state.
    ///
    /// On failure the node is left untouched.
    pub fn load(&self, store: &mut EntityStore, node: NodeId, id: impl Into<Value>) -> SyncResult<()> {
        let result = self.load_inner(store, node, id.into());
        self.tracked(result)
    }

    fn load_inner(&self, store: &mut EntityStore, node: NodeId, id: Value) -> SyncResult<()> {
        let definition = store.definition(node)?;
        let path = entity_key_segment(&definition.entity_name, &id.to_json());
        let query = entity_query(&definition);
        info!(entity = %definition.entity_name, %path, "loading entity");

        let body = self
            .transport
            .get(&path, &query.to_params(), &self.config.headers)?;
        let record = self.decode_record(&definition, body)?;
        store.import_snapshot(node, &record)?;

        self.stats.write().loads += 1;
        debug!(%node, "entity loaded");
        Ok(())
    }

    /// Loads a page of entities into a standalone collection.
    ///
    /// The definition's `$select`/`$expand` are combined with `options`;
    /// options set by the caller win.
    pub fn load_collection(
        &self,
        store: &mut EntityStore,
        collection: CollectionId,
        options: &QueryOptions,
    ) -> SyncResult<CollectionPage> {
        let result = self.load_collection_inner(store, collection, options);
        self.tracked(result)
    }

    fn load_collection_inner(
        &self,
        store: &mut EntityStore,
        collection: CollectionId,
        options: &QueryOptions,
    ) -> SyncResult<CollectionPage> {
        let definition = store.collection_definition(collection)?;
        let query = entity_query(&definition).overlay(options);
        info!(entity = %definition.entity_name, "loading collection");

        let body = self.transport.get(
            &definition.entity_name,
            &query.to_params(),
            &self.config.headers,
        )?;
        let page = self.decode_page(Some(&definition), body)?;

        store.clear_collection(collection)?;
        store.sync_from(collection, &page.records)?;
        store.consolidate_collection(collection)?;

        self.stats.write().queries += 1;
        debug!(%collection, rows = page.records.len(), "collection loaded");
        Ok(CollectionPage {
            count: page.count,
            next_link: page.next_link,
        })
    }

    /// Issues a raw GET against `path` and returns the decoded records.
    ///
    /// Used for lists and `$apply` aggregations that do not map onto an
    /// entity tree.
    pub fn query(&self, path: &str, options: &QueryOptions) -> SyncResult<QueryPage> {
        let result = self
            .transport
            .get(path, &options.to_params(), &self.config.headers)
            .and_then(|body| self.decode_page(None, body));
        if result.is_ok() {
            self.stats.write().queries += 1;
        }
        self.tracked(result)
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Saves `node` and its subtree in one atomic batch.
    ///
    /// Only changed properties, tombstoned members and never-persisted
    /// entities are sent. On failure no local state is mutated.
    pub fn save(&self, store: &mut EntityStore, node: NodeId) -> SyncResult<SaveReport> {
        let started = Instant::now();
        let plan = self.begin_save(store, node)?;
        if plan.is_empty() {
            debug!(%node, "nothing to save");
            self.abort_save(store, plan);
            return Ok(SaveReport::default());
        }

        let responses = match self.submit(&plan) {
            Ok(responses) => responses,
            Err(err) => {
                self.abort_save(store, plan);
                return Err(err);
            }
        };
        let mut report = self.finish_save(store, plan, &responses)?;
        report.duration = started.elapsed();
        Ok(report)
    }

    /// Plans a save and marks the tree as having a save in flight.
    ///
    /// Fails with [`SyncError::SaveInProgress`] if a save of the same tree
    /// has begun and not finished.
    pub fn begin_save(&self, store: &mut EntityStore, node: NodeId) -> SyncResult<SavePlan> {
        let root = store.root(node)?;
        if !store.acquire_save_slot(root) {
            warn!(%root, "save already in progress");
            return Err(SyncError::SaveInProgress);
        }
        let group = format!("{}-{}", self.config.atomicity_group, uuid::Uuid::new_v4());
        match SavePlan::build(store, node, group) {
            Ok(plan) => {
                debug!(
                    %node,
                    operations = plan.len(),
                    group = plan.group(),
                    "planned save"
                );
                Ok(plan)
            }
            Err(err) => {
                store.release_save_slot(root);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Submits a plan's operations as one batch.
    pub fn submit(&self, plan: &SavePlan) -> SyncResult<Vec<OperationResponse>> {
        info!(operations = plan.len(), group = plan.group(), "submitting batch");
        let result = self
            .transport
            .batch(plan.operations(), &self.config.headers);
        match &result {
            Ok(responses) => {
                let mut stats = self.stats.write();
                stats.saves += 1;
                stats.operations_submitted += plan.len() as u64;
                debug!(responses = responses.len(), "batch accepted");
            }
            Err(err) => warn!(%err, "batch rejected"),
        }
        self.tracked(result)
    }

    /// Applies batch responses to the planned nodes and ends the save.
    ///
    /// Responses whose target node was released meanwhile, or whose body is
    /// not an entity object, are skipped; the rest are applied only after
    /// every body decoded.
    pub fn finish_save(
        &self,
        store: &mut EntityStore,
        plan: SavePlan,
        responses: &[OperationResponse],
    ) -> SyncResult<SaveReport> {
        store.release_save_slot(plan.root());
        let result = self.apply_responses(store, &plan, responses);
        self.tracked(result)
    }

    /// Ends a save without applying anything.
    pub fn abort_save(&self, store: &mut EntityStore, plan: SavePlan) {
        store.release_save_slot(plan.root());
    }

    fn apply_responses(
        &self,
        store: &mut EntityStore,
        plan: &SavePlan,
        responses: &[OperationResponse],
    ) -> SyncResult<SaveReport> {
        let mut report = SaveReport {
            created: plan.count(OperationAction::Create),
            updated: plan.count(OperationAction::Update),
            deleted: plan.count(OperationAction::Delete),
            ..SaveReport::default()
        };

        // Every body is decoded before the tree is touched
        let mut decoded = Vec::with_capacity(responses.len());
        for response in responses {
            let Some(body) = &response.body else {
                continue;
            };
            let Some(target) = plan.target(&response.id) else {
                continue;
            };
            if !store.contains(target) {
                warn!(id = %response.id, %target, "skipping response for released node");
                report.skipped += 1;
                continue;
            }
            let definition = store.definition(target)?;
            match self.decode_record(&definition, body.clone()) {
                Ok(record) => decoded.push((target, record)),
                Err(err) => {
                    warn!(id = %response.id, %err, "skipping undecodable response body");
                    report.skipped += 1;
                }
            }
        }
        for (target, record) in &decoded {
            store.apply_server_response(*target, record)?;
        }

        let node = plan.node();
        if !store.contains(node) {
            warn!(%node, "saved node was released before the save finished");
            return Ok(report);
        }
        store.consolidate(node)?;
        store.promote(node)?;
        if let Some(base) = store.base(node)? {
            store.sync_state_from(base, node)?;
            store.promote(base)?;
        }
        info!(
            %node,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "save applied"
        );
        Ok(report)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes an entity on the server and releases it locally.
    ///
    /// A working copy deletes its base instead. Returns whether a request
    /// was issued; never-persisted entities are left alone.
    pub fn delete(&self, store: &mut EntityStore, node: NodeId) -> SyncResult<bool> {
        let result = self.delete_inner(store, node);
        self.tracked(result)
    }

    fn delete_inner(&self, store: &mut EntityStore, node: NodeId) -> SyncResult<bool> {
        let target = store.base(node)?.unwrap_or(node);
        let primary = store.primary_value(target)?;
        if primary.is_null() {
            return Ok(false);
        }
        let definition = store.definition(target)?;
        let path = entity_key_segment(&definition.entity_name, &primary.to_json());
        info!(%path, "deleting entity");
        self.transport.delete(&path, &[], &self.config.headers)?;

        store.release(target)?;
        self.stats.write().deletes += 1;
        Ok(true)
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    fn decode_record(&self, definition: &EntityDefinition, body: JsonValue) -> SyncResult<Record> {
        let mut record = Value::from(body)
            .into_object()
            .ok_or_else(|| SyncError::Protocol(format!("expected an {} object", definition.entity_name)))?;
        self.prepare(Some(definition), &mut record);
        Ok(record)
    }

    fn decode_page(&self, definition: Option<&EntityDefinition>, body: JsonValue) -> SyncResult<QueryPage> {
        let mut envelope = Value::from(body)
            .into_object()
            .ok_or_else(|| SyncError::Protocol("expected a JSON object".into()))?;
        let count = envelope
            .get("@odata.count")
            .and_then(Value::as_f64)
            .map(|count| count as u64);
        let next_link = envelope
            .get("@odata.nextLink")
            .and_then(Value::as_str)
            .map(str::to_string);

        let records = match envelope.remove("value") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(record) => Some(record),
                    other => {
                        warn!(value = ?other, "skipping non-object row");
                        None
                    }
                })
                .collect(),
            Some(_) => return Err(SyncError::Protocol("'value' is not an array".into())),
            None => vec![envelope],
        };

        let records = records
            .into_iter()
            .map(|mut record| {
                self.prepare(definition, &mut record);
                record
            })
            .collect();
        Ok(QueryPage {
            records,
            count,
            next_link,
        })
    }

    fn prepare(&self, definition: Option<&EntityDefinition>, record: &mut Record) {
        strip_envelope(record);
        if let (true, Some(definition)) = (self.config.coerce_dates, definition) {
            definition.coerce_dates(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use odbind_core::{CloneOptions, Lifecycle};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn order_definition() -> Arc<EntityDefinition> {
        EntityDefinition::new("Orders", "OrderID")
            .with_date_keys(["OrderDate"])
            .with_child(
                EntityDefinition::new("OrderLines", "LineID")
                    .with_navigation_key("Lines")
                    .with_foreign_key("OrderID"),
            )
            .shared()
    }

    fn engine() -> SyncEngine<MockTransport> {
        SyncEngine::new(SyncConfig::new("http://mock"), MockTransport::new())
    }

    fn record_of(json: JsonValue) -> Record {
        Value::from(json).into_object().unwrap()
    }

    fn ok(id: &str, status: u16, body: Option<JsonValue>) -> OperationResponse {
        OperationResponse {
            id: id.to_string(),
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    fn loaded_order(engine: &SyncEngine<MockTransport>, store: &mut EntityStore) -> NodeId {
        engine.transport().push_response(json!({
            "@odata.context": "$metadata#Orders/$entity",
            "OrderID": 1,
            "Name": "a",
            "OrderDate": "2024-05-01T10:00:00Z",
            "Lines": [
                {"LineID": 10, "OrderID": 1, "Qty": 1},
                {"LineID": 11, "OrderID": 1, "Qty": 2}
            ]
        }));
        let order = store.create_root(order_definition());
        engine.load(store, order, 1).unwrap();
        order
    }

    #[test]
    fn load_strips_envelope_and_coerces_dates() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);

        let stored = store.stored_properties(order).unwrap();
        assert!(!stored.contains_key("@odata.context"));
        assert!(stored["OrderDate"].as_datetime().is_some());
        assert_eq!(store.lifecycle(order).unwrap(), Lifecycle::Read);

        let request = &engine.transport().requests()[0];
        assert_eq!(request.path, "Orders(1)");
        assert!(request.query.iter().any(|(k, v)| k == "$expand" && v == "Lines"));
        assert_eq!(engine.stats().loads, 1);
    }

    #[test]
    fn failed_load_leaves_node_untouched() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        engine.transport().push_error(SyncError::Http {
            status: 404,
            status_text: "Not Found".into(),
            body: String::new(),
        });

        let err = engine.load(&mut store, order, 2).unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            store.get(order, "Name").unwrap().value(),
            Some(&Value::from("a"))
        );
        assert!(engine.stats().last_error.is_some());
    }

    #[test]
    fn save_without_changes_sends_nothing() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);

        let report = engine.save(&mut store, order).unwrap();
        assert!(report.is_empty());
        assert_eq!(engine.transport().request_count(), 1);
        assert!(!store.is_saving(order));
    }

    #[test]
    fn save_applies_responses_and_consolidates() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        store.set(order, "Name", "b").unwrap();
        let lines = store.child(order, "Lines").unwrap();
        store.remove(lines, 0).unwrap();
        let added = store.add(lines, Record::new()).unwrap();

        engine.transport().push_batch(vec![
            ok("/update", 200, Some(json!({"OrderID": 1, "Name": "b", "OrderDate": "2024-05-01T10:00:00Z"}))),
            ok("/Lines(10)/delete", 204, None),
            ok("/Lines[1]/create", 201, Some(json!({"LineID": 12, "OrderID": 1}))),
        ]);
        let report = engine.save(&mut store, order).unwrap();

        assert_eq!((report.created, report.updated, report.deleted), (1, 1, 1));
        assert_eq!(store.lifecycle(order).unwrap(), Lifecycle::Read);
        assert!(store.deleted_indices(lines).unwrap().is_empty());
        assert!(store.new_entities(lines).unwrap().is_empty());
        assert_eq!(store.stored_entities(lines).unwrap().len(), 2);
        assert_eq!(store.primary_value(added).unwrap(), Value::from(12));
        assert_eq!(store.lifecycle(added).unwrap(), Lifecycle::Read);
        assert!(!store.is_dirty(order).unwrap());

        let batch = &engine.transport().requests()[1];
        let group = batch.operations[0].atomicity_group.clone().unwrap();
        assert!(group.starts_with("entitySave-"));
    }

    #[test]
    fn failed_save_mutates_nothing() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        store.set(order, "Name", "b").unwrap();
        let lines = store.child(order, "Lines").unwrap();
        store.remove(lines, 0).unwrap();

        engine.transport().push_batch(vec![
            ok("/update", 200, Some(json!({"OrderID": 1, "Name": "b"}))),
            ok("/Lines(10)/delete", 409, None),
        ]);
        let err = engine.save(&mut store, order).unwrap_err();
        assert!(matches!(err, SyncError::Batch { status: 409, .. }));

        assert_eq!(store.lifecycle(order).unwrap(), Lifecycle::Update);
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![0]);
        assert!(store.changed_properties(order).unwrap().contains_key("Name"));
        assert!(!store.is_saving(order));
    }

    #[test]
    fn overlapping_saves_are_rejected() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        store.set(order, "Name", "b").unwrap();
        let line = store.locate(order, "/Lines[0]").unwrap();

        let plan = engine.begin_save(&mut store, order).unwrap();
        assert!(matches!(
            engine.begin_save(&mut store, line),
            Err(SyncError::SaveInProgress)
        ));
        engine.abort_save(&mut store, plan);
        let plan = engine.begin_save(&mut store, line).unwrap();
        assert!(plan.is_empty());
        engine.abort_save(&mut store, plan);
    }

    #[test]
    fn responses_follow_nodes_across_index_shifts() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        let lines = store.child(order, "Lines").unwrap();
        let second = store.member(lines, 1).unwrap();
        store.set(second, "Qty", 7).unwrap();
        let first = store.member(lines, 0).unwrap();
        store.set(first, "Qty", 8).unwrap();

        let plan = engine.begin_save(&mut store, order).unwrap();
        // The first line disappears while the batch is in flight
        store.release(first).unwrap();
        let responses = vec![
            ok("/Lines[0]/update", 200, Some(json!({"LineID": 10, "Qty": 8}))),
            ok("/Lines[1]/update", 200, Some(json!({"LineID": 11, "Qty": 7}))),
        ];
        let report = engine.finish_save(&mut store, plan, &responses).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(store.get(second, "Qty").unwrap().value(), Some(&Value::from(7)));
        assert_eq!(store.lifecycle(second).unwrap(), Lifecycle::Read);
    }

    #[test]
    fn working_copy_save_propagates_to_base() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        let copy = store
            .clone_node(order, CloneOptions { as_working_copy: true })
            .unwrap();
        store.set(copy, "Name", "from copy").unwrap();

        engine
            .transport()
            .push_batch(vec![ok("/update", 200, Some(json!({"OrderID": 1, "Name": "from copy"})))]);
        engine.save(&mut store, copy).unwrap();

        assert_eq!(
            store.get(order, "Name").unwrap().value(),
            Some(&Value::from("from copy"))
        );
        assert_eq!(store.lifecycle(order).unwrap(), Lifecycle::Read);
        let lines = store.child(order, "Lines").unwrap();
        assert_eq!(store.len(lines).unwrap(), 2);
    }

    #[test]
    fn undecodable_body_is_skipped_without_half_applying() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        store.set(order, "Name", "b").unwrap();
        let first = store.locate(order, "/Lines[0]").unwrap();
        store.set(first, "Qty", 5).unwrap();

        engine.transport().push_batch(vec![
            ok("/update", 200, Some(json!({"OrderID": 1, "Name": "b"}))),
            ok("/Lines[0]/update", 200, Some(json!("oops"))),
        ]);
        let report = engine.save(&mut store, order).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(store.lifecycle(order).unwrap(), Lifecycle::Read);
        assert_eq!(store.lifecycle(first).unwrap(), Lifecycle::Read);
        assert!(store.changed_properties(first).unwrap().is_empty());
        assert_eq!(
            store.stored_properties(first).unwrap().get("Qty"),
            Some(&Value::from(5))
        );
        assert!(!store.is_dirty(order).unwrap());
    }

    #[test]
    fn deep_insert_without_echoed_children_is_not_replanned() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = store.create_root(order_definition());
        store.set(order, "Name", "x").unwrap();
        let lines = store.child(order, "Lines").unwrap();
        store.add(lines, record_of(json!({"Qty": 1}))).unwrap();

        engine
            .transport()
            .push_batch(vec![ok("/create", 201, Some(json!({"OrderID": 5, "Name": "x"})))]);
        engine.save(&mut store, order).unwrap();

        assert_eq!(store.primary_value(order).unwrap(), Value::from(5));
        assert_eq!(store.len(lines).unwrap(), 0);
        assert!(!store.is_dirty(order).unwrap());

        assert!(engine.save(&mut store, order).unwrap().is_empty());
        assert_eq!(engine.transport().request_count(), 1);
    }

    #[test]
    fn failed_working_copy_save_leaves_base_untouched() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        let lines = store.child(order, "Lines").unwrap();
        let stored = store.stored_properties(order).unwrap().clone();
        let members = store.stored_entities(lines).unwrap().to_vec();

        let copy = store
            .clone_node(order, CloneOptions { as_working_copy: true })
            .unwrap();
        store.set(copy, "Name", "from copy").unwrap();
        let copy_lines = store.child(copy, "Lines").unwrap();
        store.remove(copy_lines, 0).unwrap();
        store.add(copy_lines, Record::new()).unwrap();

        engine.transport().push_batch(vec![
            ok("/update", 200, Some(json!({"OrderID": 1, "Name": "from copy"}))),
            ok("/Lines(10)/delete", 409, None),
            ok("/Lines[1]/create", 424, None),
        ]);
        let err = engine.save(&mut store, copy).unwrap_err();
        assert_eq!(err.status(), Some(409));

        assert_eq!(store.stored_properties(order).unwrap(), &stored);
        assert!(store.changed_properties(order).unwrap().is_empty());
        assert_eq!(store.lifecycle(order).unwrap(), Lifecycle::Read);
        assert_eq!(store.stored_entities(lines).unwrap(), members.as_slice());
        assert!(store.deleted_indices(lines).unwrap().is_empty());
        assert!(store.new_entities(lines).unwrap().is_empty());
        assert!(store.is_dirty(copy).unwrap());
    }

    #[test]
    fn delete_releases_member() {
        let engine = engine();
        let mut store = EntityStore::new();
        let order = loaded_order(&engine, &mut store);
        let lines = store.child(order, "Lines").unwrap();
        store.remove(lines, 1).unwrap();
        let first = store.member(lines, 0).unwrap();

        engine.transport().push_empty();
        assert!(engine.delete(&mut store, first).unwrap());

        assert!(!store.contains(first));
        assert_eq!(store.deleted_indices(lines).unwrap(), vec![0]);
        assert_eq!(engine.transport().requests()[1].path, "OrderLines(10)");

        let draft = store.add(lines, Record::new()).unwrap();
        assert!(!engine.delete(&mut store, draft).unwrap());
        assert_eq!(engine.transport().request_count(), 2);
    }

    #[test]
    fn load_collection_reports_paging() {
        let engine = engine();
        let mut store = EntityStore::new();
        let collection = store.create_collection(order_definition());
        engine.transport().push_response(json!({
            "@odata.count": 42,
            "@odata.nextLink": "Orders?$skip=2",
            "value": [
                {"OrderID": 1, "Lines": []},
                {"OrderID": 2, "Lines": [{"LineID": 5}]}
            ]
        }));

        let page = engine
            .load_collection(&mut store, collection, &QueryOptions::new().paginate(2, 0))
            .unwrap();

        assert_eq!(page.count, Some(42));
        assert_eq!(page.next_link.as_deref(), Some("Orders?$skip=2"));
        assert_eq!(store.stored_entities(collection).unwrap().len(), 2);
        let second = store.member(collection, 1).unwrap();
        assert_eq!(store.lifecycle(second).unwrap(), Lifecycle::Read);
        let params = &engine.transport().requests()[0].query;
        assert!(params.contains(&("$top".to_string(), "2".to_string())));
        assert!(params.contains(&("$count".to_string(), "true".to_string())));
    }

    #[test]
    fn query_returns_raw_rows() {
        let engine = engine();
        engine.transport().push_response(json!({
            "value": [{"Year": 2024, "aggregatedProperty0": 10, "@odata.id": null}]
        }));
        let page = engine.query("Orders", &QueryOptions::new()).unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(!page.records[0].contains_key("@odata.id"));
        assert_eq!(page.count, None);
    }
}
