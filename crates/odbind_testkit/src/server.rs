//! In-memory OData service.
//!
//! [`MemoryODataServer`] understands enough of OData v4 JSON to exercise
//! the sync engine end to end: entity sets keyed by a primary key, child
//! sets linked through foreign keys, `$select`/`$expand`, simple `$filter`,
//! `$orderby`, paging with `$count` and server-driven `@odata.nextLink`,
//! `$apply` grouping, deep insert and JSON `$batch` with atomicity groups.
//!
//! Nested records whose field is not a registered child navigation are kept
//! inline on the row and returned when expanded, which is how detail blobs
//! are modelled.

use odbind_core::EntityDefinition;
use odbind_protocol::{
    decode_component, BatchOperation, BatchRequestBody, BatchResponseBody, Method,
    OperationResponse,
};
use odbind_sync::{status_text, HttpResponse, LoopbackRequest, LoopbackServer};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A stored row.
pub type Row = Map<String, JsonValue>;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<String, Vec<Row>>,
    last_keys: BTreeMap<String, i64>,
}

static NULL: JsonValue = JsonValue::Null;

/// Link from an entity set to the set holding its child rows.
#[derive(Debug, Clone)]
struct Relation {
    navigation: String,
    target: String,
    foreign_key: Option<String>,
}

#[derive(Debug, Clone)]
struct SetSchema {
    key: String,
    relations: Vec<Relation>,
}

impl SetSchema {
    fn relation(&self, navigation: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.navigation == navigation)
    }
}

/// Status and optional body of one resource request.
#[derive(Debug)]
struct Reply {
    status: u16,
    body: Option<JsonValue>,
}

type Handled<T> = Result<T, Reply>;

impl Reply {
    fn ok(status: u16, body: JsonValue) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::ok(
            status,
            json!({"error": {"code": status_text(status), "message": message}}),
        )
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn message(&self) -> String {
        self.body
            .as_ref()
            .and_then(|body| body.pointer("/error/message"))
            .and_then(JsonValue::as_str)
            .unwrap_or(status_text(self.status))
            .to_string()
    }

    fn into_response(self) -> HttpResponse {
        match self.body {
            Some(body) => HttpResponse::json(self.status, &body),
            None => HttpResponse::empty(self.status),
        }
    }

    fn into_operation_response(self, id: &str) -> OperationResponse {
        let mut headers = BTreeMap::new();
        if self.body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        OperationResponse {
            id: id.to_string(),
            status: self.status,
            headers,
            body: self.body,
        }
    }
}

fn not_found(set: &str, key: &JsonValue) -> Reply {
    Reply::error(404, format!("{set}({key}) does not exist"))
}

fn unsupported(text: &str) -> Reply {
    Reply::error(501, format!("unsupported expression: {text}"))
}

/// An in-memory OData service.
///
/// Entity sets are registered from entity definitions; child definitions
/// register their own sets along with the navigation linking them.
pub struct MemoryODataServer {
    schema: BTreeMap<String, SetSchema>,
    tables: RwLock<Tables>,
    page_size: Option<usize>,
    failures: Mutex<HashMap<String, u16>>,
    requests: Mutex<Vec<LoopbackRequest>>,
    batches: Mutex<Vec<BatchRequestBody>>,
}

impl Default for MemoryODataServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryODataServer {
    /// Creates a server without entity sets.
    pub fn new() -> Self {
        Self {
            schema: BTreeMap::new(),
            tables: RwLock::new(Tables::default()),
            page_size: None,
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Registers the entity set of `definition` and of all its children.
    pub fn with_definition(mut self, definition: &EntityDefinition) -> Self {
        self.register(definition);
        self
    }

    /// Limits every collection response to `page_size` rows and emits
    /// `@odata.nextLink` for the rest.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size).filter(|size| *size > 0);
        self
    }

    fn register(&mut self, definition: &EntityDefinition) {
        let relations = definition
            .children
            .iter()
            .map(|child| Relation {
                navigation: child.navigation().to_string(),
                target: child.entity_name.clone(),
                foreign_key: child.foreign_key.clone(),
            })
            .collect();
        self.schema.insert(
            definition.entity_name.clone(),
            SetSchema {
                key: definition.primary_key.clone(),
                relations,
            },
        );
        self.tables
            .get_mut()
            .rows
            .entry(definition.entity_name.clone())
            .or_default();
        for child in &definition.children {
            self.register(child);
        }
    }

    /// Deep-inserts an entity and returns it as created, keys included.
    pub fn insert(&self, set: &str, entity: JsonValue) -> Result<JsonValue, String> {
        let mut tables = self.tables.write();
        let reply = self
            .create(&mut tables, set, Some(entity))
            .unwrap_or_else(|reply| reply);
        if reply.is_success() {
            Ok(reply.body.unwrap_or_default())
        } else {
            Err(reply.message())
        }
    }

    /// Returns the stored row with `key`, without expansions.
    pub fn entity(&self, set: &str, key: impl Into<JsonValue>) -> Option<JsonValue> {
        let schema = self.schema.get(set)?;
        let key = key.into();
        let tables = self.tables.read();
        find_row(tables.rows.get(set)?, &schema.key, &key).map(|row| JsonValue::Object(row.clone()))
    }

    /// Returns every stored row of a set in insertion order.
    pub fn rows(&self, set: &str) -> Vec<JsonValue> {
        self.tables
            .read()
            .rows
            .get(set)
            .map(|rows| rows.iter().cloned().map(JsonValue::Object).collect())
            .unwrap_or_default()
    }

    /// Number of rows in a set.
    pub fn count(&self, set: &str) -> usize {
        self.tables.read().rows.get(set).map_or(0, Vec::len)
    }

    /// Makes the next batch operation with `operation_id` fail with
    /// `status`.
    pub fn fail_operation(&self, operation_id: impl Into<String>, status: u16) {
        self.failures.lock().insert(operation_id.into(), status);
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<LoopbackRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns every batch received so far.
    pub fn batches(&self) -> Vec<BatchRequestBody> {
        self.batches.lock().clone()
    }

    fn schema(&self, set: &str) -> Handled<&SetSchema> {
        self.schema
            .get(set)
            .ok_or_else(|| Reply::error(404, format!("unknown entity set {set}")))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn handle_batch(&self, body: &[u8]) -> HttpResponse {
        let batch: BatchRequestBody = match serde_json::from_slice(body) {
            Ok(batch) => batch,
            Err(err) => return Reply::error(400, format!("invalid batch: {err}")).into_response(),
        };
        self.batches.lock().push(batch.clone());

        let mut tables = self.tables.write();
        let snapshot = tables.clone();
        let mut failed = false;
        let mut responses = Vec::with_capacity(batch.requests.len());
        for operation in &batch.requests {
            let reply = self.execute(&mut tables, operation);
            if !reply.is_success() && operation.atomicity_group.is_some() {
                failed = true;
            }
            responses.push(reply.into_operation_response(&operation.id));
        }
        if failed {
            warn!(operations = batch.requests.len(), "rolling back atomicity group");
            *tables = snapshot;
        }

        let body = serde_json::to_value(BatchResponseBody { responses }).unwrap_or_default();
        HttpResponse::json(200, &body)
    }

    fn execute(&self, tables: &mut Tables, operation: &BatchOperation) -> Reply {
        if let Some(status) = self.failures.lock().remove(&operation.id) {
            return Reply::error(status, format!("injected failure for {}", operation.id));
        }
        let (path, query) = operation.url.split_once('?').unwrap_or((&operation.url, ""));
        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(name), decode_component(value))
            })
            .collect::<Vec<_>>();
        let path = decode_component(path);
        self.dispatch(tables, operation.method, &path, &query, operation.body.clone())
    }

    fn dispatch(
        &self,
        tables: &mut Tables,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<JsonValue>,
    ) -> Reply {
        let result = parse_resource(path).and_then(|(set, key)| {
            self.schema(&set)?;
            match (method, key) {
                (Method::Get, None) => self.list(tables, &set, query),
                (Method::Get, Some(key)) => self.read(tables, &set, &key, query),
                (Method::Post, None) => self.create(tables, &set, body),
                (Method::Patch, Some(key)) => self.update(tables, &set, &key, body, false),
                (Method::Put, Some(key)) => self.update(tables, &set, &key, body, true),
                (Method::Delete, Some(key)) => self.remove(tables, &set, &key),
                (method, _) => Err(Reply::error(405, format!("{method} not allowed on {path}"))),
            }
        });
        result.unwrap_or_else(|reply| reply)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn list(&self, tables: &Tables, set: &str, query: &[(String, String)]) -> Handled<Reply> {
        let mut rows = tables.rows.get(set).cloned().unwrap_or_default();
        if let Some(filter) = param(query, "$filter") {
            rows = filter_rows(rows, filter)?;
        }

        let mut envelope = Map::new();
        envelope.insert(
            "@odata.context".to_string(),
            JsonValue::String(format!("$metadata#{set}")),
        );

        if let Some(apply) = param(query, "$apply") {
            let rows = apply_pipeline(rows, apply)?;
            envelope.insert(
                "value".to_string(),
                JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect()),
            );
            return Ok(Reply::ok(200, JsonValue::Object(envelope)));
        }

        if let Some(order) = param(query, "$orderby") {
            sort_rows(&mut rows, order);
        }
        let total = rows.len();
        let skip = usize_param(query, "$skip")?.unwrap_or(0);
        let requested = usize_param(query, "$top")?;
        let top = match (requested, self.page_size) {
            (Some(top), Some(page)) => top.min(page),
            (Some(top), None) => top,
            (None, Some(page)) => page,
            (None, None) => usize::MAX,
        };
        let server_limited = self
            .page_size
            .is_some_and(|page| top == page && requested.map_or(true, |t| t > page));

        let select = param(query, "$select");
        let expand = param(query, "$expand");
        let page = rows
            .iter()
            .skip(skip)
            .take(top)
            .map(|row| JsonValue::Object(self.shape(tables, set, row, select, expand)))
            .collect::<Vec<_>>();
        let consumed = skip + page.len();

        if param(query, "$count") == Some("true") {
            envelope.insert("@odata.count".to_string(), JsonValue::from(total));
        }
        envelope.insert("value".to_string(), JsonValue::Array(page));
        if server_limited && consumed < total {
            envelope.insert(
                "@odata.nextLink".to_string(),
                JsonValue::String(format!("{set}?$skip={consumed}")),
            );
        }
        Ok(Reply::ok(200, JsonValue::Object(envelope)))
    }

    fn read(
        &self,
        tables: &Tables,
        set: &str,
        key: &JsonValue,
        query: &[(String, String)],
    ) -> Handled<Reply> {
        let schema = self.schema(set)?;
        let rows = tables.rows.get(set).map(Vec::as_slice).unwrap_or_default();
        let row = find_row(rows, &schema.key, key).ok_or_else(|| not_found(set, key))?;
        let mut shaped = self.shape(
            tables,
            set,
            row,
            param(query, "$select"),
            param(query, "$expand"),
        );
        shaped.insert(
            "@odata.context".to_string(),
            JsonValue::String(format!("$metadata#{set}/$entity")),
        );
        Ok(Reply::ok(200, JsonValue::Object(shaped)))
    }

    /// Applies `$select` and `$expand` to a row.
    fn shape(
        &self,
        tables: &Tables,
        set: &str,
        row: &Row,
        select: Option<&str>,
        expand: Option<&str>,
    ) -> Row {
        let Some(schema) = self.schema.get(set) else {
            return row.clone();
        };
        let mut shaped = match select {
            Some(select) => {
                let fields = split_top_level(select, ',');
                row.iter()
                    .filter(|(name, _)| {
                        **name == schema.key || fields.iter().any(|f| f.trim() == name.as_str())
                    })
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            }
            None => row.clone(),
        };

        for item in expand.map(parse_expand).unwrap_or_default() {
            match schema.relation(&item.navigation) {
                Some(relation) => {
                    let key = row.get(&schema.key).unwrap_or(&NULL);
                    let children = children_of(tables, relation, key)
                        .into_iter()
                        .map(|child| {
                            JsonValue::Object(self.shape(
                                tables,
                                &relation.target,
                                child,
                                item.select.as_deref(),
                                item.expand.as_deref(),
                            ))
                        })
                        .collect();
                    shaped.insert(item.navigation, JsonValue::Array(children));
                }
                None => {
                    if let Some(value) = row.get(&item.navigation) {
                        let value = select_fields(value, item.select.as_deref());
                        shaped.insert(item.navigation, value);
                    }
                }
            }
        }
        shaped
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn create(&self, tables: &mut Tables, set: &str, body: Option<JsonValue>) -> Handled<Reply> {
        let Some(JsonValue::Object(entity)) = body else {
            return Err(Reply::error(400, "expected a JSON object"));
        };
        let created = self.insert_deep(tables, set, entity)?;
        debug!(%set, "created entity");
        Ok(Reply::ok(201, JsonValue::Object(created)))
    }

    /// Inserts a row and the child rows nested under its navigations.
    fn insert_deep(&self, tables: &mut Tables, set: &str, mut entity: Row) -> Handled<Row> {
        let schema = self.schema(set)?;
        let nested = schema
            .relations
            .iter()
            .filter_map(|relation| {
                entity
                    .remove(&relation.navigation)
                    .map(|value| (relation, value))
            })
            .collect::<Vec<_>>();

        let last_key = tables.last_keys.entry(set.to_string()).or_insert(0);
        let rows = tables.rows.entry(set.to_string()).or_default();
        let key = match entity.get(&schema.key) {
            Some(key) if !key.is_null() => {
                if find_row(rows, &schema.key, key).is_some() {
                    return Err(Reply::error(409, format!("{set}({key}) already exists")));
                }
                if let Some(number) = key.as_i64() {
                    *last_key = (*last_key).max(number);
                }
                key.clone()
            }
            _ => {
                // Keys are never reused, even after deletes
                *last_key += 1;
                let key = JsonValue::from(*last_key);
                entity.insert(schema.key.clone(), key.clone());
                key
            }
        };
        rows.push(entity.clone());

        let mut created = entity;
        for (relation, value) in nested {
            let items = match value {
                JsonValue::Array(items) => items,
                JsonValue::Object(item) => vec![JsonValue::Object(item)],
                _ => Vec::new(),
            };
            let mut children = Vec::with_capacity(items.len());
            for item in items {
                let JsonValue::Object(mut child) = item else {
                    return Err(Reply::error(
                        400,
                        format!("{} members must be objects", relation.navigation),
                    ));
                };
                if let Some(foreign_key) = &relation.foreign_key {
                    child.insert(foreign_key.clone(), key.clone());
                }
                let inserted = self.insert_deep(tables, &relation.target, child)?;
                children.push(JsonValue::Object(inserted));
            }
            created.insert(relation.navigation.clone(), JsonValue::Array(children));
        }
        Ok(created)
    }

    fn update(
        &self,
        tables: &mut Tables,
        set: &str,
        key: &JsonValue,
        body: Option<JsonValue>,
        replace: bool,
    ) -> Handled<Reply> {
        let schema = self.schema(set)?;
        let Some(JsonValue::Object(changes)) = body else {
            return Err(Reply::error(400, "expected a JSON object"));
        };
        let rows = tables.rows.get_mut(set).ok_or_else(|| not_found(set, key))?;
        let index = position(rows, &schema.key, key).ok_or_else(|| not_found(set, key))?;
        let row = &mut rows[index];
        if replace {
            row.retain(|name, _| *name == schema.key);
        }
        for (name, value) in changes {
            if name == schema.key {
                continue;
            }
            if schema.relation(&name).is_some() {
                warn!(%set, navigation = %name, "ignoring navigation property in update");
                continue;
            }
            row.insert(name, value);
        }
        Ok(Reply::ok(200, JsonValue::Object(row.clone())))
    }

    fn remove(&self, tables: &mut Tables, set: &str, key: &JsonValue) -> Handled<Reply> {
        let schema = self.schema(set)?;
        let rows = tables.rows.get_mut(set).ok_or_else(|| not_found(set, key))?;
        let index = position(rows, &schema.key, key).ok_or_else(|| not_found(set, key))?;
        rows.remove(index);
        self.cascade(tables, schema, key);
        debug!(%set, %key, "deleted entity");
        Ok(Reply::empty(204))
    }

    /// Deletes the child rows of a deleted row, recursively.
    fn cascade(&self, tables: &mut Tables, schema: &SetSchema, key: &JsonValue) {
        for relation in &schema.relations {
            let (Some(foreign_key), Some(child_schema)) =
                (&relation.foreign_key, self.schema.get(&relation.target))
            else {
                continue;
            };
            let Some(rows) = tables.rows.get_mut(&relation.target) else {
                continue;
            };
            let mut removed = Vec::new();
            rows.retain(|row| {
                let hit = row.get(foreign_key).is_some_and(|v| json_eq(v, key));
                if hit {
                    removed.push(row.get(&child_schema.key).cloned().unwrap_or_default());
                }
                !hit
            });
            for child_key in removed {
                self.cascade(tables, child_schema, &child_key);
            }
        }
    }
}

impl LoopbackServer for MemoryODataServer {
    fn handle(&self, request: LoopbackRequest) -> HttpResponse {
        self.requests.lock().push(request.clone());
        debug!(method = %request.method, path = %request.path, "handling request");

        if request.path == "$batch" {
            return match request.method {
                Method::Post => self.handle_batch(&request.body),
                method => Reply::error(405, format!("{method} not allowed on $batch")).into_response(),
            };
        }

        let body = if request.body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            match serde_json::from_slice(&request.body) {
                Ok(body) => Some(body),
                Err(err) => {
                    return Reply::error(400, format!("invalid JSON body: {err}")).into_response()
                }
            }
        };
        let mut tables = self.tables.write();
        self.dispatch(&mut tables, request.method, &request.path, &request.query, body)
            .into_response()
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn usize_param(query: &[(String, String)], name: &str) -> Handled<Option<usize>> {
    param(query, name)
        .map(|value| {
            value
                .parse::<usize>()
                .map_err(|_| Reply::error(400, format!("invalid {name}: {value}")))
        })
        .transpose()
}

/// Splits `Set` or `Set(key)`.
fn parse_resource(path: &str) -> Handled<(String, Option<JsonValue>)> {
    let path = path.trim_matches('/');
    match path.find('(') {
        None => Ok((path.to_string(), None)),
        Some(open) => {
            let inner = path[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| Reply::error(400, format!("malformed resource path {path}")))?;
            Ok((path[..open].to_string(), Some(parse_literal(inner))))
        }
    }
}

/// Parses an OData literal: quoted string, number, boolean or null.
fn parse_literal(text: &str) -> JsonValue {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return JsonValue::String(inner.replace("''", "'"));
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::Null, _) => Some(Ordering::Less),
        (_, JsonValue::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

fn find_row<'a>(rows: &'a [Row], key_field: &str, key: &JsonValue) -> Option<&'a Row> {
    position(rows, key_field, key).map(|index| &rows[index])
}

fn position(rows: &[Row], key_field: &str, key: &JsonValue) -> Option<usize> {
    rows.iter()
        .position(|row| row.get(key_field).is_some_and(|v| json_eq(v, key)))
}

fn children_of<'a>(tables: &'a Tables, relation: &Relation, key: &JsonValue) -> Vec<&'a Row> {
    let (Some(foreign_key), Some(rows)) = (&relation.foreign_key, tables.rows.get(&relation.target))
    else {
        return Vec::new();
    };
    rows.iter()
        .filter(|row| row.get(foreign_key).is_some_and(|v| json_eq(v, key)))
        .collect()
}

fn select_fields(value: &JsonValue, select: Option<&str>) -> JsonValue {
    match (value, select) {
        (JsonValue::Object(record), Some(select)) => {
            let fields = split_top_level(select, ',');
            JsonValue::Object(
                record
                    .iter()
                    .filter(|(name, _)| fields.iter().any(|f| f.trim() == name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            )
        }
        _ => value.clone(),
    }
}

fn sort_rows(rows: &mut [Row], order: &str) {
    let terms = order
        .split(',')
        .filter_map(|term| {
            let mut parts = term.split_whitespace();
            let field = parts.next()?;
            Some((field.to_string(), parts.next() == Some("desc")))
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        for (field, descending) in &terms {
            let ordering = compare(
                a.get(field).unwrap_or(&NULL),
                b.get(field).unwrap_or(&NULL),
            )
            .unwrap_or(Ordering::Equal);
            let ordering = if *descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Splits on `separator` outside parentheses and quotes.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 && !quoted => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

#[derive(Debug, Default)]
struct ExpandItem {
    navigation: String,
    select: Option<String>,
    expand: Option<String>,
}

fn parse_expand(text: &str) -> Vec<ExpandItem> {
    split_top_level(text, ',')
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.find('(') {
            Some(open) if item.ends_with(')') => {
                let mut expanded = ExpandItem {
                    navigation: item[..open].to_string(),
                    ..ExpandItem::default()
                };
                for option in split_top_level(&item[open + 1..item.len() - 1], ';') {
                    match option.split_once('=') {
                        Some(("$select", value)) => expanded.select = Some(value.to_string()),
                        Some(("$expand", value)) => expanded.expand = Some(value.to_string()),
                        _ => {}
                    }
                }
                expanded
            }
            _ => ExpandItem {
                navigation: item.to_string(),
                ..ExpandItem::default()
            },
        })
        .collect()
}

// =============================================================================
// $filter and $apply
// =============================================================================

struct Clause {
    field: String,
    op: String,
    literal: JsonValue,
}

impl Clause {
    fn parse(text: &str) -> Handled<Self> {
        let mut parts = text.trim().splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(field), Some(op), Some(literal))
                if matches!(op, "eq" | "ne" | "gt" | "ge" | "lt" | "le") =>
            {
                Ok(Self {
                    field: field.to_string(),
                    op: op.to_string(),
                    literal: parse_literal(literal),
                })
            }
            _ => Err(unsupported(text)),
        }
    }

    fn matches(&self, row: &Row) -> bool {
        let value = row.get(&self.field).unwrap_or(&NULL);
        match self.op.as_str() {
            "eq" => json_eq(value, &self.literal),
            "ne" => !json_eq(value, &self.literal),
            op => match compare(value, &self.literal) {
                Some(ordering) => match op {
                    "gt" => ordering.is_gt(),
                    "ge" => ordering.is_ge(),
                    "lt" => ordering.is_lt(),
                    _ => ordering.is_le(),
                },
                None => false,
            },
        }
    }
}

fn filter_rows(rows: Vec<Row>, filter: &str) -> Handled<Vec<Row>> {
    let clauses = filter
        .split(" and ")
        .map(Clause::parse)
        .collect::<Handled<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .filter(|row| clauses.iter().all(|clause| clause.matches(row)))
        .collect())
}

struct Aggregation {
    field: Option<String>,
    op: String,
    alias: String,
}

impl Aggregation {
    fn parse(text: &str) -> Handled<Self> {
        let text = text.trim();
        let (expression, alias) = text.rsplit_once(" as ").ok_or_else(|| unsupported(text))?;
        let alias = alias.trim().to_string();
        if expression.trim() == "$count" {
            return Ok(Self {
                field: None,
                op: "count".to_string(),
                alias,
            });
        }
        let (field, op) = expression
            .split_once(" with ")
            .ok_or_else(|| unsupported(text))?;
        let op = op.trim();
        if !matches!(op, "sum" | "min" | "max" | "average" | "countdistinct") {
            return Err(unsupported(text));
        }
        Ok(Self {
            field: Some(field.trim().to_string()),
            op: op.to_string(),
            alias,
        })
    }

    fn compute(&self, rows: &[Row]) -> JsonValue {
        let Some(field) = &self.field else {
            return JsonValue::from(rows.len());
        };
        let values = rows
            .iter()
            .filter_map(|row| row.get(field))
            .filter(|value| !value.is_null())
            .collect::<Vec<_>>();
        match self.op.as_str() {
            "sum" => number(numbers(&values).sum()),
            "average" => match numbers(&values).count() {
                0 => JsonValue::Null,
                n => number(numbers(&values).sum::<f64>() / n as f64),
            },
            "min" => numbers(&values).reduce(f64::min).map_or(JsonValue::Null, number),
            "max" => numbers(&values).reduce(f64::max).map_or(JsonValue::Null, number),
            _ => {
                let mut distinct: Vec<&JsonValue> = Vec::new();
                for value in values {
                    if !distinct.iter().any(|seen| json_eq(seen, value)) {
                        distinct.push(value);
                    }
                }
                JsonValue::from(distinct.len())
            }
        }
    }
}

fn numbers<'a>(values: &'a [&'a JsonValue]) -> impl Iterator<Item = f64> + 'a {
    values.iter().filter_map(|value| value.as_f64())
}

fn number(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        JsonValue::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or_default()
    }
}

fn call_args<'a>(step: &'a str, name: &str) -> Option<&'a str> {
    step.strip_prefix(name)?.strip_prefix('(')?.strip_suffix(')')
}

fn parse_aggregates(text: &str) -> Handled<Vec<Aggregation>> {
    split_top_level(text, ',')
        .into_iter()
        .map(Aggregation::parse)
        .collect()
}

fn apply_pipeline(mut rows: Vec<Row>, apply: &str) -> Handled<Vec<Row>> {
    for step in split_top_level(apply, '/') {
        let step = step.trim();
        rows = if let Some(filter) = call_args(step, "filter") {
            filter_rows(rows, filter)?
        } else if let Some(inner) = call_args(step, "groupby") {
            let parts = split_top_level(inner, ',');
            let columns = parts
                .first()
                .and_then(|c| c.trim().strip_prefix('('))
                .and_then(|c| c.strip_suffix(')'))
                .ok_or_else(|| unsupported(step))?;
            let columns = columns.split(',').map(str::trim).collect::<Vec<_>>();
            let aggregates = match parts.get(1) {
                Some(aggregate) => parse_aggregates(
                    call_args(aggregate.trim(), "aggregate").ok_or_else(|| unsupported(step))?,
                )?,
                None => Vec::new(),
            };
            group_rows(rows, &columns, &aggregates)
        } else if let Some(inner) = call_args(step, "aggregate") {
            group_rows(rows, &[], &parse_aggregates(inner)?)
        } else {
            return Err(unsupported(step));
        };
    }
    Ok(rows)
}

/// Groups rows by `columns` in order of first appearance.
fn group_rows(rows: Vec<Row>, columns: &[&str], aggregates: &[Aggregation]) -> Vec<Row> {
    let mut groups: Vec<(Vec<JsonValue>, Vec<Row>)> = Vec::new();
    for row in rows {
        let key = columns
            .iter()
            .map(|column| row.get(*column).cloned().unwrap_or_default())
            .collect::<Vec<_>>();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }
    if groups.is_empty() && columns.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut grouped: Row = columns.iter().map(|c| c.to_string()).zip(key).collect();
            for aggregate in aggregates {
                grouped.insert(aggregate.alias.clone(), aggregate.compute(&members));
            }
            grouped
        })
        .collect()
}
