//! JSON batch envelopes and path-encoded operation ids.
//!
//! Every operation of a save batch carries an id of the form
//! `<path>/<action>` where `<path>` locates the target entity relative to
//! the saved root, e.g. `/Lines[2]/Notes[0]/update`. Deletes of tombstoned
//! members are addressed by key instead of position: `/Lines(17)/delete`.
//! Ids are opaque to the server beyond atomicity grouping.

use crate::error::{ProtocolError, ProtocolResult};
use crate::url::encode_segment;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// HTTP method of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a save operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationAction {
    /// Insert a never-persisted entity.
    Create,
    /// Partial update of a persisted entity.
    Update,
    /// Delete of a tombstoned member.
    Delete,
}

impl OperationAction {
    /// Returns the id suffix for this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Create => "create",
            OperationAction::Update => "update",
            OperationAction::Delete => "delete",
        }
    }

    /// Returns the HTTP method that carries this action.
    pub fn method(&self) -> Method {
        match self {
            OperationAction::Create => Method::Post,
            OperationAction::Update => Method::Patch,
            OperationAction::Delete => Method::Delete,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationAction::Create),
            "update" => Some(OperationAction::Update),
            "delete" => Some(OperationAction::Delete),
            _ => None,
        }
    }
}

/// A path-encoded batch operation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationId {
    /// Target path relative to the saved root (empty for the root).
    pub path: String,
    /// Action performed on the target.
    pub action: OperationAction,
}

impl OperationId {
    /// Creates an operation id.
    pub fn new(path: impl Into<String>, action: OperationAction) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }

    /// Parses an id produced by [`OperationId`]'s `Display`.
    pub fn parse(id: &str) -> ProtocolResult<Self> {
        let (path, action) = id
            .rsplit_once('/')
            .ok_or_else(|| ProtocolError::InvalidOperationId(id.to_string()))?;
        let action = OperationAction::parse(action)
            .ok_or_else(|| ProtocolError::InvalidOperationId(id.to_string()))?;
        Ok(Self::new(path, action))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.path, self.action.as_str())
    }
}

/// Path of the member at `index` of collection `navigation` under `prefix`.
pub fn member_path(prefix: &str, navigation: &str, index: usize) -> String {
    format!("{}/{}[{}]", prefix, navigation, index)
}

/// Path of a tombstoned member identified by its key.
pub fn tombstone_path(prefix: &str, navigation: &str, key: &JsonValue) -> String {
    format!("{}/{}({})", prefix, navigation, key_literal(key))
}

/// One `<navigation>[<index>]` step of a member path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStep {
    /// Navigation key of the collection.
    pub navigation: String,
    /// Position in the collection's public view.
    pub index: usize,
}

/// Parses a member path such as `/Lines[2]/Notes[0]` into its steps.
///
/// The empty path designates the root and yields no steps.
pub fn parse_member_path(path: &str) -> ProtocolResult<Vec<MemberStep>> {
    let invalid = || ProtocolError::InvalidPath(path.to_string());

    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path.strip_prefix('/').ok_or_else(invalid)?;

    rest.split('/')
        .map(|step| {
            let open = step.find('[').ok_or_else(invalid)?;
            let inner = step[open + 1..].strip_suffix(']').ok_or_else(invalid)?;
            let index = inner.parse::<usize>().map_err(|_| invalid())?;
            let navigation = &step[..open];
            if navigation.is_empty() {
                return Err(invalid());
            }
            Ok(MemberStep {
                navigation: navigation.to_string(),
                index,
            })
        })
        .collect()
}

/// Renders a key value as an OData literal.
fn key_literal(key: &JsonValue) -> String {
    match key {
        JsonValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => other.to_string(),
    }
}

/// Resource path addressing a single entity: `<entity_name>(<key>)`.
///
/// The key literal is percent-encoded so that string keys cannot break out
/// of the segment.
pub fn entity_key_segment(entity_name: &str, key: &JsonValue) -> String {
    format!("{}({})", entity_name, encode_segment(&key_literal(key)))
}

/// One request inside a JSON batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    /// Correlation id.
    pub id: String,
    /// Atomicity group shared by all operations of one save.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub atomicity_group: Option<String>,
    /// HTTP method.
    pub method: Method,
    /// Resource path relative to the service root.
    pub url: String,
    /// Per-operation headers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<JsonValue>,
}

impl BatchOperation {
    /// Creates an operation without body.
    pub fn new(id: impl Into<String>, method: Method, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            atomicity_group: None,
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Sets the atomicity group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.atomicity_group = Some(group.into());
        self
    }

    /// Sets the JSON body and a JSON content type.
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = Some(body);
        self
    }
}

/// Body of a `$batch` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestBody {
    /// Operations in submission order.
    pub requests: Vec<BatchOperation>,
}

/// Response to one batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Correlation id of the request.
    pub id: String,
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<JsonValue>,
}

impl OperationResponse {
    /// Returns true for a status in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Body of a `$batch` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponseBody {
    /// Responses, one per operation.
    pub responses: Vec<OperationResponse>,
}
