//! Transport layer abstraction for remote operations.

use crate::error::{status_text, SyncError, SyncResult};
use odbind_protocol::{BatchOperation, Method, OperationResponse};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

/// Request headers.
pub type Headers = BTreeMap<String, String>;

/// Query parameters as `(name, value)` pairs.
pub type QueryParams = [(String, String)];

/// A remote transport talks to an OData service.
///
/// Paths are relative to the service root. This trait abstracts the
/// network layer, allowing for different implementations (HTTP, mock for
/// testing, etc.).
pub trait RemoteTransport: Send + Sync {
    /// Issues a GET and returns the decoded JSON body.
    fn get(&self, path: &str, query: &QueryParams, headers: &Headers) -> SyncResult<JsonValue>;

    /// Issues a POST with a JSON body.
    fn post(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>>;

    /// Issues a PUT with a JSON body.
    fn put(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>>;

    /// Issues a PATCH with a JSON body.
    fn patch(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>>;

    /// Issues a DELETE.
    fn delete(
        &self,
        path: &str,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>>;

    /// Submits operations as one JSON batch.
    ///
    /// Fails with [`SyncError::Batch`] if any operation status is outside
    /// `[200, 300)`.
    fn batch(
        &self,
        operations: &[BatchOperation],
        headers: &Headers,
    ) -> SyncResult<Vec<OperationResponse>>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// Fails with [`SyncError::Batch`] on the first non-2xx operation status.
pub fn check_batch(responses: Vec<OperationResponse>) -> SyncResult<Vec<OperationResponse>> {
    match responses.iter().find(|r| !r.is_success()) {
        Some(failed) => {
            let status = failed.status;
            Err(SyncError::Batch {
                status,
                status_text: status_text(status).to_string(),
                responses,
            })
        }
        None => Ok(responses),
    }
}

/// A request observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// HTTP method; `POST` for batches.
    pub method: Method,
    /// Resource path; `$batch` for batches.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<JsonValue>,
    /// Batch operations, empty for plain requests.
    pub operations: Vec<BatchOperation>,
}

/// A mock transport for testing.
///
/// Responses are queued and consumed in order; every request is recorded.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    responses: Mutex<VecDeque<SyncResult<Option<JsonValue>>>>,
    batch_responses: Mutex<VecDeque<SyncResult<Vec<OperationResponse>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
            batch_responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a JSON body for the next plain request.
    pub fn push_response(&self, body: JsonValue) {
        self.responses.lock().push_back(Ok(Some(body)));
    }

    /// Queues an empty (204) response for the next plain request.
    pub fn push_empty(&self) {
        self.responses.lock().push_back(Ok(None));
    }

    /// Queues a failure for the next plain request.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Queues operation responses for the next batch.
    pub fn push_batch(&self, responses: Vec<OperationResponse>) {
        self.batch_responses.lock().push_back(Ok(responses));
    }

    /// Queues a failure for the next batch.
    pub fn push_batch_error(&self, error: SyncError) {
        self.batch_responses.lock().push_back(Err(error));
    }

    /// Returns every request seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn record(
        &self,
        method: Method,
        path: &str,
        query: &QueryParams,
        body: Option<&JsonValue>,
    ) -> SyncResult<Option<JsonValue>> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.requests.lock().push(RecordedRequest {
            method,
            path: path.to_string(),
            query: query.to_vec(),
            body: body.cloned(),
            operations: Vec::new(),
        });
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("No mock response set".into())))
    }
}

impl RemoteTransport for MockTransport {
    fn get(&self, path: &str, query: &QueryParams, _headers: &Headers) -> SyncResult<JsonValue> {
        self.record(Method::Get, path, query, None)?
            .ok_or_else(|| SyncError::Protocol("empty response to GET".into()))
    }

    fn post(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        _headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.record(Method::Post, path, query, Some(body))
    }

    fn put(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        _headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.record(Method::Put, path, query, Some(body))
    }

    fn patch(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        _headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.record(Method::Patch, path, query, Some(body))
    }

    fn delete(
        &self,
        path: &str,
        query: &QueryParams,
        _headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.record(Method::Delete, path, query, None)
    }

    fn batch(
        &self,
        operations: &[BatchOperation],
        _headers: &Headers,
    ) -> SyncResult<Vec<OperationResponse>> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.requests.lock().push(RecordedRequest {
            method: Method::Post,
            path: "$batch".to_string(),
            query: Vec::new(),
            body: None,
            operations: operations.to_vec(),
        });
        let responses = self
            .batch_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("No mock batch response set".into())))?;
        check_batch(responses)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
