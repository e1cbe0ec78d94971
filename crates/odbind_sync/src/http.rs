//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport speaking OData JSON.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, in-process loopback, etc.).

use crate::error::{status_text, SyncError, SyncResult};
use crate::transport::{check_batch, Headers, QueryParams, RemoteTransport};
use odbind_protocol::{
    build_url, decode_component, BatchOperation, BatchRequestBody, BatchResponseBody, Method,
    OperationResponse,
};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

const JSON: &str = "application/json";

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Headers.
    pub headers: Headers,
    /// Body bytes.
    pub body: Option<Vec<u8>>,
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Headers.
    pub headers: Headers,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a raw body.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            status_text: status_text(status).to_string(),
            headers: Headers::new(),
            body,
        }
    }

    /// Creates a response with a JSON body.
    pub fn json(status: u16, body: &JsonValue) -> Self {
        let mut response = Self::new(status, body.to_string().into_bytes());
        response
            .headers
            .insert("content-type".to_string(), JSON.to_string());
        response
    }

    /// Creates a response without body.
    pub fn empty(status: u16) -> Self {
        Self::new(status, Vec::new())
    }

    /// Returns true for a status in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response, whatever its status.
    /// `Err` means no response was received.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based remote transport.
///
/// Uses JSON encoding for request/response bodies.
pub struct HttpTransport<C: HttpClient> {
    /// Service root URL (e.g., "https://odata.example.com/service").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn send_json(
        &self,
        method: Method,
        path: &str,
        query: &QueryParams,
        headers: &Headers,
        body: Option<&JsonValue>,
    ) -> SyncResult<Option<JsonValue>> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let mut request_headers = headers.clone();
        request_headers
            .entry("accept".to_string())
            .or_insert_with(|| JSON.to_string());
        let body = match body {
            Some(body) => {
                request_headers.insert("content-type".to_string(), JSON.to_string());
                Some(serde_json::to_vec(body)?)
            }
            None => None,
        };

        let url = build_url(&self.base_url, path, query);
        trace!(%method, %url, "sending request");
        let response = self
            .client
            .send(HttpRequest {
                method,
                url,
                headers: request_headers,
                body,
            })
            .map_err(|e| {
                self.set_error(&e);
                SyncError::transport_retryable(e)
            })?;

        self.clear_error();

        if !response.is_success() {
            debug!(%method, %path, status = response.status, "request failed");
            let status_text = if response.status_text.is_empty() {
                status_text(response.status).to_string()
            } else {
                response.status_text
            };
            return Err(SyncError::Http {
                status: response.status,
                status_text,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&response.body)?))
    }
}

impl<C: HttpClient> RemoteTransport for HttpTransport<C> {
    fn get(&self, path: &str, query: &QueryParams, headers: &Headers) -> SyncResult<JsonValue> {
        self.send_json(Method::Get, path, query, headers, None)?
            .ok_or_else(|| SyncError::Protocol(format!("empty response to GET {path}")))
    }

    fn post(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.send_json(Method::Post, path, query, headers, Some(body))
    }

    fn put(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.send_json(Method::Put, path, query, headers, Some(body))
    }

    fn patch(
        &self,
        path: &str,
        body: &JsonValue,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.send_json(Method::Patch, path, query, headers, Some(body))
    }

    fn delete(
        &self,
        path: &str,
        query: &QueryParams,
        headers: &Headers,
    ) -> SyncResult<Option<JsonValue>> {
        self.send_json(Method::Delete, path, query, headers, None)
    }

    fn batch(
        &self,
        operations: &[BatchOperation],
        headers: &Headers,
    ) -> SyncResult<Vec<OperationResponse>> {
        let body = serde_json::to_value(BatchRequestBody {
            requests: operations.to_vec(),
        })?;
        let response = self
            .send_json(Method::Post, "$batch", &[], headers, Some(&body))?
            .ok_or_else(|| SyncError::Protocol("empty batch response".into()))?;
        let decoded: BatchResponseBody = serde_json::from_value(response)?;
        check_batch(decoded.responses)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A request as seen by a [`LoopbackServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackRequest {
    /// Method.
    pub method: Method,
    /// Resource path relative to the service root, without leading `/`.
    pub path: String,
    /// Decoded query parameters.
    pub query: Vec<(String, String)>,
    /// Headers.
    pub headers: Headers,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl LoopbackRequest {
    /// Parses an outgoing request. Scheme and authority are stripped; the
    /// rest of the URL path is the resource path.
    pub fn from_http(request: HttpRequest) -> Self {
        let url = request.url.as_str();
        let after_scheme = url.find("://").map(|i| &url[i + 3..]).unwrap_or(url);
        let resource = after_scheme
            .find('/')
            .map(|i| &after_scheme[i + 1..])
            .unwrap_or("");
        let (path, query) = resource.split_once('?').unwrap_or((resource, ""));
        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(name), decode_component(value))
            })
            .collect();
        Self {
            method: request.method,
            path: decode_component(path),
            query,
            headers: request.headers,
            body: request.body.unwrap_or_default(),
        }
    }

    /// Value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a request and returns the response.
    fn handle(&self, request: LoopbackRequest) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle(&self, request: LoopbackRequest) -> HttpResponse {
        (**self).handle(request)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        Ok(self.server.handle(LoopbackRequest::from_http(request)))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestClient {
        response: Mutex<Option<HttpResponse>>,
        sent: Mutex<Vec<HttpRequest>>,
        healthy: AtomicBool,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                healthy: AtomicBool::new(true),
            }
        }

        fn set_response(&self, resp: HttpResponse) {
            *self.response.lock() = Some(resp);
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn last_sent(&self) -> HttpRequest {
            self.sent.lock().last().cloned().unwrap()
        }
    }

    impl HttpClient for TestClient {
        fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.sent.lock().push(request);
            self.response
                .lock()
                .clone()
                .ok_or_else(|| "No response set".into())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn transport_creation() {
        let transport = HttpTransport::new("https://odata.example.com/svc", TestClient::new());
        assert_eq!(transport.base_url(), "https://odata.example.com/svc");
        assert!(transport.is_connected());
    }

    #[test]
    fn transport_disconnect() {
        let transport = HttpTransport::new("https://odata.example.com/svc", TestClient::new());
        transport.close().unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.get("Orders", &[], &Headers::new()),
            Err(SyncError::NotConnected)
        ));
    }

    #[test]
    fn transport_unhealthy_client() {
        let client = TestClient::new();
        client.set_healthy(false);
        let transport = HttpTransport::new("https://odata.example.com/svc", client);
        assert!(!transport.is_connected());
    }

    #[test]
    fn get_builds_url_and_decodes_json() {
        let client = TestClient::new();
        client.set_response(HttpResponse::json(200, &json!({"OrderID": 1})));
        let transport = HttpTransport::new("https://odata.example.com/svc/", client);

        let body = transport
            .get(
                "Orders(1)",
                &[("$select".into(), "OrderID,Name".into())],
                &Headers::new(),
            )
            .unwrap();

        assert_eq!(body, json!({"OrderID": 1}));
        let sent = transport.client().last_sent();
        assert_eq!(
            sent.url,
            "https://odata.example.com/svc/Orders(1)?$select=OrderID,Name"
        );
        assert_eq!(sent.headers.get("accept").map(String::as_str), Some(JSON));
    }

    #[test]
    fn non_success_status_is_http_error() {
        let client = TestClient::new();
        client.set_response(HttpResponse::new(404, b"missing".to_vec()));
        let transport = HttpTransport::new("https://odata.example.com/svc", client);

        match transport.delete("Orders(9)", &[], &Headers::new()) {
            Err(SyncError::Http {
                status,
                status_text,
                body,
            }) => {
                assert_eq!(status, 404);
                assert_eq!(status_text, "Not Found");
                assert_eq!(body, "missing");
            }
            other => panic!("expected http error, got {other:?}"),
        }
    }

    #[test]
    fn client_failure_is_retryable_transport_error() {
        let transport = HttpTransport::new("https://odata.example.com/svc", TestClient::new());
        let err = transport.get("Orders", &[], &Headers::new()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.last_error().as_deref(), Some("No response set"));
    }

    #[test]
    fn empty_body_is_none() {
        let client = TestClient::new();
        client.set_response(HttpResponse::empty(204));
        let transport = HttpTransport::new("https://odata.example.com/svc", client);
        let result = transport
            .patch("Orders(1)", &json!({"Name": "x"}), &[], &Headers::new())
            .unwrap();
        assert!(result.is_none());
        let sent = transport.client().last_sent();
        assert_eq!(sent.method, Method::Patch);
        assert_eq!(sent.body.unwrap(), br#"{"Name":"x"}"#.to_vec());
    }

    #[test]
    fn batch_round_trip() {
        let client = TestClient::new();
        client.set_response(HttpResponse::json(
            200,
            &json!({"responses": [{"id": "/update", "status": 200, "body": {"OrderID": 1}}]}),
        ));
        let transport = HttpTransport::new("https://odata.example.com/svc", client);
        let op = BatchOperation::new("/update", Method::Patch, "Orders(1)")
            .in_group("entitySave-1")
            .with_body(json!({"Name": "x"}));

        let responses = transport.batch(&[op], &Headers::new()).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].body, Some(json!({"OrderID": 1})));

        let sent = transport.client().last_sent();
        assert_eq!(sent.url, "https://odata.example.com/svc/$batch");
        let body: JsonValue = serde_json::from_slice(&sent.body.unwrap()).unwrap();
        assert_eq!(body["requests"][0]["atomicityGroup"], json!("entitySave-1"));
        assert_eq!(body["requests"][0]["method"], json!("PATCH"));
    }

    #[test]
    fn loopback_request_parsing() {
        let request = LoopbackRequest::from_http(HttpRequest {
            method: Method::Get,
            url: "http://loopback/Orders?$filter=Name%20eq%20'a'&$top=2".into(),
            headers: Headers::new(),
            body: None,
        });
        assert_eq!(request.path, "Orders");
        assert_eq!(request.param("$filter"), Some("Name eq 'a'"));
        assert_eq!(request.param("$top"), Some("2"));
        assert_eq!(request.param("$skip"), None);
    }
}
