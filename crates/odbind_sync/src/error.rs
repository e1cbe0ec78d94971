//! Error types for the sync engine.

use odbind_protocol::OperationResponse;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during remote operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A request returned a non-2xx status.
    #[error("http error {status} {status_text}")]
    Http {
        /// HTTP status.
        status: u16,
        /// Status reason phrase.
        status_text: String,
        /// Response body as text.
        body: String,
    },

    /// A batch operation returned a non-2xx status.
    #[error("batch failed with status {status} {status_text}")]
    Batch {
        /// Status of the first failed operation.
        status: u16,
        /// Reason phrase of that status.
        status_text: String,
        /// Every operation response of the batch.
        responses: Vec<OperationResponse>,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (unexpected response shape).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// A save of the same tree is already in flight.
    #[error("a save of this entity tree is already in progress")]
    SaveInProgress,

    /// Entity state error.
    #[error("entity error: {0}")]
    Core(#[from] odbind_core::CoreError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Http { status, .. } | SyncError::Batch { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            _ => false,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } | SyncError::Batch { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Codec(err.to_string())
    }
}

impl From<odbind_protocol::ProtocolError> for SyncError {
    fn from(err: odbind_protocol::ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Standard reason phrase of an HTTP status.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        412 => "Precondition Failed",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
