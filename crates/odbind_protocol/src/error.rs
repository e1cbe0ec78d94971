//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A batch operation id does not end in a known action.
    #[error("invalid operation id: {0}")]
    InvalidOperationId(String),

    /// A member path could not be parsed.
    #[error("invalid member path: {0}")]
    InvalidPath(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
