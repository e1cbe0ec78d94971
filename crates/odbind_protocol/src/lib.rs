//! # odbind Protocol
//!
//! Wire-level types for talking to an OData v4 JSON service.
//!
//! This crate provides:
//! - `QueryOptions` rendering of `$select`, `$expand`, `$filter`, `$orderby`,
//!   `$top`, `$skip`, `$count` and `$apply`
//! - URL joining and query string encoding
//! - JSON batch envelopes (`BatchOperation`, `OperationResponse`)
//! - Path-encoded batch operation ids used for response correlation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod error;
mod query;
mod url;

pub use batch::{
    entity_key_segment, member_path, parse_member_path, tombstone_path, BatchOperation,
    BatchRequestBody, BatchResponseBody, MemberStep, Method, OperationAction, OperationId,
    OperationResponse,
};
pub use error::{ProtocolError, ProtocolResult};
pub use query::{aggregated_name, Aggregate, ApplyPipeline, Direction, OrderBy, QueryOptions};
pub use url::{
    build_url, decode_component, encode_component, encode_query, encode_segment, join_url,
};
