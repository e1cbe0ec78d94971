//! # odbind Sync
//!
//! Moves odbind entity trees to and from an OData v4 service.
//!
//! This crate provides:
//! - Loading single entities and paged collections with `$select`/`$expand`
//!   derived from entity definitions
//! - Save planning: changed properties, tombstones and new entities become
//!   one JSON `$batch` sharing an atomicity group
//! - Applying batch responses back onto the tree, then consolidating
//! - Direct deletes and raw queries (`$filter`, `$apply`, paging)
//! - A transport abstraction with HTTP, loopback and mock implementations
//!
//! ## Save model
//!
//! A save is planned from the current tree, submitted, and applied only when
//! every operation in the batch succeeded:
//! 1. Plan operations and mark the tree as saving
//! 2. Submit the batch (the server applies it atomically)
//! 3. Apply response bodies to the nodes they were planned for
//! 4. Consolidate; a working copy pushes its state to its base
//!
//! ## Key Invariants
//!
//! - A failed save leaves the tree untouched
//! - At most one save per tree is in flight
//! - Responses are correlated by node handle, never by position
//! - The engine does not retry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod http;
mod plan;
mod query;
#[cfg(feature = "reqwest")]
mod reqwest_client;
mod transport;

pub use config::{SyncConfig, DEFAULT_ATOMICITY_GROUP};
pub use engine::{CollectionPage, QueryPage, SaveReport, SyncEngine, SyncStats};
pub use error::{status_text, SyncError, SyncResult};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, HttpTransport, LoopbackClient, LoopbackRequest,
    LoopbackServer,
};
pub use plan::SavePlan;
pub use query::{entity_query, expand_clause};
#[cfg(feature = "reqwest")]
pub use reqwest_client::ReqwestClient;
pub use transport::{check_batch, Headers, MockTransport, QueryParams, RecordedRequest, RemoteTransport};
