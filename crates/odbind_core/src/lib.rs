//! # odbind Core
//!
//! In-memory mirror of remote hierarchical records.
//!
//! This crate provides:
//! - A dynamic [`Value`] type with first-class date-times
//! - Fan-out property paths over nested records ([`PropertyPath`])
//! - Immutable, shared [`EntityDefinition`]s
//! - The arena-backed [`EntityStore`] holding entity nodes and their child
//!   collections
//!
//! ## Model
//!
//! Every entity node keeps the values last confirmed by the server
//! (*stored*) apart from local edits (*changed*). A key lives in the changed
//! map only while its value differs from the stored one. Child collections
//! keep server-confirmed members, locally added members and tombstones
//! (stored members marked for deletion) separately, and expose the public
//! view `remaining ++ new`.
//!
//! Nodes and collections are addressed by copyable handles ([`NodeId`],
//! [`CollectionId`]); parent and base links are handles into the same store,
//! so the tree has no ownership cycles.
//!
//! ## Key Invariants
//!
//! - Effective value = changed value if present, else stored value
//! - Tombstone indices always address the current stored list
//! - A node is a member of at most one collection
//! - Network-free: nothing in this crate performs I/O

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod definition;
mod entity;
mod error;
mod path;
mod value;

pub use definition::{DetailDefinition, EntityDefinition, FieldKind};
pub use entity::{
    AddSource, ChangeEvent, CloneOptions, CollectionId, EntityStore, Lifecycle, NodeId,
    PayloadOptions, PropertyRef, SubscriptionId,
};
pub use error::{CoreError, CoreResult};
pub use path::{PropertyPath, FAN_OUT_MARKER};
pub use value::{parse_datetime, strip_envelope, Record, Value};
