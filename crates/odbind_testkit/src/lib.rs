//! # odbind Testkit
//!
//! Test utilities for odbind.
//!
//! This crate provides:
//! - Entity definition fixtures and sample payloads
//! - Property-based test generators using proptest
//! - [`MemoryODataServer`], an in-memory OData service reachable through
//!   `LoopbackClient`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use odbind_testkit::prelude::*;
//!
//! #[test]
//! fn load_order() {
//!     let server = seeded_server(1);
//!     let engine = loopback_engine(&server);
//!     // ... load, edit, save
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
