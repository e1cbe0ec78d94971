//! Entity nodes, child collections and the arena that owns them.
//!
//! All operations live on [`EntityStore`]; nodes and collections are
//! addressed by handle.

mod collection;
mod id;
mod node;
mod notify;
mod store;

pub use collection::AddSource;
pub use id::{CollectionId, NodeId};
pub use node::{CloneOptions, Lifecycle, PayloadOptions, PropertyRef};
pub use notify::{ChangeEvent, SubscriptionId};
pub use store::EntityStore;
