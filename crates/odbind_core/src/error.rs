//! Error types for odbind core.

use crate::entity::{CollectionId, NodeId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in entity state operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A write path's intermediate step was absent or not traversable.
    #[error("cannot resolve step '{step}' of path '{path}'")]
    PathResolution {
        /// The full path.
        path: String,
        /// The step that failed.
        step: String,
    },

    /// State was synced between nodes of different definitions.
    #[error("identity mismatch: cannot sync '{source_entity}' into '{target_entity}'")]
    IdentityMismatch {
        /// Entity name of the target definition.
        target_entity: String,
        /// Entity name of the source definition.
        source_entity: String,
    },

    /// Node handle is unknown or was released.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Collection handle is unknown or was released.
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionId),

    /// Index outside the public entities view.
    #[error("index {index} out of range for collection of length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Current length of the public view.
        len: usize,
    },

    /// Node already belongs to a collection.
    #[error("node {0} is already a member of a collection")]
    AlreadyAttached(NodeId),

    /// Node is not a member of the collection.
    #[error("node {node} is not a member of collection {collection}")]
    NotAMember {
        /// The node.
        node: NodeId,
        /// The collection searched.
        collection: CollectionId,
    },

    /// Navigation key does not name a child of the definition.
    #[error("entity '{entity}' has no child '{navigation}'")]
    UnknownChild {
        /// Entity name.
        entity: String,
        /// Requested navigation key.
        navigation: String,
    },

    /// Member path could not be parsed.
    #[error("invalid member path: {0}")]
    InvalidPath(#[from] odbind_protocol::ProtocolError),

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid-operation error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
