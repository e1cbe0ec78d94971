//! Change notifications.

use super::id::{CollectionId, NodeId};
use std::fmt;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Emitted after a public mutating operation on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A tracked property was written.
    PropertyChanged {
        /// The node.
        node: NodeId,
        /// Property name.
        name: String,
    },
    /// A detail blob was written or removed.
    DetailChanged {
        /// The node.
        node: NodeId,
        /// Detail navigation key.
        name: String,
    },
    /// A node was repopulated from server data.
    SnapshotImported {
        /// The node.
        node: NodeId,
    },
    /// A node joined a collection.
    MemberAdded {
        /// The collection.
        collection: CollectionId,
        /// The new member.
        node: NodeId,
    },
    /// A member was tombstoned or removed from a collection.
    MemberRemoved {
        /// The collection.
        collection: CollectionId,
        /// The removed member.
        node: NodeId,
    },
    /// A member slot now holds a different node.
    MemberReplaced {
        /// The collection.
        collection: CollectionId,
        /// Previous occupant, now released.
        old: NodeId,
        /// New occupant.
        new: NodeId,
    },
    /// A collection was re-synced from incoming records.
    CollectionSynced {
        /// The collection.
        collection: CollectionId,
    },
    /// Changes were merged into stored values.
    Consolidated {
        /// Root of the consolidated subtree.
        node: NodeId,
    },
    /// All values and members were dropped.
    Cleared {
        /// The node.
        node: NodeId,
    },
    /// A node's state was overwritten from another node.
    StateSynced {
        /// The overwritten node.
        target: NodeId,
        /// The node copied from.
        source: NodeId,
    },
    /// A node and its descendants were freed.
    Released {
        /// The node.
        node: NodeId,
    },
}

pub(crate) type Listener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    next: u64,
    entries: Vec<(SubscriptionId, Listener)>,
}

impl Listeners {
    pub(crate) fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        self.next += 1;
        let id = SubscriptionId(self.next);
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        for (_, listener) in &self.entries {
            listener(&event);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
