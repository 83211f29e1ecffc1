use serde::{Deserialize, Serialize};

use crate::object::ObjectIdentifier;

/// Fetch priority of a value referenced from the tree.
///
/// Eager values are downloaded together with the tree that references them;
/// lazy values are fetched on first read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPriority {
    Eager,
    Lazy,
}

/// One leaf of the content B-tree: a key mapped to a value object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub object_identifier: ObjectIdentifier,
    pub priority: KeyPriority,
    /// Stable identifier of the change that produced this entry, used to
    /// describe diffs to the cloud without revealing keys.
    pub entry_id: Vec<u8>,
}

impl Entry {
    pub fn new(
        key: impl Into<String>,
        object_identifier: ObjectIdentifier,
        priority: KeyPriority,
        entry_id: Vec<u8>,
    ) -> Self {
        Self {
            key: key.into(),
            object_identifier,
            priority,
            entry_id,
        }
    }

    /// Whether two entries hold the same value, ignoring `entry_id`.
    pub fn same_value(&self, other: &Entry) -> bool {
        self.key == other.key
            && self.object_identifier == other.object_identifier
            && self.priority == other.priority
    }
}

/// A key-level change between two trees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryChange {
    /// The new entry, or the removed one when `deleted` is set.
    pub entry: Entry,
    pub deleted: bool,
}

impl EntryChange {
    pub fn put(entry: Entry) -> Self {
        Self {
            entry,
            deleted: false,
        }
    }

    pub fn delete(entry: Entry) -> Self {
        Self {
            entry,
            deleted: true,
        }
    }
}

/// A key-level change across a base tree and two descendants.
///
/// `None` means the key is absent from that tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreeWayChange {
    pub base: Option<Entry>,
    pub left: Option<Entry>,
    pub right: Option<Entry>,
}

impl ThreeWayChange {
    /// The key this change is about.
    pub fn key(&self) -> Option<&str> {
        self.base
            .as_ref()
            .or(self.left.as_ref())
            .or(self.right.as_ref())
            .map(|e| e.key.as_str())
    }
}
