//! Rows and their per-index tree nodes.
//!
//! A [`Row`] holds its storage identity and the head of a singly linked chain
//! of [`Node`]s, one per index on its table, in index order. Each node is
//! the row's membership in one AVL tree. Rows and nodes live in the two
//! arenas of a [`RowStore`] and refer to each other by handle. Field values
//! are held by the store as shared [`RowData`].
//!
//! ```text
//!   Row ──first──► Node(index 0) ──next──► Node(index 1) ──next──► ...
//!                    │  ▲                    │  ▲
//!               left/right/parent      left/right/parent
//!                 (tree of index 0)      (tree of index 1)
//! ```

mod store;

use std::sync::Arc;

use ember_common::memory::Handle;
use ember_common::{DiskKey, Value};

pub use store::{ResidentStats, RowLoader, RowStore};

/// Field values of one row.
pub type RowData = Arc<[Value]>;

/// Handle of a row in a [`RowStore`].
pub type RowRef = Handle<Row>;

/// Handle of a node in a [`RowStore`].
pub type NodeRef = Handle<Node>;

/// Where a row's authoritative copy lives.
///
/// Chosen once per table: memory tables create `InMemory` rows, disk
/// tables create one of the disk variants depending on whether the data
/// file was mapped when the row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStorage {
    /// Only in memory.
    InMemory,
    /// Persisted in a memory-mapped data file.
    DiskMapped(DiskKey),
    /// Persisted in a data file accessed with seek/read/write.
    DiskClassic(DiskKey),
}

impl RowStorage {
    /// Builds the disk variant matching the file mode.
    #[must_use]
    pub fn disk(key: DiskKey, mapped: bool) -> Self {
        if mapped {
            Self::DiskMapped(key)
        } else {
            Self::DiskClassic(key)
        }
    }

    /// Disk identity, if the row is persisted.
    #[must_use]
    pub fn key(&self) -> Option<DiskKey> {
        match self {
            Self::InMemory => None,
            Self::DiskMapped(key) | Self::DiskClassic(key) => Some(*key),
        }
    }

    /// Returns true for the disk variants.
    #[must_use]
    pub fn is_disk(&self) -> bool {
        !matches!(self, Self::InMemory)
    }
}

/// One element of one index's AVL tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) left: Option<NodeRef>,
    pub(crate) right: Option<NodeRef>,
    pub(crate) parent: Option<NodeRef>,
    /// Height of the right subtree minus height of the left subtree.
    pub(crate) balance: i8,
    pub(crate) row: RowRef,
    pub(crate) next: Option<NodeRef>,
}

impl Node {
    pub(crate) fn new(row: RowRef) -> Self {
        Self {
            left: None,
            right: None,
            parent: None,
            balance: 0,
            row,
            next: None,
        }
    }

    /// Left child.
    pub fn left(&self) -> Option<NodeRef> {
        self.left
    }

    /// Right child.
    pub fn right(&self) -> Option<NodeRef> {
        self.right
    }

    /// Parent, `None` for the root.
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent
    }

    /// Balance factor in {-1, 0, 1}.
    pub fn balance(&self) -> i8 {
        self.balance
    }

    /// The row this node belongs to.
    pub fn row(&self) -> RowRef {
        self.row
    }

    /// Node of the same row in the next index.
    pub fn next(&self) -> Option<NodeRef> {
        self.next
    }
}

/// A table row: storage identity plus the head of its node chain.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) first_node: Option<NodeRef>,
    pub(crate) storage: RowStorage,
    /// The persisted image no longer matches (links or data changed).
    pub(crate) changed: bool,
}

impl Row {
    /// Storage strategy of the row.
    pub fn storage(&self) -> RowStorage {
        self.storage
    }

    /// Disk identity, if the row is persisted.
    pub fn key(&self) -> Option<DiskKey> {
        self.storage.key()
    }

    /// Returns true if the persisted image is out of date.
    pub fn has_changed(&self) -> bool {
        self.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_variants() {
        let key = DiskKey::new(32, 0);
        assert_eq!(RowStorage::disk(key, true), RowStorage::DiskMapped(key));
        assert_eq!(RowStorage::disk(key, false), RowStorage::DiskClassic(key));
        assert_eq!(RowStorage::disk(key, false).key(), Some(key));
        assert!(RowStorage::InMemory.key().is_none());
        assert!(!RowStorage::InMemory.is_disk());
    }
}
