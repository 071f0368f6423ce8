//! Core identifier types for the ember storage core.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Table identifier - the slot a table occupies in the database registry.
///
/// A table keeps its id when it is rebuilt by a column add/drop, so
/// constraints that name a table by id stay valid across the rebuild.
///
/// # Example
///
/// ```rust
/// use ember_common::types::TableId;
///
/// let table = TableId::new(3);
/// assert_eq!(table.as_u32(), 3);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    /// Invalid table ID constant, used as a sentinel value.
    pub const INVALID: Self = Self(u32::MAX);

    /// Creates a new `TableId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the registry slot as a `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Checks if this is a valid table ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TableId(INVALID)")
        } else {
            write!(f, "TableId({})", self.0)
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TableId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Constraint identifier - unique across the whole database.
///
/// The two halves of a foreign key (the referencing side and the
/// referenced "main" side) get distinct ids. Cascade recursion records the
/// ids it has entered in a visited set to stop on cyclic key graphs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConstraintId(u32);

impl ConstraintId {
    /// Creates a new `ConstraintId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next constraint ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Debug for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConstraintId({})", self.0)
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier, as handed out by the session layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new `SessionId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Compiled statement identifier.
///
/// Ids are allocated monotonically by the statement cache and never reused
/// while the cache lives.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StatementId(u32);

impl StatementId {
    /// Creates a new `StatementId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next statement ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatementId({})", self.0)
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StatementId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Identity of a disk-resident row: its byte offset in the data file plus
/// the file generation the offset belongs to.
///
/// The generation changes whenever the file is rewritten with remapped
/// offsets (defragmentation), so a key taken before a rewrite never
/// matches a row placed at the same offset afterwards.
///
/// # Example
///
/// ```rust
/// use ember_common::types::DiskKey;
///
/// let key = DiskKey::new(32, 0);
/// assert_ne!(key, key.regenerate(32));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskKey {
    offset: u64,
    generation: u32,
}

impl DiskKey {
    /// Creates a key for `offset` in file generation `generation`.
    #[inline]
    #[must_use]
    pub const fn new(offset: u64, generation: u32) -> Self {
        Self { offset, generation }
    }

    /// Byte offset of the row record.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// File generation the offset is valid in.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Returns the key for the same row after it moved to `new_offset` in
    /// the next file generation.
    #[inline]
    #[must_use]
    pub const fn regenerate(self, new_offset: u64) -> Self {
        Self {
            offset: new_offset,
            generation: self.generation.wrapping_add(1),
        }
    }
}

impl fmt::Debug for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiskKey({}@{})", self.offset, self.generation)
    }
}

impl fmt::Display for DiskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.offset, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_id() {
        let id = TableId::new(7);
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.as_usize(), 7);
        assert!(id.is_valid());
        assert!(!TableId::INVALID.is_valid());
        assert_eq!(format!("{:?}", TableId::INVALID), "TableId(INVALID)");
    }

    #[test]
    fn test_statement_id_next() {
        let id = StatementId::new(1);
        assert_eq!(id.next(), StatementId::new(2));
        assert_eq!(id.to_string(), "1");
    }

    #[test]
    fn test_disk_key_generation() {
        let key = DiskKey::new(64, 3);
        let moved = key.regenerate(32);
        assert_eq!(moved.offset(), 32);
        assert_eq!(moved.generation(), 4);

        let same_offset = key.regenerate(64);
        assert_ne!(key, same_offset);
        assert_eq!(format!("{}", key), "64@3");
    }

    #[test]
    fn test_ordering() {
        assert!(ConstraintId::new(1) < ConstraintId::new(2));
        assert!(DiskKey::new(10, 0) < DiskKey::new(20, 0));
        assert!(SessionId::new(1) < SessionId::new(9));
    }
}
