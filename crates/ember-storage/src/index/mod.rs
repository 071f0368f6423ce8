//! Ordered AVL indexes over table rows.
//!
//! An [`Index`] is an AVL tree whose elements are the nodes a row carries
//! for that index. The tree itself only stores a root handle; every link
//! lives in the [`RowStore`] arena, so all structural operations take the
//! store explicitly.
//!
//! # Key layout
//!
//! ```text
//!   columns:  [ c0 c1 .. c(v-1) | p0 p1 .. ]
//!               visible prefix    primary key suffix
//! ```
//!
//! Non-primary indexes append the primary key columns they do not already
//! contain. The suffix makes every key distinct, which keeps equal visible
//! keys adjacent while still giving each row a unique place in the tree.
//! A primary index over a hidden row id has no visible columns at all.
//!
//! # Modules
//!
//! - `avl`: insert, delete and rebalancing
//! - `search`: lookups, in-order traversal and cursors

mod avl;
mod search;

use std::cmp::Ordering;
use std::fmt;

use ember_common::{CompareOptions, DataType, EmberResult, Value};

use crate::row::{NodeRef, RowRef, RowStore};

pub use search::{IndexIter, SeekKind};

/// Declared shape of an index before it is attached to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Index name, unique within the database.
    pub name: String,
    /// Declared (visible) column positions.
    pub columns: Vec<usize>,
    /// Unique index.
    pub unique: bool,
    /// Created to back a constraint.
    pub constraint: bool,
    /// Backs a foreign key that references a table created later.
    pub forward: bool,
}

impl IndexDef {
    /// A user index over `columns`.
    pub fn new(name: impl Into<String>, columns: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
            constraint: false,
            forward: false,
        }
    }

    /// Marks the index unique.
    #[must_use]
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Marks the index as backing a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: bool) -> Self {
        self.constraint = constraint;
        self
    }

    /// Marks the index as backing a forward foreign key.
    #[must_use]
    pub fn forward(mut self, forward: bool) -> Self {
        self.forward = forward;
        self
    }

    /// Position class within a table's index list. Lower sorts first.
    pub fn order_value(&self) -> u8 {
        if self.constraint {
            if self.forward {
                4
            } else if self.unique {
                0
            } else {
                1
            }
        } else {
            2
        }
    }
}

/// An AVL tree over a fixed tuple of row columns.
#[derive(Debug, Clone)]
pub struct Index {
    def: IndexDef,
    /// Visible columns followed by the primary key suffix.
    columns: Vec<usize>,
    types: Vec<DataType>,
    visible: usize,
    /// Ordinal of this index's node in every row chain.
    position: usize,
    root: Option<NodeRef>,
}

impl Index {
    /// Creates an empty index.
    ///
    /// `columns` is the full key (visible prefix plus suffix) and `types`
    /// holds the column type for each entry of `columns`.
    pub fn new(def: IndexDef, columns: Vec<usize>, types: Vec<DataType>, position: usize) -> Self {
        let visible = def.columns.len();
        debug_assert_eq!(columns.len(), types.len());
        debug_assert!(visible <= columns.len());
        Self {
            def,
            columns,
            types,
            visible,
            position,
            root: None,
        }
    }

    /// Index name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// The definition this index was created from.
    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    /// Full key column positions, suffix included.
    #[inline]
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Declared column positions.
    #[inline]
    pub fn visible_columns(&self) -> &[usize] {
        &self.columns[..self.visible]
    }

    /// Number of declared columns.
    #[inline]
    pub fn visible_count(&self) -> usize {
        self.visible
    }

    /// Column types, suffix included.
    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    /// Returns true for a unique index.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.def.unique
    }

    /// Returns true if the index was created for a constraint.
    pub fn is_constraint(&self) -> bool {
        self.def.constraint
    }

    /// Returns true for a forward foreign key index.
    pub fn is_forward(&self) -> bool {
        self.def.forward
    }

    /// Returns true when the visible columns are the whole key.
    #[inline]
    pub fn is_exact(&self) -> bool {
        self.visible == self.columns.len()
    }

    /// Ordinal of this index in the table and in every node chain.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Root node, `None` when empty.
    #[inline]
    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    /// Installs a root, used when a tree is rebuilt from disk.
    pub(crate) fn set_root(&mut self, root: Option<NodeRef>) {
        self.root = root;
    }

    /// Returns true if the index holds no rows.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The node of `row` in this index.
    #[inline]
    pub fn node_of(&self, store: &RowStore, row: RowRef) -> EmberResult<NodeRef> {
        store.node_at(row, self.position)
    }

    // =========================================================================
    // Comparators
    // =========================================================================

    /// Orders a new row against an existing row for insertion.
    ///
    /// Returns `Equal` when the rows collide: the whole key matches, or the
    /// index is unique and the visible key matches without nulls.
    pub fn compare_row_for_insert(
        &self,
        new_row: &[Value],
        existing: &[Value],
        options: &CompareOptions,
    ) -> Ordering {
        let mut has_null = false;
        for &col in &self.columns[..self.visible] {
            let value = &new_row[col];
            let c = value.compare(&existing[col], options);
            if c != Ordering::Equal {
                return c;
            }
            if value.is_null() {
                has_null = true;
            }
        }

        if self.is_exact() || (self.def.unique && self.visible > 0 && !has_null) {
            return Ordering::Equal;
        }

        for &col in &self.columns[self.visible..] {
            let c = new_row[col].compare(&existing[col], options);
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    }

    /// Compares a probe against the visible key of `row`.
    ///
    /// `col_map[j]` names the probe field matched against visible column `j`.
    /// Only the columns covered by both are compared.
    pub fn compare_row_non_unique(
        &self,
        data: &[Value],
        col_map: &[usize],
        row: &[Value],
        options: &CompareOptions,
    ) -> Ordering {
        let n = col_map.len().min(self.visible);
        for j in 0..n {
            let c = data[col_map[j]].compare(&row[self.columns[j]], options);
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    }

    /// Compares a single value against the head column of `row`.
    pub fn compare_head(&self, value: &Value, row: &[Value], options: &CompareOptions) -> Ordering {
        match self.columns.first() {
            Some(&col) => value.compare(&row[col], options),
            None => Ordering::Equal,
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.def.name)?;
        for (i, col) in self.visible_columns().iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", col)?;
        }
        write!(f, ")")?;
        if self.def.unique {
            write!(f, " UNIQUE")?;
        }
        Ok(())
    }
}
