//! Lookups and in-order traversal.

use std::cmp::Ordering;

use ember_common::{EmberError, EmberResult, Value};

use super::Index;
use crate::row::{NodeRef, RowRef, RowStore};

/// Range predicate for [`Index::find_first`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekKind {
    /// First row whose head column equals the value.
    Equal,
    /// First row whose head column is greater than the value.
    Greater,
    /// First row whose head column is greater than or equal to the value.
    GreaterEqual,
}

impl Index {
    // =========================================================================
    // Traversal
    // =========================================================================

    /// Leftmost node.
    pub fn first(&self, store: &RowStore) -> EmberResult<Option<NodeRef>> {
        match self.root {
            None => Ok(None),
            Some(root) => leftmost(store, root).map(Some),
        }
    }

    /// Rightmost node.
    pub fn last(&self, store: &RowStore) -> EmberResult<Option<NodeRef>> {
        let mut x = match self.root {
            None => return Ok(None),
            Some(root) => root,
        };
        while let Some(r) = store.right(x)? {
            x = r;
        }
        Ok(Some(x))
    }

    /// In-order successor of `node`.
    pub fn next(&self, store: &RowStore, node: NodeRef) -> EmberResult<Option<NodeRef>> {
        if let Some(r) = store.right(node)? {
            return leftmost(store, r).map(Some);
        }
        let mut x = node;
        let mut p = store.parent(x)?;
        while let Some(parent) = p {
            if store.right(parent)? != Some(x) {
                break;
            }
            x = parent;
            p = store.parent(x)?;
        }
        Ok(p)
    }

    /// Iterates over all rows in index order.
    pub fn first_row<'a>(&'a self, store: &'a RowStore) -> IndexIter<'a> {
        match self.first(store) {
            Ok(start) => IndexIter::new(self, store, start),
            Err(e) => IndexIter::failed(self, store, e),
        }
    }

    /// Iterates from `start` (inclusive) in index order.
    pub fn iter_from<'a>(&'a self, store: &'a RowStore, start: Option<NodeRef>) -> IndexIter<'a> {
        IndexIter::new(self, store, start)
    }

    /// Number of rows, counted by traversal.
    pub fn size(&self, store: &RowStore) -> EmberResult<usize> {
        let mut count = 0;
        for row in self.first_row(store) {
            row?;
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // Seeks
    // =========================================================================

    /// First node whose head column satisfies `kind` against `value`.
    pub fn find_first(
        &self,
        store: &RowStore,
        value: &Value,
        kind: SeekKind,
    ) -> EmberResult<Option<NodeRef>> {
        let options = *store.compare_options();
        let found = self.leftmost_where(store, |row| {
            let c = self.compare_head(value, row, &options);
            match kind {
                SeekKind::Greater => c == Ordering::Less,
                SeekKind::Equal | SeekKind::GreaterEqual => c != Ordering::Greater,
            }
        })?;

        if kind == SeekKind::Equal {
            if let Some(node) = found {
                let row = store.node_data(node)?;
                if self.compare_head(value, &row, &options) != Ordering::Equal {
                    return Ok(None);
                }
            }
        }
        Ok(found)
    }

    /// First node whose head column is not null.
    pub fn find_first_not_null(&self, store: &RowStore) -> EmberResult<Option<NodeRef>> {
        let head = match self.columns.first() {
            Some(&col) => col,
            None => return self.first(store),
        };
        self.leftmost_where(store, |row| !row[head].is_null())
    }

    /// Leftmost node whose visible key equals the probe.
    ///
    /// Returns `None` when any probe key column is null, since a null key
    /// never matches.
    pub fn find_not_null(
        &self,
        store: &RowStore,
        data: &[Value],
        col_map: &[usize],
    ) -> EmberResult<Option<NodeRef>> {
        let n = col_map.len().min(self.visible);
        if col_map[..n].iter().any(|&c| data[c].is_null()) {
            return Ok(None);
        }

        let options = *store.compare_options();
        let mut x = self.root;
        let mut found = None;
        while let Some(current) = x {
            let c = self.compare_row_non_unique(data, col_map, &store.node_data(current)?, &options);
            match c {
                Ordering::Equal => {
                    found = Some(current);
                    x = store.left(current)?;
                }
                Ordering::Less => x = store.left(current)?,
                Ordering::Greater => x = store.right(current)?,
            }
        }
        Ok(found)
    }

    /// All rows whose visible key equals the probe, in index order.
    pub fn find_rows(
        &self,
        store: &RowStore,
        data: &[Value],
        col_map: &[usize],
    ) -> EmberResult<Vec<RowRef>> {
        let options = *store.compare_options();
        let mut rows = Vec::new();
        let mut node = self.find_not_null(store, data, col_map)?;
        while let Some(n) = node {
            let row = store.row_of(n)?;
            if self.compare_row_non_unique(data, col_map, &store.data(row)?, &options)
                != Ordering::Equal
            {
                break;
            }
            rows.push(row);
            node = self.next(store, n)?;
        }
        Ok(rows)
    }

    /// Leftmost node for which `pred` holds, given that `pred` is false on
    /// a prefix of the in-order sequence and true on the rest.
    fn leftmost_where<F>(&self, store: &RowStore, pred: F) -> EmberResult<Option<NodeRef>>
    where
        F: Fn(&[Value]) -> bool,
    {
        let mut x = self.root;
        let mut found = None;
        while let Some(current) = x {
            if pred(&store.node_data(current)?) {
                found = Some(current);
                x = store.left(current)?;
            } else {
                x = store.right(current)?;
            }
        }
        Ok(found)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Verifies parent links, balance factors and key order.
    ///
    /// Returns the tree height. Any violation is an internal error.
    pub fn check_balanced(&self, store: &RowStore) -> EmberResult<usize> {
        let root = match self.root {
            None => return Ok(0),
            Some(root) => root,
        };
        if store.parent(root)?.is_some() {
            return Err(self.invariant("root has a parent"));
        }
        let height = self.check_subtree(store, root)?;

        let options = *store.compare_options();
        let mut prev: Option<RowRef> = None;
        for row in self.first_row(store) {
            let row = row?;
            if let Some(p) = prev {
                let c = self.compare_row_for_insert(&store.data(p)?, &store.data(row)?, &options);
                if c == Ordering::Greater || (c == Ordering::Equal && self.is_unique()) {
                    return Err(self.invariant("keys out of order"));
                }
            }
            prev = Some(row);
        }
        Ok(height)
    }

    fn check_subtree(&self, store: &RowStore, node: NodeRef) -> EmberResult<usize> {
        let mut heights = [0usize; 2];
        for (slot, child) in [store.left(node)?, store.right(node)?].into_iter().enumerate() {
            if let Some(c) = child {
                if store.parent(c)? != Some(node) {
                    return Err(self.invariant("child does not point back at its parent"));
                }
                heights[slot] = self.check_subtree(store, c)?;
            }
        }
        let actual = heights[1] as i64 - heights[0] as i64;
        if actual.abs() > 1 || actual != i64::from(store.balance(node)?) {
            return Err(self.invariant("balance factor does not match subtree heights"));
        }
        Ok(1 + heights[0].max(heights[1]))
    }

    fn invariant(&self, what: &str) -> EmberError {
        EmberError::internal(format!("index {}: {}", self.name(), what))
    }
}

fn leftmost(store: &RowStore, mut x: NodeRef) -> EmberResult<NodeRef> {
    while let Some(l) = store.left(x)? {
        x = l;
    }
    Ok(x)
}

/// Forward, in-order iterator over the rows of an index.
///
/// The iterator is lazy and finite. Once consumed it stays exhausted; call
/// [`Index::first_row`] again to restart.
pub struct IndexIter<'a> {
    index: &'a Index,
    store: &'a RowStore,
    next: Option<NodeRef>,
    error: Option<EmberError>,
}

impl<'a> IndexIter<'a> {
    fn new(index: &'a Index, store: &'a RowStore, start: Option<NodeRef>) -> Self {
        Self {
            index,
            store,
            next: start,
            error: None,
        }
    }

    fn failed(index: &'a Index, store: &'a RowStore, error: EmberError) -> Self {
        Self {
            index,
            store,
            next: None,
            error: Some(error),
        }
    }
}

impl Iterator for IndexIter<'_> {
    type Item = EmberResult<RowRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }
        let node = self.next?;
        let row = match self.store.row_of(node) {
            Ok(row) => row,
            Err(e) => {
                self.next = None;
                return Some(Err(e));
            }
        };
        match self.index.next(self.store, node) {
            Ok(next) => self.next = next,
            Err(e) => {
                self.next = None;
                self.error = Some(e);
            }
        }
        Some(Ok(row))
    }
}
