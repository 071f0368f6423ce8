//! AVL insertion, deletion and rebalancing.
//!
//! Balance factors are `height(right) - height(left)`. Both operations walk
//! from the point of change toward the root. Insertion stops as soon as a
//! subtree regains its previous height, which is always true after one
//! rotation. Deletion may need rotations all the way up.
//!
//! Deleting a node with two children swaps it with its in-order
//! predecessor by relinking the two nodes. Row payloads never move between
//! nodes, so a node keeps its identity (and its row's disk offset) for its
//! whole life.

use std::cmp::Ordering;

use ember_common::{EmberError, EmberResult};
use tracing::trace;

use super::Index;
use crate::row::{NodeRef, RowRef, RowStore};

impl Index {
    /// Links `row` into the tree.
    ///
    /// Fails with `UniqueIndexViolation` when the row collides with an
    /// existing row. The tree is unchanged on failure.
    pub fn insert(&mut self, store: &mut RowStore, row: RowRef) -> EmberResult<()> {
        let node = self.node_of(store, row)?;
        let options = *store.compare_options();

        let mut parent = None;
        let mut is_left = true;
        {
            let data = store.data(row)?;
            let mut n = self.root;
            while let Some(current) = n {
                parent = Some(current);
                let c = self.compare_row_for_insert(&data, &store.node_data(current)?, &options);
                if c == Ordering::Equal {
                    return Err(EmberError::UniqueIndexViolation {
                        index: self.name().to_string(),
                    });
                }
                is_left = c == Ordering::Less;
                n = store.child(current, is_left)?;
            }
        }

        store.reset_links(node)?;
        match parent {
            None => {
                self.root = Some(node);
                Ok(())
            }
            Some(x) => {
                self.set(store, x, is_left, Some(node))?;
                self.balance_after_insert(store, x, is_left)
            }
        }
    }

    /// Unlinks `row` from the tree and rebalances.
    pub fn delete(&mut self, store: &mut RowStore, row: RowRef) -> EmberResult<()> {
        let mut x = self.node_of(store, row)?;
        if store.parent(x)?.is_none() && self.root != Some(x) {
            return Err(EmberError::internal(format!(
                "index {}: deleting a node that is not linked",
                self.name()
            )));
        }

        let n = match (store.left(x)?, store.right(x)?) {
            (None, right) => right,
            (left, None) => left,
            (Some(left), Some(_)) => {
                let d = x;
                x = left;
                while let Some(r) = store.right(x)? {
                    x = r;
                }
                let n = store.left(x)?;
                self.swap_with_predecessor(store, d, x)?;

                store.set_left(d, n)?;
                if let Some(n) = n {
                    store.set_parent(n, Some(d))?;
                }
                store.set_right(d, None)?;
                x = d;
                n
            }
        };

        let mut is_left = self.is_from_left(store, x)?;
        self.replace(store, x, n)?;
        let mut n = store.parent(x)?;
        store.reset_links(x)?;

        while let Some(p) = n {
            let mut x = p;
            let sign: i8 = if is_left { 1 } else { -1 };
            match store.balance(x)? * sign {
                -1 => store.set_balance(x, 0)?,
                0 => {
                    store.set_balance(x, sign)?;
                    return Ok(());
                }
                1 => {
                    let r = self.child_required(store, x, !is_left)?;
                    let b = store.balance(r)?;
                    if b * sign >= 0 {
                        self.replace(store, x, Some(r))?;
                        let inner = store.child(r, is_left)?;
                        self.set(store, x, !is_left, inner)?;
                        self.set(store, r, is_left, Some(x))?;
                        if b == 0 {
                            store.set_balance(x, sign)?;
                            store.set_balance(r, -sign)?;
                            return Ok(());
                        }
                        store.set_balance(x, 0)?;
                        store.set_balance(r, 0)?;
                        x = r;
                    } else {
                        let l = self.child_required(store, r, is_left)?;
                        self.replace(store, x, Some(l))?;
                        let b = store.balance(l)?;
                        let inner = store.child(l, !is_left)?;
                        self.set(store, r, is_left, inner)?;
                        self.set(store, l, !is_left, Some(r))?;
                        let inner = store.child(l, is_left)?;
                        self.set(store, x, !is_left, inner)?;
                        self.set(store, l, is_left, Some(x))?;
                        store.set_balance(x, if b == sign { -sign } else { 0 })?;
                        store.set_balance(r, if b == -sign { sign } else { 0 })?;
                        store.set_balance(l, 0)?;
                        x = l;
                    }
                }
                other => return Err(self.bad_balance(other)),
            }
            is_left = self.is_from_left(store, x)?;
            n = store.parent(x)?;
        }
        Ok(())
    }

    /// Unlinks every node from the tree without touching the nodes.
    ///
    /// Used when a whole table is discarded or an index is rebuilt.
    pub(crate) fn clear(&mut self) {
        self.root = None;
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    fn balance_after_insert(
        &mut self,
        store: &mut RowStore,
        mut x: NodeRef,
        mut is_left: bool,
    ) -> EmberResult<()> {
        loop {
            let sign: i8 = if is_left { 1 } else { -1 };
            match store.balance(x)? * sign {
                1 => {
                    store.set_balance(x, 0)?;
                    return Ok(());
                }
                0 => store.set_balance(x, -sign)?,
                -1 => {
                    let l = self.child_required(store, x, is_left)?;
                    if store.balance(l)? == -sign {
                        trace!(index = self.name(), "single rotation");
                        self.replace(store, x, Some(l))?;
                        let inner = store.child(l, !is_left)?;
                        self.set(store, x, is_left, inner)?;
                        self.set(store, l, !is_left, Some(x))?;
                        store.set_balance(x, 0)?;
                        store.set_balance(l, 0)?;
                    } else {
                        trace!(index = self.name(), "double rotation");
                        let r = self.child_required(store, l, !is_left)?;
                        self.replace(store, x, Some(r))?;
                        let inner = store.child(r, is_left)?;
                        self.set(store, l, !is_left, inner)?;
                        self.set(store, r, is_left, Some(l))?;
                        let inner = store.child(r, !is_left)?;
                        self.set(store, x, is_left, inner)?;
                        self.set(store, r, !is_left, Some(x))?;
                        let rb = store.balance(r)?;
                        store.set_balance(x, if rb == -sign { sign } else { 0 })?;
                        store.set_balance(l, if rb == sign { -sign } else { 0 })?;
                        store.set_balance(r, 0)?;
                    }
                    return Ok(());
                }
                other => return Err(self.bad_balance(other)),
            }

            match store.parent(x)? {
                None => return Ok(()),
                Some(p) => {
                    is_left = store.left(p)? == Some(x);
                    x = p;
                }
            }
        }
    }

    /// Exchanges the tree positions of `d` and its predecessor `x`.
    ///
    /// Afterwards `x` sits where `d` was and `d` sits where `x` was, with
    /// the balance factors exchanged to match the positions.
    fn swap_with_predecessor(
        &mut self,
        store: &mut RowStore,
        d: NodeRef,
        x: NodeRef,
    ) -> EmberResult<()> {
        let b = store.balance(x)?;
        store.set_balance(x, store.balance(d)?)?;
        store.set_balance(d, b)?;

        let xp = store
            .parent(x)?
            .ok_or_else(|| self.corrupt("predecessor without parent"))?;
        let dp = store.parent(d)?;
        if dp.is_none() {
            self.root = Some(x);
        }
        store.set_parent(x, dp)?;
        if let Some(dp) = dp {
            if store.right(dp)? == Some(d) {
                store.set_right(dp, Some(x))?;
            } else {
                store.set_left(dp, Some(x))?;
            }
        }

        if xp == d {
            // x was the left child of d
            store.set_parent(d, Some(x))?;
            let dr = store.right(d)?;
            store.set_left(x, Some(d))?;
            store.set_right(x, dr)?;
        } else {
            store.set_parent(d, Some(xp))?;
            store.set_right(xp, Some(d))?;
            let dl = store.left(d)?;
            let dr = store.right(d)?;
            store.set_left(x, dl)?;
            store.set_right(x, dr)?;
        }

        let xl = self.child_required(store, x, true)?;
        let xr = self.child_required(store, x, false)?;
        store.set_parent(xl, Some(x))?;
        store.set_parent(xr, Some(x))?;
        Ok(())
    }

    // =========================================================================
    // Link helpers
    // =========================================================================

    /// Sets a child of `x` and points the child back at `x`.
    fn set(
        &self,
        store: &mut RowStore,
        x: NodeRef,
        is_left: bool,
        n: Option<NodeRef>,
    ) -> EmberResult<()> {
        store.set_child(x, is_left, n)?;
        if let Some(n) = n {
            store.set_parent(n, Some(x))?;
        }
        Ok(())
    }

    /// Puts `n` in the place `x` occupies under its parent, or at the root.
    fn replace(&mut self, store: &mut RowStore, x: NodeRef, n: Option<NodeRef>) -> EmberResult<()> {
        match store.parent(x)? {
            None => {
                if let Some(n) = n {
                    store.set_parent(n, None)?;
                }
                self.root = n;
                Ok(())
            }
            Some(p) => {
                let is_left = store.left(p)? == Some(x);
                self.set(store, p, is_left, n)
            }
        }
    }

    /// Root counts as a left child.
    fn is_from_left(&self, store: &RowStore, x: NodeRef) -> EmberResult<bool> {
        match store.parent(x)? {
            None => Ok(true),
            Some(p) => Ok(store.left(p)? == Some(x)),
        }
    }

    fn child_required(&self, store: &RowStore, x: NodeRef, is_left: bool) -> EmberResult<NodeRef> {
        store
            .child(x, is_left)?
            .ok_or_else(|| self.corrupt("missing child during rebalance"))
    }

    fn corrupt(&self, what: &str) -> EmberError {
        EmberError::internal(format!("index {}: {}", self.name(), what))
    }

    fn bad_balance(&self, balance: i8) -> EmberError {
        self.corrupt(&format!("balance factor {} out of range", balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDef;
    use crate::row::RowStorage;
    use ember_common::{CompareOptions, DataType, Value};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn unique_index() -> Index {
        Index::new(
            IndexDef::new("PK", vec![0]).unique(true),
            vec![0],
            vec![DataType::Integer],
            0,
        )
    }

    fn keys(index: &Index, store: &RowStore) -> Vec<i32> {
        index
            .first_row(store)
            .map(|r| match store.data(r.unwrap()).unwrap()[0] {
                Value::Integer(v) => v,
                _ => unreachable!(),
            })
            .collect()
    }

    fn add(index: &mut Index, store: &mut RowStore, key: i32) -> EmberResult<RowRef> {
        let row = store.insert_row(vec![Value::Integer(key)], 1, RowStorage::InMemory)?;
        index.insert(store, row).map(|_| row)
    }

    #[test]
    fn test_insert_keeps_order_and_balance() {
        let mut store = RowStore::new(CompareOptions::default());
        let mut index = unique_index();
        let mut inserted = Vec::new();
        for key in [5, 3, 8, 1, 4] {
            add(&mut index, &mut store, key).unwrap();
            inserted.push(key);
            inserted.sort_unstable();
            index.check_balanced(&store).unwrap();
            assert_eq!(keys(&index, &store), inserted);
        }
    }

    #[test]
    fn test_delete_with_two_children() {
        let mut store = RowStore::new(CompareOptions::default());
        let mut index = unique_index();
        let mut three = None;
        for key in [5, 3, 8, 1, 4] {
            let row = add(&mut index, &mut store, key).unwrap();
            if key == 3 {
                three = Some(row);
            }
        }
        index.delete(&mut store, three.unwrap()).unwrap();
        index.check_balanced(&store).unwrap();
        assert_eq!(keys(&index, &store), vec![1, 4, 5, 8]);
    }

    #[test]
    fn test_duplicate_rejected_without_change() {
        let mut store = RowStore::new(CompareOptions::default());
        let mut index = unique_index();
        for key in [2, 1, 3] {
            add(&mut index, &mut store, key).unwrap();
        }
        let err = add(&mut index, &mut store, 3).unwrap_err();
        assert!(matches!(err, EmberError::UniqueIndexViolation { .. }));
        assert_eq!(keys(&index, &store), vec![1, 2, 3]);
    }

    #[test]
    fn test_delete_root_until_empty() {
        let mut store = RowStore::new(CompareOptions::default());
        let mut index = unique_index();
        let rows: Vec<_> = (0..7).map(|k| add(&mut index, &mut store, k).unwrap()).collect();
        for row in rows {
            index.delete(&mut store, row).unwrap();
            index.check_balanced(&store).unwrap();
        }
        assert!(index.is_empty());
    }

    #[test]
    fn test_random_insert_delete() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut store = RowStore::new(CompareOptions::default());
        let mut index = unique_index();

        let mut order: Vec<i32> = (0..500).collect();
        order.shuffle(&mut rng);
        let mut rows = Vec::new();
        for key in &order {
            rows.push((*key, add(&mut index, &mut store, *key).unwrap()));
        }
        index.check_balanced(&store).unwrap();

        rows.shuffle(&mut rng);
        let (gone, kept) = rows.split_at(250);
        for (_, row) in gone {
            index.delete(&mut store, *row).unwrap();
            index.check_balanced(&store).unwrap();
        }
        let mut expected: Vec<i32> = kept.iter().map(|(k, _)| *k).collect();
        expected.sort_unstable();
        assert_eq!(keys(&index, &store), expected);
        assert_eq!(index.size(&store).unwrap(), 250);
    }

    #[test]
    fn test_delete_unlinked_node_is_internal_error() {
        let mut store = RowStore::new(CompareOptions::default());
        let mut index = unique_index();
        add(&mut index, &mut store, 1).unwrap();
        let loose = store
            .insert_row(vec![Value::Integer(2)], 1, RowStorage::InMemory)
            .unwrap();
        let err = index.delete(&mut store, loose).unwrap_err();
        assert!(err.is_fatal());
    }
}
