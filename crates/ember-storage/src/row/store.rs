//! Arena storage for the rows and nodes of one table.
//!
//! Rows and nodes always stay in the arenas, so handles remain valid for
//! the life of a row. Field values are kept separately in a resident set.
//! For disk tables that set is bounded: saved rows are evicted least
//! recently used first and read back from the data file by their
//! [`DiskKey`] when next needed.

use std::collections::HashMap;
use std::sync::Arc;

use ember_common::memory::Arena;
use ember_common::{CompareOptions, DataType, DiskKey, EmberError, EmberResult, Value};
use parking_lot::Mutex;
use tracing::trace;

use super::{Node, NodeRef, Row, RowData, RowRef, RowStorage};
use crate::cache::DataFileCache;

/// Reads evicted field values back from a data file.
pub struct RowLoader {
    cache: Arc<Mutex<DataFileCache>>,
    types: Vec<DataType>,
    capacity: usize,
}

impl RowLoader {
    /// Loader over `cache` for rows of `types`, keeping at most `capacity`
    /// saved rows in core.
    pub fn new(cache: Arc<Mutex<DataFileCache>>, types: Vec<DataType>, capacity: usize) -> Self {
        Self {
            cache,
            types,
            capacity,
        }
    }
}

/// Counters of the resident set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidentStats {
    /// Rows whose field values are in core.
    pub resident: usize,
    /// Field values read back from the data file.
    pub loads: u64,
    /// Field values dropped from core.
    pub evictions: u64,
}

struct Resident {
    data: RowData,
    stamp: u64,
}

#[derive(Default)]
struct ResidentRows {
    rows: HashMap<RowRef, Resident>,
    clock: u64,
    loads: u64,
    evictions: u64,
}

impl ResidentRows {
    fn put(&mut self, row: RowRef, data: RowData) {
        self.clock += 1;
        let stamp = self.clock;
        self.rows.insert(row, Resident { data, stamp });
    }
}

/// Owns every row and node of one table.
///
/// Link setters mark the owning row as changed so that disk tables know
/// which records must be rewritten. Changed rows are never evicted.
pub struct RowStore {
    rows: Arena<Row>,
    nodes: Arena<Node>,
    compare: CompareOptions,
    /// Rows changed since the last [`take_changed`](Self::take_changed).
    dirty: Vec<RowRef>,
    track_changes: bool,
    /// Nodes per row.
    chain_len: usize,
    resident: Mutex<ResidentRows>,
    loader: Option<RowLoader>,
}

impl RowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(compare: CompareOptions) -> Self {
        Self {
            rows: Arena::new(),
            nodes: Arena::new(),
            compare,
            dirty: Vec::new(),
            track_changes: false,
            chain_len: 0,
            resident: Mutex::new(ResidentRows::default()),
            loader: None,
        }
    }

    /// Bounds the resident set and reloads evicted rows through `loader`.
    #[must_use]
    pub fn with_loader(mut self, loader: RowLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Enables the changed-row list used by disk tables.
    #[must_use]
    pub fn with_change_tracking(mut self, enabled: bool) -> Self {
        self.track_changes = enabled;
        self
    }

    /// Comparison options used by every index over this store.
    #[inline]
    pub fn compare_options(&self) -> &CompareOptions {
        &self.compare
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Creates a row with a chain of `node_count` unlinked nodes.
    ///
    /// Fails with `OutOfMemory` if the arenas cannot grow.
    pub fn insert_row(
        &mut self,
        data: Vec<Value>,
        node_count: usize,
        storage: RowStorage,
    ) -> EmberResult<RowRef> {
        if !self.rows.try_reserve(1) || !self.nodes.try_reserve(node_count) {
            return Err(EmberError::OutOfMemory {
                message: "row arena".to_string(),
            });
        }

        let row = self.rows.insert(Row {
            first_node: None,
            storage,
            changed: true,
        });
        self.chain_len = node_count;
        self.resident.get_mut().put(row, data.into());

        let mut next = None;
        for _ in 0..node_count {
            let mut node = Node::new(row);
            node.next = next;
            next = Some(self.nodes.insert(node));
        }
        if let Some(r) = self.rows.get_mut(row) {
            r.first_node = next;
        }
        if self.track_changes {
            self.dirty.push(row);
        }
        Ok(row)
    }

    /// Removes a row and severs its node chain.
    ///
    /// The nodes must already be unlinked from their trees.
    pub fn remove_row(&mut self, row: RowRef) -> Option<Row> {
        let removed = self.rows.remove(row)?;
        self.resident.get_mut().rows.remove(&row);
        let mut node = removed.first_node;
        while let Some(n) = node {
            node = self.nodes.remove(n).and_then(|n| n.next);
        }
        Some(removed)
    }

    /// Returns true while `row` is live.
    #[inline]
    pub fn contains(&self, row: RowRef) -> bool {
        self.rows.contains(row)
    }

    /// Returns the row behind `row`.
    pub fn row(&self, row: RowRef) -> EmberResult<&Row> {
        self.rows
            .get(row)
            .ok_or_else(|| EmberError::internal(format!("dangling row handle {:?}", row)))
    }

    /// Returns the row behind `row` mutably.
    pub fn row_mut(&mut self, row: RowRef) -> EmberResult<&mut Row> {
        self.rows
            .get_mut(row)
            .ok_or_else(|| EmberError::internal(format!("dangling row handle {:?}", row)))
    }

    /// Field values of `row`, read back from the data file if evicted.
    pub fn data(&self, row: RowRef) -> EmberResult<RowData> {
        {
            let mut resident = self.resident.lock();
            resident.clock += 1;
            let clock = resident.clock;
            if let Some(r) = resident.rows.get_mut(&row) {
                r.stamp = clock;
                return Ok(Arc::clone(&r.data));
            }
        }

        let data = self.load(row)?;
        let mut resident = self.resident.lock();
        resident.loads += 1;
        resident.put(row, Arc::clone(&data));
        self.evict(&mut resident);
        Ok(data)
    }

    fn load(&self, row: RowRef) -> EmberResult<RowData> {
        let key = self
            .row(row)?
            .key()
            .ok_or_else(|| EmberError::internal(format!("row {:?} has no field values", row)))?;
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| EmberError::internal(format!("row {:?} was evicted without a loader", row)))?;

        let mut cache = loader.cache.lock();
        if key.generation() != cache.generation() {
            return Err(EmberError::corruption(format!(
                "row key {:?} is stale, data file is at generation {}",
                key,
                cache.generation()
            )));
        }
        let image = cache.read_row(key.offset(), self.chain_len, &loader.types)?;
        Ok(image.data.into())
    }

    /// Drops the least recently used saved rows once the resident set
    /// exceeds the loader's capacity, down to half of it.
    fn evict(&self, resident: &mut ResidentRows) {
        let Some(loader) = &self.loader else {
            return;
        };
        if resident.rows.len() <= loader.capacity {
            return;
        }
        let mut candidates: Vec<(u64, RowRef)> = resident
            .rows
            .iter()
            .filter(|(row, _)| self.rows.get(**row).map_or(true, |r| !r.changed))
            .map(|(row, r)| (r.stamp, *row))
            .collect();
        candidates.sort_unstable_by_key(|(stamp, _)| *stamp);

        let target = loader.capacity / 2;
        let mut evicted = 0u64;
        for (_, row) in candidates {
            if resident.rows.len() <= target {
                break;
            }
            resident.rows.remove(&row);
            evicted += 1;
        }
        resident.evictions += evicted;
        trace!(evicted, resident = resident.rows.len(), "evicted rows");
    }

    /// Applies the resident bound, for use after rows were saved.
    pub fn trim(&self) {
        let mut resident = self.resident.lock();
        self.evict(&mut resident);
    }

    /// Resident set counters.
    pub fn resident_stats(&self) -> ResidentStats {
        let resident = self.resident.lock();
        ResidentStats {
            resident: resident.rows.len(),
            loads: resident.loads,
            evictions: resident.evictions,
        }
    }

    /// Iterates over live rows in arena order.
    pub fn rows(&self) -> impl Iterator<Item = (RowRef, &Row)> {
        self.rows.iter()
    }

    /// Returns the node behind `node`.
    #[inline]
    pub fn node(&self, node: NodeRef) -> EmberResult<&Node> {
        self.nodes
            .get(node)
            .ok_or_else(|| EmberError::internal(format!("dangling node handle {:?}", node)))
    }

    fn node_mut(&mut self, node: NodeRef) -> EmberResult<&mut Node> {
        let n = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| EmberError::internal(format!("dangling node handle {:?}", node)))?;
        let row = n.row;
        self.touch(row);
        self.nodes
            .get_mut(node)
            .ok_or_else(|| EmberError::internal("node vanished"))
    }

    /// Marks `row` as out of date with its persisted image.
    fn touch(&mut self, row: RowRef) {
        if let Some(r) = self.rows.get_mut(row) {
            if !r.changed && self.track_changes {
                self.dirty.push(row);
            }
            r.changed = true;
        }
    }

    /// Node of `row` for the index at `position`. Walks the chain.
    pub fn node_at(&self, row: RowRef, position: usize) -> EmberResult<NodeRef> {
        let mut node = self.row(row)?.first_node;
        for _ in 0..position {
            node = match node {
                Some(n) => self.node(n)?.next,
                None => None,
            };
        }
        node.ok_or_else(|| {
            EmberError::internal(format!("row {:?} has no node at position {}", row, position))
        })
    }

    /// Row that owns `node`.
    #[inline]
    pub fn row_of(&self, node: NodeRef) -> EmberResult<RowRef> {
        self.node(node).map(|n| n.row)
    }

    /// Field values of the row that owns `node`.
    #[inline]
    pub fn node_data(&self, node: NodeRef) -> EmberResult<RowData> {
        self.data(self.row_of(node)?)
    }

    // ==========================================================================
    // Tree links
    // ==========================================================================

    /// Left child of `node`.
    #[inline]
    pub fn left(&self, node: NodeRef) -> EmberResult<Option<NodeRef>> {
        self.node(node).map(|n| n.left)
    }

    /// Right child of `node`.
    #[inline]
    pub fn right(&self, node: NodeRef) -> EmberResult<Option<NodeRef>> {
        self.node(node).map(|n| n.right)
    }

    /// Parent of `node`.
    #[inline]
    pub fn parent(&self, node: NodeRef) -> EmberResult<Option<NodeRef>> {
        self.node(node).map(|n| n.parent)
    }

    /// Balance factor of `node`.
    #[inline]
    pub fn balance(&self, node: NodeRef) -> EmberResult<i8> {
        self.node(node).map(|n| n.balance)
    }

    /// Child on the given side.
    #[inline]
    pub fn child(&self, node: NodeRef, left: bool) -> EmberResult<Option<NodeRef>> {
        if left {
            self.left(node)
        } else {
            self.right(node)
        }
    }

    /// Sets the left child.
    pub fn set_left(&mut self, node: NodeRef, child: Option<NodeRef>) -> EmberResult<()> {
        self.node_mut(node)?.left = child;
        Ok(())
    }

    /// Sets the right child.
    pub fn set_right(&mut self, node: NodeRef, child: Option<NodeRef>) -> EmberResult<()> {
        self.node_mut(node)?.right = child;
        Ok(())
    }

    /// Sets the child on the given side.
    pub fn set_child(
        &mut self,
        node: NodeRef,
        left: bool,
        child: Option<NodeRef>,
    ) -> EmberResult<()> {
        if left {
            self.set_left(node, child)
        } else {
            self.set_right(node, child)
        }
    }

    /// Sets the parent link.
    pub fn set_parent(&mut self, node: NodeRef, parent: Option<NodeRef>) -> EmberResult<()> {
        self.node_mut(node)?.parent = parent;
        Ok(())
    }

    /// Sets the balance factor.
    pub fn set_balance(&mut self, node: NodeRef, balance: i8) -> EmberResult<()> {
        self.node_mut(node)?.balance = balance;
        Ok(())
    }

    /// Clears all tree links of `node`.
    pub fn reset_links(&mut self, node: NodeRef) -> EmberResult<()> {
        let n = self.node_mut(node)?;
        n.left = None;
        n.right = None;
        n.parent = None;
        n.balance = 0;
        Ok(())
    }

    /// Returns true if `node` is the left child of its parent.
    pub fn is_left_child(&self, node: NodeRef) -> EmberResult<bool> {
        match self.parent(node)? {
            Some(p) => Ok(self.left(p)? == Some(node)),
            None => Ok(false),
        }
    }

    // ==========================================================================
    // Node chain maintenance
    // ==========================================================================

    /// Loads and pins the field values of every row.
    ///
    /// Stored records are laid out for the current chain length, so rows
    /// must be resident and changed before the chain is reshaped.
    fn pin_all(&mut self, rows: &[RowRef]) -> EmberResult<()> {
        for &row in rows {
            self.data(row)?;
            self.touch(row);
        }
        Ok(())
    }

    /// Inserts a fresh node into every row's chain at `position`.
    ///
    /// Used when an index is added to a table that already holds rows.
    pub fn insert_chain_position(&mut self, position: usize) -> EmberResult<()> {
        if !self.nodes.try_reserve(self.rows.len()) {
            return Err(EmberError::OutOfMemory {
                message: "node arena".to_string(),
            });
        }
        let rows: Vec<RowRef> = self.rows.iter().map(|(r, _)| r).collect();
        self.pin_all(&rows)?;
        self.chain_len += 1;
        for row in rows {
            let new_node = self.nodes.insert(Node::new(row));
            if position == 0 {
                let first = self.row(row)?.first_node;
                self.node_mut(new_node)?.next = first;
                self.row_mut(row)?.first_node = Some(new_node);
            } else {
                let prev = self.node_at(row, position - 1)?;
                let after = self.node(prev)?.next;
                self.node_mut(new_node)?.next = after;
                self.node_mut(prev)?.next = Some(new_node);
            }
            self.touch(row);
        }
        Ok(())
    }

    /// Removes the node at `position` from every row's chain.
    ///
    /// The tree those nodes formed must be discarded by the caller.
    pub fn remove_chain_position(&mut self, position: usize) -> EmberResult<()> {
        let rows: Vec<RowRef> = self.rows.iter().map(|(r, _)| r).collect();
        self.pin_all(&rows)?;
        self.chain_len = self.chain_len.saturating_sub(1);
        for row in rows {
            let target = self.node_at(row, position)?;
            let after = self.node(target)?.next;
            if position == 0 {
                self.row_mut(row)?.first_node = after;
            } else {
                let prev = self.node_at(row, position - 1)?;
                self.node_mut(prev)?.next = after;
            }
            self.nodes.remove(target);
            self.touch(row);
        }
        Ok(())
    }

    // ==========================================================================
    // Persistence bookkeeping
    // ==========================================================================

    /// Sets the storage strategy of `row` and marks it changed.
    pub fn set_storage(&mut self, row: RowRef, storage: RowStorage) -> EmberResult<()> {
        self.row_mut(row)?.storage = storage;
        self.touch(row);
        Ok(())
    }

    /// Marks `row` as matching its persisted image.
    pub fn mark_saved(&mut self, row: RowRef) -> EmberResult<()> {
        self.row_mut(row)?.changed = false;
        Ok(())
    }

    /// Drains the live disk rows whose persisted image is out of date.
    pub fn take_changed(&mut self) -> Vec<RowRef> {
        let mut rows = std::mem::take(&mut self.dirty);
        rows.sort_unstable();
        rows.dedup();
        rows.retain(|r| {
            self.rows
                .get(*r)
                .map_or(false, |row| row.changed && row.storage.is_disk())
        });
        rows
    }

    /// Disk key of the row owning `node`, if persisted.
    pub fn node_key(&self, node: NodeRef) -> EmberResult<Option<DiskKey>> {
        Ok(self.row(self.row_of(node)?)?.storage.key())
    }

    /// Drops every row and node.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.nodes.clear();
        self.dirty.clear();
        self.resident.get_mut().rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_rows(n: i32, chain: usize) -> (RowStore, Vec<RowRef>) {
        let mut store = RowStore::new(CompareOptions::default());
        let rows = (0..n)
            .map(|i| {
                store
                    .insert_row(vec![Value::Integer(i)], chain, RowStorage::InMemory)
                    .unwrap()
            })
            .collect();
        (store, rows)
    }

    #[test]
    fn test_node_chain() {
        let (store, rows) = store_with_rows(1, 3);
        let n0 = store.node_at(rows[0], 0).unwrap();
        let n2 = store.node_at(rows[0], 2).unwrap();
        assert_ne!(n0, n2);
        assert_eq!(store.row_of(n2).unwrap(), rows[0]);
        assert!(store.node_at(rows[0], 3).is_err());
    }

    #[test]
    fn test_remove_row_severs_chain() {
        let (mut store, rows) = store_with_rows(2, 2);
        let n1 = store.node_at(rows[0], 1).unwrap();
        assert!(store.remove_row(rows[0]).is_some());
        assert!(!store.contains(rows[0]));
        assert!(store.node(n1).is_err());
        assert_eq!(store.len(), 1);
        assert!(store.remove_row(rows[0]).is_none());
    }

    #[test]
    fn test_links_mark_changed() {
        let mut store = RowStore::new(CompareOptions::default()).with_change_tracking(true);
        let key = DiskKey::new(32, 0);
        let rows: Vec<RowRef> = (0..2)
            .map(|i| {
                store
                    .insert_row(vec![Value::Integer(i)], 1, RowStorage::DiskClassic(key))
                    .unwrap()
            })
            .collect();
        assert_eq!(store.take_changed().len(), 2);
        for row in &rows {
            store.mark_saved(*row).unwrap();
        }
        assert!(store.take_changed().is_empty());

        let a = store.node_at(rows[0], 0).unwrap();
        let b = store.node_at(rows[1], 0).unwrap();
        store.set_left(a, Some(b)).unwrap();
        store.set_parent(a, None).unwrap();
        assert_eq!(store.take_changed(), vec![rows[0]]);
        assert_eq!(store.node_key(a).unwrap(), Some(key));
    }

    #[test]
    fn test_chain_positions() {
        let (mut store, rows) = store_with_rows(3, 2);
        store.insert_chain_position(1).unwrap();
        for row in &rows {
            assert!(store.node_at(*row, 2).is_ok());
        }
        let old_last = store.node_at(rows[0], 2).unwrap();
        store.remove_chain_position(1).unwrap();
        assert_eq!(store.node_at(rows[0], 1).unwrap(), old_last);
        assert!(store.node_at(rows[0], 2).is_err());
    }

    mod resident {
        use super::super::*;
        use crate::cache::NodeImage;
        use crate::codec::ProviderRegistry;
        use ember_common::config::StorageConfig;
        use tempfile::{tempdir, TempDir};

        fn types() -> Vec<DataType> {
            vec![DataType::Integer, DataType::Varchar(16)]
        }

        fn data(i: i32) -> Vec<Value> {
            vec![Value::Integer(i), Value::string(format!("r{}", i))]
        }

        /// Store over a fresh data file holding one saved record per value
        /// of `ids`.
        fn saved_store(
            ids: &[i32],
            capacity: usize,
        ) -> (TempDir, Arc<Mutex<DataFileCache>>, RowStore, Vec<RowRef>) {
            let dir = tempdir().unwrap();
            let cache = DataFileCache::open(
                dir.path().join("r.data"),
                &StorageConfig::default(),
                &ProviderRegistry::with_defaults(),
            )
            .unwrap();
            let cache = Arc::new(Mutex::new(cache));
            let loader = RowLoader::new(Arc::clone(&cache), types(), capacity);
            let mut store = RowStore::new(CompareOptions::default())
                .with_change_tracking(true)
                .with_loader(loader);

            let mut rows = Vec::new();
            for &i in ids {
                let mut c = cache.lock();
                let size = c.row_size(&data(i), &types(), 1).unwrap();
                let pos = c.allocate(size).unwrap();
                c.write_row(pos, size, &[NodeImage::EMPTY], &data(i), &types())
                    .unwrap();
                let key = DiskKey::new(pos, c.generation());
                drop(c);
                rows.push(store.insert_row(data(i), 1, RowStorage::disk(key, true)).unwrap());
            }
            for row in store.take_changed() {
                store.mark_saved(row).unwrap();
            }
            (dir, cache, store, rows)
        }

        #[test]
        fn test_saved_rows_are_evicted_and_reloaded() {
            let (_dir, _cache, store, rows) = saved_store(&(0..40).collect::<Vec<_>>(), 8);
            assert_eq!(store.resident_stats().resident, 40);

            store.trim();
            assert_eq!(store.resident_stats().resident, 4);

            for (i, &row) in rows.iter().enumerate() {
                assert_eq!(&*store.data(row).unwrap(), data(i as i32).as_slice());
                assert!(store.resident_stats().resident <= 8);
            }
            let stats = store.resident_stats();
            assert!(stats.loads >= 36);
            assert!(stats.evictions >= 36);
        }

        #[test]
        fn test_changed_rows_stay_resident() {
            let (_dir, _cache, mut store, rows) = saved_store(&[1, 2, 3, 4], 2);
            let node = store.node_at(rows[0], 0).unwrap();
            store.set_balance(node, 1).unwrap();

            store.trim();
            assert_eq!(store.resident_stats().resident, 1);
            assert_eq!(store.resident_stats().loads, 0);
            assert_eq!(&*store.data(rows[0]).unwrap(), data(1).as_slice());
            assert_eq!(store.resident_stats().loads, 0);
        }

        #[test]
        fn test_stale_key_is_not_reloaded() {
            let (_dir, cache, mut store, rows) = saved_store(&[5, 6], 1);
            let key = store.row(rows[0]).unwrap().key().unwrap();
            store
                .set_storage(rows[0], RowStorage::disk(key.regenerate(key.offset()), true))
                .unwrap();
            for row in store.take_changed() {
                store.mark_saved(row).unwrap();
            }
            store.trim();
            assert_eq!(store.resident_stats().resident, 0);

            let err = store.data(rows[0]).unwrap_err();
            assert!(err.is_fatal());
            assert_eq!(&*store.data(rows[1]).unwrap(), data(6).as_slice());
            assert_eq!(cache.lock().generation(), key.generation());
        }
    }
}
