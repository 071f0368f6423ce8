//! Persistence of disk table rows.
//!
//! A disk row's record stores, per index, the unit positions of its left
//! child, right child and parent rows plus its balance. Index roots are kept
//! outside the data file as a space separated list of row positions, one
//! per index, `-1` for an empty index.

use std::collections::HashMap;
use std::sync::Arc;

use ember_common::constants::NO_POS;
use ember_common::{DiskKey, EmberError, EmberResult};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::Table;
use crate::cache::{DataFileCache, NodeImage};
use crate::row::{NodeRef, RowRef, RowStorage, RowStore};

impl Table {
    /// Writes the record of every changed row to the data file cache.
    ///
    /// Memory tables return immediately.
    pub fn sync(&mut self) -> EmberResult<()> {
        let Some(cache) = self.cache.clone() else {
            return Ok(());
        };
        let changed = self.store.take_changed();
        if changed.is_empty() {
            return Ok(());
        }

        let node_count = self.indexes.len();
        let mut records = Vec::with_capacity(changed.len());
        for &row in &changed {
            let key = self
                .store
                .row(row)?
                .key()
                .ok_or_else(|| EmberError::internal("disk table row without a disk key"))?;
            let mut nodes = Vec::with_capacity(node_count);
            for i in 0..node_count {
                nodes.push(node_image(&self.store, self.store.node_at(row, i)?)?);
            }
            records.push((key, nodes, self.store.data(row)?));
        }
        {
            let mut cache = cache.lock();
            for (key, nodes, data) in &records {
                let size = cache.row_size(data, &self.types, node_count)?;
                cache.write_row(key.offset(), size, nodes, data, &self.types)?;
            }
        }
        for &row in &changed {
            self.store.mark_saved(row)?;
        }
        self.store.trim();
        debug!(table = %self.name, rows = changed.len(), "synced rows");
        Ok(())
    }

    /// Root row position of every index, `-1` for an empty index.
    pub fn index_root_positions(&self) -> EmberResult<Vec<i64>> {
        self.indexes
            .iter()
            .map(|index| match index.root() {
                Some(root) => Ok(link_pos(&self.store, Some(root))? as i64),
                None => Ok(i64::from(NO_POS)),
            })
            .collect()
    }

    /// Index roots in their persisted text form.
    pub fn index_roots(&self) -> EmberResult<String> {
        let roots = self.index_root_positions()?;
        Ok(roots
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Restores the index roots of an empty disk table from their persisted
    /// text form, loading every row they reach.
    pub fn set_index_roots(&mut self, roots: &str) -> EmberResult<()> {
        self.load(roots).map(|_| ())
    }

    /// Rebuilds the rows and index trees of an empty disk table from the
    /// data file, given the roots saved by [`index_roots`](Self::index_roots).
    ///
    /// Rows are found by walking the primary index on disk. Returns the
    /// number of rows loaded. On failure the table is left empty.
    pub fn load(&mut self, roots: &str) -> EmberResult<usize> {
        if !self.store.is_empty() {
            return Err(EmberError::invalid_argument(format!(
                "table {} already holds rows",
                self.name
            )));
        }
        let result = self.load_rows(roots);
        if result.is_err() {
            self.store.clear();
            for index in &mut self.indexes {
                index.clear();
            }
        }
        result
    }

    fn load_rows(&mut self, roots: &str) -> EmberResult<usize> {
        let Some(cache) = self.cache.clone() else {
            return Err(EmberError::not_supported("loading a memory table"));
        };
        let roots = parse_roots(roots)?;
        let node_count = self.indexes.len();
        if roots.len() != node_count {
            return Err(EmberError::invalid_argument(format!(
                "table {} has {} indexes, {} roots given",
                self.name,
                node_count,
                roots.len()
            )));
        }

        let mut by_pos: HashMap<i32, RowRef> = HashMap::new();
        let mut images = Vec::new();
        {
            let mut cache = cache.lock();
            let mapped = cache.is_mapped();
            let generation = cache.generation();
            let mut stack: Vec<i32> = match roots[0] {
                NO_POS => Vec::new(),
                root => vec![root],
            };
            while let Some(pos) = stack.pop() {
                if by_pos.contains_key(&pos) {
                    return Err(EmberError::corruption(format!(
                        "cycle at row {} in primary index of {}",
                        pos, self.name
                    )));
                }
                let image = cache.read_row(pos as u64, node_count, &self.types)?;
                let key = DiskKey::new(pos as u64, generation);
                let row = self
                    .store
                    .insert_row(image.data, node_count, RowStorage::disk(key, mapped))?;
                by_pos.insert(pos, row);
                for link in [image.nodes[0].left, image.nodes[0].right] {
                    if link != NO_POS {
                        stack.push(link);
                    }
                }
                images.push((row, image.nodes));
            }
        }

        let resolve = |store: &RowStore, pos: i32, index: usize| -> EmberResult<Option<NodeRef>> {
            if pos == NO_POS {
                return Ok(None);
            }
            let row = by_pos.get(&pos).ok_or_else(|| {
                EmberError::corruption(format!("link to unknown row {} in index {}", pos, index))
            })?;
            store.node_at(*row, index).map(Some)
        };

        for (row, nodes) in &images {
            for (i, image) in nodes.iter().enumerate() {
                let node = self.store.node_at(*row, i)?;
                let left = resolve(&self.store, image.left, i)?;
                let right = resolve(&self.store, image.right, i)?;
                let parent = resolve(&self.store, image.parent, i)?;
                let balance = i8::try_from(image.balance)
                    .ok()
                    .filter(|b| (-1..=1).contains(b))
                    .ok_or_else(|| {
                        EmberError::corruption(format!("balance {} in index {}", image.balance, i))
                    })?;
                self.store.set_left(node, left)?;
                self.store.set_right(node, right)?;
                self.store.set_parent(node, parent)?;
                self.store.set_balance(node, balance)?;
            }
        }
        for (i, &root) in roots.iter().enumerate() {
            let root = resolve(&self.store, root, i)?;
            self.indexes[i].set_root(root);
        }

        let count = images.len();
        for index in &self.indexes {
            let size = index.size(&self.store)?;
            if size != count {
                return Err(EmberError::corruption(format!(
                    "index {} holds {} of {} rows",
                    index.name(),
                    size,
                    count
                )));
            }
        }

        self.restore_counters()?;
        for row in self.store.take_changed() {
            self.store.mark_saved(row)?;
        }
        self.store.trim();
        info!(table = %self.name, rows = count, "loaded table");
        Ok(count)
    }

    fn restore_counters(&mut self) -> EmberResult<()> {
        let hidden = self.has_hidden_key.then(|| self.columns.len() - 1);
        let rows: Vec<RowRef> = self.store.rows().map(|(row, _)| row).collect();
        for row in rows {
            let data = self.store.data(row)?;
            if let Some(v) = hidden.and_then(|c| data[c].to_i64()) {
                self.next_row_id = self.next_row_id.max(self.successor(v, "row id")?);
            }
            if let Some(v) = self.identity_column.and_then(|c| data[c].to_i64()) {
                self.next_identity = self.next_identity.max(self.successor(v, "identity")?);
            }
        }
        Ok(())
    }

    /// Moves every row to the position `lookup` gives for its old one.
    ///
    /// Used after defragmentation has rewritten the data file with the
    /// translated links, so the rows are not marked changed.
    pub(crate) fn rekey(&mut self, lookup: &HashMap<u64, u64>, mapped: bool) -> EmberResult<()> {
        let keys: Vec<(RowRef, DiskKey)> = self
            .store
            .rows()
            .filter_map(|(row, r)| r.key().map(|k| (row, k)))
            .collect();
        for (row, key) in keys {
            let offset = lookup.get(&key.offset()).ok_or_else(|| {
                EmberError::internal(format!("row at {} missing from relocation map", key.offset()))
            })?;
            self.store
                .set_storage(row, RowStorage::disk(key.regenerate(*offset), mapped))?;
        }
        for row in self.store.take_changed() {
            self.store.mark_saved(row)?;
        }
        Ok(())
    }

    /// Shared handle of the data file cache, for disk tables.
    pub(crate) fn data_file(&self) -> Option<&Arc<Mutex<DataFileCache>>> {
        self.cache.as_ref()
    }
}

/// Unit position of the row owning `node`, or `NO_POS`.
fn link_pos(store: &RowStore, node: Option<NodeRef>) -> EmberResult<i32> {
    let Some(node) = node else {
        return Ok(NO_POS);
    };
    let key = store
        .node_key(node)?
        .ok_or_else(|| EmberError::internal("linked row without a disk key"))?;
    i32::try_from(key.offset())
        .map_err(|_| EmberError::internal(format!("row position {} out of range", key.offset())))
}

fn node_image(store: &RowStore, node: NodeRef) -> EmberResult<NodeImage> {
    let n = store.node(node)?;
    Ok(NodeImage {
        left: link_pos(store, n.left())?,
        right: link_pos(store, n.right())?,
        parent: link_pos(store, n.parent())?,
        balance: i32::from(n.balance()),
    })
}

/// Parses a persisted root list.
pub fn parse_roots(roots: &str) -> EmberResult<Vec<i32>> {
    roots
        .split_whitespace()
        .map(|s| {
            s.parse::<i32>()
                .ok()
                .filter(|&p| p >= NO_POS)
                .ok_or_else(|| EmberError::invalid_argument(format!("bad index root '{}'", s)))
        })
        .collect()
}
