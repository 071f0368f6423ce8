//! Offline compaction of the data file.
//!
//! The pass reads the current data file through classic file access and
//! writes a compacted copy next to it:
//!
//! 1. Walk every table's primary index on disk in key order and give each
//!    live record a new, contiguous position. This yields the old to new
//!    position lookup.
//! 2. Walk the same order again and copy each record to its new position,
//!    translating every node link through the lookup.
//! 3. Write the header with the new end of data and the next generation,
//!    then rename the copy over the original.
//!
//! Any failure removes the partial copy and leaves the original file as it
//! was.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ember_common::config::StorageConfig;
use ember_common::constants::{INITIAL_FREE_POS, NO_POS};
use ember_common::{EmberError, EmberResult, TableId};
use tracing::{info, warn};

use crate::cache::{read_raw_record, write_header, write_raw_record, RawRecord};
use crate::file::{open_scaled_file, FileOptions, ScaledFile};

/// What the pass needs to know about one disk table.
#[derive(Debug, Clone)]
pub struct DefragTable {
    /// Table id.
    pub id: TableId,
    /// Root row position per index, `-1` for an empty index.
    pub roots: Vec<i32>,
}

impl DefragTable {
    fn node_count(&self) -> usize {
        self.roots.len()
    }
}

/// Outcome of a defragmentation pass.
#[derive(Debug, Clone, Default)]
pub struct DefragResult {
    /// Old unit position to new unit position of every live row.
    pub lookup: HashMap<u64, u64>,
    /// Translated index roots per table.
    pub roots: BTreeMap<TableId, Vec<i32>>,
    /// Rows copied.
    pub rows: usize,
    /// Generation of the new file.
    pub generation: u32,
    /// End of data of the new file in bytes.
    pub file_size: u64,
}

/// Path of the temporary copy written next to `path`.
pub fn new_file_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".new");
    PathBuf::from(name)
}

/// Compacts the data file at `path`, which must be saved and closed.
///
/// `tables` are processed in the given order. `generation` is the current
/// file generation; the new file gets the next one.
pub fn run(
    path: &Path,
    config: &StorageConfig,
    tables: &[DefragTable],
    generation: u32,
) -> EmberResult<DefragResult> {
    let started = Instant::now();
    let new_path = new_file_path(path);
    info!(path = %path.display(), tables = tables.len(), "defragmentation started");

    let result = copy_compacted(path, &new_path, config, tables, generation);
    let result = match result {
        Ok(result) => result,
        Err(e) => {
            if let Err(remove) = std::fs::remove_file(&new_path) {
                if remove.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %new_path.display(), error = %remove, "could not remove partial file");
                }
            }
            warn!(path = %path.display(), error = %e, "defragmentation aborted");
            return Err(e);
        }
    };

    std::fs::rename(&new_path, path)?;
    info!(
        path = %path.display(),
        rows = result.rows,
        size = result.file_size,
        generation = result.generation,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "defragmentation finished"
    );
    Ok(result)
}

fn copy_compacted(
    path: &Path,
    new_path: &Path,
    config: &StorageConfig,
    tables: &[DefragTable],
    generation: u32,
) -> EmberResult<DefragResult> {
    let options = FileOptions::from_config(config).mapped(false);
    let mut old = open_scaled_file(path, &options.clone().create(false))?;
    let mut new = open_scaled_file(new_path, &options.truncate(true))?;
    let scale = u64::from(old.scale());

    // pass 1: new positions in primary key order
    let mut result = DefragResult {
        generation: generation.wrapping_add(1),
        ..DefragResult::default()
    };
    let mut order: Vec<(usize, u64)> = Vec::new();
    let mut end = INITIAL_FREE_POS;
    for (t, table) in tables.iter().enumerate() {
        let root = table.roots.first().copied().unwrap_or(NO_POS);
        walk_primary(old.as_mut(), root, table.node_count(), |pos, record| {
            result.lookup.insert(pos, end / scale);
            order.push((t, pos));
            end += record.size as u64;
        })?;
    }

    // pass 2: copy with translated links
    new.seek(0)?;
    new.write(&[0u8; INITIAL_FREE_POS as usize])?;
    let translate = |p: i32, lookup: &HashMap<u64, u64>| -> EmberResult<i32> {
        let new_pos = lookup
            .get(&(p as u64))
            .ok_or_else(|| EmberError::corruption(format!("link to row {} outside its table", p)))?;
        i32::try_from(*new_pos).map_err(|_| EmberError::corruption("row position overflow"))
    };
    for &(t, pos) in &order {
        let mut record = read_raw_record(old.as_mut(), pos, tables[t].node_count())?;
        for node in &mut record.nodes {
            let mut failed = None;
            *node = node.map_links(|p| match translate(p, &result.lookup) {
                Ok(p) => p,
                Err(e) => {
                    failed = Some(e);
                    NO_POS
                }
            });
            if let Some(e) = failed {
                return Err(e);
            }
        }
        write_raw_record(new.as_mut(), result.lookup[&pos], &record)?;
    }

    for table in tables {
        let roots = table
            .roots
            .iter()
            .map(|&r| if r == NO_POS { Ok(NO_POS) } else { translate(r, &result.lookup) })
            .collect::<EmberResult<Vec<_>>>()?;
        result.roots.insert(table.id, roots);
    }

    write_header(new.as_mut(), end, result.generation)?;
    new.sync()?;
    new.close()?;
    old.close()?;

    result.rows = order.len();
    result.file_size = end;
    Ok(result)
}

/// Visits the records of one primary index in key order.
fn walk_primary(
    file: &mut dyn ScaledFile,
    root: i32,
    node_count: usize,
    mut visit: impl FnMut(u64, &RawRecord),
) -> EmberResult<()> {
    let mut seen = HashSet::new();
    let mut stack: Vec<(u64, RawRecord)> = Vec::new();
    let mut next = root;
    loop {
        while next != NO_POS {
            let pos = u64::try_from(next)
                .map_err(|_| EmberError::corruption(format!("bad row link {}", next)))?;
            if !seen.insert(pos) {
                return Err(EmberError::corruption(format!("cycle at row {}", pos)));
            }
            let record = read_raw_record(file, pos, node_count)?;
            next = record.nodes[0].left;
            stack.push((pos, record));
        }
        let Some((pos, record)) = stack.pop() else {
            return Ok(());
        };
        visit(pos, &record);
        next = record.nodes[0].right;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DataFileCache, NodeImage};
    use crate::codec::ProviderRegistry;
    use ember_common::{DataType, Value};
    use tempfile::tempdir;

    #[test]
    fn test_new_file_path() {
        assert_eq!(
            new_file_path(Path::new("/tmp/db.data")),
            PathBuf::from("/tmp/db.data.new")
        );
    }

    #[test]
    fn test_compacts_single_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.data");
        let config = StorageConfig::default().with_mapped_files(false);
        let types = [DataType::Integer];
        let mut cache = DataFileCache::open(&path, &config, &ProviderRegistry::with_defaults()).unwrap();

        // three rows with a hole between them: 2 <- 1 -> 3 by position
        let data = |v: i32| vec![Value::Integer(v)];
        let size = cache.row_size(&data(0), &types, 1).unwrap();
        let a = cache.allocate(size).unwrap();
        let hole = cache.allocate(size).unwrap();
        let b = cache.allocate(size).unwrap();
        let c = cache.allocate(size).unwrap();
        let link = |p: u64| p as i32;
        let root = NodeImage { left: link(a), right: link(c), parent: NO_POS, balance: 0 };
        let left = NodeImage { parent: link(b), ..NodeImage::EMPTY };
        let right = NodeImage { parent: link(b), ..NodeImage::EMPTY };
        cache.write_row(b, size, &[root], &data(2), &types).unwrap();
        cache.write_row(a, size, &[left], &data(1), &types).unwrap();
        cache.write_row(c, size, &[right], &data(3), &types).unwrap();
        cache.free(hole, size);
        cache.close().unwrap();

        let tables = [DefragTable { id: TableId::new(1), roots: vec![link(b)] }];
        let result = run(&path, &config, &tables, 0).unwrap();
        assert_eq!(result.rows, 3);
        assert_eq!(result.generation, 1);
        assert_eq!(result.lookup[&a], a);
        assert_eq!(result.lookup[&b], a + size as u64);
        assert!(!new_file_path(&path).exists());

        let mut cache = DataFileCache::open(&path, &config, &ProviderRegistry::with_defaults()).unwrap();
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.free_position(), a + 3 * size as u64);
        let new_root = result.roots[&TableId::new(1)][0] as u64;
        let image = cache.read_row(new_root, 1, &types).unwrap();
        assert_eq!(image.data, data(2));
        let right = cache.read_row(image.nodes[0].right as u64, 1, &types).unwrap();
        assert_eq!(right.data, data(3));
        assert_eq!(right.nodes[0].parent as u64, new_root);
    }

    #[test]
    fn test_failure_keeps_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.data");
        let config = StorageConfig::default().with_mapped_files(false);
        let mut cache = DataFileCache::open(&path, &config, &ProviderRegistry::with_defaults()).unwrap();
        cache.close().unwrap();
        let before = std::fs::read(&path).unwrap();

        let tables = [DefragTable { id: TableId::new(1), roots: vec![4096] }];
        assert!(run(&path, &config, &tables, 0).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(!new_file_path(&path).exists());
    }
}
