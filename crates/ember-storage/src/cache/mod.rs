//! Data file cache for disk-resident rows.
//!
//! The cache owns the scaled page file of a database, hands out space for
//! row records, and buffers dirty row images until a bounded amount has
//! accumulated. Buffered images are written in ascending file order.
//!
//! # Record layout
//!
//! ```text
//!   ┌──────┬──────────────────────────────┬─────────────┬─────────┐
//!   │ size │ node 0 │ node 1 │ ... │ n-1 │ field data  │ padding │
//!   │  i32 │ left right parent balance   │ (RowCodec)  │         │
//!   └──────┴──────────────────────────────┴─────────────┴─────────┘
//! ```
//!
//! Node links hold the unit position of the linked row's record, or -1.
//! The file header keeps the end-of-data pointer at byte 16 and the file
//! generation at byte 24; records start at byte 32.

mod free_list;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ember_common::config::StorageConfig;
use ember_common::constants::{
    FREE_POS_POS, GENERATION_POS, INITIAL_FREE_POS, NODE_DISK_SIZE, NO_POS, ROW_SIZE_PREFIX,
};
use ember_common::{DataType, EmberError, EmberResult, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{ProviderRegistry, RowCodec};
use crate::file::{open_scaled_file, FileOptions, ScaledFile};

pub use free_list::{FreeBlock, FreeList};

/// Stored image of one index node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeImage {
    /// Unit position of the left child's row, or -1.
    pub left: i32,
    /// Unit position of the right child's row, or -1.
    pub right: i32,
    /// Unit position of the parent's row, or -1.
    pub parent: i32,
    /// Balance factor.
    pub balance: i32,
}

impl NodeImage {
    /// A node with no links.
    pub const EMPTY: NodeImage = NodeImage {
        left: NO_POS,
        right: NO_POS,
        parent: NO_POS,
        balance: 0,
    };

    /// Applies `f` to every link that is set.
    #[must_use]
    pub fn map_links(self, mut f: impl FnMut(i32) -> i32) -> Self {
        let mut map = |p: i32| if p == NO_POS { NO_POS } else { f(p) };
        Self {
            left: map(self.left),
            right: map(self.right),
            parent: map(self.parent),
            balance: self.balance,
        }
    }
}

/// A row record with its field data still encoded.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Padded record size in bytes.
    pub size: usize,
    /// One node image per index.
    pub nodes: Vec<NodeImage>,
    /// Encoded field data, padding included.
    pub data: Bytes,
}

impl RawRecord {
    /// Parses a record of `node_count` nodes from `buf`.
    pub fn decode(buf: &[u8], node_count: usize) -> EmberResult<Self> {
        let header = ROW_SIZE_PREFIX + node_count * NODE_DISK_SIZE;
        if buf.len() < header {
            return Err(EmberError::corruption("row record shorter than its header"));
        }
        let mut cursor = buf;
        let size = cursor.get_i32();
        if size < header as i32 || size as usize > buf.len() {
            return Err(EmberError::corruption(format!("row record size {} invalid", size)));
        }
        let nodes = (0..node_count)
            .map(|_| NodeImage {
                left: cursor.get_i32(),
                right: cursor.get_i32(),
                parent: cursor.get_i32(),
                balance: cursor.get_i32(),
            })
            .collect();
        let data = Bytes::copy_from_slice(&buf[header..size as usize]);
        Ok(Self {
            size: size as usize,
            nodes,
            data,
        })
    }

    /// Serializes the record. `data` must already carry its padding.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.size);
        out.put_i32(self.size as i32);
        for node in &self.nodes {
            out.put_i32(node.left);
            out.put_i32(node.right);
            out.put_i32(node.parent);
            out.put_i32(node.balance);
        }
        out.put_slice(&self.data);
    }
}

/// A decoded row record.
#[derive(Debug, Clone)]
pub struct RowImage {
    /// Padded record size in bytes.
    pub size: usize,
    /// One node image per index.
    pub nodes: Vec<NodeImage>,
    /// Field values.
    pub data: Vec<Value>,
}

/// Reads the raw record at unit position `pos`.
pub fn read_raw_record(
    file: &mut dyn ScaledFile,
    pos: u64,
    node_count: usize,
) -> EmberResult<RawRecord> {
    file.seek(pos)?;
    let size = file.read_int()?;
    let header = ROW_SIZE_PREFIX + node_count * NODE_DISK_SIZE;
    if size < header as i32 {
        return Err(EmberError::corruption(format!(
            "row record at {} has size {}",
            pos, size
        )));
    }
    let mut buf = vec![0u8; size as usize];
    buf[..ROW_SIZE_PREFIX].copy_from_slice(&size.to_be_bytes());
    file.read(&mut buf[ROW_SIZE_PREFIX..])?;
    RawRecord::decode(&buf, node_count)
}

/// Writes `record` at unit position `pos`.
pub fn write_raw_record(file: &mut dyn ScaledFile, pos: u64, record: &RawRecord) -> EmberResult<()> {
    let mut out = BytesMut::with_capacity(record.size);
    record.encode(&mut out);
    file.seek(pos)?;
    file.write(&out)?;
    Ok(())
}

/// Writes the end-of-data pointer and generation into a data file header.
pub fn write_header(file: &mut dyn ScaledFile, free_pos: u64, generation: u32) -> EmberResult<()> {
    let scale = u64::from(file.scale());
    file.seek(FREE_POS_POS / scale)?;
    file.write_long(free_pos as i64)?;
    file.seek(GENERATION_POS / scale)?;
    file.write_int(generation as i32)?;
    Ok(())
}

/// Counters kept by the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Row images handed to the cache.
    pub rows_written: u64,
    /// Row records read from the file.
    pub rows_read: u64,
    /// Times the write buffer was flushed.
    pub flushes: u64,
    /// Allocations served from the free list.
    pub reused_blocks: u64,
}

/// Space management and write-back buffering for one data file.
pub struct DataFileCache {
    path: PathBuf,
    config: StorageConfig,
    file: Box<dyn ScaledFile>,
    codec: Box<dyn RowCodec>,
    free_list: FreeList,
    /// End of data in bytes.
    free_pos: u64,
    generation: u32,
    /// Dirty record images keyed by unit position.
    pending: BTreeMap<u64, BytesMut>,
    pending_bytes: usize,
    stats: CacheStats,
}

impl DataFileCache {
    /// Opens or creates the data file at `path`.
    ///
    /// The row format is chosen from `registry` by `config.data_format`.
    pub fn open(
        path: impl AsRef<Path>,
        config: &StorageConfig,
        registry: &ProviderRegistry,
    ) -> EmberResult<Self> {
        let path = path.as_ref().to_path_buf();
        let codec = registry.create(&config.data_format, config)?;
        let existing_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let mut file = open_scaled_file(&path, &FileOptions::from_config(config))?;
        let scale = u64::from(file.scale());

        let (free_pos, generation) = if existing_len < INITIAL_FREE_POS {
            file.seek(0)?;
            file.write(&[0u8; INITIAL_FREE_POS as usize])?;
            write_header(file.as_mut(), INITIAL_FREE_POS, 0)?;
            (INITIAL_FREE_POS, 0)
        } else {
            file.seek(FREE_POS_POS / scale)?;
            let free_pos = file.read_long()?;
            file.seek(GENERATION_POS / scale)?;
            let generation = file.read_int()?;
            if free_pos < INITIAL_FREE_POS as i64 || free_pos as u64 > existing_len {
                return Err(EmberError::corruption(format!(
                    "data file {} has free position {}",
                    path.display(),
                    free_pos
                )));
            }
            (free_pos as u64, generation as u32)
        };

        info!(
            path = %path.display(),
            free_pos,
            generation,
            mapped = file.is_mapped(),
            format = codec.tag(),
            "opened data file"
        );

        Ok(Self {
            path,
            config: config.clone(),
            file,
            codec,
            free_list: FreeList::default(),
            free_pos,
            generation,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            stats: CacheStats::default(),
        })
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while the page file is memory mapped.
    pub fn is_mapped(&self) -> bool {
        self.file.is_mapped()
    }

    /// Returns true if the page file was ever memory mapped.
    pub fn was_mapped(&self) -> bool {
        self.file.was_mapped()
    }

    /// Generation stamped into every disk key issued by this file.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Addressing unit in bytes.
    pub fn scale(&self) -> u32 {
        self.file.scale()
    }

    /// Row codec in use.
    pub fn codec(&self) -> &dyn RowCodec {
        self.codec.as_ref()
    }

    /// End of data as a unit position.
    pub fn free_position(&self) -> u64 {
        self.free_pos / u64::from(self.scale())
    }

    /// Free list of the file.
    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Cache counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of buffered row images.
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    fn padding(&self) -> usize {
        self.config.row_padding.max(self.scale() as usize).max(1)
    }

    /// Padded record size for a row.
    pub fn row_size(&self, data: &[Value], types: &[DataType], node_count: usize) -> EmberResult<usize> {
        let raw = ROW_SIZE_PREFIX
            + node_count * NODE_DISK_SIZE
            + self.codec.encoded_len(data, types)?;
        let pad = self.padding();
        Ok(raw.div_ceil(pad) * pad)
    }

    // =========================================================================
    // Space management
    // =========================================================================

    /// Reserves `size` bytes and returns their unit position.
    pub fn allocate(&mut self, size: usize) -> EmberResult<u64> {
        let scale = u64::from(self.scale());
        if let Some(offset) = self.free_list.take(size) {
            self.stats.reused_blocks += 1;
            return Ok(offset / scale);
        }

        let offset = self.free_pos;
        let end = offset + size as u64;
        if end / scale > i32::MAX as u64 {
            return Err(EmberError::OutOfMemory {
                message: format!("data file {} is full", self.path.display()),
            });
        }
        self.free_pos = end;
        Ok(offset / scale)
    }

    /// Returns the record at `pos` to the free list.
    pub fn free(&mut self, pos: u64, size: usize) {
        if let Some(buf) = self.pending.remove(&pos) {
            self.pending_bytes -= buf.len();
        }
        let offset = pos * u64::from(self.scale());
        self.free_list.add(offset, size);
    }

    // =========================================================================
    // Row records
    // =========================================================================

    /// Buffers the record for a row at `pos`.
    ///
    /// `size` must be the value [`row_size`](Self::row_size) returned for
    /// the same row.
    pub fn write_row(
        &mut self,
        pos: u64,
        size: usize,
        nodes: &[NodeImage],
        data: &[Value],
        types: &[DataType],
    ) -> EmberResult<()> {
        let mut fields = BytesMut::new();
        self.codec.encode(data, types, &mut fields)?;
        let header = ROW_SIZE_PREFIX + nodes.len() * NODE_DISK_SIZE;
        if header + fields.len() > size {
            return Err(EmberError::internal(format!(
                "row at {} outgrew its record of {} bytes",
                pos, size
            )));
        }
        fields.resize(size - header, 0);

        let record = RawRecord {
            size,
            nodes: nodes.to_vec(),
            data: fields.freeze(),
        };
        let mut out = BytesMut::with_capacity(size);
        record.encode(&mut out);

        self.pending_bytes += out.len();
        if let Some(old) = self.pending.insert(pos, out) {
            self.pending_bytes -= old.len();
        }
        self.stats.rows_written += 1;

        if self.pending.len() > self.config.max_cached_rows
            || self.pending_bytes > self.config.max_cached_bytes
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Reads the raw record at `pos`, preferring a buffered image.
    pub fn read_raw(&mut self, pos: u64, node_count: usize) -> EmberResult<RawRecord> {
        self.check_position(pos)?;
        self.stats.rows_read += 1;
        match self.pending.get(&pos) {
            Some(buf) => RawRecord::decode(buf, node_count),
            None => read_raw_record(self.file.as_mut(), pos, node_count),
        }
    }

    /// Reads and decodes the row at `pos`.
    pub fn read_row(&mut self, pos: u64, node_count: usize, types: &[DataType]) -> EmberResult<RowImage> {
        let raw = self.read_raw(pos, node_count)?;
        let data = self.codec.decode(&raw.data, types)?;
        Ok(RowImage {
            size: raw.size,
            nodes: raw.nodes,
            data,
        })
    }

    fn check_position(&self, pos: u64) -> EmberResult<()> {
        let byte = pos * u64::from(self.scale());
        if byte < INITIAL_FREE_POS || byte >= self.free_pos {
            return Err(EmberError::corruption(format!(
                "row position {} outside data file {}",
                pos,
                self.path.display()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes every buffered image in ascending position order.
    pub fn flush(&mut self) -> EmberResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let count = self.pending.len();
        for (pos, buf) in std::mem::take(&mut self.pending) {
            self.file.seek(pos)?;
            self.file.write(&buf)?;
        }
        self.pending_bytes = 0;
        self.stats.flushes += 1;
        debug!(path = %self.path.display(), rows = count, "flushed row buffer");
        Ok(())
    }

    /// Flushes buffered rows and records the end-of-data pointer.
    pub fn save_all(&mut self) -> EmberResult<()> {
        self.flush()?;
        write_header(self.file.as_mut(), self.free_pos, self.generation)?;
        self.file.sync()?;
        Ok(())
    }

    /// Saves everything and closes the page file.
    pub fn close(&mut self) -> EmberResult<()> {
        self.save_all()?;
        self.file.close()?;
        info!(path = %self.path.display(), "closed data file");
        Ok(())
    }
}

impl std::fmt::Debug for DataFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileCache")
            .field("path", &self.path)
            .field("free_pos", &self.free_pos)
            .field("generation", &self.generation)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn types() -> Vec<DataType> {
        vec![DataType::Integer, DataType::Varchar(0)]
    }

    fn row(i: i32) -> Vec<Value> {
        vec![Value::Integer(i), Value::string(format!("row {}", i))]
    }

    fn open(path: &Path, config: &StorageConfig) -> DataFileCache {
        DataFileCache::open(path, config, &ProviderRegistry::with_defaults()).unwrap()
    }

    #[test]
    fn test_write_read_through_buffer_and_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");
        let mut cache = open(&path, &StorageConfig::default());
        let types = types();

        let size = cache.row_size(&row(1), &types, 2).unwrap();
        assert_eq!(size % 8, 0);
        let pos = cache.allocate(size).unwrap();
        assert_eq!(pos, INITIAL_FREE_POS);

        let nodes = [NodeImage::EMPTY, NodeImage { left: 64, right: -1, parent: 96, balance: 1 }];
        cache.write_row(pos, size, &nodes, &row(1), &types).unwrap();
        assert_eq!(cache.pending_rows(), 1);

        let image = cache.read_row(pos, 2, &types).unwrap();
        assert_eq!(image.data, row(1));
        assert_eq!(image.nodes[1], nodes[1]);

        cache.flush().unwrap();
        assert_eq!(cache.pending_rows(), 0);
        let image = cache.read_row(pos, 2, &types).unwrap();
        assert_eq!(image.data, row(1));
        assert_eq!(image.size, size);
    }

    #[test]
    fn test_reopen_restores_free_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.data");
        let config = StorageConfig::default().with_mapped_files(false);
        let types = types();

        let (pos, end) = {
            let mut cache = open(&path, &config);
            let size = cache.row_size(&row(7), &types, 1).unwrap();
            let pos = cache.allocate(size).unwrap();
            cache.write_row(pos, size, &[NodeImage::EMPTY], &row(7), &types).unwrap();
            cache.close().unwrap();
            (pos, cache.free_position())
        };

        let mut cache = open(&path, &config);
        assert_eq!(cache.free_position(), end);
        assert_eq!(cache.read_row(pos, 1, &types).unwrap().data, row(7));
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::default();
        config.max_cached_rows = 4;
        let mut cache = open(&dir.path().join("t.data"), &config);
        let types = types();

        for i in 0..5 {
            let size = cache.row_size(&row(i), &types, 1).unwrap();
            let pos = cache.allocate(size).unwrap();
            cache.write_row(pos, size, &[NodeImage::EMPTY], &row(i), &types).unwrap();
        }
        assert_eq!(cache.pending_rows(), 0);
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn test_freed_space_is_reused() {
        let dir = tempdir().unwrap();
        let mut cache = open(&dir.path().join("t.data"), &StorageConfig::default());
        let types = types();

        let size = cache.row_size(&row(100), &types, 3).unwrap();
        let a = cache.allocate(size).unwrap();
        let _b = cache.allocate(size).unwrap();
        cache.free(a, size);
        assert_eq!(cache.allocate(size).unwrap(), a);
        assert_eq!(cache.stats().reused_blocks, 1);
    }

    #[test]
    fn test_position_outside_file_is_corruption() {
        let dir = tempdir().unwrap();
        let mut cache = open(&dir.path().join("t.data"), &StorageConfig::default());
        let err = cache.read_raw(4096, 1).unwrap_err();
        assert!(matches!(err, EmberError::Corruption { .. }));
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::default().with_data_format("csv");
        let err = DataFileCache::open(dir.path().join("t.data"), &config, &ProviderRegistry::with_defaults())
            .unwrap_err();
        assert!(matches!(err, EmberError::NotSupported { .. }));
    }

    #[test]
    fn test_map_links_keeps_missing() {
        let node = NodeImage { left: 32, right: NO_POS, parent: 64, balance: -1 };
        let mapped = node.map_links(|p| p + 1);
        assert_eq!(mapped, NodeImage { left: 33, right: NO_POS, parent: 65, balance: -1 });
    }
}
