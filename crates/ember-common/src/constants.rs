//! System-wide constants for the ember storage core.
//!
//! Offsets and sizes here define the data file layout and must not change
//! for existing files.

// =============================================================================
// Data File Layout
// =============================================================================

/// Byte offset of the end-of-data pointer in the data file header.
pub const FREE_POS_POS: u64 = 16;

/// Byte offset of the data file generation counter in the header.
pub const GENERATION_POS: u64 = 24;

/// Byte offset where the first row record may be placed.
pub const INITIAL_FREE_POS: u64 = 32;

/// Size of the row record length prefix in bytes.
pub const ROW_SIZE_PREFIX: usize = 4;

/// Size of one stored index node in bytes: left, right, parent, balance.
pub const NODE_DISK_SIZE: usize = 16;

/// Stored link value for "no row".
pub const NO_POS: i32 = -1;

/// Default row record padding in bytes.
pub const DEFAULT_ROW_PADDING: usize = 8;

// =============================================================================
// Free Space Management
// =============================================================================

/// Maximum number of free blocks tracked by the data file cache.
pub const MAX_FREE_COUNT: usize = 1024;

/// Smallest leftover fragment worth keeping after a split allocation.
pub const MIN_FREE_FRAGMENT: usize = 32;

// =============================================================================
// Scaled Page File
// =============================================================================

/// Default ceiling for a memory-mapped window (256 MB).
pub const DEFAULT_MAX_MAPPED_SIZE: u64 = 1 << 28;

/// Initial mapped window size (64 KB).
pub const INITIAL_MAPPED_SIZE: u64 = 64 * 1024;

/// Default read-ahead block size for classic file access.
pub const DEFAULT_READ_AHEAD_SIZE: usize = 4096;

// =============================================================================
// Cache Defaults
// =============================================================================

/// Default maximum number of row images buffered before a flush.
pub const DEFAULT_MAX_CACHED_ROWS: usize = 1024;

/// Default maximum bytes of row images buffered before a flush.
pub const DEFAULT_MAX_CACHED_BYTES: usize = 4 * 1024 * 1024;

/// First id handed out by the compiled-statement cache.
pub const FIRST_STATEMENT_ID: u32 = 1;
