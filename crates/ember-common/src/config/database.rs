//! Database configuration structures.
//!
//! These structures define all configurable aspects of an ember database.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_MAX_CACHED_BYTES, DEFAULT_MAX_CACHED_ROWS, DEFAULT_MAX_MAPPED_SIZE,
    DEFAULT_READ_AHEAD_SIZE, DEFAULT_ROW_PADDING, FIRST_STATEMENT_ID, INITIAL_MAPPED_SIZE,
};
use crate::types::CompareOptions;

/// Main database configuration.
///
/// # Example
///
/// ```rust
/// use ember_common::config::DatabaseConfig;
///
/// let config = DatabaseConfig::default();
/// assert_eq!(config.storage.cache_file_scale, 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database name. The data file is `<data_dir>/<name>.data`.
    pub name: String,

    /// Directory holding the data file.
    pub data_dir: PathBuf,

    /// Storage engine configuration.
    pub storage: StorageConfig,

    /// Compiled-statement cache configuration.
    pub statements: StatementCacheConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "ember".to_string(),
            data_dir: PathBuf::from("./data"),
            storage: StorageConfig::default(),
            statements: StatementCacheConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Creates a new configuration with the specified data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Creates a small configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            name: "test".to_string(),
            data_dir: std::env::temp_dir().join("ember_test"),
            storage: StorageConfig {
                max_cached_rows: 64, // Exercise flushes in tests
                max_cached_bytes: 64 * 1024,
                ..Default::default()
            },
            statements: StatementCacheConfig::default(),
        }
    }

    /// Path of the data file for this database.
    #[must_use]
    pub fn data_file_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.data", self.name))
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        self.storage.validate()
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Addressing unit of the data file in bytes. Must be 1 or 8.
    /// Default: 1
    pub cache_file_scale: u32,

    /// Use a memory-mapped window over the data file.
    /// Default: true
    pub use_mapped_files: bool,

    /// Ceiling for the mapped window in bytes. Must be a power of 2.
    /// Default: 268435456 (256 MB)
    pub max_mapped_size: u64,

    /// Initial mapped window in bytes. Must be a power of 2.
    /// Default: 65536 (64 KB)
    pub initial_mapped_size: u64,

    /// Read-ahead block size for classic file access.
    /// Default: 4096
    pub read_ahead_size: usize,

    /// Row records are padded to a multiple of this many bytes.
    /// Default: 8
    pub row_padding: usize,

    /// Saved rows of a disk table whose field values stay in memory, and
    /// row images buffered before the cache flushes to the file.
    /// Default: 1024
    pub max_cached_rows: usize,

    /// Bytes of row images buffered before the cache flushes to the file.
    /// Default: 4194304 (4 MB)
    pub max_cached_bytes: usize,

    /// Reject over-long character values instead of truncating them.
    /// Default: false
    pub strict_column_size: bool,

    /// Compare strings case-insensitively in indexes.
    /// Default: false
    pub ignore_case: bool,

    /// Tag of the row format provider used for data files.
    /// Default: "binary"
    pub data_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_file_scale: 1,
            use_mapped_files: true,
            max_mapped_size: DEFAULT_MAX_MAPPED_SIZE,
            initial_mapped_size: INITIAL_MAPPED_SIZE,
            read_ahead_size: DEFAULT_READ_AHEAD_SIZE,
            row_padding: DEFAULT_ROW_PADDING,
            max_cached_rows: DEFAULT_MAX_CACHED_ROWS,
            max_cached_bytes: DEFAULT_MAX_CACHED_BYTES,
            strict_column_size: false,
            ignore_case: false,
            data_format: "binary".to_string(),
        }
    }
}

impl StorageConfig {
    /// Sets whether the data file is memory mapped.
    #[must_use]
    pub fn with_mapped_files(mut self, enabled: bool) -> Self {
        self.use_mapped_files = enabled;
        self
    }

    /// Sets the mapped window ceiling.
    #[must_use]
    pub fn with_max_mapped_size(mut self, size: u64) -> Self {
        self.max_mapped_size = size;
        self
    }

    /// Sets the addressing unit of the data file.
    #[must_use]
    pub fn with_cache_file_scale(mut self, scale: u32) -> Self {
        self.cache_file_scale = scale;
        self
    }

    /// Sets strict column size enforcement.
    #[must_use]
    pub fn with_strict_column_size(mut self, strict: bool) -> Self {
        self.strict_column_size = strict;
        self
    }

    /// Sets the row format provider tag.
    #[must_use]
    pub fn with_data_format(mut self, tag: impl Into<String>) -> Self {
        self.data_format = tag.into();
        self
    }

    /// Comparison options derived from this configuration.
    #[must_use]
    pub const fn compare_options(&self) -> CompareOptions {
        CompareOptions {
            ignore_case: self.ignore_case,
        }
    }

    /// Validates the storage configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_file_scale != 1 && self.cache_file_scale != 8 {
            return Err("cache_file_scale must be 1 or 8".to_string());
        }

        if !self.max_mapped_size.is_power_of_two() {
            return Err("max_mapped_size must be a power of 2".to_string());
        }

        if !self.initial_mapped_size.is_power_of_two()
            || self.initial_mapped_size > self.max_mapped_size
        {
            return Err(
                "initial_mapped_size must be a power of 2 no larger than max_mapped_size"
                    .to_string(),
            );
        }

        if self.row_padding == 0 || !self.row_padding.is_power_of_two() {
            return Err("row_padding must be a power of 2".to_string());
        }

        if (self.row_padding as u64) % u64::from(self.cache_file_scale) != 0 {
            return Err("row_padding must be a multiple of cache_file_scale".to_string());
        }

        if self.read_ahead_size == 0 {
            return Err("read_ahead_size must be positive".to_string());
        }

        if self.max_cached_rows == 0 {
            return Err("max_cached_rows must be positive".to_string());
        }

        if self.data_format.is_empty() {
            return Err("data_format must not be empty".to_string());
        }

        Ok(())
    }
}

/// Compiled-statement cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementCacheConfig {
    /// First id handed out for a compiled statement.
    /// Default: 1
    pub first_statement_id: u32,

    /// Collapse whitespace and case before looking up SQL text.
    /// Default: false
    pub normalize_sql: bool,
}

impl Default for StatementCacheConfig {
    fn default() -> Self {
        Self {
            first_statement_id: FIRST_STATEMENT_ID,
            normalize_sql: false,
        }
    }
}
