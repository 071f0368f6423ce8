//! Page file open options.

use std::fs;

use ember_common::config::StorageConfig;
use ember_common::constants::{DEFAULT_MAX_MAPPED_SIZE, DEFAULT_READ_AHEAD_SIZE, INITIAL_MAPPED_SIZE};

/// Options for opening a scaled page file.
///
/// # Example
///
/// ```rust
/// use ember_storage::file::FileOptions;
///
/// let options = FileOptions::new()
///     .scale(8)
///     .mapped(true)
///     .max_mapped_size(1 << 20);
/// assert_eq!(options.scale_unit(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct FileOptions {
    /// Addressing unit in bytes.
    pub(crate) scale: u32,
    /// Start in memory-mapped mode.
    pub(crate) mapped: bool,
    /// First mapped window size.
    pub(crate) initial_mapped_size: u64,
    /// Ceiling for the mapped window.
    pub(crate) max_mapped_size: u64,
    /// Read-ahead block size for classic access.
    pub(crate) read_ahead_size: usize,
    /// Open without write access.
    pub(crate) read_only: bool,
    /// Create the file if it doesn't exist.
    pub(crate) create: bool,
    /// Truncate an existing file.
    pub(crate) truncate: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl FileOptions {
    /// Creates read-write options that create the file when missing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scale: 1,
            mapped: false,
            initial_mapped_size: INITIAL_MAPPED_SIZE,
            max_mapped_size: DEFAULT_MAX_MAPPED_SIZE,
            read_ahead_size: DEFAULT_READ_AHEAD_SIZE,
            read_only: false,
            create: true,
            truncate: false,
        }
    }

    /// Derives options from the storage configuration.
    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            scale: config.cache_file_scale,
            mapped: config.use_mapped_files,
            initial_mapped_size: config.initial_mapped_size,
            max_mapped_size: config.max_mapped_size,
            read_ahead_size: config.read_ahead_size,
            ..Self::new()
        }
    }

    /// Sets the addressing unit.
    #[must_use]
    pub fn scale(mut self, scale: u32) -> Self {
        self.scale = scale.max(1);
        self
    }

    /// Sets whether the file starts in memory-mapped mode.
    #[must_use]
    pub fn mapped(mut self, mapped: bool) -> Self {
        self.mapped = mapped;
        self
    }

    /// Sets the first mapped window size.
    #[must_use]
    pub fn initial_mapped_size(mut self, size: u64) -> Self {
        self.initial_mapped_size = size;
        self
    }

    /// Sets the mapped window ceiling.
    ///
    /// Growth past this size degrades the file to classic access for the
    /// rest of its lifetime.
    #[must_use]
    pub fn max_mapped_size(mut self, size: u64) -> Self {
        self.max_mapped_size = size;
        self
    }

    /// Sets the read-ahead block size.
    #[must_use]
    pub fn read_ahead_size(mut self, size: usize) -> Self {
        self.read_ahead_size = size.max(1);
        self
    }

    /// Opens the file without write access.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets whether a missing file is created.
    #[must_use]
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Sets whether an existing file is truncated.
    #[must_use]
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Returns the addressing unit.
    #[must_use]
    pub fn scale_unit(&self) -> u32 {
        self.scale
    }

    /// Converts to standard library options.
    pub(crate) fn to_std_options(&self) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        opts.read(true)
            .write(!self.read_only)
            .create(self.create && !self.read_only)
            .truncate(self.truncate && !self.read_only);
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let opts = FileOptions::new()
            .scale(8)
            .mapped(true)
            .max_mapped_size(1 << 16)
            .read_ahead_size(512);
        assert_eq!(opts.scale, 8);
        assert!(opts.mapped);
        assert_eq!(opts.max_mapped_size, 1 << 16);
        assert_eq!(opts.read_ahead_size, 512);
    }

    #[test]
    fn test_zero_scale_clamped() {
        assert_eq!(FileOptions::new().scale(0).scale_unit(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = StorageConfig::default()
            .with_mapped_files(false)
            .with_cache_file_scale(8);
        let opts = FileOptions::from_config(&config);
        assert!(!opts.mapped);
        assert_eq!(opts.scale, 8);
        assert_eq!(opts.read_ahead_size, config.read_ahead_size);
    }
}
