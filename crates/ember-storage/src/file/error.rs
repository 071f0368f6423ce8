//! I/O error types for the file module.

use std::io;
use std::path::PathBuf;

use ember_common::EmberError;
use thiserror::Error;

/// Result type for page file operations.
pub type FileResult<T> = Result<T, FileError>;

/// Errors that can occur during data file I/O.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum FileError {
    /// Standard I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// File not found.
    #[error("file not found: {path}")]
    NotFound { path: PathBuf },

    /// Permission denied.
    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// A scaled position does not fit the addressing range.
    #[error("invalid offset: {offset} exceeds addressable range of scale {scale}")]
    InvalidOffset { offset: u64, scale: u32 },

    /// Short read (the file ended before the buffer was filled).
    #[error("short {operation}: expected {expected} bytes, got {actual}")]
    ShortIo {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    /// File was closed.
    #[error("file is closed")]
    Closed,

    /// Invalid operation for file mode.
    #[error("invalid operation: {operation} not allowed in {mode} mode")]
    InvalidOperation {
        operation: &'static str,
        mode: &'static str,
    },
}

impl FileError {
    /// Creates a ShortIo error for reads.
    pub fn short_read(expected: usize, actual: usize) -> Self {
        Self::ShortIo {
            operation: "read",
            expected,
            actual,
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::Io { source } if source.kind() == io::ErrorKind::NotFound)
    }

    /// Converts from std::io::Error with path context.
    pub fn from_io_with_path(err: io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { source: err },
        }
    }
}

impl From<FileError> for EmberError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::Io { source } => EmberError::Io { source },
            FileError::ShortIo { .. } => EmberError::corruption(err.to_string()),
            other => EmberError::Io {
                source: io::Error::new(io::ErrorKind::Other, other.to_string()),
            },
        }
    }
}
