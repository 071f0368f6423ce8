//! Scaled page file layer.
//!
//! A data file is addressed in fixed-size scale units. Two implementations
//! share the [`ScaledFile`] contract:
//!
//! - **Classic**: seek/read/write through the OS with a one-block read-ahead cache
//! - **Mapped**: a growable memory-mapped window that degrades to classic
//!   access once it would pass its ceiling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            ScaledFile Trait             │
//! │  (seek, read, write, length, close)     │
//! └─────────────────────────────────────────┘
//!              │                   │
//!              ▼                   ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │   ClassicFile       │◄─│   MappedFile        │
//! │   read-ahead block  │  │   memmap2 window    │
//! └─────────────────────┘  └─────────────────────┘
//!            ▲ one-way fallback ┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use ember_storage::file::{open_scaled_file, FileOptions, ScaledFile};
//!
//! fn example() -> ember_storage::file::FileResult<()> {
//!     let options = FileOptions::new().mapped(true).scale(8);
//!     let mut file = open_scaled_file("db.data", &options)?;
//!
//!     file.seek(2)?; // byte offset 16
//!     file.write_long(32)?;
//!     file.close()?;
//!     Ok(())
//! }
//! ```

mod classic;
mod error;
mod handle;
mod mapped;
mod options;

pub use classic::ClassicFile;
pub use error::{FileError, FileResult};
pub use handle::ScaledFile;
pub use mapped::MappedFile;
pub use options::FileOptions;

use std::path::Path;

/// Opens a data file in the mode the options ask for.
pub fn open_scaled_file(
    path: impl AsRef<Path>,
    options: &FileOptions,
) -> FileResult<Box<dyn ScaledFile>> {
    if options.mapped {
        Ok(Box::new(MappedFile::open(path, options)?))
    } else {
        Ok(Box::new(ClassicFile::open(path, options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_by_mode() {
        let dir = tempdir().unwrap();
        let mapped = open_scaled_file(dir.path().join("a"), &FileOptions::new().mapped(true)).unwrap();
        assert!(mapped.is_mapped());

        let classic = open_scaled_file(dir.path().join("b"), &FileOptions::new()).unwrap();
        assert!(!classic.is_mapped());
        assert!(!classic.was_mapped());
    }
}
