//! Classic seek/read/write file access.
//!
//! Every operation goes through the operating system file. Small reads are
//! served from a single read-ahead block that is refilled on a miss and
//! dropped on any write, which removes most syscalls for the clustered
//! reads a tree walk produces.

use std::fs::File as StdFile;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{FileError, FileResult};
use super::handle::{byte_to_unit, unit_to_byte, ScaledFile};
use super::options::FileOptions;

/// Single cached block of file bytes.
#[derive(Debug)]
struct ReadAheadBlock {
    start: u64,
    data: Vec<u8>,
    capacity: usize,
    valid: bool,
}

impl ReadAheadBlock {
    fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity),
            capacity,
            valid: false,
        }
    }

    fn covers(&self, offset: u64, len: usize) -> bool {
        self.valid
            && offset >= self.start
            && offset + len as u64 <= self.start + self.data.len() as u64
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.data.clear();
    }
}

/// File accessed through explicit seek, read and write calls.
pub struct ClassicFile {
    /// The underlying file. `None` after close.
    file: Option<StdFile>,
    /// The file path.
    path: PathBuf,
    /// Addressing unit.
    scale: u32,
    /// Cursor in bytes.
    position: u64,
    /// Read-ahead cache.
    block: ReadAheadBlock,
    /// Whether the file was opened with write access.
    writable: bool,
    /// Set when this file took over from a mapped file.
    was_mapped: bool,
}

impl ClassicFile {
    /// Opens a file with the specified options.
    pub fn open(path: impl AsRef<Path>, options: &FileOptions) -> FileResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = options
            .to_std_options()
            .open(&path)
            .map_err(|e| FileError::from_io_with_path(e, &path))?;

        debug!(path = %path.display(), scale = options.scale, "opened classic data file");

        Ok(Self::from_parts(file, path, options, 0, false))
    }

    /// Wraps an already open file, placing the cursor at byte `position`.
    pub(crate) fn from_parts(
        file: StdFile,
        path: PathBuf,
        options: &FileOptions,
        position: u64,
        was_mapped: bool,
    ) -> Self {
        Self {
            file: Some(file),
            path,
            scale: options.scale,
            position,
            block: ReadAheadBlock::new(options.read_ahead_size),
            writable: !options.read_only,
            was_mapped,
        }
    }

    fn file_mut(&mut self) -> FileResult<&mut StdFile> {
        self.file.as_mut().ok_or(FileError::Closed)
    }

    /// Reads as many bytes as are available, up to `buf.len()`.
    fn read_up_to(file: &mut StdFile, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn fill_block(&mut self, offset: u64) -> FileResult<()> {
        let capacity = self.block.capacity;
        let mut data = std::mem::take(&mut self.block.data);
        data.resize(capacity, 0);

        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        let n = Self::read_up_to(file, &mut data)?;
        data.truncate(n);

        self.block.start = offset;
        self.block.data = data;
        self.block.valid = true;
        Ok(())
    }
}

impl ScaledFile for ClassicFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn seek(&mut self, position: u64) -> FileResult<()> {
        self.position = unit_to_byte(position, self.scale);
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        byte_to_unit(self.position, self.scale)
    }

    fn read(&mut self, buf: &mut [u8]) -> FileResult<()> {
        let offset = self.position;
        let len = buf.len();

        if !self.block.covers(offset, len) && len <= self.block.capacity {
            self.fill_block(offset)?;
        }

        if self.block.covers(offset, len) {
            let start = (offset - self.block.start) as usize;
            buf.copy_from_slice(&self.block.data[start..start + len]);
        } else if len <= self.block.capacity {
            // The refill stopped at end of file
            let available = self.block.data.len();
            return Err(FileError::short_read(len, available));
        } else {
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(offset))?;
            let n = Self::read_up_to(file, buf)?;
            if n < len {
                return Err(FileError::short_read(len, n));
            }
        }

        self.position += len as u64;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> FileResult<()> {
        if !self.writable {
            return Err(FileError::InvalidOperation {
                operation: "write",
                mode: "read-only",
            });
        }
        self.block.invalidate();

        let offset = self.position;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn length(&self) -> FileResult<u64> {
        let file = self.file.as_ref().ok_or(FileError::Closed)?;
        Ok(file.metadata()?.len())
    }

    fn sync(&mut self) -> FileResult<()> {
        if self.writable {
            self.file_mut()?.sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> FileResult<()> {
        if self.file.is_some() {
            self.sync()?;
            self.file = None;
            self.block.invalidate();
            debug!(path = %self.path.display(), "closed classic data file");
        }
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        false
    }

    fn was_mapped(&self) -> bool {
        self.was_mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let mut file = ClassicFile::open(dir.path().join("t.data"), &FileOptions::new()).unwrap();

        file.seek(0).unwrap();
        file.write(b"hello world").unwrap();
        file.write_int(-7).unwrap();

        file.seek(0).unwrap();
        let mut buf = [0u8; 5];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        file.seek(11).unwrap();
        assert_eq!(file.read_int().unwrap(), -7);
        assert_eq!(file.length().unwrap(), 15);
        assert!(!file.is_mapped());
        assert!(!file.was_mapped());
    }

    #[test]
    fn test_read_ahead_invalidated_by_write() {
        let dir = tempdir().unwrap();
        let opts = FileOptions::new().read_ahead_size(64);
        let mut file = ClassicFile::open(dir.path().join("t.data"), &opts).unwrap();

        file.write(&[1u8; 32]).unwrap();
        file.seek(0).unwrap();
        let mut buf = [0u8; 4];
        file.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 1, 1, 1]);

        file.seek(4).unwrap();
        file.write(&[9u8; 4]).unwrap();

        file.seek(4).unwrap();
        file.read(&mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
    }

    #[test]
    fn test_scaled_addressing() {
        let dir = tempdir().unwrap();
        let opts = FileOptions::new().scale(8);
        let mut file = ClassicFile::open(dir.path().join("t.data"), &opts).unwrap();

        file.seek(2).unwrap();
        file.write_long(42).unwrap();
        assert_eq!(file.file_pointer(), 3);
        assert_eq!(file.length().unwrap(), 24);

        file.seek(2).unwrap();
        assert_eq!(file.read_long().unwrap(), 42);
    }

    #[test]
    fn test_short_read_past_end() {
        let dir = tempdir().unwrap();
        let mut file = ClassicFile::open(dir.path().join("t.data"), &FileOptions::new()).unwrap();
        file.write(&[0u8; 4]).unwrap();
        file.seek(2).unwrap();
        assert!(matches!(
            file.read_int(),
            Err(FileError::ShortIo { .. })
        ));
    }

    #[test]
    fn test_large_read_bypasses_block() {
        let dir = tempdir().unwrap();
        let opts = FileOptions::new().read_ahead_size(16);
        let mut file = ClassicFile::open(dir.path().join("t.data"), &opts).unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        file.write(&data).unwrap();

        file.seek(0).unwrap();
        let mut buf = vec![0u8; 100];
        file.read(&mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_closed_file() {
        let dir = tempdir().unwrap();
        let mut file = ClassicFile::open(dir.path().join("t.data"), &FileOptions::new()).unwrap();
        file.close().unwrap();
        assert!(matches!(file.write(b"x"), Err(FileError::Closed)));
        file.close().unwrap();
    }
}
