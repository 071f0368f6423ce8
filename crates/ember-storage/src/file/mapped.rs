//! Memory-mapped file access with a one-way fallback to classic access.
//!
//! The file is mapped through a window that grows to the next power of two
//! covering each access. When growth would pass the configured ceiling, or
//! the platform refuses a mapping, the window is flushed and unmapped and the
//! file continues as a [`ClassicFile`] at the same cursor. The fallback is
//! permanent for the lifetime of the handle.
//!
//! ```text
//!   open ──► Mapped ──(ceiling / map error)──► Classic ──► Closed
//!              │                                            ▲
//!              └────────────────── close ───────────────────┘
//! ```

use std::fs::File as StdFile;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};

use super::classic::ClassicFile;
use super::error::{FileError, FileResult};
use super::handle::{byte_to_unit, unit_to_byte, ScaledFile};
use super::options::FileOptions;

struct MappedWindow {
    file: StdFile,
    map: MmapMut,
    /// Cursor in bytes.
    position: u64,
}

enum Mode {
    Mapped(MappedWindow),
    Classic(ClassicFile),
    Closed,
}

/// File accessed through a growable memory-mapped window.
pub struct MappedFile {
    path: PathBuf,
    options: FileOptions,
    mode: Mode,
    was_mapped: bool,
}

impl MappedFile {
    /// Opens a file, mapping it when it fits under the ceiling.
    pub fn open(path: impl AsRef<Path>, options: &FileOptions) -> FileResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = options
            .to_std_options()
            .open(&path)
            .map_err(|e| FileError::from_io_with_path(e, &path))?;

        let mut this = Self {
            path: path.clone(),
            options: options.clone(),
            mode: Mode::Closed,
            was_mapped: false,
        };

        let file_len = file.metadata()?.len();
        let window = options
            .initial_mapped_size
            .max(file_len.next_power_of_two());

        if options.read_only || window > options.max_mapped_size {
            debug!(path = %path.display(), file_len, "data file not mapped");
            this.mode = Mode::Classic(ClassicFile::from_parts(file, path, options, 0, false));
            return Ok(this);
        }

        match Self::map(&file, window) {
            Ok(map) => {
                debug!(path = %path.display(), window, "mapped data file");
                this.mode = Mode::Mapped(MappedWindow {
                    file,
                    map,
                    position: 0,
                });
                this.was_mapped = true;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "mapping refused, using classic access");
                this.mode = Mode::Classic(ClassicFile::from_parts(file, path, options, 0, false));
            }
        }
        Ok(this)
    }

    /// Extends the file to at least `size` bytes and maps all of it.
    fn map(file: &StdFile, size: u64) -> std::io::Result<MmapMut> {
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can be
        // modified externally. This is safe because:
        // 1. The data file is owned by one cache and not shared with other processes
        // 2. The map lives inside MappedWindow next to its file and is dropped before
        //    any remap, so no slice into an old mapping can outlive it
        // 3. Every access bounds-checks against map.len() before slicing
        unsafe { MmapMut::map_mut(file) }
    }

    /// Size of the current mapped window, if mapped.
    pub fn window_size(&self) -> Option<u64> {
        match &self.mode {
            Mode::Mapped(w) => Some(w.map.len() as u64),
            _ => None,
        }
    }

    /// Grows the window so that `end` bytes are addressable.
    fn enlarge_buffer(&mut self, end: u64) -> FileResult<()> {
        let new_size = end.next_power_of_two();
        if new_size > self.options.max_mapped_size {
            return self.degrade("mapped window would exceed ceiling");
        }

        let remapped = match &mut self.mode {
            Mode::Mapped(w) => {
                w.map.flush()?;
                Self::map(&w.file, new_size)
            }
            _ => return Ok(()),
        };

        match remapped {
            Ok(map) => {
                if let Mode::Mapped(w) = &mut self.mode {
                    w.map = map;
                }
                debug!(path = %self.path.display(), window = new_size, "enlarged mapped window");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "remap failed");
                self.degrade("remap failed")
            }
        }
    }

    /// Permanently switches to classic access at the current cursor.
    fn degrade(&mut self, reason: &str) -> FileResult<()> {
        if let Mode::Mapped(w) = &mut self.mode {
            w.map.flush()?;
            let file = w.file.try_clone()?;
            let position = w.position;
            warn!(
                path = %self.path.display(),
                reason,
                position,
                "falling back to classic file access"
            );
            self.mode = Mode::Classic(ClassicFile::from_parts(
                file,
                self.path.clone(),
                &self.options,
                position,
                true,
            ));
        }
        Ok(())
    }

    /// Makes `len` bytes at the cursor writable, degrading if needed.
    fn prepare(&mut self, len: usize) -> FileResult<()> {
        let end = match &self.mode {
            Mode::Mapped(w) => w.position + len as u64,
            Mode::Classic(_) => return Ok(()),
            Mode::Closed => return Err(FileError::Closed),
        };
        let mapped_len = match &self.mode {
            Mode::Mapped(w) => w.map.len() as u64,
            _ => 0,
        };
        if end > mapped_len {
            self.enlarge_buffer(end)?;
        }
        Ok(())
    }
}

impl ScaledFile for MappedFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn scale(&self) -> u32 {
        self.options.scale
    }

    fn seek(&mut self, position: u64) -> FileResult<()> {
        let scale = self.options.scale;
        match &mut self.mode {
            Mode::Mapped(w) => {
                w.position = unit_to_byte(position, scale);
                Ok(())
            }
            Mode::Classic(c) => c.seek(position),
            Mode::Closed => Err(FileError::Closed),
        }
    }

    fn file_pointer(&self) -> u64 {
        match &self.mode {
            Mode::Mapped(w) => byte_to_unit(w.position, self.options.scale),
            Mode::Classic(c) => c.file_pointer(),
            Mode::Closed => 0,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> FileResult<()> {
        match &mut self.mode {
            Mode::Mapped(w) => {
                // The window covers the whole file; reads never grow it.
                let available = (w.map.len() as u64).saturating_sub(w.position);
                if (buf.len() as u64) > available {
                    return Err(FileError::short_read(buf.len(), available as usize));
                }
                let start = w.position as usize;
                buf.copy_from_slice(&w.map[start..start + buf.len()]);
                w.position += buf.len() as u64;
                Ok(())
            }
            Mode::Classic(c) => c.read(buf),
            Mode::Closed => Err(FileError::Closed),
        }
    }

    fn write(&mut self, buf: &[u8]) -> FileResult<()> {
        self.prepare(buf.len())?;
        match &mut self.mode {
            Mode::Mapped(w) => {
                let start = w.position as usize;
                w.map[start..start + buf.len()].copy_from_slice(buf);
                w.position += buf.len() as u64;
                Ok(())
            }
            Mode::Classic(c) => c.write(buf),
            Mode::Closed => Err(FileError::Closed),
        }
    }

    fn length(&self) -> FileResult<u64> {
        match &self.mode {
            Mode::Mapped(w) => Ok(w.file.metadata()?.len()),
            Mode::Classic(c) => c.length(),
            Mode::Closed => Err(FileError::Closed),
        }
    }

    fn sync(&mut self) -> FileResult<()> {
        match &mut self.mode {
            Mode::Mapped(w) => {
                w.map.flush()?;
                Ok(())
            }
            Mode::Classic(c) => c.sync(),
            Mode::Closed => Ok(()),
        }
    }

    fn close(&mut self) -> FileResult<()> {
        match &mut self.mode {
            Mode::Mapped(w) => {
                w.map.flush()?;
                w.file.sync_all()?;
            }
            Mode::Classic(c) => c.close()?,
            Mode::Closed => return Ok(()),
        }
        self.mode = Mode::Closed;
        debug!(path = %self.path.display(), "closed mapped data file");
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        matches!(self.mode, Mode::Mapped(_))
    }

    fn was_mapped(&self) -> bool {
        self.was_mapped
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Mode::Mapped(w) = &self.mode {
            if let Err(e) = w.map.flush() {
                warn!(error = %e, "flush of mapped window failed on drop");
            }
        }
    }
}
