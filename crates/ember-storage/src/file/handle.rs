//! Scaled file trait.

use std::path::Path;

use super::error::FileResult;

/// Random-access file addressed in fixed-size scale units.
///
/// `seek` and `file_pointer` work in scale units; the byte offset is the
/// unit address times [`ScaledFile::scale`]. Reads and writes are relative
/// to the current position and advance it. A scale of 1 makes units and
/// bytes identical; a scale of 8 lets a 32-bit stored position address
/// files up to 32 GB.
pub trait ScaledFile: Send {
    /// Returns the file path.
    fn path(&self) -> &Path;

    /// Returns the addressing unit in bytes.
    fn scale(&self) -> u32;

    /// Moves the cursor to the unit address `position`.
    fn seek(&mut self, position: u64) -> FileResult<()>;

    /// Returns the cursor as a unit address, rounded up to the next unit.
    fn file_pointer(&self) -> u64;

    /// Fills `buf` from the current position.
    ///
    /// Returns an error if the file ends before the buffer is filled.
    fn read(&mut self, buf: &mut [u8]) -> FileResult<()>;

    /// Writes all of `buf` at the current position.
    fn write(&mut self, buf: &[u8]) -> FileResult<()>;

    /// Returns the file length in bytes.
    fn length(&self) -> FileResult<u64>;

    /// Flushes buffered or mapped data to the operating system.
    fn sync(&mut self) -> FileResult<()>;

    /// Flushes and closes the file. Further calls fail with `Closed`.
    fn close(&mut self) -> FileResult<()>;

    /// Returns true while the memory-mapped fast path is in use.
    fn is_mapped(&self) -> bool;

    /// Returns true if the file was ever memory mapped, even after a
    /// fallback to classic access.
    fn was_mapped(&self) -> bool;

    /// Reads a big-endian i32.
    fn read_int(&mut self) -> FileResult<i32> {
        let mut buf = [0u8; 4];
        self.read(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Writes a big-endian i32.
    fn write_int(&mut self, value: i32) -> FileResult<()> {
        self.write(&value.to_be_bytes())
    }

    /// Reads a big-endian i64.
    fn read_long(&mut self) -> FileResult<i64> {
        let mut buf = [0u8; 8];
        self.read(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Writes a big-endian i64.
    fn write_long(&mut self, value: i64) -> FileResult<()> {
        self.write(&value.to_be_bytes())
    }
}

/// Converts a unit address to a byte offset.
#[inline]
pub(crate) fn unit_to_byte(position: u64, scale: u32) -> u64 {
    position * u64::from(scale)
}

/// Converts a byte offset to a unit address, rounding up.
#[inline]
pub(crate) fn byte_to_unit(offset: u64, scale: u32) -> u64 {
    let scale = u64::from(scale);
    (offset + scale - 1) / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion() {
        assert_eq!(unit_to_byte(4, 8), 32);
        assert_eq!(byte_to_unit(32, 8), 4);
        assert_eq!(byte_to_unit(33, 8), 5);
        assert_eq!(byte_to_unit(33, 1), 33);
    }
}
