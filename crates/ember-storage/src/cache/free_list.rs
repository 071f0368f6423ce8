//! Free space tracking for the data file.
//!
//! Freed row records become blocks in a bounded list. Allocation takes the
//! first block that is large enough and keeps the remainder if it is still
//! worth tracking. When the list is full the smallest block is forgotten;
//! its space is only recovered by defragmentation.

use ember_common::constants::{MAX_FREE_COUNT, MIN_FREE_FRAGMENT};
use tracing::debug;

/// A free region of the data file, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Byte offset of the block.
    pub offset: u64,
    /// Block size in bytes.
    pub size: usize,
}

/// Bounded first-fit free list.
#[derive(Debug)]
pub struct FreeList {
    blocks: Vec<FreeBlock>,
    capacity: usize,
    /// Bytes given up because the list was full or the block too small.
    lost_bytes: u64,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new(MAX_FREE_COUNT)
    }
}

impl FreeList {
    /// Creates a free list holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: Vec::new(),
            capacity: capacity.max(1),
            lost_bytes: 0,
        }
    }

    /// Number of tracked blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if no block is tracked.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes held by tracked blocks.
    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    /// Bytes dropped from tracking.
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Returns a block to the list.
    pub fn add(&mut self, offset: u64, size: usize) {
        if size < MIN_FREE_FRAGMENT {
            self.lost_bytes += size as u64;
            return;
        }

        if self.blocks.len() < self.capacity {
            self.blocks.push(FreeBlock { offset, size });
            return;
        }

        let smallest = self
            .blocks
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.size)
            .map(|(i, b)| (i, b.size));

        match smallest {
            Some((i, smallest)) if smallest < size => {
                debug!(dropped = smallest, kept = size, "free list full, dropping smallest block");
                self.lost_bytes += smallest as u64;
                self.blocks[i] = FreeBlock { offset, size };
            }
            _ => self.lost_bytes += size as u64,
        }
    }

    /// Takes `size` bytes from the first block large enough.
    pub fn take(&mut self, size: usize) -> Option<u64> {
        let i = self.blocks.iter().position(|b| b.size >= size)?;
        let block = self.blocks[i];
        let leftover = block.size - size;

        if leftover >= MIN_FREE_FRAGMENT {
            self.blocks[i] = FreeBlock {
                offset: block.offset + size as u64,
                size: leftover,
            };
        } else {
            self.blocks.remove(i);
            self.lost_bytes += leftover as u64;
        }
        Some(block.offset)
    }

    /// Forgets every block.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.lost_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_split() {
        let mut list = FreeList::new(4);
        list.add(100, 64);
        list.add(200, 128);

        assert_eq!(list.take(96), Some(200));
        assert_eq!(list.len(), 2);
        assert_eq!(list.take(64), Some(100));
        // 32 bytes remain at 296
        assert_eq!(list.take(32), Some(296));
        assert!(list.is_empty());
        assert_eq!(list.lost_bytes(), 0);

        list.add(400, 40);
        assert_eq!(list.take(16), Some(400));
        assert_eq!(list.lost_bytes(), 24);
    }

    #[test]
    fn test_small_blocks_are_dropped() {
        let mut list = FreeList::new(4);
        list.add(100, 16);
        assert!(list.is_empty());
        assert_eq!(list.lost_bytes(), 16);
        assert_eq!(list.take(8), None);
    }

    #[test]
    fn test_full_list_discards_smallest() {
        let mut list = FreeList::new(2);
        list.add(0, 40);
        list.add(100, 80);
        list.add(200, 60);
        assert_eq!(list.len(), 2);
        assert_eq!(list.free_bytes(), 140);

        list.add(300, 32);
        assert_eq!(list.free_bytes(), 140);
        assert_eq!(list.lost_bytes(), 72);
    }
}
