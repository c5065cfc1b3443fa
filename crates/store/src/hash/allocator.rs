//! Free-block pool for the record area.
//!
//! Freed record blocks are remembered here so later writes can reuse them.
//! Allocation is best-fit: the smallest block that is large enough. The pool
//! holds at most `capacity` blocks; when it overflows the smallest block is
//! forgotten and its space stays unused until the table is rebuilt.
//!
//! The pool lives in memory and is written to the pool region of the file on
//! sync and close. After an unclean shutdown it is discarded.

use std::collections::{BTreeMap, BTreeSet};

/// Bounded best-fit pool of free blocks.
#[derive(Debug, Clone, Default)]
pub struct FreePool {
    /// `(size, offset)`, so the first entry at or above a size is the best fit.
    by_size: BTreeSet<(u64, u64)>,
    /// `offset -> size`, for coalescing and tail lookups.
    by_offset: BTreeMap<u64, u64>,
    capacity: usize,
    defrag_unit: u32,
    releases: u32,
    dropped: u64,
}

impl FreePool {
    /// Creates an empty pool.
    pub fn new(capacity: usize, defrag_unit: u32) -> Self {
        Self { capacity, defrag_unit, ..Self::default() }
    }

    /// Creates a pool holding `blocks`, as loaded from the file.
    pub fn from_blocks(blocks: Vec<(u64, u64)>, capacity: usize, defrag_unit: u32) -> Self {
        let mut pool = Self::new(capacity, defrag_unit);
        for (offset, size) in blocks {
            pool.insert(offset, size);
        }
        pool.enforce_capacity();
        pool
    }

    /// Number of pooled blocks.
    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    /// Returns true if nothing is pooled.
    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    /// Total pooled bytes.
    pub fn free_bytes(&self) -> u64 {
        self.by_offset.values().sum()
    }

    /// Blocks forgotten because the pool was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Takes the smallest block of at least `size` bytes.
    pub fn take(&mut self, size: u64) -> Option<(u64, u64)> {
        let &(block_size, offset) = self.by_size.range((size, 0)..).next()?;
        self.remove(offset, block_size);
        Some((offset, block_size))
    }

    /// Returns a block to the pool.
    ///
    /// Returns true when the defragmentation unit has been reached and the
    /// caller should run [`FreePool::coalesce`].
    pub fn release(&mut self, offset: u64, size: u64) -> bool {
        self.insert(offset, size);
        self.enforce_capacity();
        if self.defrag_unit == 0 {
            return false;
        }
        self.releases += 1;
        if self.releases >= self.defrag_unit {
            self.releases = 0;
            return true;
        }
        false
    }

    /// Removes and returns the block that ends exactly at `end`, if any.
    pub fn take_ending_at(&mut self, end: u64) -> Option<(u64, u64)> {
        let (&offset, &size) = self.by_offset.range(..end).next_back()?;
        if offset + size != end {
            return None;
        }
        self.remove(offset, size);
        Some((offset, size))
    }

    /// Merges physically adjacent blocks whose combined size stays below
    /// `max_block`. Returns the merged blocks so their headers can be rewritten.
    pub fn coalesce(&mut self, max_block: u64) -> Vec<(u64, u64)> {
        let mut merged = Vec::new();
        let blocks: Vec<(u64, u64)> = self.by_offset.iter().map(|(&o, &s)| (o, s)).collect();
        let mut iter = blocks.into_iter().peekable();
        while let Some((offset, mut size)) = iter.next() {
            let mut grew = false;
            while let Some(&(next_offset, next_size)) = iter.peek() {
                if offset + size != next_offset || size + next_size > max_block {
                    break;
                }
                self.remove(next_offset, next_size);
                size += next_size;
                grew = true;
                iter.next();
            }
            if grew {
                let old = self.by_offset.get(&offset).copied().unwrap_or(0);
                self.remove(offset, old);
                self.insert(offset, size);
                merged.push((offset, size));
            }
        }
        merged
    }

    /// Pooled blocks in offset order, at most `capacity` of them.
    pub fn blocks(&self) -> Vec<(u64, u64)> {
        self.by_offset.iter().map(|(&o, &s)| (o, s)).collect()
    }

    /// Forgets every block.
    pub fn clear(&mut self) {
        self.by_size.clear();
        self.by_offset.clear();
        self.releases = 0;
    }

    fn insert(&mut self, offset: u64, size: u64) {
        self.by_size.insert((size, offset));
        self.by_offset.insert(offset, size);
    }

    fn remove(&mut self, offset: u64, size: u64) {
        self.by_size.remove(&(size, offset));
        self.by_offset.remove(&offset);
    }

    fn enforce_capacity(&mut self) {
        while self.by_offset.len() > self.capacity {
            let Some(&(size, offset)) = self.by_size.iter().next() else {
                break;
            };
            self.remove(offset, size);
            self.dropped += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_best_fit() {
        let mut pool = FreePool::new(16, 0);
        pool.release(1000, 64);
        pool.release(2000, 32);
        pool.release(3000, 128);

        assert_eq!(pool.take(40), Some((1000, 64)));
        assert_eq!(pool.take(32), Some((2000, 32)));
        assert_eq!(pool.take(256), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_overflow_drops_smallest() {
        let mut pool = FreePool::new(2, 0);
        pool.release(100, 48);
        pool.release(200, 16);
        pool.release(300, 32);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.dropped(), 1);
        assert_eq!(pool.blocks(), vec![(100, 48), (300, 32)]);
    }

    #[test]
    fn test_defrag_unit_triggers_and_coalesces() {
        let mut pool = FreePool::new(16, 3);
        assert!(!pool.release(100, 16));
        assert!(!pool.release(116, 16));
        assert!(pool.release(132, 32));
        assert!(!pool.release(500, 16));

        let merged = pool.coalesce(u64::from(u32::MAX));
        assert_eq!(merged, vec![(100, 64)]);
        assert_eq!(pool.blocks(), vec![(100, 64), (500, 16)]);
        assert_eq!(pool.free_bytes(), 80);
    }

    #[test]
    fn test_coalesce_respects_max_block() {
        let mut pool = FreePool::new(16, 0);
        pool.release(0, 32);
        pool.release(32, 32);
        pool.release(64, 32);
        assert_eq!(pool.coalesce(64), vec![(0, 64)]);
        assert_eq!(pool.blocks(), vec![(0, 64), (64, 32)]);
    }

    #[test]
    fn test_take_ending_at() {
        let mut pool = FreePool::new(16, 0);
        pool.release(100, 20);
        assert_eq!(pool.take_ending_at(119), None);
        assert_eq!(pool.take_ending_at(120), Some((100, 20)));
        assert!(pool.is_empty());
    }
}
