//! Free block pool
//!
//! Index of reclaimed byte ranges in the record region, kept sorted by
//! `(size, offset)` so allocation is a binary search for the best fit.
//! Capacity is `2^fpow`; on overflow adjacent entries are coalesced first
//! and then the smallest entries are dropped. Dropped ranges stay marked
//! free on disk and are picked up again by defragmentation or a rebuild.
//!
//! Every entry handed out is bounds-checked against the record region so a
//! corrupt pool surfaces as an error instead of an out-of-range write.

use crate::format::{read_u32, read_u64, POOL_ENTRY_SIZE, POOL_PREFIX_SIZE};

/// A reclaimed byte range in the record region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeBlock {
    pub offset: u64,
    pub size: u64,
}

impl FreeBlock {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.offset < end && start < self.end()
    }
}

/// Size-sorted, bounded pool of free blocks.
#[derive(Debug, Clone)]
pub struct FreePool {
    /// Sorted by (size, offset)
    blocks: Vec<FreeBlock>,
    capacity: usize,
    /// First valid offset (start of the record region)
    frec: u64,
}

impl FreePool {
    pub fn new(capacity: usize, frec: u64) -> Self {
        Self { blocks: Vec::new(), capacity, frec }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes indexed by the pool.
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &FreeBlock> {
        self.blocks.iter()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    fn sort_key(block: &FreeBlock) -> (u64, u64) {
        (block.size, block.offset)
    }

    /// Add a block. Returns how many entries were dropped to stay within
    /// capacity (0 in the common case).
    pub fn insert(&mut self, block: FreeBlock) -> usize {
        if self.capacity == 0 {
            return 1;
        }
        let key = Self::sort_key(&block);
        let at = self.blocks.partition_point(|b| Self::sort_key(b) < key);
        self.blocks.insert(at, block);

        if self.blocks.len() <= self.capacity {
            return 0;
        }
        self.coalesce();
        let mut dropped = 0;
        while self.blocks.len() > self.capacity {
            self.blocks.remove(0);
            dropped += 1;
        }
        dropped
    }

    /// Merge entries that touch each other. Merged sizes never exceed what a
    /// block prefix can describe.
    fn coalesce(&mut self) {
        self.blocks.sort_by_key(|b| b.offset);
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == block.offset && last.size + block.size <= u32::MAX as u64 => {
                    last.size += block.size;
                }
                _ => merged.push(block),
            }
        }
        merged.sort_by_key(Self::sort_key);
        self.blocks = merged;
    }

    /// Remove and return the smallest block of at least `size` bytes.
    ///
    /// `Err` means the chosen entry lies outside `[frec, fsiz)`; the entry is
    /// discarded either way.
    pub fn take_best_fit(&mut self, size: u64, fsiz: u64) -> Result<Option<FreeBlock>, String> {
        let at = self.blocks.partition_point(|b| b.size < size);
        if at >= self.blocks.len() {
            return Ok(None);
        }
        let block = self.blocks.remove(at);
        if block.offset < self.frec || block.end() > fsiz {
            return Err(format!(
                "free block {}+{} outside record region [{}, {})",
                block.offset, block.size, self.frec, fsiz
            ));
        }
        Ok(Some(block))
    }

    /// Remove the entry ending exactly at `end`, if any.
    pub fn take_ending_at(&mut self, end: u64) -> Option<FreeBlock> {
        let at = self.blocks.iter().position(|b| b.end() == end)?;
        Some(self.blocks.remove(at))
    }

    /// Drop every entry overlapping `[start, end)`. Returns how many went.
    pub fn remove_overlapping(&mut self, start: u64, end: u64) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|b| !b.overlaps(start, end));
        before - self.blocks.len()
    }

    /// Serialized pool region: u32 count, u32 reserved, then
    /// `(u64 offset, u64 size)` pairs. Slots past the count are left as-is
    /// on disk.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(POOL_PREFIX_SIZE + self.blocks.len() * POOL_ENTRY_SIZE);
        buf.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        for block in &self.blocks {
            buf.extend_from_slice(&block.offset.to_le_bytes());
            buf.extend_from_slice(&block.size.to_le_bytes());
        }
        buf
    }

    /// Parse a persisted pool region. Entries that are empty, outside
    /// `[frec, fsiz)` or overlapping an earlier entry are rejected; the
    /// second value counts them.
    pub fn decode(bytes: &[u8], capacity: usize, frec: u64, fsiz: u64) -> (Self, usize) {
        let mut pool = Self::new(capacity, frec);
        if bytes.len() < POOL_PREFIX_SIZE {
            return (pool, 0);
        }
        let stored = read_u32(bytes, 0) as usize;
        let available = (bytes.len() - POOL_PREFIX_SIZE) / POOL_ENTRY_SIZE;
        let count = stored.min(capacity).min(available);
        let mut rejected = stored - count;

        let mut entries: Vec<FreeBlock> = (0..count)
            .map(|i| {
                let at = POOL_PREFIX_SIZE + i * POOL_ENTRY_SIZE;
                FreeBlock { offset: read_u64(bytes, at), size: read_u64(bytes, at + 8) }
            })
            .collect();
        entries.sort_by_key(|b| b.offset);

        let mut last_end = frec;
        for block in entries {
            let in_bounds = block.size > 0
                && block.offset >= last_end
                && block.offset.checked_add(block.size).map_or(false, |end| end <= fsiz);
            if in_bounds {
                last_end = block.end();
                pool.blocks.push(block);
            } else {
                rejected += 1;
            }
        }
        pool.blocks.sort_by_key(Self::sort_key);
        (pool, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u64, size: u64) -> FreeBlock {
        FreeBlock { offset, size }
    }

    #[test]
    fn test_best_fit_picks_smallest_sufficient() {
        let mut pool = FreePool::new(16, 1000);
        pool.insert(block(1000, 64));
        pool.insert(block(2000, 32));
        pool.insert(block(3000, 128));

        assert_eq!(pool.take_best_fit(40, 10_000).unwrap(), Some(block(1000, 64)));
        assert_eq!(pool.take_best_fit(200, 10_000).unwrap(), None);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_out_of_bounds_entry_rejected_on_allocation() {
        let mut pool = FreePool::new(16, 1000);
        pool.insert(block(4000, 64));
        assert!(pool.take_best_fit(16, 2000).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_overflow_coalesces_before_dropping() {
        let mut pool = FreePool::new(2, 0);
        pool.insert(block(0, 16));
        pool.insert(block(16, 16));
        let dropped = pool.insert(block(64, 16));
        assert_eq!(dropped, 0);
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().any(|b| *b == block(0, 32)));
    }

    #[test]
    fn test_overflow_drops_smallest() {
        let mut pool = FreePool::new(2, 0);
        pool.insert(block(0, 16));
        pool.insert(block(100, 64));
        let dropped = pool.insert(block(300, 32));
        assert_eq!(dropped, 1);
        assert!(pool.iter().all(|b| b.size >= 32));
    }

    #[test]
    fn test_encode_decode_rejects_overlaps() {
        let mut pool = FreePool::new(8, 100);
        pool.insert(block(100, 50));
        pool.insert(block(300, 20));
        let mut bytes = pool.encode();
        // Append a third entry overlapping the first and bump the count.
        bytes.extend_from_slice(&120u64.to_le_bytes());
        bytes.extend_from_slice(&10u64.to_le_bytes());
        bytes[0..4].copy_from_slice(&3u32.to_le_bytes());

        let (loaded, rejected) = FreePool::decode(&bytes, 8, 100, 1000);
        assert_eq!(rejected, 1);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.total_size(), 70);
    }

    #[test]
    fn test_take_ending_at_and_remove_overlapping() {
        let mut pool = FreePool::new(8, 0);
        pool.insert(block(0, 16));
        pool.insert(block(32, 16));
        pool.insert(block(96, 32));

        assert_eq!(pool.take_ending_at(128), Some(block(96, 32)));
        assert_eq!(pool.remove_overlapping(8, 40), 2);
        assert!(pool.is_empty());
    }
}
