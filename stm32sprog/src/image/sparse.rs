//! Sparse firmware image.
//!
//! A firmware image rarely covers the whole address space: it is a handful
//! of contiguous runs of bytes with gaps between them. [`SparseImage`] keeps
//! those runs as an ordered, coalescing collection of blocks and streams
//! them back out in bounded chunks for the protocol driver.
//!
//! Invariants, maintained by every operation:
//!
//! - blocks are sorted by offset and pairwise neither overlap nor touch
//!   (touching blocks are merged on insertion, later writes winning),
//! - each block owns its bytes in one contiguous allocation,
//! - a cursor tracks the streaming position; [`SparseImage::rewind`] resets
//!   it and [`SparseImage::read`] never crosses a block boundary.

use std::collections::BTreeMap;
use std::mem;

use crate::error::{Error, Result};

/// A borrowed view of one contiguous run of image bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemBlock<'a> {
    /// Address of the first byte in the target address space.
    pub offset: u64,
    /// The bytes themselves.
    pub data: &'a [u8],
}

impl MemBlock<'_> {
    /// Number of bytes in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte address.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// An ordered, gap-tolerant, coalescing collection of memory blocks.
#[derive(Debug, Default, Clone)]
pub struct SparseImage {
    blocks: BTreeMap<u64, Vec<u8>>,
    cursor: u64,
}

impl SparseImage {
    /// Create an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `data` at `offset`, merging with any block it overlaps or
    /// touches. Overlapping addresses take the new bytes. Merging is
    /// transitive: one insert may fuse a whole run of neighbors.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let new_end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::InvalidArgument("block end overflows address space".into()))?;

        // Widen to the left if the predecessor reaches our first byte.
        let mut start = offset;
        if let Some((&key, block)) = self.blocks.range(..=offset).next_back() {
            if key + block.len() as u64 >= offset {
                start = key;
            }
        }

        // Every existing block starting inside [start, new_end] touches the
        // union, and nothing past new_end can (blocks never touch pairwise).
        let absorbed: Vec<u64> = self.blocks.range(start..=new_end).map(|(&k, _)| k).collect();
        let mut end = new_end;
        for &key in &absorbed {
            end = end.max(key + self.blocks[&key].len() as u64);
        }

        let mut merged = vec![0u8; (end - start) as usize];
        for key in absorbed {
            if let Some(block) = self.blocks.remove(&key) {
                let at = (key - start) as usize;
                merged[at..at + block.len()].copy_from_slice(&block);
            }
        }
        let at = (offset - start) as usize;
        merged[at..at + data.len()].copy_from_slice(data);

        self.blocks.insert(start, merged);
        Ok(())
    }

    /// Add `delta` to every block offset and to the cursor.
    ///
    /// Ordering is preserved; the cursor keeps its relative position inside
    /// the current block. Fails without modifying the image if any shifted
    /// offset would leave the address space.
    pub fn shift(&mut self, delta: i64) -> Result<()> {
        for (&key, block) in &self.blocks {
            key.checked_add_signed(delta)
                .and_then(|shifted| shifted.checked_add(block.len() as u64))
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("shift by {delta} leaves the address space"))
                })?;
        }

        self.blocks = mem::take(&mut self.blocks)
            .into_iter()
            .map(|(key, block)| (key.wrapping_add_signed(delta), block))
            .collect();
        self.cursor = self.cursor.wrapping_add_signed(delta);
        Ok(())
    }

    /// Sum of all block lengths; gaps do not count.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.blocks.values().map(|block| block.len() as u64).sum()
    }

    /// Whether the image holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Move the cursor back to the first byte of the first block.
    pub fn rewind(&mut self) {
        self.cursor = self.blocks.keys().next().copied().unwrap_or(0);
    }

    /// Return the next run of bytes at the cursor, at most `max_len` long
    /// and never crossing a block boundary, then advance the cursor.
    ///
    /// `max_len` of zero means "the rest of the current block". Returns
    /// `None` once every block has been drained.
    pub fn read(&mut self, max_len: usize) -> Option<MemBlock<'_>> {
        let cursor = self.cursor;
        let key = self
            .blocks
            .range(..=cursor)
            .next_back()
            .filter(|(&key, block)| cursor < key + block.len() as u64)
            .map(|(&key, _)| key)
            .or_else(|| self.blocks.range(cursor..).next().map(|(&key, _)| key))?;

        let block_end = key + self.blocks[&key].len() as u64;
        let pos = cursor.max(key);
        let available = (block_end - pos) as usize;
        let take = if max_len == 0 {
            available
        } else {
            available.min(max_len)
        };
        self.cursor = pos + take as u64;

        let lo = (pos - key) as usize;
        Some(MemBlock {
            offset: pos,
            data: &self.blocks[&key][lo..lo + take],
        })
    }

    /// Iterate over the blocks in address order without moving the cursor.
    pub fn blocks(&self) -> impl Iterator<Item = MemBlock<'_>> {
        self.blocks
            .iter()
            .map(|(&offset, data)| MemBlock { offset, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert the structural invariants: sorted, pairwise non-touching.
    fn assert_invariants(image: &SparseImage) {
        let mut prev_end: Option<u64> = None;
        for block in image.blocks() {
            assert!(!block.is_empty());
            if let Some(prev) = prev_end {
                assert!(
                    block.offset > prev,
                    "blocks at {prev:#x} and {:#x} touch or overlap",
                    block.offset
                );
            }
            prev_end = Some(block.end());
        }
    }

    #[test]
    fn test_insert_disjoint_blocks_stay_separate() {
        let mut image = SparseImage::new();
        image.insert(100, &[1; 10]).unwrap();
        image.insert(200, &[2; 10]).unwrap();

        assert_eq!(image.blocks().count(), 2);
        assert_eq!(image.total_size(), 20);
        assert_invariants(&image);
    }

    #[test]
    fn test_insert_touching_blocks_coalesce() {
        let mut image = SparseImage::new();
        image.insert(100, &[1; 10]).unwrap();
        image.insert(110, &[2; 10]).unwrap();

        assert_eq!(image.blocks().count(), 1);
        let block = image.blocks().next().unwrap();
        assert_eq!(block.offset, 100);
        assert_eq!(block.len(), 20);
        assert_invariants(&image);
    }

    #[test]
    fn test_later_write_wins_on_overlap() {
        // Three overlapping inserts: [100..200) ones, then [150..300) twos, then
        // [200..210) threes: one block [100..310), twos from 150, threes
        // winning over twos at [200..210).
        let mut image = SparseImage::new();
        image.insert(100, &[1; 100]).unwrap();
        image.insert(150, &[2; 150]).unwrap();
        image.insert(200, &[3; 10]).unwrap();

        assert_eq!(image.blocks().count(), 1);
        let block = image.blocks().next().unwrap();
        assert_eq!(block.offset, 100);
        assert_eq!(block.end(), 310);
        assert!(block.data[..50].iter().all(|&b| b == 1));
        assert!(block.data[50..100].iter().all(|&b| b == 2));
        assert!(block.data[100..110].iter().all(|&b| b == 3));
        assert!(block.data[110..210].iter().all(|&b| b == 2));
        assert_invariants(&image);
    }

    #[test]
    fn test_insert_before_existing_block_grows_left() {
        let mut image = SparseImage::new();
        image.insert(100, &[1; 10]).unwrap();
        image.insert(95, &[2; 8]).unwrap();

        let block = image.blocks().next().unwrap();
        assert_eq!(block.offset, 95);
        assert_eq!(block.len(), 15);
        assert!(block.data[..8].iter().all(|&b| b == 2));
        assert!(block.data[8..].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_insert_bridges_multiple_neighbors() {
        let mut image = SparseImage::new();
        image.insert(0, &[1; 4]).unwrap();
        image.insert(8, &[2; 4]).unwrap();
        image.insert(16, &[3; 4]).unwrap();
        // Spans all three, chain-merging them into one.
        image.insert(2, &[9; 15]).unwrap();

        assert_eq!(image.blocks().count(), 1);
        let block = image.blocks().next().unwrap();
        assert_eq!(block.offset, 0);
        assert_eq!(block.len(), 20);
        assert_eq!(&block.data[..2], &[1, 1]);
        assert!(block.data[2..17].iter().all(|&b| b == 9));
        assert_eq!(&block.data[17..], &[3, 3, 3]);
        assert_invariants(&image);
    }

    #[test]
    fn test_empty_insert_is_a_no_op() {
        let mut image = SparseImage::new();
        image.insert(100, &[]).unwrap();
        assert!(image.is_empty());
        assert_eq!(image.total_size(), 0);
    }

    #[test]
    fn test_insert_overflow_rejected() {
        let mut image = SparseImage::new();
        assert!(image.insert(u64::MAX - 2, &[0; 8]).is_err());
        assert!(image.is_empty());
    }

    #[test]
    fn test_total_size_counts_union_of_addresses() {
        let mut image = SparseImage::new();
        image.insert(0, &[1; 100]).unwrap();
        image.insert(50, &[2; 100]).unwrap(); // 50 overlapping bytes
        image.insert(1000, &[3; 10]).unwrap();

        assert_eq!(image.total_size(), 160);
    }

    #[test]
    fn test_read_never_crosses_block_boundary() {
        let mut image = SparseImage::new();
        image.insert(0, &[1; 300]).unwrap();
        image.insert(1000, &[2; 40]).unwrap();
        image.rewind();

        let first = image.read(256).unwrap();
        assert_eq!((first.offset, first.len()), (0, 256));
        let second = image.read(256).unwrap();
        assert_eq!((second.offset, second.len()), (256, 44));
        let third = image.read(256).unwrap();
        assert_eq!((third.offset, third.len()), (1000, 40));
        assert!(image.read(256).is_none());
    }

    #[test]
    fn test_full_drain_yields_total_size() {
        let mut image = SparseImage::new();
        image.insert(0, &[1; 300]).unwrap();
        image.insert(512, &[2; 100]).unwrap();
        image.rewind();

        let mut drained = 0u64;
        while let Some(block) = image.read(256) {
            assert!(block.len() <= 256);
            drained += block.len() as u64;
        }
        assert_eq!(drained, image.total_size());
    }

    #[test]
    fn test_read_zero_returns_rest_of_block() {
        let mut image = SparseImage::new();
        image.insert(0, &[1; 100]).unwrap();
        image.rewind();

        image.read(30).unwrap();
        let rest = image.read(0).unwrap();
        assert_eq!((rest.offset, rest.len()), (30, 70));
    }

    #[test]
    fn test_rewind_restarts_stream() {
        let mut image = SparseImage::new();
        image.insert(64, &[7; 16]).unwrap();
        image.rewind();
        assert_eq!(image.read(8).unwrap().offset, 64);
        image.rewind();
        assert_eq!(image.read(8).unwrap().offset, 64);
    }

    #[test]
    fn test_shift_round_trip_restores_offsets() {
        let mut image = SparseImage::new();
        image.insert(0, &[1; 10]).unwrap();
        image.insert(100, &[2; 10]).unwrap();

        image.shift(0x0800_0000).unwrap();
        let offsets: Vec<u64> = image.blocks().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0x0800_0000, 0x0800_0064]);

        image.shift(-0x0800_0000).unwrap();
        let offsets: Vec<u64> = image.blocks().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 100]);
    }

    #[test]
    fn test_shift_moves_cursor_with_blocks() {
        let mut image = SparseImage::new();
        image.insert(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        image.rewind();
        image.read(4).unwrap();

        image.shift(1000).unwrap();
        let rest = image.read(4).unwrap();
        assert_eq!(rest.offset, 1004);
        assert_eq!(rest.data, &[5, 6, 7, 8]);
    }

    #[test]
    fn test_shift_underflow_rejected() {
        let mut image = SparseImage::new();
        image.insert(10, &[1; 4]).unwrap();
        assert!(image.shift(-100).is_err());
        // Image unchanged on failure.
        assert_eq!(image.blocks().next().unwrap().offset, 10);
    }
}
