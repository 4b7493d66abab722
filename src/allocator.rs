//! Segment allocator: a 64-ary tree of bitmap words over the segment id
//! space (bit set = free). The tree exists to make "find first free"
//! O(depth) instead of a scan over the whole leaf bitmap.
//!
//! `alloc_chain` hands out monotonically increasing ids within one call, so
//! the restore scan can reconstruct allocation order from the disk image
//! alone. All mutating operations are all-or-none. A poisoned lock is
//! reported as `Error::Corrupt` rather than cascading a panic into every
//! caller.

use std::sync::{Mutex, MutexGuard};

use crate::segment::{SegmentId, SEGMENT_ID_NONE};
use crate::{Error, Result};

const WORD_BITS: u32 = 64;

/// Leaf-level bitmap copy used by tests to compare allocator state across a
/// restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorSnapshot {
    leaf: Vec<u64>,
}

#[derive(Debug)]
struct TreeBitmap {
    /// `levels[0]` is the single root word; the last level is the leaf
    /// bitmap with one bit per segment id.
    levels: Vec<Vec<u64>>,
    total_segments: u32,
}

impl TreeBitmap {
    fn new(total_segments: u32) -> Self {
        let mut level_words = Vec::new();
        let mut words = (total_segments as usize).div_ceil(WORD_BITS as usize).max(1);
        level_words.push(words);
        while words > 1 {
            words = words.div_ceil(WORD_BITS as usize);
            level_words.push(words);
        }
        level_words.reverse();

        let mut levels: Vec<Vec<u64>> = level_words.iter().map(|&n| vec![0u64; n]).collect();

        // Mark every valid id free, then propagate occupancy upward.
        let leaf_ix = levels.len() - 1;
        for id in 0..total_segments {
            let word = (id / WORD_BITS) as usize;
            levels[leaf_ix][word] |= 1u64 << (id % WORD_BITS);
        }
        for level in (1..levels.len()).rev() {
            for word in 0..levels[level].len() {
                if levels[level][word] != 0 {
                    levels[level - 1][word / WORD_BITS as usize] |=
                        1u64 << (word as u32 % WORD_BITS);
                }
            }
        }

        Self {
            levels,
            total_segments,
        }
    }

    fn first_free(&self) -> Option<SegmentId> {
        let mut word_ix = 0usize;
        for level in &self.levels {
            let word = level[word_ix];
            if word == 0 {
                return None;
            }
            word_ix = word_ix * WORD_BITS as usize + word.trailing_zeros() as usize;
        }
        let id = word_ix as u32;
        debug_assert!(id < self.total_segments);
        Some(id)
    }

    fn is_free(&self, id: SegmentId) -> bool {
        if id >= self.total_segments {
            return false;
        }
        let leaf = self.levels.last().expect("at least one level");
        leaf[(id / WORD_BITS) as usize] & (1u64 << (id % WORD_BITS)) != 0
    }

    fn mark_used(&mut self, id: SegmentId) {
        let mut word_ix = (id / WORD_BITS) as usize;
        let mut bit = id % WORD_BITS;
        for level in (0..self.levels.len()).rev() {
            let word = &mut self.levels[level][word_ix];
            *word &= !(1u64 << bit);
            if *word != 0 || level == 0 {
                break;
            }
            bit = word_ix as u32 % WORD_BITS;
            word_ix /= WORD_BITS as usize;
        }
    }

    fn mark_free(&mut self, id: SegmentId) {
        let mut word_ix = (id / WORD_BITS) as usize;
        let mut bit = id % WORD_BITS;
        for level in (0..self.levels.len()).rev() {
            let word = &mut self.levels[level][word_ix];
            let was_empty = *word == 0;
            *word |= 1u64 << bit;
            if !was_empty || level == 0 {
                break;
            }
            bit = word_ix as u32 % WORD_BITS;
            word_ix /= WORD_BITS as usize;
        }
    }
}

#[derive(Debug)]
pub struct SegmentAllocator {
    tree: Mutex<TreeBitmap>,
}

impl SegmentAllocator {
    pub fn new(total_segments: u32) -> Self {
        assert!(
            total_segments < SEGMENT_ID_NONE,
            "segment id space reserves u32::MAX"
        );
        Self {
            tree: Mutex::new(TreeBitmap::new(total_segments)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, TreeBitmap>> {
        self.tree
            .lock()
            .map_err(|_| Error::Corrupt("segment allocator lock poisoned"))
    }

    /// Reserves `count` segment ids, lowest-first. Returns `Ok(None)` (with
    /// no state change) when fewer than `count` ids are free.
    pub fn alloc_chain(&self, count: u64) -> Result<Option<Vec<SegmentId>>> {
        let mut tree = self.lock()?;
        let mut chain = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match tree.first_free() {
                Some(id) => {
                    tree.mark_used(id);
                    chain.push(id);
                }
                None => {
                    for id in chain {
                        tree.mark_free(id);
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(chain))
    }

    /// Claims one specific id. Used only by the restore scan.
    pub fn alloc_specific(&self, id: SegmentId) -> Result<bool> {
        let mut tree = self.lock()?;
        if !tree.is_free(id) {
            return Ok(false);
        }
        tree.mark_used(id);
        Ok(true)
    }

    /// Releases a whole chain. Returns `Ok(false)` (with no state change)
    /// if any id is not currently in use.
    pub fn free_chain(&self, ids: &[SegmentId]) -> Result<bool> {
        let mut tree = self.lock()?;
        if ids.iter().any(|&id| tree.is_free(id)) {
            return Ok(false);
        }
        for &id in ids {
            tree.mark_free(id);
        }
        Ok(true)
    }

    pub fn is_free(&self, id: SegmentId) -> Result<bool> {
        Ok(self.lock()?.is_free(id))
    }

    pub fn snapshot(&self) -> Result<AllocatorSnapshot> {
        let tree = self.lock()?;
        Ok(AllocatorSnapshot {
            leaf: tree.levels.last().expect("at least one level").clone(),
        })
    }

    pub fn is_backup_equal(&self, backup: &AllocatorSnapshot) -> Result<bool> {
        let tree = self.lock()?;
        Ok(*tree.levels.last().expect("at least one level") == backup.leaf)
    }
}
