//! Write and read sessions: transient handles binding a bundle to its
//! segment chain while it is being pushed to or streamed from disk.
//!
//! Sessions own per-bundle cursor state and, for reads, the read-ahead
//! cache slots. They are cheap to reuse across bundles and callers are
//! expected to do so; the read cache in particular is sized once.

use std::sync::Arc;

use crate::catalog::CatalogEntry;
use crate::diskio::ReadCacheSlot;

/// Tracks a multi-segment push from `push` through the tail segment.
#[derive(Debug, Default)]
pub struct WriteSession {
    pub(crate) entry: Option<CatalogEntry>,
    pub(crate) next_logical_segment: usize,
}

impl WriteSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments already submitted for this bundle.
    pub fn segments_pushed(&self) -> usize {
        self.next_logical_segment
    }

    /// Total segments in the chain reserved by `push`.
    pub fn total_segments(&self) -> usize {
        self.entry.as_ref().map_or(0, |entry| entry.chain.len())
    }
}

/// Holds a bundle popped from the catalog while it streams from disk.
#[derive(Debug, Default)]
pub struct ReadSession {
    pub(crate) entry: Option<CatalogEntry>,
    /// Segments consumed by the caller so far.
    pub(crate) next_logical_segment: usize,
    /// Segments submitted to the read-ahead pipeline so far.
    pub(crate) next_logical_segment_to_cache: usize,
    pub(crate) cache_read_index: usize,
    pub(crate) cache_write_index: usize,
    pub(crate) read_cache: Vec<Arc<ReadCacheSlot>>,
}

impl ReadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self) -> Option<&CatalogEntry> {
        self.entry.as_ref()
    }

    pub fn bundle_size(&self) -> u64 {
        self.entry.as_ref().map_or(0, |entry| entry.bundle_size)
    }

    pub fn chain_len(&self) -> usize {
        self.entry.as_ref().map_or(0, |entry| entry.chain.len())
    }

    /// True once every segment of the held bundle has been consumed.
    pub fn fully_consumed(&self) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|entry| self.next_logical_segment == entry.chain.len())
    }

    pub(crate) fn reset_cursors(&mut self, cache_depth: usize) {
        self.next_logical_segment = 0;
        self.next_logical_segment_to_cache = 0;
        self.cache_read_index = 0;
        self.cache_write_index = 0;
        while self.read_cache.len() < cache_depth {
            self.read_cache.push(ReadCacheSlot::new());
        }
    }
}
