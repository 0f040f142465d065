//! Local entry storage consumed by state transfer and publishers.
//!
//! The grid only needs a narrow view of the storage engine: segment-scoped
//! reads in key order, idempotent upserts and segment allocation. Anything
//! implementing [`DataContainer`] can back a node; [`InMemoryDataContainer`]
//! is the default.

mod memory;

pub use memory::InMemoryDataContainer;

use crate::types::{CacheEntry, SegmentId, SegmentSet};

/// One page of a segment read.
#[derive(Debug, Clone, Default)]
pub struct SegmentScan {
    /// Entries in key order.
    pub entries: Vec<CacheEntry>,

    /// No entries remain after this page.
    pub exhausted: bool,
}

/// Segment-aware local storage.
pub trait DataContainer: Send + Sync + std::fmt::Debug {
    /// Number of segments.
    fn num_segments(&self) -> u32;

    /// Read a single entry.
    fn get(&self, segment: SegmentId, key: &[u8]) -> Option<CacheEntry>;

    /// Insert or replace an entry. Writing the same entry twice leaves the
    /// container unchanged.
    fn write(&self, segment: SegmentId, entry: CacheEntry);

    /// Remove an entry.
    fn remove(&self, segment: SegmentId, key: &[u8]) -> Option<CacheEntry>;

    /// Read up to `limit` live entries with keys strictly after `after`.
    fn read_segment(&self, segment: SegmentId, after: Option<&[u8]>, limit: usize) -> SegmentScan;

    /// Number of entries stored for a segment.
    fn segment_len(&self, segment: SegmentId) -> usize;

    /// Allocate storage for segments.
    fn add_segments(&self, segments: &SegmentSet);

    /// Drop segments and every entry they hold.
    fn remove_segments(&self, segments: &SegmentSet);

    /// Whether the segment is allocated on this node.
    fn is_locally_owned(&self, segment: SegmentId) -> bool;

    /// All allocated segments.
    fn segments(&self) -> SegmentSet;
}
