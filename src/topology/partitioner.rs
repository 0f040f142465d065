//! Key to segment mapping.

use crate::types::SegmentId;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Maps keys to segments. Every key maps to exactly one segment.
pub trait KeyPartitioner: Send + Sync + std::fmt::Debug {
    /// Number of segments the key space is split into.
    fn num_segments(&self) -> u32;

    /// Segment for the given key.
    fn segment_of(&self, key: &[u8]) -> SegmentId;
}

/// Default partitioner: `xxhash64(key) mod num_segments`.
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    num_segments: u32,
}

impl HashPartitioner {
    /// Create a partitioner for the given segment count.
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments: num_segments.max(1),
        }
    }

    fn hash(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        hasher.finish()
    }
}

impl KeyPartitioner for HashPartitioner {
    fn num_segments(&self) -> u32 {
        self.num_segments
    }

    fn segment_of(&self, key: &[u8]) -> SegmentId {
        (Self::hash(key) % self.num_segments as u64) as SegmentId
    }
}
