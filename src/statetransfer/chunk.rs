//! State chunks exchanged between providers and consumers.

use crate::types::{CacheEntry, SegmentId};
use serde::{Deserialize, Serialize};

/// Why state is being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferMode {
    /// Ordinary rebalance: the receiver applies entries to its storage.
    Rebalance,
    /// Post-merge conflict resolution: the receiver collects every
    /// owner's copy for comparison and applies nothing directly.
    ConflictResolution,
}

/// A batch of entries from one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChunk {
    /// Segment the entries belong to.
    pub segment: SegmentId,

    /// Position of this chunk within its segment, starting at 0.
    pub sequence: u64,

    /// Entries in this chunk.
    pub entries: Vec<CacheEntry>,

    /// Whether this is the segment's final chunk.
    pub is_last_chunk: bool,
}

impl StateChunk {
    /// Create a new chunk.
    pub fn new(segment: SegmentId, sequence: u64, entries: Vec<CacheEntry>, is_last_chunk: bool) -> Self {
        Self {
            segment,
            sequence,
            entries,
            is_last_chunk,
        }
    }

    /// Create an empty final chunk.
    pub fn empty_last(segment: SegmentId, sequence: u64) -> Self {
        Self::new(segment, sequence, Vec::new(), true)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chunk carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_constructors() {
        let chunk = StateChunk::new(3, 0, vec![CacheEntry::new("k", "v")], false);
        assert_eq!(chunk.len(), 1);
        assert!(!chunk.is_last_chunk);

        let last = StateChunk::empty_last(3, 1);
        assert!(last.is_empty());
        assert!(last.is_last_chunk);
        assert_eq!(last.sequence, 1);
    }
}
