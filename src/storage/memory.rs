//! In-memory segmented storage.

use crate::storage::{DataContainer, SegmentScan};
use crate::types::{CacheEntry, SegmentId, SegmentSet};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

type Segment = BTreeMap<Bytes, CacheEntry>;

/// Storage keeping one ordered map per allocated segment.
#[derive(Debug)]
pub struct InMemoryDataContainer {
    /// Indexed by segment id; `None` means not allocated.
    segments: Vec<RwLock<Option<Segment>>>,
}

impl InMemoryDataContainer {
    /// Create a container with no segments allocated.
    pub fn new(num_segments: u32) -> Self {
        Self {
            segments: (0..num_segments).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Total entries across all segments.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.read().as_ref().map_or(0, |m| m.len()))
            .sum()
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, segment: SegmentId) -> Option<&RwLock<Option<Segment>>> {
        self.segments.get(segment as usize)
    }
}

impl DataContainer for InMemoryDataContainer {
    fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    fn get(&self, segment: SegmentId, key: &[u8]) -> Option<CacheEntry> {
        let slot = self.slot(segment)?.read();
        slot.as_ref()?
            .get(key)
            .filter(|e| !e.metadata.is_expired())
            .cloned()
    }

    fn write(&self, segment: SegmentId, entry: CacheEntry) {
        if let Some(slot) = self.slot(segment) {
            slot.write()
                .get_or_insert_with(BTreeMap::new)
                .insert(entry.key.clone(), entry);
        }
    }

    fn remove(&self, segment: SegmentId, key: &[u8]) -> Option<CacheEntry> {
        let mut slot = self.slot(segment)?.write();
        slot.as_mut()?.remove(key)
    }

    fn read_segment(&self, segment: SegmentId, after: Option<&[u8]>, limit: usize) -> SegmentScan {
        let Some(slot) = self.slot(segment) else {
            return SegmentScan {
                entries: Vec::new(),
                exhausted: true,
            };
        };
        let slot = slot.read();
        let Some(map) = slot.as_ref() else {
            return SegmentScan {
                entries: Vec::new(),
                exhausted: true,
            };
        };

        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut range = map
            .range::<[u8], _>((lower, Bound::Unbounded))
            .map(|(_, e)| e)
            .filter(|e| !e.metadata.is_expired());

        let entries: Vec<CacheEntry> = range.by_ref().take(limit).cloned().collect();
        let exhausted = range.next().is_none();

        SegmentScan { entries, exhausted }
    }

    fn segment_len(&self, segment: SegmentId) -> usize {
        self.slot(segment)
            .map_or(0, |s| s.read().as_ref().map_or(0, |m| m.len()))
    }

    fn add_segments(&self, segments: &SegmentSet) {
        for segment in segments {
            if let Some(slot) = self.slot(*segment) {
                slot.write().get_or_insert_with(BTreeMap::new);
            }
        }
    }

    fn remove_segments(&self, segments: &SegmentSet) {
        for segment in segments {
            if let Some(slot) = self.slot(*segment) {
                *slot.write() = None;
            }
        }
    }

    fn is_locally_owned(&self, segment: SegmentId) -> bool {
        self.slot(segment).map_or(false, |s| s.read().is_some())
    }

    fn segments(&self) -> SegmentSet {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.read().is_some())
            .map(|(i, _)| i as SegmentId)
            .collect()
    }
}
