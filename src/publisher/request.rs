//! Publisher request and response types.

use crate::types::{CacheEntry, SegmentId, SegmentSet, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Iteration semantics under segment reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryGuarantee {
    /// A segment reassigned mid-iteration loses its remaining entries.
    AtMostOnce,
    /// A lost segment is re-fetched from its new owner; duplicates are possible.
    AtLeastOnce,
    /// A lost segment is re-fetched excluding keys already delivered.
    ExactlyOnce,
}

impl DeliveryGuarantee {
    /// Whether lost segments are re-fetched.
    pub fn retries_lost_segments(&self) -> bool {
        !matches!(self, DeliveryGuarantee::AtMostOnce)
    }
}

/// Parameters of one distributed publisher request as sent to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherRequest {
    /// Unique id of this sub-request.
    pub request_id: String,

    /// Delivery guarantee.
    pub delivery_guarantee: DeliveryGuarantee,

    /// Maximum results per response.
    pub batch_size: usize,

    /// Segments the target should iterate, in order.
    pub segments: SegmentSet,

    /// If set, only these keys are returned.
    pub keys_to_include: Option<BTreeSet<Bytes>>,

    /// Keys never returned.
    pub keys_to_exclude: BTreeSet<Bytes>,

    /// Return whole entries rather than keys.
    pub entry_stream: bool,

    /// Associate every result with its originating key.
    pub track_keys: bool,

    /// Name of a transform registered on every node.
    pub transformer: Option<String>,
}

impl PublisherRequest {
    /// Create a request for the given segments with a fresh id.
    pub fn new(segments: SegmentSet, delivery_guarantee: DeliveryGuarantee, batch_size: usize) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            delivery_guarantee,
            batch_size,
            segments,
            keys_to_include: None,
            keys_to_exclude: BTreeSet::new(),
            entry_stream: true,
            track_keys: delivery_guarantee == DeliveryGuarantee::ExactlyOnce,
            transformer: None,
        }
    }

    /// Stream keys instead of entries.
    pub fn keys_only(mut self) -> Self {
        self.entry_stream = false;
        self
    }

    /// Restrict iteration to the given keys.
    pub fn with_keys_to_include(mut self, keys: BTreeSet<Bytes>) -> Self {
        self.keys_to_include = Some(keys);
        self
    }

    /// Skip the given keys.
    pub fn with_keys_to_exclude(mut self, keys: BTreeSet<Bytes>) -> Self {
        self.keys_to_exclude = keys;
        self
    }

    /// Apply a named transform on the target.
    pub fn with_transformer(mut self, name: impl Into<String>) -> Self {
        self.transformer = Some(name.into());
        self
    }

    /// Enable or disable key tracking.
    pub fn with_track_keys(mut self, track_keys: bool) -> Self {
        self.track_keys = track_keys;
        self
    }

    /// Copy of this request for a subset of segments under a fresh id.
    pub fn for_segments(&self, segments: SegmentSet) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            segments,
            ..self.clone()
        }
    }

    /// Whether a key passes the include and exclude filters.
    pub fn accepts(&self, key: &[u8]) -> bool {
        if self.keys_to_exclude.contains(key) {
            return false;
        }
        self.keys_to_include
            .as_ref()
            .map_or(true, |include| include.contains(key))
    }
}

/// A single result value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublisherItem {
    /// A key.
    Key(Bytes),
    /// A whole entry.
    Entry(CacheEntry),
    /// The output of a transform.
    Value(Bytes),
}

/// Number of results a segment contributed to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub segment: SegmentId,
    pub entry_count: usize,
}

/// One batch returned by a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherResponse {
    /// Results in iteration order.
    pub results: Vec<PublisherItem>,

    /// Originating key of each result, index aligned with `results`.
    /// Present only when the request tracks keys.
    pub keys: Option<Vec<Bytes>>,

    /// Segments fully iterated.
    pub completed_segments: SegmentSet,

    /// Segments this target stopped owning before finishing them.
    pub lost_segments: SegmentSet,

    /// Per segment result counts, in iteration order.
    pub segment_results: Vec<SegmentResult>,

    /// No segment is left on this target.
    pub complete: bool,

    /// Topology the target observed while building the batch.
    pub topology_id: TopologyId,
}

impl PublisherResponse {
    /// Pairs of (key, result) when keys are tracked.
    pub fn keyed_results(&self) -> Option<impl Iterator<Item = (&Bytes, &PublisherItem)>> {
        self.keys
            .as_ref()
            .map(|keys| keys.iter().zip(self.results.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        let request = PublisherRequest::new(SegmentSet::from([0, 1]), DeliveryGuarantee::AtLeastOnce, 10)
            .with_keys_to_include(BTreeSet::from([Bytes::from("a"), Bytes::from("b")]))
            .with_keys_to_exclude(BTreeSet::from([Bytes::from("b")]));

        assert!(request.accepts(b"a"));
        assert!(!request.accepts(b"b"));
        assert!(!request.accepts(b"c"));
    }

    #[test]
    fn test_exactly_once_tracks_keys() {
        let request = PublisherRequest::new(SegmentSet::new(), DeliveryGuarantee::ExactlyOnce, 10);
        assert!(request.track_keys);
        assert!(request.delivery_guarantee.retries_lost_segments());
        assert!(!DeliveryGuarantee::AtMostOnce.retries_lost_segments());

        let sub = request.for_segments(SegmentSet::from([4]));
        assert_ne!(sub.request_id, request.request_id);
        assert!(sub.track_keys);
    }

    #[test]
    fn test_keyed_results() {
        let response = PublisherResponse {
            results: vec![PublisherItem::Value(Bytes::from("1"))],
            keys: Some(vec![Bytes::from("k")]),
            ..Default::default()
        };
        let pairs: Vec<_> = response.keyed_results().unwrap().collect();
        assert_eq!(pairs[0].0, &Bytes::from("k"));
    }
}
