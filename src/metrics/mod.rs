//! Metrics for state transfer, rebalancing and distributed iteration.
//!
//! Every grid node owns one [`GridMetrics`] instance shared by its components.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       GridMetrics                        │
//! │  ┌────────────────┐ ┌────────────────┐ ┌──────────────┐  │
//! │  │ State transfer │ │  Rebalancing   │ │  Publisher   │  │
//! │  │ - chunks       │ │ - started      │ │ - batches    │  │
//! │  │ - stale drops  │ │ - committed    │ │ - lost segs  │  │
//! │  │ - cancels      │ │ - conflicts    │ │ - open       │  │
//! │  └────────────────┘ └────────────────┘ └──────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod instruments;

pub use instruments::{Counter, Gauge};

/// Metrics collected by one grid node.
#[derive(Debug, Default)]
pub struct GridMetrics {
    // State provider
    /// Outbound transfers started.
    pub transfers_started: Counter,
    /// Outbound transfers cancelled.
    pub transfers_cancelled: Counter,
    /// Outbound transfers abandoned because the destination became unreachable.
    pub transfers_abandoned: Counter,
    /// State chunks sent.
    pub chunks_sent: Counter,

    // State consumer
    /// State chunks applied to local storage.
    pub chunks_applied: Counter,
    /// State chunks discarded because their topology was superseded.
    pub chunks_discarded_stale: Counter,
    /// Entries written from incoming state.
    pub entries_applied: Counter,
    /// Entries held back because a local transaction wrote the key.
    pub entries_deferred: Counter,
    /// Segment requests re-issued to another source.
    pub transfer_retries: Counter,

    // Coordinator
    /// Rebalances started.
    pub rebalances_started: Counter,
    /// Rebalances committed.
    pub rebalances_committed: Counter,
    /// Rebalances restarted after a failure or timeout.
    pub rebalances_restarted: Counter,
    /// Conflicting keys resolved by the merge policy.
    pub conflicts_resolved: Counter,
    /// Conflicting keys the merge policy could not resolve.
    pub conflicts_unresolved: Counter,

    // Publisher
    /// Publisher batches served by this node.
    pub publisher_batches: Counter,
    /// Segments reported lost mid-iteration by this node.
    pub publisher_segments_lost: Counter,
    /// Publishers currently registered on this node.
    pub open_publishers: Gauge,
}

impl GridMetrics {
    /// Create a fresh metrics set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_started: self.transfers_started.get(),
            transfers_cancelled: self.transfers_cancelled.get(),
            transfers_abandoned: self.transfers_abandoned.get(),
            chunks_sent: self.chunks_sent.get(),
            chunks_applied: self.chunks_applied.get(),
            chunks_discarded_stale: self.chunks_discarded_stale.get(),
            entries_applied: self.entries_applied.get(),
            entries_deferred: self.entries_deferred.get(),
            transfer_retries: self.transfer_retries.get(),
            rebalances_started: self.rebalances_started.get(),
            rebalances_committed: self.rebalances_committed.get(),
            rebalances_restarted: self.rebalances_restarted.get(),
            conflicts_resolved: self.conflicts_resolved.get(),
            conflicts_unresolved: self.conflicts_unresolved.get(),
            publisher_batches: self.publisher_batches.get(),
            publisher_segments_lost: self.publisher_segments_lost.get(),
            open_publishers: self.open_publishers.get(),
        }
    }
}

/// Point-in-time copy of [`GridMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_started: u64,
    pub transfers_cancelled: u64,
    pub transfers_abandoned: u64,
    pub chunks_sent: u64,
    pub chunks_applied: u64,
    pub chunks_discarded_stale: u64,
    pub entries_applied: u64,
    pub entries_deferred: u64,
    pub transfer_retries: u64,
    pub rebalances_started: u64,
    pub rebalances_committed: u64,
    pub rebalances_restarted: u64,
    pub conflicts_resolved: u64,
    pub conflicts_unresolved: u64,
    pub publisher_batches: u64,
    pub publisher_segments_lost: u64,
    pub open_publishers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = GridMetrics::new();
        metrics.chunks_sent.inc_by(3);
        metrics.chunks_discarded_stale.inc();
        metrics.open_publishers.set(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_sent, 3);
        assert_eq!(snapshot.chunks_discarded_stale, 1);
        assert_eq!(snapshot.open_publishers, 1);
        assert_eq!(snapshot.chunks_applied, 0);
    }
}
