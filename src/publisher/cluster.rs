//! Initiator side of the publisher protocol.
//!
//! Requested segments are grouped by their current primary owner and each
//! owner becomes one target of an [`AsyncBatchHandler`]. Segments a target
//! reports lost, or that belonged to a target that failed, are regrouped
//! against the latest topology once the current targets are drained.

use crate::config::PublisherConfig;
use crate::error::{Error, Result};
use crate::flow::{AsyncBatchHandler, Batch, BatchTarget, ErrorAction, TargetFactory};
use crate::publisher::request::{
    DeliveryGuarantee, PublisherItem, PublisherRequest, PublisherResponse,
};
use crate::topology::TopologyTracker;
use crate::transport::{Command, Reply, RpcClient};
use crate::types::{NodeId, SegmentId, SegmentSet};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Times a segment is re-routed before it is given up as lost.
const MAX_SEGMENT_ATTEMPTS: usize = 5;

/// Bookkeeping shared by the targets of one publisher.
#[derive(Debug, Default)]
struct Progress {
    /// Segments waiting to be routed to an owner.
    unassigned: SegmentSet,
    completed: SegmentSet,
    lost: SegmentSet,
    attempts: HashMap<SegmentId, usize>,
    /// Keys already emitted per unfinished segment, tracked for exactly-once
    /// re-routing.
    delivered: HashMap<SegmentId, BTreeSet<Bytes>>,
}

impl Progress {
    fn requeue(&mut self, segments: impl IntoIterator<Item = SegmentId>) {
        for segment in segments {
            if self.completed.contains(&segment) || self.lost.contains(&segment) {
                continue;
            }
            let attempts = self.attempts.entry(segment).or_insert(0);
            *attempts += 1;
            if *attempts >= MAX_SEGMENT_ATTEMPTS {
                self.lost.insert(segment);
            } else {
                self.unassigned.insert(segment);
            }
        }
    }

    /// Fold one response in: remember the keys each segment produced, then
    /// forget them for segments that finished.
    fn record(&mut self, response: &PublisherResponse) {
        if let Some(keys) = &response.keys {
            let mut keys = keys.iter();
            for result in &response.segment_results {
                self.delivered
                    .entry(result.segment)
                    .or_default()
                    .extend(keys.by_ref().take(result.entry_count).cloned());
            }
        }
        for segment in &response.completed_segments {
            self.delivered.remove(segment);
            self.completed.insert(*segment);
        }
    }

    /// Keys already emitted for those of `segments` that are being routed
    /// again. First-time segments contribute nothing.
    fn delivered_in(&self, segments: &SegmentSet) -> BTreeSet<Bytes> {
        segments
            .iter()
            .filter(|s| self.attempts.contains_key(s))
            .filter_map(|s| self.delivered.get(s))
            .flatten()
            .cloned()
            .collect()
    }
}

/// One owner's share of a publisher.
struct RemoteTarget {
    node: NodeId,
    request: PublisherRequest,
    rpc: RpcClient,
    tracker: Arc<TopologyTracker>,
    progress: Arc<Mutex<Progress>>,
    rpc_timeout: Duration,
    opened: bool,
    finished: bool,
}

#[async_trait::async_trait]
impl BatchTarget for RemoteTarget {
    type Item = PublisherItem;

    async fn fetch(&mut self, _amount: usize) -> Result<Batch<PublisherItem>> {
        let topology_id = self.tracker.topology_id();
        let command = if self.opened {
            Command::NextPublisher {
                request_id: self.request.request_id.clone(),
            }
        } else {
            Command::InitialPublisher(self.request.clone())
        };

        let reply = match self.rpc.invoke(self.node, topology_id, command).await {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_retryable() {
                    // Give the failure a chance to reach the topology before
                    // the segments are routed again.
                    let _ = self
                        .tracker
                        .await_topology(topology_id + 1, self.rpc_timeout)
                        .await;
                }
                return Err(e);
            }
        };
        self.opened = true;
        let Reply::Publisher(response) = reply else {
            return Err(reply.unexpected());
        };

        {
            let mut progress = self.progress.lock();
            progress.record(&response);
            if self.request.delivery_guarantee.retries_lost_segments() {
                progress.requeue(response.lost_segments.iter().copied());
            } else {
                progress.lost.extend(response.lost_segments.iter().copied());
            }
        }

        if !response.lost_segments.is_empty() && response.topology_id > topology_id {
            let _ = self
                .tracker
                .await_topology(response.topology_id, self.rpc_timeout)
                .await;
        }

        self.finished = response.complete;
        Ok(Batch {
            items: response.results,
            complete: response.complete,
        })
    }

    async fn cancel(&mut self) {
        if self.opened && !self.finished {
            self.rpc.send_and_forget(
                self.node,
                self.tracker.topology_id(),
                Command::CancelPublisher {
                    request_id: self.request.request_id.clone(),
                },
            );
        }
    }
}

/// Supplies one [`RemoteTarget`] per primary owner.
struct RemoteTargets {
    template: PublisherRequest,
    rpc: RpcClient,
    tracker: Arc<TopologyTracker>,
    progress: Arc<Mutex<Progress>>,
    rpc_timeout: Duration,
    queue: VecDeque<(NodeId, SegmentSet)>,
    /// Segments of the last target handed out.
    current: SegmentSet,
}

impl RemoteTargets {
    /// Group unassigned segments by their current primary owner.
    fn route(&mut self) {
        let unassigned = std::mem::take(&mut self.progress.lock().unassigned);
        if unassigned.is_empty() {
            return;
        }
        let topology = self.tracker.snapshot();

        let mut by_owner: BTreeMap<NodeId, SegmentSet> = BTreeMap::new();
        let mut orphaned = SegmentSet::new();
        for segment in unassigned {
            match topology.as_ref().and_then(|t| t.read_ch().primary_of(segment)) {
                Some(owner) => {
                    by_owner.entry(owner).or_default().insert(segment);
                }
                None => {
                    orphaned.insert(segment);
                }
            }
        }
        if !orphaned.is_empty() {
            warn!(
                request_id = %self.template.request_id,
                segments = ?orphaned,
                "Segments have no owner"
            );
            self.progress.lock().lost.extend(orphaned);
        }
        self.queue.extend(by_owner);
    }
}

impl TargetFactory for RemoteTargets {
    type Target = RemoteTarget;

    fn next_target(&mut self) -> Option<RemoteTarget> {
        if self.queue.is_empty() {
            self.route();
        }
        let (node, segments) = self.queue.pop_front()?;

        let mut request = self.template.for_segments(segments.clone());
        if self.template.delivery_guarantee == DeliveryGuarantee::ExactlyOnce {
            let seen = self.progress.lock().delivered_in(&segments);
            request.keys_to_exclude.extend(seen);
        }
        debug!(
            request_id = %request.request_id,
            parent = %self.template.request_id,
            target_node = node,
            segments = ?segments,
            "Opening publisher target"
        );
        self.current = segments;

        Some(RemoteTarget {
            node,
            request,
            rpc: self.rpc.clone(),
            tracker: self.tracker.clone(),
            progress: self.progress.clone(),
            rpc_timeout: self.rpc_timeout,
            opened: false,
            finished: false,
        })
    }

    fn on_target_error(&mut self, error: &Error) -> ErrorAction {
        if !error.is_retryable() {
            return ErrorAction::Propagate;
        }

        let segments = std::mem::take(&mut self.current);
        warn!(
            request_id = %self.template.request_id,
            segments = ?segments,
            error = %error,
            "Publisher target failed"
        );
        let mut progress = self.progress.lock();
        if self.template.delivery_guarantee.retries_lost_segments() {
            progress.requeue(segments);
        } else {
            let unfinished: Vec<SegmentId> = segments
                .into_iter()
                .filter(|s| !progress.completed.contains(s))
                .collect();
            progress.lost.extend(unfinished);
        }
        ErrorAction::Continue
    }
}

/// Final outcome of a drained publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOutcome {
    /// Every item received, in arrival order.
    pub items: Vec<PublisherItem>,

    /// Segments fully iterated.
    pub completed_segments: SegmentSet,

    /// Segments given up.
    pub lost_segments: SegmentSet,
}

/// A running cluster-wide iteration.
#[derive(Debug)]
pub struct ClusterPublisher {
    flow: AsyncBatchHandler<PublisherItem>,
    progress: Arc<Mutex<Progress>>,
}

impl ClusterPublisher {
    /// Next item, or None when every segment was completed or lost.
    pub async fn next(&mut self) -> Result<Option<PublisherItem>> {
        self.flow.next_item().await
    }

    /// Stop iterating and release the open targets.
    pub fn cancel(&self) {
        self.flow.cancel();
    }

    /// Segments completed so far.
    pub fn completed_segments(&self) -> SegmentSet {
        self.progress.lock().completed.clone()
    }

    /// Segments given up so far.
    pub fn lost_segments(&self) -> SegmentSet {
        let progress = self.progress.lock();
        progress.lost.difference(&progress.completed).copied().collect()
    }

    /// Drain every remaining item.
    pub async fn collect(mut self) -> Result<PublisherOutcome> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(PublisherOutcome {
            items,
            completed_segments: self.completed_segments(),
            lost_segments: self.lost_segments(),
        })
    }
}

/// Starts cluster-wide iterations from this node.
#[derive(Debug, Clone)]
pub struct ClusterPublisherManager {
    tracker: Arc<TopologyTracker>,
    rpc: RpcClient,
    config: PublisherConfig,
}

impl ClusterPublisherManager {
    /// Create a manager.
    pub fn new(tracker: Arc<TopologyTracker>, rpc: RpcClient, config: PublisherConfig) -> Self {
        Self {
            rpc: rpc.with_timeout(config.rpc_timeout),
            tracker,
            config,
        }
    }

    /// A request over every segment with the configured batch size.
    pub fn request(&self, guarantee: DeliveryGuarantee) -> Result<PublisherRequest> {
        let num_segments = self.tracker.current()?.num_segments();
        Ok(PublisherRequest::new(
            (0..num_segments).collect(),
            guarantee,
            self.config.batch_size,
        ))
    }

    /// Start iterating. An empty segment set means every segment.
    pub fn publish(&self, mut request: PublisherRequest) -> Result<ClusterPublisher> {
        if request.segments.is_empty() {
            request.segments = (0..self.tracker.current()?.num_segments()).collect();
        }
        if request.delivery_guarantee == DeliveryGuarantee::ExactlyOnce {
            request.track_keys = true;
        }

        let progress = Arc::new(Mutex::new(Progress {
            unassigned: request.segments.clone(),
            ..Default::default()
        }));
        let batch_size = request.batch_size;
        debug!(
            request_id = %request.request_id,
            segments = request.segments.len(),
            guarantee = ?request.delivery_guarantee,
            "Starting cluster publisher"
        );

        let targets = RemoteTargets {
            template: request,
            rpc: self.rpc.clone(),
            tracker: self.tracker.clone(),
            progress: progress.clone(),
            rpc_timeout: self.config.rpc_timeout,
            queue: VecDeque::new(),
            current: SegmentSet::new(),
        };
        Ok(ClusterPublisher {
            flow: AsyncBatchHandler::spawn(targets, batch_size),
            progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::request::SegmentResult;

    #[test]
    fn test_requeue_gives_up_after_attempts() {
        let mut progress = Progress::default();
        for _ in 0..MAX_SEGMENT_ATTEMPTS - 1 {
            progress.requeue([3]);
            assert!(progress.unassigned.remove(&3));
        }
        progress.requeue([3]);
        assert!(progress.lost.contains(&3));
        assert!(!progress.unassigned.contains(&3));
    }

    fn response(segments: &[(SegmentId, &[&str])], completed: &[SegmentId]) -> PublisherResponse {
        let mut response = PublisherResponse::default();
        let mut keys = Vec::new();
        for (segment, names) in segments {
            for name in names.iter() {
                keys.push(Bytes::from(name.to_string()));
                response.results.push(PublisherItem::Key(Bytes::from(name.to_string())));
            }
            response.segment_results.push(SegmentResult {
                segment: *segment,
                entry_count: names.len(),
            });
        }
        response.keys = Some(keys);
        response.completed_segments = completed.iter().copied().collect();
        response
    }

    #[test]
    fn test_rerouted_segments_exclude_only_their_own_keys() {
        let mut progress = Progress::default();
        progress.record(&response(&[(0, &["a", "b"]), (1, &["c"])], &[0]));
        progress.record(&response(&[(2, &["d", "e"])], &[]));

        // Finished segments are not remembered.
        assert!(progress.completed.contains(&0));
        assert!(!progress.delivered.contains_key(&0));
        assert_eq!(progress.delivered[&1], BTreeSet::from([Bytes::from("c")]));

        // First-time targets carry no exclusions.
        assert!(progress.delivered_in(&SegmentSet::from([1, 2, 3])).is_empty());

        progress.requeue([2]);
        assert_eq!(
            progress.delivered_in(&SegmentSet::from([1, 2, 3])),
            BTreeSet::from([Bytes::from("d"), Bytes::from("e")])
        );
    }

    #[test]
    fn test_requeue_skips_finished_segments() {
        let mut progress = Progress::default();
        progress.completed.insert(1);
        progress.requeue([1, 2]);
        assert_eq!(progress.unassigned, SegmentSet::from([2]));
    }
}
