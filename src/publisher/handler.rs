//! Target side of the publisher protocol.
//!
//! Each open request holds a cursor over the segments it still has to
//! iterate. Every batch is built against the current topology: a segment this
//! node stopped being primary for is reported lost and its partial results
//! are removed from the batch.

use crate::error::{Error, NetworkError, Result};
use crate::metrics::GridMetrics;
use crate::publisher::request::{
    PublisherItem, PublisherRequest, PublisherResponse, SegmentResult,
};
use crate::publisher::transform::{TransformFn, TransformRegistry};
use crate::storage::DataContainer;
use crate::topology::{CacheTopology, TopologyListener, TopologyTracker};
use crate::transport::{Command, CommandHandler, CommandKind, Envelope, Reply};
use crate::types::{NodeId, SegmentId, SegmentSet};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Server-side iteration state of one request.
struct PublisherState {
    origin: NodeId,
    request: PublisherRequest,
    transform: Option<TransformFn>,
    remaining: VecDeque<SegmentId>,
    /// Last key read from the front segment.
    cursor: Option<Bytes>,
    complete: bool,
}

/// A batch being assembled.
#[derive(Default)]
struct BatchBuilder {
    response: PublisherResponse,
    keys: Vec<Bytes>,
}

impl BatchBuilder {
    fn push(&mut self, segment: SegmentId, key: Bytes, item: PublisherItem) {
        self.response.results.push(item);
        self.keys.push(key);
        match self.response.segment_results.last_mut() {
            Some(last) if last.segment == segment => last.entry_count += 1,
            _ => self.response.segment_results.push(SegmentResult {
                segment,
                entry_count: 1,
            }),
        }
    }

    /// Drop every result attributed to `segment` and report it lost.
    fn lose(&mut self, segment: SegmentId) {
        let mut offset = 0;
        let mut kept = Vec::with_capacity(self.response.segment_results.len());
        for result in self.response.segment_results.drain(..) {
            if result.segment == segment {
                self.response
                    .results
                    .drain(offset..offset + result.entry_count);
                self.keys.drain(offset..offset + result.entry_count);
            } else {
                offset += result.entry_count;
                kept.push(result);
            }
        }
        self.response.segment_results = kept;
        self.response.completed_segments.remove(&segment);
        self.response.lost_segments.insert(segment);
    }

    fn len(&self) -> usize {
        self.response.results.len()
    }

    fn finish(mut self, track_keys: bool) -> PublisherResponse {
        if track_keys {
            self.response.keys = Some(self.keys);
        }
        self.response
    }
}

/// Serves publisher requests for segments this node is primary for.
pub struct PublisherHandler {
    local_node: NodeId,
    tracker: Arc<TopologyTracker>,
    container: Arc<dyn DataContainer>,
    transforms: Arc<TransformRegistry>,
    metrics: Arc<GridMetrics>,
    topology_wait: Duration,
    publishers: DashMap<String, Arc<Mutex<PublisherState>>>,
}

impl std::fmt::Debug for PublisherHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandler")
            .field("local_node", &self.local_node)
            .field("open_publishers", &self.publishers.len())
            .finish()
    }
}

impl PublisherHandler {
    /// Create a handler.
    pub fn new(
        tracker: Arc<TopologyTracker>,
        container: Arc<dyn DataContainer>,
        transforms: Arc<TransformRegistry>,
        metrics: Arc<GridMetrics>,
        topology_wait: Duration,
    ) -> Self {
        Self {
            local_node: tracker.local_node(),
            tracker,
            container,
            transforms,
            metrics,
            topology_wait,
            publishers: DashMap::new(),
        }
    }

    /// Register a request from `origin`.
    ///
    /// A completed request with the same id is replaced; an open one is an
    /// error.
    pub fn register(&self, origin: NodeId, request: PublisherRequest) -> Result<()> {
        let transform = match &request.transformer {
            Some(name) => Some(
                self.transforms
                    .get(name)
                    .ok_or_else(|| Error::Config(format!("unknown transformer '{name}'")))?,
            ),
            None => None,
        };

        let request_id = request.request_id.clone();
        if let Some(existing) = self.publishers.get(&request_id) {
            if !existing.lock().complete {
                return Err(Error::PublisherAlreadyRegistered(request_id));
            }
        }

        debug!(
            node_id = self.local_node,
            request_id = %request_id,
            origin,
            segments = request.segments.len(),
            guarantee = ?request.delivery_guarantee,
            "Registered publisher"
        );

        let state = PublisherState {
            origin,
            remaining: request.segments.iter().copied().collect(),
            request,
            transform,
            cursor: None,
            complete: false,
        };
        self.publishers
            .insert(request_id, Arc::new(Mutex::new(state)));
        self.update_gauge();
        Ok(())
    }

    /// Build the next batch of an open request.
    pub fn get_next(&self, request_id: &str) -> Result<PublisherResponse> {
        let state = self
            .publishers
            .get(request_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::PublisherNotFound(request_id.to_string()))?;
        let mut state = state.lock();
        if state.complete {
            return Err(Error::PublisherNotFound(request_id.to_string()));
        }

        let topology = self.tracker.snapshot();
        let mut batch = BatchBuilder::default();
        batch.response.topology_id = topology.as_ref().map_or(0, |t| t.id);
        let batch_size = state.request.batch_size.max(1);

        while batch.len() < batch_size {
            let Some(&segment) = state.remaining.front() else {
                break;
            };
            if !self.is_primary(topology.as_deref(), segment) {
                batch.lose(segment);
                state.remaining.pop_front();
                state.cursor = None;
                continue;
            }

            let scan = self.container.read_segment(
                segment,
                state.cursor.as_deref(),
                batch_size - batch.len(),
            );
            let read_any = !scan.entries.is_empty();
            for entry in scan.entries {
                state.cursor = Some(entry.key.clone());
                if !state.request.accepts(&entry.key) {
                    continue;
                }
                let key = entry.key.clone();
                let item = match (&state.transform, state.request.entry_stream) {
                    (Some(transform), _) => match transform(&entry) {
                        Some(value) => PublisherItem::Value(value),
                        None => continue,
                    },
                    (None, true) => PublisherItem::Entry(entry),
                    (None, false) => PublisherItem::Key(entry.key),
                };
                batch.push(segment, key, item);
            }

            if scan.exhausted {
                batch.response.completed_segments.insert(segment);
                state.remaining.pop_front();
                state.cursor = None;
            } else if !read_any {
                break;
            }
        }

        // Ownership may have moved while the batch was read.
        let latest = self.tracker.snapshot();
        if latest.as_ref().map(|t| t.id) != topology.as_ref().map(|t| t.id) {
            let touched: SegmentSet = batch
                .response
                .segment_results
                .iter()
                .map(|r| r.segment)
                .chain(batch.response.completed_segments.iter().copied())
                .collect();
            for segment in touched {
                if !self.is_primary(latest.as_deref(), segment) {
                    batch.lose(segment);
                    if state.remaining.front() == Some(&segment) {
                        state.remaining.pop_front();
                        state.cursor = None;
                    }
                }
            }
            batch.response.topology_id = latest.as_ref().map_or(0, |t| t.id);
        }

        batch.response.complete = state.remaining.is_empty();
        state.complete = batch.response.complete;
        let response = batch.finish(state.request.track_keys);

        self.metrics.publisher_batches.inc();
        if !response.lost_segments.is_empty() {
            self.metrics
                .publisher_segments_lost
                .inc_by(response.lost_segments.len() as u64);
            warn!(
                node_id = self.local_node,
                request_id,
                lost = ?response.lost_segments,
                topology_id = response.topology_id,
                "Publisher lost segments"
            );
        }
        trace!(
            node_id = self.local_node,
            request_id,
            results = response.results.len(),
            completed = ?response.completed_segments,
            complete = response.complete,
            "Publisher batch"
        );

        if response.complete {
            drop(state);
            self.publishers.remove(request_id);
            self.update_gauge();
        }
        Ok(response)
    }

    /// Release a request. Closing an unknown or finished request is a no-op.
    pub fn close_publisher(&self, request_id: &str) -> bool {
        let removed = self.publishers.remove(request_id).is_some();
        if removed {
            debug!(node_id = self.local_node, request_id, "Closed publisher");
            self.update_gauge();
        }
        removed
    }

    /// Close every request whose origin is not in `members`.
    pub fn on_view_change(&self, members: &[NodeId]) -> usize {
        let departed: Vec<String> = self
            .publishers
            .iter()
            .filter(|e| !members.contains(&e.value().lock().origin))
            .map(|e| e.key().clone())
            .collect();
        for request_id in &departed {
            self.close_publisher(request_id);
        }
        if !departed.is_empty() {
            debug!(
                node_id = self.local_node,
                closed = departed.len(),
                "Closed publishers of departed origins"
            );
        }
        departed.len()
    }

    /// Number of open requests.
    pub fn open_publishers(&self) -> usize {
        self.publishers.len()
    }

    fn is_primary(&self, topology: Option<&CacheTopology>, segment: SegmentId) -> bool {
        topology.map_or(false, |t| t.read_ch().primary_of(segment) == Some(self.local_node))
    }

    fn update_gauge(&self) {
        self.metrics.open_publishers.set(self.publishers.len());
    }

    /// Command kinds served by the handler.
    pub const COMMANDS: &'static [CommandKind] = &[
        CommandKind::InitialPublisher,
        CommandKind::NextPublisher,
        CommandKind::CancelPublisher,
    ];
}

impl TopologyListener for PublisherHandler {
    fn on_topology_changed(&self, _old: Option<&Arc<CacheTopology>>, new: &Arc<CacheTopology>) {
        self.on_view_change(&new.members);
    }
}

#[async_trait::async_trait]
impl CommandHandler for PublisherHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Reply> {
        match envelope.command {
            Command::InitialPublisher(request) => {
                if envelope.topology_id > self.tracker.topology_id() {
                    // Ignore a timeout: segments we do not own are reported lost.
                    let _ = self
                        .tracker
                        .await_topology(envelope.topology_id, self.topology_wait)
                        .await;
                }
                let request_id = request.request_id.clone();
                self.register(envelope.origin, request)?;
                Ok(Reply::Publisher(self.get_next(&request_id)?))
            }
            Command::NextPublisher { request_id } => Ok(Reply::Publisher(self.get_next(&request_id)?)),
            Command::CancelPublisher { request_id } => {
                self.close_publisher(&request_id);
                Ok(Reply::Ack)
            }
            other => Err(NetworkError::HandlerMissing(other.kind()).into()),
        }
    }
}
