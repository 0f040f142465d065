//! Inbound side of state transfer.
//!
//! The consumer listens for topology installs, works out which segments the
//! local node gained in the write owners, and requests each one from a current
//! owner. Chunks are applied only while they match the live transfer record
//! for their segment; anything from a superseded request is dropped.
//!
//! ```text
//!                 request               first chunk            last chunk
//!  NOT_OWNED ──────────────► REQUESTED ─────────────► RECEIVING ──────────► OWNED
//!                               │                        │
//!                               └── source exhausted ────┴──► CANCELLED
//! ```
//!
//! Network work runs on a single worker task fed in install order, so
//! requests and cancels for one topology are never reordered behind the next.

use crate::config::StateTransferConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::GridMetrics;
use crate::statetransfer::chunk::{StateChunk, TransferMode};
use crate::statetransfer::listeners::ClusterListenerRegistry;
use crate::statetransfer::tx::TransactionTable;
use crate::storage::DataContainer;
use crate::topology::{
    topology_diff, CacheTopology, KeyPartitioner, TopologyListener, TopologyTracker,
};
use crate::transport::{Command, CommandHandler, Envelope, Reply, RpcClient};
use crate::types::{NodeId, SegmentId, SegmentSet, TopologyId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Ownership state of one segment on the consuming node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// The node does not own the segment.
    NotOwned,
    /// Data was requested, nothing received yet.
    Requested,
    /// At least one chunk was applied.
    Receiving,
    /// Every chunk was applied; reads may be served locally.
    Owned,
    /// The transfer ended without data.
    Cancelled,
}

#[derive(Debug, Clone)]
struct InboundTransfer {
    source: NodeId,
    topology_id: TopologyId,
    blacklist: BTreeSet<NodeId>,
    last_progress: Instant,
}

#[derive(Debug, Default)]
struct ConsumerState {
    topology: Option<Arc<CacheTopology>>,
    states: BTreeMap<SegmentId, SegmentState>,
    inbound: BTreeMap<SegmentId, InboundTransfer>,
    unavailable: SegmentSet,
    confirmed: Option<TopologyId>,
    listeners_fetched: bool,
}

impl ConsumerState {
    fn topology_id(&self) -> TopologyId {
        self.topology.as_ref().map_or(0, |t| t.id)
    }
}

#[derive(Debug)]
enum ConsumerWork {
    FetchListeners {
        topology: Arc<CacheTopology>,
    },
    Request {
        source: NodeId,
        topology_id: TopologyId,
        segments: SegmentSet,
    },
    Cancel {
        source: NodeId,
        topology_id: TopologyId,
        segments: SegmentSet,
    },
    Confirm {
        coordinator: NodeId,
        topology_id: TopologyId,
        unavailable: SegmentSet,
    },
}

/// Acquires newly assigned segments.
pub struct StateConsumer {
    local_node: NodeId,
    config: StateTransferConfig,
    tracker: Arc<TopologyTracker>,
    container: Arc<dyn DataContainer>,
    partitioner: Arc<dyn KeyPartitioner>,
    rpc: RpcClient,
    listeners: Arc<ClusterListenerRegistry>,
    transactions: Arc<TransactionTable>,
    metrics: Arc<GridMetrics>,
    state: Mutex<ConsumerState>,
    work: mpsc::UnboundedSender<ConsumerWork>,
}

impl std::fmt::Debug for StateConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StateConsumer")
            .field("local_node", &self.local_node)
            .field("topology_id", &state.topology_id())
            .field("inbound", &state.inbound.len())
            .finish()
    }
}

impl StateConsumer {
    /// Create a consumer and start its worker and stall watchdog.
    ///
    /// Must be called from within a tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StateTransferConfig,
        tracker: Arc<TopologyTracker>,
        container: Arc<dyn DataContainer>,
        partitioner: Arc<dyn KeyPartitioner>,
        rpc: RpcClient,
        listeners: Arc<ClusterListenerRegistry>,
        transactions: Arc<TransactionTable>,
        metrics: Arc<GridMetrics>,
    ) -> Arc<Self> {
        let (work, rx) = mpsc::unbounded_channel();
        let watchdog_interval = (config.transfer_timeout / 4).max(Duration::from_millis(10));

        let consumer = Arc::new(Self {
            local_node: tracker.local_node(),
            config,
            tracker,
            container,
            partitioner,
            rpc,
            listeners,
            transactions,
            metrics,
            state: Mutex::new(ConsumerState::default()),
            work,
        });

        tokio::spawn(Self::run_worker(Arc::downgrade(&consumer), rx));
        tokio::spawn(Self::run_watchdog(Arc::downgrade(&consumer), watchdog_interval));
        consumer
    }

    /// Apply chunks received from `origin` for a transfer requested at
    /// `topology_id`. Chunks that do not belong to a live transfer record are
    /// dropped; re-delivering a chunk rewrites the same entries.
    pub async fn apply_state(
        &self,
        origin: NodeId,
        topology_id: TopologyId,
        chunks: Vec<StateChunk>,
    ) -> Result<()> {
        if topology_id > self.tracker.topology_id() {
            self.tracker
                .await_topology(topology_id, self.config.topology_wait_timeout)
                .await?;
        }

        let mut completed = SegmentSet::new();
        {
            let mut state = self.state.lock();
            let current = state.topology_id();
            if topology_id < current {
                self.metrics.chunks_discarded_stale.inc_by(chunks.len() as u64);
                warn!(
                    node_id = self.local_node,
                    origin,
                    topology_id,
                    current,
                    "Discarding chunks from superseded topology"
                );
                return Ok(());
            }

            for chunk in chunks {
                let segment = chunk.segment;
                let live = state
                    .inbound
                    .get(&segment)
                    .map_or(false, |t| t.source == origin && t.topology_id == topology_id);
                if !live {
                    self.metrics.chunks_discarded_stale.inc();
                    trace!(
                        node_id = self.local_node,
                        origin,
                        segment,
                        topology_id,
                        "Discarding chunk without live transfer"
                    );
                    continue;
                }

                for entry in chunk.entries {
                    if self.transactions.defer_if_locked(segment, &entry) {
                        self.metrics.entries_deferred.inc();
                    } else if self
                        .container
                        .get(segment, &entry.key)
                        .map_or(false, |local| local.version() > entry.version())
                    {
                        // Written locally after the source read it.
                        continue;
                    } else {
                        self.container.write(segment, entry);
                        self.metrics.entries_applied.inc();
                    }
                }
                self.metrics.chunks_applied.inc();

                if chunk.is_last_chunk {
                    state.inbound.remove(&segment);
                    state.states.insert(segment, SegmentState::Owned);
                    completed.insert(segment);
                } else {
                    if let Some(transfer) = state.inbound.get_mut(&segment) {
                        transfer.last_progress = Instant::now();
                    }
                    state.states.insert(segment, SegmentState::Receiving);
                }
            }

            if !completed.is_empty() {
                self.container.add_segments(&completed);
            }
        }

        if !completed.is_empty() {
            debug!(
                node_id = self.local_node,
                origin,
                topology_id,
                segments = ?completed,
                "Segments received"
            );
        }
        self.check_complete();
        Ok(())
    }

    /// Whether any inbound transfer is running.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        !self.state.lock().inbound.is_empty()
    }

    /// Whether the key's segment is still being received.
    pub fn is_state_transfer_in_progress_for_key(&self, key: &[u8]) -> bool {
        let segment = self.partitioner.segment_of(key);
        self.state.lock().inbound.contains_key(&segment)
    }

    /// State of one segment.
    pub fn segment_state(&self, segment: SegmentId) -> SegmentState {
        self.state
            .lock()
            .states
            .get(&segment)
            .copied()
            .unwrap_or(SegmentState::NotOwned)
    }

    /// Segments fully received or held since the node became an owner.
    pub fn owned_segments(&self) -> SegmentSet {
        self.state
            .lock()
            .states
            .iter()
            .filter(|(_, s)| **s == SegmentState::Owned)
            .map(|(seg, _)| *seg)
            .collect()
    }

    /// Segments with no owner left to provide them.
    pub fn unavailable_segments(&self) -> SegmentSet {
        self.state.lock().unavailable.clone()
    }

    /// Current source of an inbound segment.
    pub fn source_of(&self, segment: SegmentId) -> Option<NodeId> {
        self.state.lock().inbound.get(&segment).map(|t| t.source)
    }

    /// First candidate among the segment's current owners that is neither
    /// the local node nor blacklisted. Owners are ordered primary first.
    fn pick_source(
        &self,
        topology: &CacheTopology,
        segment: SegmentId,
        blacklist: &BTreeSet<NodeId>,
    ) -> Option<NodeId> {
        topology
            .read_ch()
            .owners_of(segment)
            .iter()
            .copied()
            .find(|o| *o != self.local_node && !blacklist.contains(o))
    }

    /// Record that no source is left for a segment. Called with the state lock held.
    fn mark_unavailable(&self, state: &mut ConsumerState, segment: SegmentId) {
        state.inbound.remove(&segment);
        if self.config.allow_data_loss {
            warn!(
                node_id = self.local_node,
                segment, "No owner left, segment restarts empty"
            );
            state.states.insert(segment, SegmentState::Owned);
            self.container.add_segments(&SegmentSet::from([segment]));
        } else {
            error!(
                node_id = self.local_node,
                segment, "No owner left to provide segment"
            );
            state.states.insert(segment, SegmentState::Cancelled);
            state.unavailable.insert(segment);
        }
    }

    /// Move segments whose request to `failed` went nowhere to their next
    /// candidate source.
    fn retry_segments(&self, segments: &SegmentSet, failed: NodeId, topology_id: TopologyId) {
        let mut requests: BTreeMap<NodeId, SegmentSet> = BTreeMap::new();
        {
            let mut state = self.state.lock();
            let Some(topology) = state.topology.clone() else {
                return;
            };
            if topology.id != topology_id {
                return;
            }

            for segment in segments {
                let next = match state.inbound.get_mut(segment) {
                    Some(t) if t.source == failed && t.topology_id == topology_id => {
                        t.blacklist.insert(failed);
                        let blacklist = t.blacklist.clone();
                        self.pick_source(&topology, *segment, &blacklist)
                    }
                    _ => continue,
                };

                match next {
                    Some(source) => {
                        if let Some(t) = state.inbound.get_mut(segment) {
                            t.source = source;
                            t.last_progress = Instant::now();
                        }
                        state.states.insert(*segment, SegmentState::Requested);
                        requests.entry(source).or_default().insert(*segment);
                        self.metrics.transfer_retries.inc();
                    }
                    None => self.mark_unavailable(&mut state, *segment),
                }
            }
        }

        for (source, segments) in requests {
            debug!(
                node_id = self.local_node,
                failed,
                source,
                segments = ?segments,
                "Re-requesting segments from next owner"
            );
            self.submit(ConsumerWork::Request {
                source,
                topology_id,
                segments,
            });
        }
        self.check_complete();
    }

    /// Re-request segments whose source made no progress in time.
    fn check_stalled(&self) {
        let mut stalled: BTreeMap<(NodeId, TopologyId), SegmentSet> = BTreeMap::new();
        {
            let state = self.state.lock();
            for (segment, transfer) in &state.inbound {
                if transfer.last_progress.elapsed() >= self.config.transfer_timeout {
                    stalled
                        .entry((transfer.source, transfer.topology_id))
                        .or_default()
                        .insert(*segment);
                }
            }
        }
        for ((source, topology_id), segments) in stalled {
            warn!(
                node_id = self.local_node,
                source,
                segments = ?segments,
                "Transfer stalled"
            );
            self.submit(ConsumerWork::Cancel {
                source,
                topology_id,
                segments: segments.clone(),
            });
            self.retry_segments(&segments, source, topology_id);
        }
    }

    /// Confirm the rebalance once nothing is left to receive.
    fn check_complete(&self) {
        let confirm = {
            let mut state = self.state.lock();
            let Some(topology) = state.topology.clone() else {
                return;
            };
            if !topology.is_rebalancing()
                || !state.inbound.is_empty()
                || state.confirmed == Some(topology.id)
                || !topology.members.contains(&self.local_node)
            {
                return;
            }
            let Some(coordinator) = topology.coordinator() else {
                return;
            };
            state.confirmed = Some(topology.id);
            ConsumerWork::Confirm {
                coordinator,
                topology_id: topology.id,
                unavailable: state.unavailable.clone(),
            }
        };
        self.submit(confirm);
    }

    fn submit(&self, work: ConsumerWork) {
        if self.work.send(work).is_err() {
            trace!(node_id = self.local_node, "Consumer worker stopped");
        }
    }

    async fn run_worker(consumer: Weak<Self>, mut rx: mpsc::UnboundedReceiver<ConsumerWork>) {
        while let Some(work) = rx.recv().await {
            let Some(consumer) = consumer.upgrade() else {
                break;
            };
            consumer.process(work).await;
        }
    }

    async fn run_watchdog(consumer: Weak<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let Some(consumer) = consumer.upgrade() else {
                break;
            };
            consumer.check_stalled();
        }
    }

    async fn process(&self, work: ConsumerWork) {
        match work {
            ConsumerWork::FetchListeners { topology } => {
                self.fetch_cluster_listeners(&topology).await;
            }
            ConsumerWork::Request {
                source,
                topology_id,
                segments,
            } => {
                if self.state.lock().topology_id() != topology_id {
                    return;
                }
                let command = Command::StateTransferStart {
                    segments: segments.clone(),
                    mode: TransferMode::Rebalance,
                };
                trace!(node_id = self.local_node, source, topology_id, "Requesting segments");
                match self.rpc.invoke(source, topology_id, command).await {
                    Ok(Reply::TransferStarted { missing }) => {
                        if !missing.is_empty() {
                            debug!(
                                node_id = self.local_node,
                                source,
                                missing = ?missing,
                                "Source does not hold requested segments"
                            );
                            self.retry_segments(&missing, source, topology_id);
                        }
                    }
                    Ok(other) => {
                        warn!(node_id = self.local_node, source, reply = ?other, "Unexpected reply");
                        self.retry_segments(&segments, source, topology_id);
                    }
                    Err(Error::Topology(e)) => {
                        // Either side is behind; the next install restarts the request.
                        debug!(node_id = self.local_node, source, error = %e, "Request rejected");
                    }
                    Err(e) => {
                        let err = Error::SourceUnreachable {
                            segment: segments.iter().next().copied().unwrap_or_default(),
                            source_node: source,
                        };
                        warn!(node_id = self.local_node, error = %err, cause = %e, "Transfer source failed");
                        self.retry_segments(&segments, source, topology_id);
                    }
                }
            }
            ConsumerWork::Cancel {
                source,
                topology_id,
                segments,
            } => {
                self.rpc
                    .send_and_forget(source, topology_id, Command::StateTransferCancel { segments });
            }
            ConsumerWork::Confirm {
                coordinator,
                topology_id,
                unavailable,
            } => {
                debug!(
                    node_id = self.local_node,
                    coordinator,
                    topology_id,
                    unavailable = unavailable.len(),
                    "Confirming rebalance"
                );
                let command = Command::RebalanceConfirm { unavailable };
                if let Err(e) = self.rpc.invoke(coordinator, topology_id, command).await {
                    warn!(node_id = self.local_node, coordinator, error = %e, "Rebalance confirm failed");
                }
            }
        }
    }

    async fn fetch_cluster_listeners(&self, topology: &CacheTopology) {
        for member in topology.members.iter().filter(|m| **m != self.local_node) {
            match self.rpc.invoke(*member, topology.id, Command::ClusterListeners).await {
                Ok(Reply::Listeners(listeners)) => {
                    let installed = self.listeners.install_all(listeners);
                    debug!(
                        node_id = self.local_node,
                        member, installed, "Installed cluster listeners"
                    );
                    return;
                }
                Ok(other) => {
                    debug!(node_id = self.local_node, member, reply = ?other, "Unexpected listener reply");
                }
                Err(e) => {
                    debug!(node_id = self.local_node, member, error = %e, "Listener fetch failed");
                }
            }
        }
    }
}

impl TopologyListener for StateConsumer {
    fn on_topology_changed(&self, old: Option<&Arc<CacheTopology>>, new: &Arc<CacheTopology>) {
        let local = self.local_node;
        if let Some(old) = old {
            let changes = topology_diff(old, new);
            trace!(
                node_id = local,
                topology_id = new.id,
                gained = ?changes.gained_by(local),
                lost = ?changes.lost_by(local),
                "Write ownership changed"
            );
        }
        let write_owned = new.write_ch().segments_owned_by(local);
        let read_owned = new.read_ch().segments_owned_by(local);

        let mut requests: BTreeMap<NodeId, SegmentSet> = BTreeMap::new();
        let mut cancels: BTreeMap<(NodeId, TopologyId), SegmentSet> = BTreeMap::new();
        let mut discard = SegmentSet::new();
        let mut fetch_listeners = false;

        {
            let mut state = self.state.lock();
            state.topology = Some(new.clone());
            state.unavailable.clear();

            if !state.listeners_fetched && read_owned.is_empty() && !write_owned.is_empty() {
                state.listeners_fetched = true;
                fetch_listeners = true;
            } else if !read_owned.is_empty() {
                state.listeners_fetched = true;
            }

            let mut held = SegmentSet::new();
            for segment in &write_owned {
                let current = state.states.get(segment).copied();
                if current == Some(SegmentState::Owned) {
                    continue;
                }
                if let Some(previous) = state.inbound.remove(segment) {
                    cancels
                        .entry((previous.source, previous.topology_id))
                        .or_default()
                        .insert(*segment);
                }
                if read_owned.contains(segment) {
                    state.states.insert(*segment, SegmentState::Owned);
                    held.insert(*segment);
                    continue;
                }

                match self.pick_source(new, *segment, &BTreeSet::new()) {
                    Some(source) => {
                        state.inbound.insert(
                            *segment,
                            InboundTransfer {
                                source,
                                topology_id: new.id,
                                blacklist: BTreeSet::new(),
                                last_progress: Instant::now(),
                            },
                        );
                        state.states.insert(*segment, SegmentState::Requested);
                        requests.entry(source).or_default().insert(*segment);
                    }
                    None => self.mark_unavailable(&mut state, *segment),
                }
            }

            let tracked: Vec<SegmentId> = state.states.keys().copied().collect();
            for segment in tracked {
                if write_owned.contains(&segment) || read_owned.contains(&segment) {
                    continue;
                }
                // A transfer cut short stays visible as cancelled until the
                // next install.
                if let Some(previous) = state.inbound.remove(&segment) {
                    cancels
                        .entry((previous.source, previous.topology_id))
                        .or_default()
                        .insert(segment);
                    state.states.insert(segment, SegmentState::Cancelled);
                } else {
                    state.states.remove(&segment);
                }
                discard.insert(segment);
            }

            if !held.is_empty() {
                self.container.add_segments(&held);
            }
            if !discard.is_empty() {
                self.container.remove_segments(&discard);
            }
        }

        if !requests.is_empty() || !discard.is_empty() {
            info!(
                node_id = local,
                topology_id = new.id,
                requested = requests.values().map(|s| s.len()).sum::<usize>(),
                discarded = discard.len(),
                "Segment ownership changed"
            );
        }

        if fetch_listeners {
            self.submit(ConsumerWork::FetchListeners {
                topology: new.clone(),
            });
        }
        for ((source, topology_id), segments) in cancels {
            self.submit(ConsumerWork::Cancel {
                source,
                topology_id,
                segments,
            });
        }
        for (source, segments) in requests {
            self.submit(ConsumerWork::Request {
                source,
                topology_id: new.id,
                segments,
            });
        }
        self.check_complete();
    }
}

#[async_trait::async_trait]
impl CommandHandler for StateConsumer {
    async fn handle(&self, envelope: Envelope) -> Result<Reply> {
        match envelope.command {
            Command::StateResponse {
                chunks,
                mode: TransferMode::Rebalance,
            } => {
                self.apply_state(envelope.origin, envelope.topology_id, chunks)
                    .await?;
                Ok(Reply::Ack)
            }
            other => Err(NetworkError::HandlerMissing(other.kind()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryDataContainer;
    use crate::testing::InMemoryNetwork;
    use crate::topology::HashPartitioner;
    use crate::transport::{CommandKind, MessageDispatcher, Transport};
    use crate::types::{CacheEntry, EntryMetadata};
    use bytes::Bytes;

    /// Source node that accepts every request but never streams anything,
    /// so chunks are delivered by hand. Cancelled segments are recorded.
    #[derive(Default)]
    struct SilentSource {
        cancelled: Mutex<SegmentSet>,
    }

    #[async_trait::async_trait]
    impl CommandHandler for SilentSource {
        async fn handle(&self, envelope: Envelope) -> Result<Reply> {
            match envelope.command {
                Command::StateTransferStart { .. } => Ok(Reply::TransferStarted {
                    missing: SegmentSet::new(),
                }),
                Command::StateTransferCancel { segments } => {
                    self.cancelled.lock().extend(segments);
                    Ok(Reply::Ack)
                }
                Command::ClusterListeners => Ok(Reply::Listeners(Vec::new())),
                _ => Ok(Reply::Ack),
            }
        }
    }

    struct Fixture {
        source: Arc<SilentSource>,
        tracker: Arc<TopologyTracker>,
        container: Arc<dyn DataContainer>,
        transactions: Arc<TransactionTable>,
        metrics: Arc<GridMetrics>,
        consumer: Arc<StateConsumer>,
        pending: Arc<CacheTopology>,
        gained: Vec<SegmentId>,
        _dispatcher: Arc<MessageDispatcher>,
        _network: Arc<InMemoryNetwork>,
    }

    /// Node 2 joins node 1 and is waiting for the segments it gained.
    fn joining_node() -> Fixture {
        let network = InMemoryNetwork::new();
        let source = Arc::new(SilentSource::default());
        let dispatcher = Arc::new(MessageDispatcher::new("c"));
        dispatcher.register(
            &[
                CommandKind::StateTransferStart,
                CommandKind::StateTransferCancel,
                CommandKind::RebalanceConfirm,
                CommandKind::ClusterListeners,
            ],
            source.clone(),
        );
        network.attach(1, &dispatcher);

        let tracker = Arc::new(TopologyTracker::new(2));
        let initial = tracker.install(CacheTopology::initial(8, 1, &[1])).unwrap();

        let transport: Arc<dyn Transport> = network.transport(2);
        let container: Arc<dyn DataContainer> = Arc::new(InMemoryDataContainer::new(8));
        let transactions = Arc::new(TransactionTable::new());
        let metrics = Arc::new(GridMetrics::new());
        let consumer = StateConsumer::new(
            StateTransferConfig::default(),
            tracker.clone(),
            container.clone(),
            Arc::new(HashPartitioner::new(8)),
            RpcClient::new(transport, "c", Duration::from_secs(5)),
            Arc::new(ClusterListenerRegistry::new()),
            transactions.clone(),
            metrics.clone(),
        );
        tracker.add_listener(consumer.clone());

        let pending = tracker
            .install(initial.with_pending(initial.read_ch().rebalance(&[1, 2])))
            .unwrap();
        let gained: Vec<SegmentId> = pending
            .pending_ch()
            .unwrap()
            .segments_owned_by(2)
            .into_iter()
            .collect();
        assert!(gained.len() >= 2);

        Fixture {
            source,
            tracker,
            container,
            transactions,
            metrics,
            consumer,
            pending,
            gained,
            _dispatcher: dispatcher,
            _network: network,
        }
    }

    fn versioned(key: &str, value: &str, version: u64) -> CacheEntry {
        CacheEntry::with_metadata(key.to_string(), value.to_string(), EntryMetadata::new(version))
    }

    fn contents(container: &dyn DataContainer, segment: SegmentId) -> Vec<CacheEntry> {
        container.read_segment(segment, None, usize::MAX).entries
    }

    #[tokio::test]
    async fn test_gained_segments_are_requested() {
        let f = joining_node();
        for segment in &f.gained {
            assert_eq!(f.consumer.segment_state(*segment), SegmentState::Requested);
            assert_eq!(f.consumer.source_of(*segment), Some(1));
        }
        assert!(f.consumer.is_state_transfer_in_progress());
        assert!(f.consumer.owned_segments().is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_chunk_changes_nothing() {
        let f = joining_node();
        let segment = f.gained[0];
        let topology_id = f.pending.id;
        let first = StateChunk::new(
            segment,
            0,
            vec![versioned("a", "1", 1), versioned("b", "2", 1)],
            false,
        );

        f.consumer.apply_state(1, topology_id, vec![first.clone()]).await.unwrap();
        let once = contents(f.container.as_ref(), segment);
        assert_eq!(once.len(), 2);
        assert_eq!(f.consumer.segment_state(segment), SegmentState::Receiving);

        f.consumer.apply_state(1, topology_id, vec![first]).await.unwrap();
        assert_eq!(contents(f.container.as_ref(), segment), once);
        assert_eq!(f.consumer.segment_state(segment), SegmentState::Receiving);
        assert_eq!(f.metrics.chunks_discarded_stale.get(), 0);

        let last = StateChunk::new(segment, 1, vec![versioned("c", "3", 1)], true);
        f.consumer.apply_state(1, topology_id, vec![last.clone()]).await.unwrap();
        let complete = contents(f.container.as_ref(), segment);
        assert_eq!(complete.len(), 3);
        assert_eq!(f.consumer.segment_state(segment), SegmentState::Owned);
        assert_eq!(f.consumer.source_of(segment), None);
        assert!(f.container.is_locally_owned(segment));

        // The record is gone, so the repeat is dropped rather than applied.
        let applied = f.metrics.chunks_applied.get();
        f.consumer.apply_state(1, topology_id, vec![last]).await.unwrap();
        assert_eq!(f.metrics.chunks_discarded_stale.get(), 1);
        assert_eq!(f.metrics.chunks_applied.get(), applied);
        assert_eq!(contents(f.container.as_ref(), segment), complete);
        assert_eq!(f.consumer.segment_state(segment), SegmentState::Owned);
    }

    #[tokio::test]
    async fn test_locked_keys_wait_for_transaction_outcome() {
        let f = joining_node();
        let (committed_segment, rolled_back_segment) = (f.gained[0], f.gained[1]);
        let topology_id = f.pending.id;

        // Commit: the transaction's newer value wins over the transferred one.
        let tx = f.transactions.begin();
        f.transactions
            .write(tx, committed_segment, versioned("k", "local", 5))
            .unwrap();
        let chunk = StateChunk::new(committed_segment, 0, vec![versioned("k", "transferred", 3)], true);
        f.consumer.apply_state(1, topology_id, vec![chunk]).await.unwrap();
        assert_eq!(f.metrics.entries_deferred.get(), 1);
        assert_eq!(f.metrics.entries_applied.get(), 0);
        assert!(f.container.get(committed_segment, b"k").is_none());
        assert_eq!(f.consumer.segment_state(committed_segment), SegmentState::Owned);

        assert_eq!(f.transactions.commit(tx, f.container.as_ref()).unwrap(), 1);
        let entry = f.container.get(committed_segment, b"k").unwrap();
        assert_eq!(entry.value, Bytes::from("local"));
        assert_eq!(entry.version(), 5);

        // Rollback: the held transferred value is applied.
        let tx = f.transactions.begin();
        f.transactions
            .write(tx, rolled_back_segment, versioned("j", "local", 5))
            .unwrap();
        let chunk = StateChunk::new(rolled_back_segment, 0, vec![versioned("j", "transferred", 3)], true);
        f.consumer.apply_state(1, topology_id, vec![chunk]).await.unwrap();
        assert_eq!(f.metrics.entries_deferred.get(), 2);
        assert!(f.container.get(rolled_back_segment, b"j").is_none());
        assert_eq!(f.transactions.deferred_len(), 1);

        assert_eq!(f.transactions.rollback(tx, f.container.as_ref()).unwrap(), 1);
        let entry = f.container.get(rolled_back_segment, b"j").unwrap();
        assert_eq!(entry.value, Bytes::from("transferred"));
        assert_eq!(entry.version(), 3);
        assert_eq!(f.transactions.deferred_len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_rebalance_cancels_inbound_segments() {
        let f = joining_node();
        let segment = f.gained[0];
        let old_id = f.pending.id;
        let partial = StateChunk::new(segment, 0, vec![versioned("a", "1", 1)], false);
        f.consumer.apply_state(1, old_id, vec![partial]).await.unwrap();
        assert!(f.container.get(segment, b"a").is_some());

        f.tracker.install(f.pending.without_pending()).unwrap();
        for gained in &f.gained {
            assert_eq!(f.consumer.segment_state(*gained), SegmentState::Cancelled);
        }
        assert!(!f.consumer.is_state_transfer_in_progress());
        assert!(f.container.get(segment, b"a").is_none());

        // Late chunks of the abandoned transfer are dropped.
        let late = StateChunk::new(segment, 1, vec![versioned("b", "2", 1)], true);
        f.consumer.apply_state(1, old_id, vec![late]).await.unwrap();
        assert_eq!(f.metrics.chunks_discarded_stale.get(), 1);
        assert!(f.container.get(segment, b"b").is_none());
        assert_ne!(f.consumer.segment_state(segment), SegmentState::Owned);

        // The source is told to stop.
        let expected: SegmentSet = f.gained.iter().copied().collect();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while *f.source.cancelled.lock() != expected && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*f.source.cancelled.lock(), expected);
    }
}
