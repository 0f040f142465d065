//! Outbound side of state transfer.
//!
//! A provider serves segment data to consumers. Every requested segment runs
//! as its own [`TransferTask`]: a task reads the segment in key order through
//! an [`AsyncBatchHandler`] and sends one chunk at a time, so a cancel observed
//! between two chunks stops the segment without blocking the caller.

use crate::config::StateTransferConfig;
use crate::error::{NetworkError, Result};
use crate::flow::{AsyncBatchHandler, Batch, BatchTarget, TargetFactory};
use crate::metrics::GridMetrics;
use crate::statetransfer::chunk::{StateChunk, TransferMode};
use crate::statetransfer::listeners::{ClusterListener, ClusterListenerRegistry};
use crate::storage::DataContainer;
use crate::topology::{CacheTopology, TopologyListener, TopologyTracker};
use crate::transport::{Command, CommandHandler, CommandKind, Envelope, Reply, RpcClient};
use crate::types::{NodeId, SegmentId, SegmentSet, TopologyId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Identifies one outbound segment transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TransferKey {
    destination: NodeId,
    segment: SegmentId,
    mode: TransferMode,
}

/// One segment being streamed to one destination.
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// Segment being sent.
    pub segment: SegmentId,

    /// Receiving node.
    pub destination: NodeId,

    /// Topology the transfer was requested at.
    pub topology_id: TopologyId,

    /// Transfer purpose.
    pub mode: TransferMode,

    task_id: u64,
    token: CancellationToken,
}

impl TransferTask {
    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Serves segment data to consumers.
pub struct StateProvider {
    local_node: NodeId,
    config: StateTransferConfig,
    tracker: Arc<TopologyTracker>,
    container: Arc<dyn DataContainer>,
    rpc: RpcClient,
    listeners: Arc<ClusterListenerRegistry>,
    metrics: Arc<GridMetrics>,
    transfers: Arc<Mutex<HashMap<TransferKey, TransferTask>>>,
    next_task_id: AtomicU64,
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("local_node", &self.local_node)
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}

impl StateProvider {
    /// Create a new provider.
    pub fn new(
        config: StateTransferConfig,
        tracker: Arc<TopologyTracker>,
        container: Arc<dyn DataContainer>,
        rpc: RpcClient,
        listeners: Arc<ClusterListenerRegistry>,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        Self {
            local_node: tracker.local_node(),
            config,
            tracker,
            container,
            rpc,
            listeners,
            metrics,
            transfers: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Start streaming `segments` to `destination`.
    ///
    /// Rebalance requests are validated against the local topology: stale ids
    /// are rejected, newer ids are briefly waited for. Returns the requested
    /// segments this node does not hold; nothing is sent for those.
    pub async fn start_outbound_transfer(
        &self,
        destination: NodeId,
        topology_id: TopologyId,
        segments: SegmentSet,
        mode: TransferMode,
    ) -> Result<SegmentSet> {
        if mode == TransferMode::Rebalance {
            self.tracker
                .validate(topology_id, self.config.topology_wait_timeout)
                .await?;
        }

        let (held, missing): (SegmentSet, SegmentSet) = segments
            .into_iter()
            .partition(|s| self.container.is_locally_owned(*s));

        debug!(
            node_id = self.local_node,
            destination,
            topology_id,
            ?mode,
            segments = held.len(),
            missing = missing.len(),
            "Starting outbound transfer"
        );

        for segment in held {
            let key = TransferKey {
                destination,
                segment,
                mode,
            };
            let task = TransferTask {
                segment,
                destination,
                topology_id,
                mode,
                task_id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
                token: CancellationToken::new(),
            };
            if let Some(previous) = self.transfers.lock().insert(key, task.clone()) {
                previous.token.cancel();
            }
            self.metrics.transfers_started.inc();

            let run = TransferRun {
                key,
                task,
                container: self.container.clone(),
                rpc: self.rpc.clone(),
                transfers: self.transfers.clone(),
                metrics: self.metrics.clone(),
                chunk_size: self.config.chunk_size,
            };
            tokio::spawn(run.run());
        }

        Ok(missing)
    }

    /// Cancel rebalance transfers of `segments` to `destination` requested at
    /// or before `topology_id`. Never blocks; unknown or finished transfers
    /// are ignored.
    pub fn cancel_outbound_transfer(
        &self,
        destination: NodeId,
        topology_id: TopologyId,
        segments: &SegmentSet,
    ) {
        let mut transfers = self.transfers.lock();
        for segment in segments {
            let key = TransferKey {
                destination,
                segment: *segment,
                mode: TransferMode::Rebalance,
            };
            let matches = transfers
                .get(&key)
                .map_or(false, |t| t.topology_id <= topology_id);
            if matches {
                if let Some(task) = transfers.remove(&key) {
                    task.token.cancel();
                    self.metrics.transfers_cancelled.inc();
                    debug!(
                        node_id = self.local_node,
                        destination,
                        segment,
                        "Cancelled outbound transfer"
                    );
                }
            }
        }
    }

    /// Cancel every transfer to the given nodes.
    pub fn cancel_transfers_to(&self, departed: &[NodeId]) -> usize {
        let mut transfers = self.transfers.lock();
        let before = transfers.len();
        transfers.retain(|key, task| {
            if departed.contains(&key.destination) {
                task.token.cancel();
                false
            } else {
                true
            }
        });
        let cancelled = before - transfers.len();
        self.metrics.transfers_cancelled.inc_by(cancelled as u64);
        cancelled
    }

    /// Cluster listeners a joining node must install before receiving state.
    pub fn get_cluster_listeners_to_install(&self) -> Vec<ClusterListener> {
        self.listeners.snapshot()
    }

    /// Number of running transfers.
    pub fn active_transfers(&self) -> usize {
        self.transfers.lock().len()
    }

    /// Snapshot of running transfers.
    pub fn transfers(&self) -> Vec<TransferTask> {
        self.transfers.lock().values().cloned().collect()
    }

    /// Whether a transfer of the segment to the destination is running.
    pub fn is_transferring(&self, destination: NodeId, segment: SegmentId) -> bool {
        self.transfers
            .lock()
            .keys()
            .any(|k| k.destination == destination && k.segment == segment)
    }
}

impl TopologyListener for StateProvider {
    fn on_topology_changed(&self, _old: Option<&Arc<CacheTopology>>, new: &Arc<CacheTopology>) {
        let departed: Vec<NodeId> = self
            .transfers
            .lock()
            .keys()
            .map(|k| k.destination)
            .filter(|d| !new.members.contains(d))
            .collect();
        if !departed.is_empty() {
            let cancelled = self.cancel_transfers_to(&departed);
            debug!(
                node_id = self.local_node,
                ?departed,
                cancelled,
                "Cancelled transfers to departed members"
            );
        }
    }
}

#[async_trait::async_trait]
impl CommandHandler for StateProvider {
    async fn handle(&self, envelope: Envelope) -> Result<Reply> {
        let origin = envelope.origin;
        match envelope.command {
            Command::StateTransferStart { segments, mode } => {
                let missing = self
                    .start_outbound_transfer(origin, envelope.topology_id, segments, mode)
                    .await?;
                Ok(Reply::TransferStarted { missing })
            }
            Command::ConflictResolutionStart { segments } => {
                let missing = self
                    .start_outbound_transfer(
                        origin,
                        envelope.topology_id,
                        segments,
                        TransferMode::ConflictResolution,
                    )
                    .await?;
                Ok(Reply::TransferStarted { missing })
            }
            Command::StateTransferCancel { segments } => {
                self.cancel_outbound_transfer(origin, envelope.topology_id, &segments);
                Ok(Reply::Ack)
            }
            Command::ClusterListeners => {
                Ok(Reply::Listeners(self.get_cluster_listeners_to_install()))
            }
            other => Err(NetworkError::HandlerMissing(other.kind()).into()),
        }
    }
}

impl StateProvider {
    /// Command kinds served by the provider.
    pub const COMMANDS: &'static [CommandKind] = &[
        CommandKind::StateTransferStart,
        CommandKind::StateTransferCancel,
        CommandKind::ConflictResolutionStart,
        CommandKind::ClusterListeners,
    ];
}

/// Reads one segment page by page.
struct SegmentChunkSource {
    container: Arc<dyn DataContainer>,
    segment: SegmentId,
    chunk_size: usize,
    cursor: Option<Bytes>,
    sequence: u64,
}

#[async_trait::async_trait]
impl BatchTarget for SegmentChunkSource {
    type Item = StateChunk;

    async fn fetch(&mut self, _amount: usize) -> Result<Batch<StateChunk>> {
        let scan = self
            .container
            .read_segment(self.segment, self.cursor.as_deref(), self.chunk_size);
        if let Some(last) = scan.entries.last() {
            self.cursor = Some(last.key.clone());
        }
        let chunk = StateChunk::new(self.segment, self.sequence, scan.entries, scan.exhausted);
        self.sequence += 1;

        Ok(if scan.exhausted {
            Batch::last(vec![chunk])
        } else {
            Batch::partial(vec![chunk])
        })
    }
}

/// Yields the single source of one segment.
struct SegmentChunkFactory(Option<SegmentChunkSource>);

impl TargetFactory for SegmentChunkFactory {
    type Target = SegmentChunkSource;

    fn next_target(&mut self) -> Option<SegmentChunkSource> {
        self.0.take()
    }
}

/// State moved into a spawned transfer task.
struct TransferRun {
    key: TransferKey,
    task: TransferTask,
    container: Arc<dyn DataContainer>,
    rpc: RpcClient,
    transfers: Arc<Mutex<HashMap<TransferKey, TransferTask>>>,
    metrics: Arc<GridMetrics>,
    chunk_size: usize,
}

impl TransferRun {
    async fn run(self) {
        let segment = self.task.segment;
        let destination = self.task.destination;
        let topology_id = self.task.topology_id;
        let mode = self.task.mode;
        let token = self.task.token.clone();

        let source = SegmentChunkSource {
            container: self.container.clone(),
            segment,
            chunk_size: self.chunk_size,
            cursor: None,
            sequence: 0,
        };
        let mut chunks = AsyncBatchHandler::spawn(SegmentChunkFactory(Some(source)), 1);

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = chunks.next_item() => Some(item),
            };

            let chunk = match next {
                None => {
                    chunks.cancel();
                    trace!(destination, segment, "Transfer stopped by cancel");
                    break;
                }
                Some(Ok(Some(chunk))) => chunk,
                Some(Ok(None)) => break,
                Some(Err(e)) => {
                    warn!(destination, segment, error = %e, "Reading segment failed");
                    break;
                }
            };

            if token.is_cancelled() {
                chunks.cancel();
                break;
            }

            let last = chunk.is_last_chunk;
            let entries = chunk.len();
            let command = Command::StateResponse {
                chunks: vec![chunk],
                mode,
            };
            let sent = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    chunks.cancel();
                    trace!(destination, segment, "Transfer stopped by cancel while sending");
                    break;
                }
                sent = self.rpc.invoke(destination, topology_id, command) => sent,
            };
            if let Err(e) = sent {
                warn!(
                    destination,
                    segment,
                    topology_id,
                    error = %e,
                    "Abandoning transfer, destination unreachable"
                );
                self.metrics.transfers_abandoned.inc();
                chunks.cancel();
                break;
            }
            self.metrics.chunks_sent.inc();
            trace!(destination, segment, entries, last, "Sent state chunk");

            if last {
                debug!(destination, segment, topology_id, "Outbound transfer complete");
                break;
            }
        }

        let mut transfers = self.transfers.lock();
        if transfers.get(&self.key).map(|t| t.task_id) == Some(self.task.task_id) {
            transfers.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryDataContainer;
    use crate::testing::InMemoryNetwork;
    use crate::transport::{MessageDispatcher, Transport};
    use crate::types::CacheEntry;
    use std::time::Duration;

    /// Collects every chunk delivered to a node.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<StateChunk>>);

    #[async_trait::async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, envelope: Envelope) -> Result<Reply> {
            if let Command::StateResponse { chunks, .. } = envelope.command {
                self.0.lock().extend(chunks);
            }
            Ok(Reply::Ack)
        }
    }

    /// Never answers.
    struct Stalled;

    #[async_trait::async_trait]
    impl CommandHandler for Stalled {
        async fn handle(&self, _envelope: Envelope) -> Result<Reply> {
            std::future::pending().await
        }
    }

    struct Fixture {
        network: Arc<InMemoryNetwork>,
        provider: StateProvider,
        metrics: Arc<GridMetrics>,
        _dispatcher: Arc<MessageDispatcher>,
    }

    /// Node 1 holds segments 0..4 with 5 entries each and streams 2 entries
    /// per chunk to node 2, served by `destination`.
    fn fixture(destination: Arc<dyn CommandHandler>, rpc_timeout: Duration) -> Fixture {
        let network = InMemoryNetwork::new();
        let dispatcher = Arc::new(MessageDispatcher::new("c"));
        dispatcher.register(&[CommandKind::StateResponse], destination);
        network.attach(2, &dispatcher);

        let tracker = Arc::new(TopologyTracker::new(1));
        tracker.install(CacheTopology::initial(4, 1, &[1, 2, 3])).unwrap();
        let container = Arc::new(InMemoryDataContainer::new(4));
        container.add_segments(&(0..4).collect::<SegmentSet>());
        for segment in 0..4 {
            for i in 0..5 {
                container.write(segment, CacheEntry::new(format!("k{segment}-{i}"), "v"));
            }
        }

        let transport: Arc<dyn Transport> = network.transport(1);
        let metrics = Arc::new(GridMetrics::new());
        let provider = StateProvider::new(
            StateTransferConfig::default().with_chunk_size(2),
            tracker,
            container,
            RpcClient::new(transport, "c", rpc_timeout),
            Arc::new(ClusterListenerRegistry::new()),
            metrics.clone(),
        );
        Fixture {
            network,
            provider,
            metrics,
            _dispatcher: dispatcher,
        }
    }

    async fn wait_idle(provider: &StateProvider) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while provider.active_transfers() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_cancel_before_first_chunk() {
        let recorder = Arc::new(Recorder::default());
        let f = fixture(recorder.clone(), Duration::from_secs(5));
        let segments: SegmentSet = [0, 1].into();

        f.provider
            .start_outbound_transfer(2, 1, segments.clone(), TransferMode::Rebalance)
            .await
            .unwrap();
        assert_eq!(f.provider.active_transfers(), 2);
        assert!(f.provider.is_transferring(2, 0));

        // A cancel from an older topology leaves the transfers alone.
        f.provider.cancel_outbound_transfer(2, 0, &segments);
        assert_eq!(f.provider.active_transfers(), 2);

        // Spawned tasks have not run yet on this single-threaded runtime.
        let reply = f
            .provider
            .handle(Envelope::new("c", 2, 1, Command::StateTransferCancel { segments }))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ack);
        assert_eq!(f.provider.active_transfers(), 0);
        assert!(!f.provider.is_transferring(2, 0));
        assert_eq!(f.metrics.transfers_cancelled.get(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.0.lock().is_empty());
        assert_eq!(f.metrics.chunks_sent.get(), 0);
        assert_eq!(f.metrics.transfers_abandoned.get(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let recorder = Arc::new(Recorder::default());
        let f = fixture(recorder.clone(), Duration::from_secs(5));
        let segments: SegmentSet = [3].into();

        let missing = f
            .provider
            .start_outbound_transfer(2, 1, segments.clone(), TransferMode::Rebalance)
            .await
            .unwrap();
        assert!(missing.is_empty());
        wait_idle(&f.provider).await;
        assert_eq!(f.provider.active_transfers(), 0);

        let chunks = recorder.0.lock().clone();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chunks[2].is_last_chunk);
        assert!(chunks[..2].iter().all(|c| !c.is_last_chunk));
        assert_eq!(chunks.iter().map(StateChunk::len).sum::<usize>(), 5);

        f.provider.cancel_outbound_transfer(2, 1, &segments);
        f.provider.cancel_outbound_transfer(2, 1, &segments);
        assert_eq!(f.metrics.transfers_cancelled.get(), 0);
        assert_eq!(f.metrics.chunks_sent.get(), 3);
        assert_eq!(recorder.0.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_stalled_destination() {
        let f = fixture(Arc::new(Stalled), Duration::from_millis(200));
        let segments: SegmentSet = [0].into();

        f.provider
            .start_outbound_transfer(2, 1, segments.clone(), TransferMode::Rebalance)
            .await
            .unwrap();
        // Let the task read its first chunk and block on the send.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.provider.active_transfers(), 1);

        f.provider.cancel_outbound_transfer(2, 1, &segments);
        assert_eq!(f.provider.active_transfers(), 0);
        assert_eq!(f.metrics.transfers_cancelled.get(), 1);

        // The interrupted send is not counted as a failed destination.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.metrics.transfers_abandoned.get(), 0);
        assert_eq!(f.metrics.chunks_sent.get(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_destination_then_cancel() {
        let recorder = Arc::new(Recorder::default());
        let f = fixture(recorder.clone(), Duration::from_secs(5));
        f.network.crash(2);
        let segments: SegmentSet = [1].into();

        f.provider
            .start_outbound_transfer(2, 1, segments.clone(), TransferMode::Rebalance)
            .await
            .unwrap();
        wait_idle(&f.provider).await;
        assert_eq!(f.provider.active_transfers(), 0);
        assert_eq!(f.metrics.transfers_abandoned.get(), 1);

        f.provider.cancel_outbound_transfer(2, 1, &segments);
        assert_eq!(f.metrics.transfers_cancelled.get(), 0);
        assert!(recorder.0.lock().is_empty());
    }
}
