//! A grid member: one node's components wired to the transport.
//!
//! ```text
//!                         ┌──────────────── GridNode ────────────────┐
//!   Transport ──► MessageDispatcher                                   │
//!                  ├─ StateTransferStart/Cancel ──► StateProvider     │
//!                  ├─ StateResponse ──► Rebalance ──► StateConsumer   │
//!                  │                 └► ConflictResolution ──►        │
//!                  │                        ConflictManager           │
//!                  ├─ *Publisher ──► PublisherHandler                 │
//!                  ├─ RebalanceConfirm ──► StateTransferCoordinator   │
//!                  └─ topology / storage commands ──► NodeCommands    │
//!                         │                                           │
//!   TopologyTracker ── listeners ──► consumer, provider, publishers   │
//!                         └───────────────────────────────────────────┘
//! ```

use crate::config::GridConfig;
use crate::error::{Error, NetworkError, Result, TopologyError};
use crate::metrics::GridMetrics;
use crate::publisher::{
    ClusterPublisher, ClusterPublisherManager, DeliveryGuarantee, PublisherHandler,
    PublisherRequest, TransformRegistry,
};
use crate::rebalancing::{ConflictManager, StateTransferCoordinator};
use crate::statetransfer::{
    ClusterListener, ClusterListenerRegistry, SegmentState, StateConsumer, StateProvider,
    TransactionTable, TransferMode,
};
use crate::storage::{DataContainer, InMemoryDataContainer};
use crate::topology::{CacheTopology, HashPartitioner, KeyPartitioner, TopologyTracker};
use crate::transport::{
    Command, CommandHandler, CommandKind, Envelope, MessageDispatcher, Reply, RpcClient, Transport,
};
use crate::types::{CacheEntry, EntryMetadata, NodeId, SegmentId};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

/// Times a routed operation is retried after an owner rejects it as stale.
const MAX_TOPOLOGY_RETRIES: usize = 3;

/// Topology and storage commands served directly by the node.
struct NodeCommands {
    local_node: NodeId,
    config: GridConfig,
    tracker: Arc<TopologyTracker>,
    container: Arc<dyn DataContainer>,
    consumer: Arc<StateConsumer>,
    conflicts: Arc<ConflictManager>,
}

impl NodeCommands {
    const COMMANDS: &'static [CommandKind] = &[
        CommandKind::StateResponse,
        CommandKind::TopologyUpdate,
        CommandKind::TopologyQuery,
        CommandKind::ApplyResolution,
        CommandKind::WriteEntries,
        CommandKind::RemoveKeys,
        CommandKind::ReadEntry,
        CommandKind::GetAllVersions,
    ];
}

#[async_trait::async_trait]
impl CommandHandler for NodeCommands {
    async fn handle(&self, envelope: Envelope) -> Result<Reply> {
        let origin = envelope.origin;
        let topology_id = envelope.topology_id;
        match envelope.command {
            Command::StateResponse {
                chunks,
                mode: TransferMode::ConflictResolution,
            } => {
                self.conflicts.receive_state(origin, chunks);
                Ok(Reply::Ack)
            }
            command @ Command::StateResponse { .. } => {
                self.consumer
                    .handle(Envelope { command, ..envelope })
                    .await
            }
            Command::TopologyUpdate { topology } => {
                match self.tracker.install(topology) {
                    Ok(_) | Err(Error::Topology(TopologyError::NotNewer { .. })) => Ok(Reply::Ack),
                    Err(e) => Err(e),
                }
            }
            Command::TopologyQuery => Ok(Reply::Topology(
                self.tracker.snapshot().map(|t| (*t).clone()),
            )),
            Command::ApplyResolution {
                segment,
                writes,
                removals,
            } => {
                debug!(
                    node_id = self.local_node,
                    origin,
                    segment,
                    writes = writes.len(),
                    removals = removals.len(),
                    "Applying conflict resolution"
                );
                for entry in writes {
                    self.container.write(segment, entry);
                }
                for key in removals {
                    self.container.remove(segment, &key);
                }
                Ok(Reply::Ack)
            }
            Command::WriteEntries { segment, entries } => {
                self.tracker
                    .validate(topology_id, self.config.state_transfer.topology_wait_timeout)
                    .await?;
                for entry in entries {
                    self.container.write(segment, entry);
                }
                Ok(Reply::Ack)
            }
            Command::RemoveKeys { segment, keys } => {
                self.tracker
                    .validate(topology_id, self.config.state_transfer.topology_wait_timeout)
                    .await?;
                for key in keys {
                    self.container.remove(segment, &key);
                }
                Ok(Reply::Ack)
            }
            Command::ReadEntry { segment, key } => {
                self.tracker
                    .validate(topology_id, self.config.state_transfer.topology_wait_timeout)
                    .await?;
                Ok(Reply::Entry(self.container.get(segment, &key)))
            }
            Command::GetAllVersions { segment, key } => Ok(Reply::Entry(self.container.get(segment, &key))),
            other => Err(NetworkError::HandlerMissing(other.kind()).into()),
        }
    }
}

/// One member of the grid.
pub struct GridNode {
    config: GridConfig,
    tracker: Arc<TopologyTracker>,
    container: Arc<dyn DataContainer>,
    partitioner: Arc<dyn KeyPartitioner>,
    dispatcher: Arc<MessageDispatcher>,
    rpc: RpcClient,
    provider: Arc<StateProvider>,
    consumer: Arc<StateConsumer>,
    coordinator: Arc<StateTransferCoordinator>,
    conflicts: Arc<ConflictManager>,
    publishers: Arc<PublisherHandler>,
    cluster_publisher: ClusterPublisherManager,
    listeners: Arc<ClusterListenerRegistry>,
    transactions: Arc<TransactionTable>,
    transforms: Arc<TransformRegistry>,
    metrics: Arc<GridMetrics>,
}

impl std::fmt::Debug for GridNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridNode")
            .field("node_id", &self.config.node_id)
            .field("cache_name", &self.config.cache_name)
            .field("topology_id", &self.tracker.topology_id())
            .finish()
    }
}

impl GridNode {
    /// Create a node backed by an in-memory container.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: GridConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let container = Arc::new(InMemoryDataContainer::new(config.num_segments));
        Self::with_container(config, transport, container)
    }

    /// Create a node over the given container.
    pub fn with_container(
        config: GridConfig,
        transport: Arc<dyn Transport>,
        container: Arc<dyn DataContainer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if transport.local_node() != config.node_id {
            return Err(Error::Config(format!(
                "transport is bound to node {}, config names node {}",
                transport.local_node(),
                config.node_id
            )));
        }

        let state_transfer = config.state_transfer.clone();
        let metrics = Arc::new(GridMetrics::new());
        let tracker = Arc::new(TopologyTracker::new(config.node_id));
        let partitioner: Arc<dyn KeyPartitioner> = Arc::new(HashPartitioner::new(config.num_segments));
        let rpc = RpcClient::new(transport, config.cache_name.clone(), state_transfer.transfer_timeout);
        let dispatcher = Arc::new(MessageDispatcher::new(config.cache_name.clone()));
        let listeners = Arc::new(ClusterListenerRegistry::new());
        let transactions = Arc::new(TransactionTable::new());
        let transforms = Arc::new(TransformRegistry::new());

        let provider = Arc::new(StateProvider::new(
            state_transfer.clone(),
            tracker.clone(),
            container.clone(),
            rpc.clone(),
            listeners.clone(),
            metrics.clone(),
        ));
        let consumer = StateConsumer::new(
            state_transfer.clone(),
            tracker.clone(),
            container.clone(),
            partitioner.clone(),
            rpc.clone(),
            listeners.clone(),
            transactions.clone(),
            metrics.clone(),
        );
        let conflicts = Arc::new(ConflictManager::new(
            config.conflict.clone(),
            tracker.clone(),
            partitioner.clone(),
            rpc.clone(),
            state_transfer.transfer_timeout,
            metrics.clone(),
        ));
        let coordinator = Arc::new(StateTransferCoordinator::new(
            config.num_segments,
            config.num_owners,
            state_transfer.clone(),
            tracker.clone(),
            rpc.clone(),
            conflicts.clone(),
            metrics.clone(),
        ));
        let publishers = Arc::new(PublisherHandler::new(
            tracker.clone(),
            container.clone(),
            transforms.clone(),
            metrics.clone(),
            state_transfer.topology_wait_timeout,
        ));
        let cluster_publisher =
            ClusterPublisherManager::new(tracker.clone(), rpc.clone(), config.publisher.clone());

        let commands = Arc::new(NodeCommands {
            local_node: config.node_id,
            config: config.clone(),
            tracker: tracker.clone(),
            container: container.clone(),
            consumer: consumer.clone(),
            conflicts: conflicts.clone(),
        });

        dispatcher.register(StateProvider::COMMANDS, provider.clone());
        dispatcher.register(StateTransferCoordinator::COMMANDS, coordinator.clone());
        dispatcher.register(PublisherHandler::COMMANDS, publishers.clone());
        dispatcher.register(NodeCommands::COMMANDS, commands);

        tracker.add_listener(consumer.clone());
        tracker.add_listener(provider.clone());
        tracker.add_listener(publishers.clone());

        info!(
            node_id = config.node_id,
            cache_name = %config.cache_name,
            num_segments = config.num_segments,
            num_owners = config.num_owners,
            "Grid node created"
        );

        Ok(Arc::new(Self {
            config,
            tracker,
            container,
            partitioner,
            dispatcher,
            rpc,
            provider,
            consumer,
            coordinator,
            conflicts,
            publishers,
            cluster_publisher,
            listeners,
            transactions,
            transforms,
            metrics,
        }))
    }

    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Node configuration.
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Handle an incoming envelope.
    pub async fn receive(&self, envelope: Envelope) -> Reply {
        self.dispatcher.dispatch(envelope).await
    }

    /// The dispatcher incoming envelopes go through.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Topology tracker.
    pub fn tracker(&self) -> &Arc<TopologyTracker> {
        &self.tracker
    }

    /// The installed topology.
    pub fn topology(&self) -> Option<Arc<CacheTopology>> {
        self.tracker.snapshot()
    }

    /// Local storage.
    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    /// State provider.
    pub fn provider(&self) -> &Arc<StateProvider> {
        &self.provider
    }

    /// State consumer.
    pub fn consumer(&self) -> &Arc<StateConsumer> {
        &self.consumer
    }

    /// Rebalance coordinator. Only the topology's first member drives it.
    pub fn coordinator(&self) -> &Arc<StateTransferCoordinator> {
        &self.coordinator
    }

    /// Conflict manager.
    pub fn conflicts(&self) -> &Arc<ConflictManager> {
        &self.conflicts
    }

    /// Publisher handler serving remote iterations.
    pub fn publishers(&self) -> &Arc<PublisherHandler> {
        &self.publishers
    }

    /// Named transforms available to publishers targeting this node.
    pub fn transforms(&self) -> &Arc<TransformRegistry> {
        &self.transforms
    }

    /// Local transactions.
    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    /// Node metrics.
    pub fn metrics(&self) -> &Arc<GridMetrics> {
        &self.metrics
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        self.partitioner.segment_of(key)
    }

    /// Register a cluster-wide listener. Joining nodes fetch it before they
    /// receive state.
    pub fn add_cluster_listener(&self, name: impl Into<String>) -> ClusterListener {
        let listener = ClusterListener::new(self.config.node_id, name);
        self.listeners.register(listener.clone());
        listener
    }

    /// Cluster listeners known to this node.
    pub fn cluster_listeners(&self) -> Vec<ClusterListener> {
        self.listeners.snapshot()
    }

    /// Read a key from the local copy if it is fully held here, from the
    /// primary owner otherwise. A read rejected by an owner that is ahead of
    /// this node is retried once that topology arrives here.
    pub async fn get(&self, key: &[u8]) -> Result<Option<CacheEntry>> {
        let mut attempt = 0;
        loop {
            match self.get_once(key).await {
                Err(err) => {
                    attempt += 1;
                    self.refresh_after(err, attempt, self.segment_of(key)).await?;
                }
                done => return done,
            }
        }
    }

    async fn get_once(&self, key: &[u8]) -> Result<Option<CacheEntry>> {
        let topology = self.tracker.current()?;
        let segment = self.segment_of(key);
        let local = self.config.node_id;

        if topology.read_ch().is_owner(local, segment)
            && self.consumer.segment_state(segment) == SegmentState::Owned
        {
            return Ok(self.container.get(segment, key));
        }

        let primary = topology
            .read_ch()
            .primary_of(segment)
            .ok_or_else(|| Error::SegmentUnavailable([segment].into()))?;
        let command = Command::ReadEntry {
            segment,
            key: Bytes::copy_from_slice(key),
        };
        match self.rpc.invoke(primary, topology.id, command).await? {
            Reply::Entry(entry) => Ok(entry),
            other => Err(other.unexpected()),
        }
    }

    /// Write a value to every write owner of its segment. The entry version
    /// is one above the latest visible version.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<CacheEntry> {
        self.put_with_metadata(key, value, None).await
    }

    /// Write a value that expires at an absolute time.
    pub async fn put_with_expiration(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expires_at_ms: u64,
    ) -> Result<CacheEntry> {
        self.put_with_metadata(key, value, Some(expires_at_ms)).await
    }

    async fn put_with_metadata(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expires_at_ms: Option<u64>,
    ) -> Result<CacheEntry> {
        let key = key.into();
        let version = self.get(&key).await?.map_or(0, |e| e.version()) + 1;
        let mut metadata = EntryMetadata::new(version);
        metadata.expires_at_ms = expires_at_ms;
        let entry = CacheEntry::with_metadata(key, value, metadata);

        let segment = self.segment_of(&entry.key);
        let command = Command::WriteEntries {
            segment,
            entries: vec![entry.clone()],
        };
        self.to_write_owners(segment, command).await?;
        Ok(entry)
    }

    /// Remove a key from every write owner of its segment.
    pub async fn remove(&self, key: &[u8]) -> Result<()> {
        let segment = self.segment_of(key);
        let command = Command::RemoveKeys {
            segment,
            keys: vec![Bytes::copy_from_slice(key)],
        };
        self.to_write_owners(segment, command).await
    }

    /// Send a write to every write owner. When an owner rejects it as
    /// stale, the whole write is re-sent to the owners of the newer
    /// topology so that no owner is left without it.
    async fn to_write_owners(&self, segment: SegmentId, command: Command) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.write_once(segment, command.clone()).await {
                Err(err) => {
                    attempt += 1;
                    self.refresh_after(err, attempt, segment).await?;
                }
                done => return done,
            }
        }
    }

    async fn write_once(&self, segment: SegmentId, command: Command) -> Result<()> {
        let topology = self.tracker.current()?;
        let owners = topology.write_ch().owners_of(segment).to_vec();
        if owners.is_empty() {
            return Err(Error::SegmentUnavailable([segment].into()));
        }

        let mut failure = None;
        for (owner, outcome) in self.rpc.invoke_all(&owners, topology.id, command).await {
            match outcome {
                Ok(_) => {}
                Err(err @ Error::Topology(TopologyError::Stale { .. })) => return Err(err),
                Err(err) => {
                    debug!(
                        node_id = self.config.node_id,
                        owner,
                        segment,
                        error = %err,
                        "Write to owner failed"
                    );
                    failure.get_or_insert(err);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Catch up with the topology an owner reported before an operation is
    /// retried: the segment's owners are asked for it, and it is awaited in
    /// case the coordinator's broadcast gets here first. Any other error, or
    /// running out of attempts, ends the operation with that error.
    async fn refresh_after(&self, err: Error, attempt: usize, segment: SegmentId) -> Result<()> {
        let Error::Topology(TopologyError::Stale { requested, current }) = err else {
            return Err(err);
        };
        if attempt > MAX_TOPOLOGY_RETRIES {
            return Err(err);
        }
        debug!(
            node_id = self.config.node_id,
            requested,
            current,
            attempt,
            "Owner is ahead, retrying on its topology"
        );

        let owners = self.tracker.current()?.write_ch().owners_of(segment).to_vec();
        for owner in owners.into_iter().filter(|o| *o != self.config.node_id) {
            if self.tracker.topology_id() >= current {
                break;
            }
            match self.rpc.invoke(owner, requested, Command::TopologyQuery).await {
                Ok(Reply::Topology(Some(topology))) if topology.id >= current => {
                    match self.tracker.install(topology) {
                        Ok(_) | Err(Error::Topology(TopologyError::NotNewer { .. })) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(node_id = self.config.node_id, owner, error = %e, "Topology query failed");
                }
            }
        }

        self.tracker
            .await_topology(current, self.config.state_transfer.topology_wait_timeout)
            .await?;
        Ok(())
    }

    /// Start a cluster-wide iteration.
    pub fn publish(&self, request: PublisherRequest) -> Result<ClusterPublisher> {
        self.cluster_publisher.publish(request)
    }

    /// Iterate every entry of the cache with the given guarantee.
    pub fn entries(&self, guarantee: DeliveryGuarantee) -> Result<ClusterPublisher> {
        let request = self.cluster_publisher.request(guarantee)?;
        self.publish(request)
    }

    /// Iterate every key of the cache with the given guarantee.
    pub fn keys(&self, guarantee: DeliveryGuarantee) -> Result<ClusterPublisher> {
        let request = self.cluster_publisher.request(guarantee)?.keys_only();
        self.publish(request)
    }

    /// Whether this node is still receiving segments.
    pub fn is_state_transfer_in_progress(&self) -> bool {
        self.consumer.is_state_transfer_in_progress()
    }
}
