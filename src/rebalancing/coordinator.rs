//! Cluster-wide rebalance driver.
//!
//! The coordinator (the first member of the topology) installs a pending
//! topology on every member, waits for each member to confirm it received its
//! gained segments, then commits the pending owners. Members that do not
//! confirm in time are treated as failed and the rebalance restarts without
//! them.

use crate::config::StateTransferConfig;
use crate::error::{Error, NetworkError, Result, TopologyError};
use crate::metrics::GridMetrics;
use crate::rebalancing::conflict::ConflictManager;
use crate::topology::{diff, CacheTopology, ConsistentHash, TopologyTracker};
use crate::transport::{Command, CommandHandler, CommandKind, Envelope, Reply, RpcClient};
use crate::types::{NodeId, SegmentSet, TopologyId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// State of a rebalance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    /// Pending topology installed, waiting for confirmations.
    Transferring,
    /// Every member confirmed; committing.
    Committing,
    /// Committed.
    Complete,
    /// Gave up.
    Failed,
}

/// What triggered a rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceType {
    /// Nodes joined.
    Join(Vec<NodeId>),
    /// Nodes left or failed.
    Leave(Vec<NodeId>),
    /// Partitions merged.
    Merge,
    /// Requested explicitly.
    Manual,
}

/// Record of one rebalance operation.
#[derive(Debug, Clone)]
pub struct RebalanceOperationInfo {
    /// Operation id.
    pub id: u64,

    /// Trigger.
    pub rebalance_type: RebalanceType,

    /// Current state.
    pub state: RebalanceState,

    /// Id of the last pending topology installed.
    pub topology_id: TopologyId,

    /// Attempts made so far.
    pub attempts: usize,

    /// When the operation started.
    pub started_at: Instant,

    /// When the operation finished.
    pub completed_at: Option<Instant>,

    /// Failure reason.
    pub error: Option<String>,
}

impl RebalanceOperationInfo {
    /// Time spent so far.
    pub fn duration(&self) -> Duration {
        self.completed_at
            .map(|t| t.duration_since(self.started_at))
            .unwrap_or_else(|| self.started_at.elapsed())
    }
}

#[derive(Debug)]
struct PendingConfirmations {
    topology_id: TopologyId,
    waiting: BTreeSet<NodeId>,
    unavailable: SegmentSet,
}

/// Drives rebalances and partition merges from the coordinating member.
#[derive(Debug)]
pub struct StateTransferCoordinator {
    local_node: NodeId,
    num_segments: u32,
    num_owners: usize,
    config: StateTransferConfig,
    tracker: Arc<TopologyTracker>,
    rpc: RpcClient,
    conflicts: Arc<ConflictManager>,
    metrics: Arc<GridMetrics>,
    pending: Mutex<Option<PendingConfirmations>>,
    confirmed: Notify,
    running: tokio::sync::Mutex<()>,
    next_operation_id: AtomicU64,
    operations: RwLock<Vec<RebalanceOperationInfo>>,
    max_history: usize,
}

impl StateTransferCoordinator {
    /// Create a new coordinator.
    pub fn new(
        num_segments: u32,
        num_owners: usize,
        config: StateTransferConfig,
        tracker: Arc<TopologyTracker>,
        rpc: RpcClient,
        conflicts: Arc<ConflictManager>,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        Self {
            local_node: tracker.local_node(),
            num_segments,
            num_owners,
            config,
            tracker,
            rpc,
            conflicts,
            metrics,
            pending: Mutex::new(None),
            confirmed: Notify::new(),
            running: tokio::sync::Mutex::new(()),
            next_operation_id: AtomicU64::new(1),
            operations: RwLock::new(Vec::new()),
            max_history: 100,
        }
    }

    /// Install the first topology of the cache over the founding members.
    pub async fn bootstrap(&self, members: Vec<NodeId>) -> Result<Arc<CacheTopology>> {
        let members = self.coordinator_first(members)?;
        let topology = CacheTopology::initial(self.num_segments, self.num_owners, &members);
        info!(node_id = self.local_node, ?members, "Bootstrapping cache topology");
        self.install_and_broadcast(topology).await
    }

    /// Rebalance after `joiners` joined.
    pub async fn node_joined(&self, joiners: Vec<NodeId>) -> Result<Arc<CacheTopology>> {
        let mut members = self.tracker.current()?.members.clone();
        for node in &joiners {
            if !members.contains(node) {
                members.push(*node);
            }
        }
        self.rebalance(RebalanceType::Join(joiners), members).await
    }

    /// Rebalance after `leavers` left or failed.
    pub async fn nodes_left(&self, leavers: Vec<NodeId>) -> Result<Arc<CacheTopology>> {
        let members = self
            .tracker
            .current()?
            .members
            .iter()
            .copied()
            .filter(|m| !leavers.contains(m))
            .collect();
        self.rebalance(RebalanceType::Leave(leavers), members).await
    }

    /// Move ownership to a balanced assignment over `members`.
    ///
    /// Retries with reduced membership when members fail to confirm, up to
    /// the configured number of attempts.
    pub async fn rebalance(
        &self,
        rebalance_type: RebalanceType,
        members: Vec<NodeId>,
    ) -> Result<Arc<CacheTopology>> {
        let _running = self.running.lock().await;
        let mut members = self.coordinator_first(members)?;
        let op_id = self.begin_operation(rebalance_type.clone());
        self.metrics.rebalances_started.inc();
        info!(
            node_id = self.local_node,
            op_id,
            ?rebalance_type,
            ?members,
            "Rebalance started"
        );

        for attempt in 1..=self.config.max_rebalance_attempts {
            let current = self.tracker.current()?;
            let leavers: Vec<NodeId> = current
                .members
                .iter()
                .copied()
                .filter(|m| !members.contains(m))
                .collect();
            let surviving = current.read_ch().without_members(&leavers);
            let target = surviving.rebalance(&members);

            if target == surviving {
                let settled = if leavers.is_empty() && !current.is_rebalancing() && current.members == members {
                    current
                } else {
                    self.install_and_broadcast(CacheTopology::new(
                        current.id + 1,
                        members.clone(),
                        surviving,
                        None,
                    ))
                    .await?
                };
                self.finish_operation(op_id, RebalanceState::Complete, settled.id, None);
                return Ok(settled);
            }

            let moves = diff(&surviving, &target);
            debug!(
                node_id = self.local_node,
                op_id,
                attempt,
                segment_moves = moves.total_changes(),
                gaining = ?moves.gaining_nodes().collect::<Vec<_>>(),
                "Installing pending ownership"
            );
            let pending = CacheTopology::new(current.id + 1, members.clone(), surviving, Some(target));
            self.update_operation(op_id, RebalanceState::Transferring, pending.id, attempt);
            self.expect_confirmations(pending.id, &members);
            let pending = self.install_and_broadcast(pending).await?;

            match self.await_confirmations(self.config.rebalance_timeout).await {
                Ok(unavailable) if unavailable.is_empty() => {
                    self.update_operation(op_id, RebalanceState::Committing, pending.id, attempt);
                    let committed = self.install_and_broadcast(pending.committed()).await?;
                    self.metrics.rebalances_committed.inc();
                    self.finish_operation(op_id, RebalanceState::Complete, committed.id, None);
                    info!(
                        node_id = self.local_node,
                        op_id,
                        topology_id = committed.id,
                        attempt,
                        "Rebalance committed"
                    );
                    return Ok(committed);
                }
                Ok(unavailable) => {
                    error!(
                        node_id = self.local_node,
                        op_id,
                        segments = ?unavailable,
                        "Rebalance aborted, segments unavailable"
                    );
                    let abandoned = self.install_and_broadcast(pending.without_pending()).await?;
                    let err = Error::SegmentUnavailable(unavailable);
                    self.finish_operation(op_id, RebalanceState::Failed, abandoned.id, Some(&err));
                    return Err(err);
                }
                Err(missing) => {
                    self.metrics.rebalances_restarted.inc();
                    warn!(
                        node_id = self.local_node,
                        op_id,
                        topology_id = pending.id,
                        ?missing,
                        attempt,
                        "Rebalance timed out, restarting without unresponsive members"
                    );
                    if attempt == self.config.max_rebalance_attempts {
                        let err = Error::RebalanceTimeout {
                            topology_id: pending.id,
                            missing,
                        };
                        self.finish_operation(op_id, RebalanceState::Failed, pending.id, Some(&err));
                        return Err(err);
                    }
                    members.retain(|m| !missing.contains(m) || *m == self.local_node);
                }
            }
        }

        let err = Error::RebalanceFailed(format!(
            "no attempt succeeded out of {}",
            self.config.max_rebalance_attempts
        ));
        self.finish_operation(op_id, RebalanceState::Failed, self.tracker.topology_id(), Some(&err));
        Err(err)
    }

    /// Reconcile the topologies of healed partitions.
    ///
    /// Every member reports its topology. The partition with the most members
    /// (highest topology id on ties) is preferred; the union of all
    /// partitions' owners is installed, conflicts are resolved if enabled,
    /// and a normal rebalance brings ownership back to the configured owner
    /// count.
    pub async fn handle_merge(&self, members: Vec<NodeId>) -> Result<Arc<CacheTopology>> {
        let members = self.coordinator_first(members)?;
        let local_id = self.tracker.topology_id();

        let mut partitions: BTreeMap<(TopologyId, Vec<NodeId>), CacheTopology> = BTreeMap::new();
        for (node, outcome) in self.rpc.invoke_all(&members, local_id, Command::TopologyQuery).await {
            match outcome {
                Ok(Reply::Topology(Some(topology))) => {
                    partitions
                        .entry((topology.id, topology.members.clone()))
                        .or_insert(topology);
                }
                Ok(Reply::Topology(None)) => {
                    debug!(node_id = self.local_node, node, "Member has no topology");
                }
                Ok(other) => return Err(other.unexpected()),
                Err(e) => {
                    warn!(node_id = self.local_node, node, error = %e, "Member did not report topology");
                }
            }
        }

        let Some(preferred) = partitions
            .values()
            .max_by_key(|t| (t.members.len(), t.id))
            .cloned()
        else {
            return Err(TopologyError::NotInstalled.into());
        };

        let mut union = preferred.read_ch().clone();
        let mut max_id = preferred.id;
        for topology in partitions.values() {
            if topology.id == preferred.id && topology.members == preferred.members {
                continue;
            }
            union = union.union(topology.read_ch());
            max_id = max_id.max(topology.id);
        }
        let absent: Vec<NodeId> = union
            .members()
            .iter()
            .copied()
            .filter(|m| !members.contains(m))
            .collect();
        let union: ConsistentHash = union.without_members(&absent);

        info!(
            node_id = self.local_node,
            partitions = partitions.len(),
            preferred_id = preferred.id,
            preferred_members = ?preferred.members,
            "Merging partitions"
        );

        let merged = self
            .install_and_broadcast(CacheTopology::new(max_id + 1, members.clone(), union, None))
            .await?;

        let mut unresolved = 0;
        if self.conflicts.is_enabled() && partitions.len() > 1 {
            let report = self
                .conflicts
                .resolve_conflicts(&merged, &preferred.members)
                .await?;
            unresolved = report.unresolved.len();
        }

        let topology = self.rebalance(RebalanceType::Merge, members).await?;
        if unresolved > 0 {
            return Err(Error::UnresolvedConflicts(unresolved));
        }
        Ok(topology)
    }

    /// Record a member's confirmation for a pending topology.
    pub fn handle_confirm(&self, origin: NodeId, topology_id: TopologyId, unavailable: SegmentSet) {
        let mut pending = self.pending.lock();
        let Some(p) = pending.as_mut() else {
            debug!(node_id = self.local_node, origin, topology_id, "Confirmation with no rebalance running");
            return;
        };
        if p.topology_id != topology_id {
            debug!(
                node_id = self.local_node,
                origin,
                topology_id,
                expected = p.topology_id,
                "Ignoring confirmation for another topology"
            );
            return;
        }
        p.waiting.remove(&origin);
        p.unavailable.extend(unavailable);
        debug!(
            node_id = self.local_node,
            origin,
            topology_id,
            remaining = p.waiting.len(),
            "Rebalance confirmed by member"
        );
        self.confirmed.notify_waiters();
    }

    /// Whether a rebalance is running.
    pub fn is_rebalance_in_progress(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Recent rebalance operations, oldest first.
    pub fn operations(&self) -> Vec<RebalanceOperationInfo> {
        self.operations.read().clone()
    }

    /// The conflict manager.
    pub fn conflicts(&self) -> &Arc<ConflictManager> {
        &self.conflicts
    }

    fn coordinator_first(&self, mut members: Vec<NodeId>) -> Result<Vec<NodeId>> {
        let Some(pos) = members.iter().position(|m| *m == self.local_node) else {
            return Err(Error::RebalanceFailed(format!(
                "coordinator {} is not a member",
                self.local_node
            )));
        };
        let local = members.remove(pos);
        members.insert(0, local);
        members.dedup();
        Ok(members)
    }

    async fn install_and_broadcast(&self, topology: CacheTopology) -> Result<Arc<CacheTopology>> {
        let installed = self.tracker.install(topology)?;
        let others: Vec<NodeId> = installed
            .members
            .iter()
            .copied()
            .filter(|m| *m != self.local_node)
            .collect();

        let command = Command::TopologyUpdate {
            topology: (*installed).clone(),
        };
        for (node, outcome) in self.rpc.invoke_all(&others, installed.id, command).await {
            if let Err(e) = outcome {
                warn!(
                    node_id = self.local_node,
                    node,
                    topology_id = installed.id,
                    error = %e,
                    "Topology update not delivered"
                );
            }
        }
        Ok(installed)
    }

    fn expect_confirmations(&self, topology_id: TopologyId, members: &[NodeId]) {
        *self.pending.lock() = Some(PendingConfirmations {
            topology_id,
            waiting: members.iter().copied().collect(),
            unavailable: SegmentSet::new(),
        });
    }

    /// Wait until every expected member confirmed. Returns the unavailable
    /// segments reported, or the members still missing at the deadline.
    async fn await_confirmations(&self, timeout: Duration) -> std::result::Result<SegmentSet, Vec<NodeId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.confirmed.notified();
            {
                let mut pending = self.pending.lock();
                if let Some(p) = pending.as_ref() {
                    if p.waiting.is_empty() {
                        let unavailable = p.unavailable.clone();
                        *pending = None;
                        return Ok(unavailable);
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut pending = self.pending.lock();
                let missing = pending
                    .take()
                    .map(|p| p.waiting.into_iter().collect())
                    .unwrap_or_default();
                return Err(missing);
            }
        }
    }

    fn begin_operation(&self, rebalance_type: RebalanceType) -> u64 {
        let id = self.next_operation_id.fetch_add(1, Ordering::SeqCst);
        let mut operations = self.operations.write();
        operations.push(RebalanceOperationInfo {
            id,
            rebalance_type,
            state: RebalanceState::Transferring,
            topology_id: self.tracker.topology_id(),
            attempts: 0,
            started_at: Instant::now(),
            completed_at: None,
            error: None,
        });
        if operations.len() > self.max_history {
            operations.remove(0);
        }
        id
    }

    fn update_operation(&self, id: u64, state: RebalanceState, topology_id: TopologyId, attempt: usize) {
        if let Some(op) = self.operations.write().iter_mut().find(|op| op.id == id) {
            op.state = state;
            op.topology_id = topology_id;
            op.attempts = attempt;
        }
    }

    fn finish_operation(&self, id: u64, state: RebalanceState, topology_id: TopologyId, error: Option<&Error>) {
        if let Some(op) = self.operations.write().iter_mut().find(|op| op.id == id) {
            op.state = state;
            op.topology_id = topology_id;
            op.completed_at = Some(Instant::now());
            op.error = error.map(|e| e.to_string());
        }
    }
}

#[async_trait::async_trait]
impl CommandHandler for StateTransferCoordinator {
    async fn handle(&self, envelope: Envelope) -> Result<Reply> {
        match envelope.command {
            Command::RebalanceConfirm { unavailable } => {
                self.handle_confirm(envelope.origin, envelope.topology_id, unavailable);
                Ok(Reply::Ack)
            }
            other => Err(NetworkError::HandlerMissing(other.kind()).into()),
        }
    }
}

impl StateTransferCoordinator {
    /// Command kinds served by the coordinator.
    pub const COMMANDS: &'static [CommandKind] = &[CommandKind::RebalanceConfirm];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictResolutionConfig;
    use crate::topology::HashPartitioner;
    use crate::transport::Transport;

    /// Transport for a single-member cluster: every send fails.
    #[derive(Debug)]
    struct Isolated(NodeId);

    #[async_trait::async_trait]
    impl Transport for Isolated {
        fn local_node(&self) -> NodeId {
            self.0
        }

        async fn send(&self, target: NodeId, _envelope: Envelope) -> Result<Reply> {
            Err(NetworkError::Unreachable(target).into())
        }

        fn current_view(&self) -> Vec<NodeId> {
            vec![self.0]
        }
    }

    fn coordinator(config: StateTransferConfig) -> StateTransferCoordinator {
        let tracker = Arc::new(TopologyTracker::new(1));
        let rpc = RpcClient::new(Arc::new(Isolated(1)), "test", Duration::from_millis(50));
        let metrics = Arc::new(GridMetrics::new());
        let conflicts = Arc::new(ConflictManager::new(
            ConflictResolutionConfig::default(),
            tracker.clone(),
            Arc::new(HashPartitioner::new(8)),
            rpc.clone(),
            Duration::from_millis(50),
            metrics.clone(),
        ));
        StateTransferCoordinator::new(8, 2, config, tracker, rpc, conflicts, metrics)
    }

    #[tokio::test]
    async fn test_bootstrap_puts_coordinator_first() {
        let coordinator = coordinator(StateTransferConfig::default());
        let topology = coordinator.bootstrap(vec![3, 1, 2]).await.unwrap();
        assert_eq!(topology.id, 1);
        assert_eq!(topology.coordinator(), Some(1));
        assert!(!topology.is_rebalancing());
    }

    #[tokio::test]
    async fn test_rebalance_rejects_non_member_coordinator() {
        let coordinator = coordinator(StateTransferConfig::default());
        coordinator.bootstrap(vec![1]).await.unwrap();
        let err = coordinator
            .rebalance(RebalanceType::Manual, vec![2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RebalanceFailed(_)));
    }

    #[tokio::test]
    async fn test_unchanged_membership_is_a_noop() {
        let coordinator = coordinator(StateTransferConfig::default());
        coordinator.bootstrap(vec![1]).await.unwrap();

        let same = coordinator.rebalance(RebalanceType::Manual, vec![1]).await.unwrap();
        assert_eq!(same.id, 1);

        let ops = coordinator.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].state, RebalanceState::Complete);
        assert_eq!(coordinator.metrics.rebalances_started.get(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_timeout_on_last_attempt_fails() {
        let config = StateTransferConfig::default()
            .with_rebalance_timeout(Duration::from_millis(30))
            .with_max_rebalance_attempts(1);
        let coordinator = coordinator(config);
        coordinator.bootstrap(vec![1]).await.unwrap();

        let err = coordinator
            .rebalance(RebalanceType::Join(vec![2]), vec![1, 2])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RebalanceTimeout { topology_id: 2, .. }));
        assert!(!coordinator.is_rebalance_in_progress());

        let op = coordinator.operations().pop().unwrap();
        assert_eq!(op.state, RebalanceState::Failed);
        assert!(op.error.is_some());
        assert!(op.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unresponsive_joiner_is_dropped_on_retry() {
        let config = StateTransferConfig::default()
            .with_rebalance_timeout(Duration::from_millis(30))
            .with_max_rebalance_attempts(3);
        let coordinator = coordinator(config);
        coordinator.bootstrap(vec![1]).await.unwrap();

        let topology = coordinator
            .rebalance(RebalanceType::Join(vec![2]), vec![1, 2])
            .await
            .unwrap();
        assert_eq!(topology.members, vec![1]);
        assert!(!topology.is_rebalancing());
        assert_eq!(coordinator.metrics.rebalances_restarted.get(), 1);
        assert_eq!(coordinator.operations()[0].state, RebalanceState::Complete);
    }

    #[test]
    fn test_confirm_for_other_topology_is_ignored() {
        let coordinator = coordinator(StateTransferConfig::default());
        coordinator.expect_confirmations(5, &[1, 2]);
        coordinator.handle_confirm(2, 4, SegmentSet::new());
        assert_eq!(coordinator.pending.lock().as_ref().unwrap().waiting.len(), 2);

        coordinator.handle_confirm(2, 5, [3].into_iter().collect());
        let pending = coordinator.pending.lock();
        let p = pending.as_ref().unwrap();
        assert_eq!(p.waiting.len(), 1);
        assert!(p.unavailable.contains(&3));
    }
}
