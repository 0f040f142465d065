//! Conflict resolution after a partition merge.
//!
//! Owners that lived in different partitions may hold different copies of the
//! same key. A [`StateReceiver`] collects every owner's copy of a segment
//! without applying anything, and the [`ConflictManager`] runs the configured
//! merge policy over keys whose copies diverge.

use crate::config::ConflictResolutionConfig;
use crate::error::{Error, Result};
use crate::metrics::GridMetrics;
use crate::statetransfer::StateChunk;
use crate::topology::{CacheTopology, KeyPartitioner, TopologyTracker};
use crate::transport::{Command, Reply, RpcClient};
use crate::types::{CacheEntry, NodeId, SegmentId, TopologyId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Built-in merge policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicyKind {
    /// Keep the preferred partition's copy, removing the key if it has none.
    PreferredAlways,
    /// Keep the preferred partition's copy, or the newest other copy if the
    /// preferred partition has none.
    PreferNonNull,
    /// Keep the copy with the highest version, then the latest write time.
    /// Equal versions with different values are left unresolved.
    LatestVersion,
    /// Remove every conflicting key.
    RemoveAll,
}

/// Result of merging the copies of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Write this entry on every owner.
    Keep(CacheEntry),
    /// Remove the key from every owner.
    Remove,
    /// The policy could not decide.
    Unresolved,
}

/// Decides the surviving copy of a conflicting key.
pub trait EntryMergePolicy: Send + Sync + std::fmt::Debug {
    /// Merge the preferred partition's copy with the other copies.
    fn merge(&self, preferred: Option<&CacheEntry>, others: &[Option<CacheEntry>]) -> MergeOutcome;
}

fn newest<'a>(entries: impl Iterator<Item = &'a CacheEntry>) -> Option<&'a CacheEntry> {
    entries.max_by_key(|e| (e.metadata.version, e.metadata.last_modified_ms))
}

impl EntryMergePolicy for MergePolicyKind {
    fn merge(&self, preferred: Option<&CacheEntry>, others: &[Option<CacheEntry>]) -> MergeOutcome {
        match self {
            MergePolicyKind::PreferredAlways => preferred
                .cloned()
                .map_or(MergeOutcome::Remove, MergeOutcome::Keep),
            MergePolicyKind::PreferNonNull => match preferred {
                Some(entry) => MergeOutcome::Keep(entry.clone()),
                None => newest(others.iter().flatten())
                    .cloned()
                    .map_or(MergeOutcome::Remove, MergeOutcome::Keep),
            },
            MergePolicyKind::LatestVersion => {
                let all: Vec<&CacheEntry> = preferred.into_iter().chain(others.iter().flatten()).collect();
                let Some(winner) = newest(all.iter().copied()) else {
                    return MergeOutcome::Remove;
                };
                let rank = (winner.metadata.version, winner.metadata.last_modified_ms);
                let tied_differently = all.iter().any(|e| {
                    (e.metadata.version, e.metadata.last_modified_ms) == rank && e.value != winner.value
                });
                if tied_differently {
                    MergeOutcome::Unresolved
                } else {
                    MergeOutcome::Keep(winner.clone())
                }
            }
            MergePolicyKind::RemoveAll => MergeOutcome::Remove,
        }
    }
}

/// Every owner's copy of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    /// Segment of the key.
    pub segment: SegmentId,

    /// The key.
    pub key: Bytes,

    /// Copy held by each responding owner, in owner order.
    pub versions: Vec<(NodeId, Option<CacheEntry>)>,
}

impl ConflictEntry {
    /// Whether the copies differ in presence, value or version.
    pub fn is_divergent(&self) -> bool {
        let mut copies = self.versions.iter().map(|(_, e)| e);
        let Some(first) = copies.next() else {
            return false;
        };
        copies.any(|other| !same_copy(first, other))
    }
}

fn same_copy(a: &Option<CacheEntry>, b: &Option<CacheEntry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.value == b.value && a.version() == b.version(),
        _ => false,
    }
}

/// Outcome of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    /// Segments compared.
    pub segments_checked: usize,

    /// Keys resolved by the policy.
    pub resolved: usize,

    /// Keys the policy could not resolve.
    pub unresolved: Vec<ConflictEntry>,
}

#[derive(Debug)]
struct Collection {
    expected: BTreeSet<NodeId>,
    done: BTreeSet<NodeId>,
    copies: BTreeMap<Bytes, BTreeMap<NodeId, CacheEntry>>,
}

impl Collection {
    fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.done)
    }
}

/// Collects every owner's copy of a segment without applying it.
#[derive(Debug)]
pub struct StateReceiver {
    local_node: NodeId,
    rpc: RpcClient,
    timeout: Duration,
    collections: Mutex<HashMap<SegmentId, Collection>>,
    progress: Notify,
}

impl StateReceiver {
    /// Create a receiver.
    pub fn new(rpc: RpcClient, timeout: Duration) -> Self {
        Self {
            local_node: rpc.local_node(),
            rpc,
            timeout,
            collections: Mutex::new(HashMap::new()),
            progress: Notify::new(),
        }
    }

    /// Accept conflict resolution chunks from an owner.
    pub fn receive(&self, origin: NodeId, chunks: Vec<StateChunk>) {
        let mut collections = self.collections.lock();
        for chunk in chunks {
            let Some(collection) = collections.get_mut(&chunk.segment) else {
                debug!(origin, segment = chunk.segment, "Dropping unsolicited conflict chunk");
                continue;
            };
            if !collection.expected.contains(&origin) {
                continue;
            }
            for entry in chunk.entries {
                collection
                    .copies
                    .entry(entry.key.clone())
                    .or_default()
                    .insert(origin, entry);
            }
            if chunk.is_last_chunk {
                collection.done.insert(origin);
            }
        }
        self.progress.notify_waiters();
    }

    /// Collect every owner's copy of `segment`. Owners that fail or do not
    /// finish in time are left out of the result.
    pub async fn collect(
        &self,
        topology_id: TopologyId,
        segment: SegmentId,
        owners: &[NodeId],
    ) -> Result<Vec<ConflictEntry>> {
        self.collections.lock().insert(
            segment,
            Collection {
                expected: owners.iter().copied().collect(),
                done: BTreeSet::new(),
                copies: BTreeMap::new(),
            },
        );

        let command = Command::ConflictResolutionStart {
            segments: [segment].into(),
        };
        for (owner, outcome) in self.rpc.invoke_all(owners, topology_id, command).await {
            let no_data = match outcome {
                Ok(Reply::TransferStarted { missing }) => missing.contains(&segment),
                Ok(other) => {
                    warn!(node_id = self.local_node, owner, reply = ?other, "Unexpected reply");
                    true
                }
                Err(e) => {
                    warn!(node_id = self.local_node, owner, segment, error = %e, "Owner left out of conflict check");
                    if let Some(c) = self.collections.lock().get_mut(&segment) {
                        c.expected.remove(&owner);
                    }
                    false
                }
            };
            if no_data {
                if let Some(c) = self.collections.lock().get_mut(&segment) {
                    c.done.insert(owner);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let notified = self.progress.notified();
            if self
                .collections
                .lock()
                .get(&segment)
                .map_or(true, |c| c.is_complete())
            {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(node_id = self.local_node, segment, "Timed out collecting conflict state");
                break;
            }
        }

        let Some(collection) = self.collections.lock().remove(&segment) else {
            return Ok(Vec::new());
        };
        let responders: Vec<NodeId> = owners
            .iter()
            .copied()
            .filter(|o| collection.done.contains(o))
            .collect();

        Ok(collection
            .copies
            .into_iter()
            .map(|(key, mut by_owner)| ConflictEntry {
                segment,
                key,
                versions: responders
                    .iter()
                    .map(|o| (*o, by_owner.remove(o)))
                    .collect(),
            })
            .collect())
    }
}

/// Queries and resolves divergent copies across owners.
#[derive(Debug)]
pub struct ConflictManager {
    local_node: NodeId,
    config: ConflictResolutionConfig,
    policy: Arc<dyn EntryMergePolicy>,
    tracker: Arc<TopologyTracker>,
    partitioner: Arc<dyn KeyPartitioner>,
    rpc: RpcClient,
    receiver: StateReceiver,
    metrics: Arc<GridMetrics>,
    in_progress: AtomicBool,
    running: tokio::sync::Mutex<()>,
    unresolved: Mutex<Vec<ConflictEntry>>,
}

impl ConflictManager {
    /// Create a manager using the configured built-in policy.
    pub fn new(
        config: ConflictResolutionConfig,
        tracker: Arc<TopologyTracker>,
        partitioner: Arc<dyn KeyPartitioner>,
        rpc: RpcClient,
        collect_timeout: Duration,
        metrics: Arc<GridMetrics>,
    ) -> Self {
        let policy = Arc::new(config.merge_policy);
        Self {
            local_node: tracker.local_node(),
            config,
            policy,
            tracker,
            partitioner,
            receiver: StateReceiver::new(rpc.clone(), collect_timeout),
            rpc,
            metrics,
            in_progress: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(()),
            unresolved: Mutex::new(Vec::new()),
        }
    }

    /// Replace the merge policy.
    pub fn with_policy(mut self, policy: Arc<dyn EntryMergePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Whether resolution runs automatically on merge.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a conflict check or resolution pass is running.
    pub fn is_conflict_resolution_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Conflicts left unresolved by the last pass.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictEntry> {
        self.unresolved.lock().clone()
    }

    /// Route conflict resolution chunks to the receiver.
    pub fn receive_state(&self, origin: NodeId, chunks: Vec<StateChunk>) {
        self.receiver.receive(origin, chunks);
    }

    /// Every write owner's copy of a key.
    pub async fn get_all_versions(&self, key: &[u8]) -> Result<Vec<(NodeId, Option<CacheEntry>)>> {
        let topology = self.tracker.current()?;
        let segment = self.partitioner.segment_of(key);
        let owners = topology.write_ch().owners_of(segment).to_vec();
        let command = Command::GetAllVersions {
            segment,
            key: Bytes::copy_from_slice(key),
        };

        let mut versions = Vec::with_capacity(owners.len());
        for (owner, outcome) in self.rpc.invoke_all(&owners, topology.id, command).await {
            match outcome? {
                Reply::Entry(entry) => versions.push((owner, entry)),
                other => return Err(other.unexpected()),
            }
        }
        Ok(versions)
    }

    /// Every key whose copies diverge across the current owners.
    pub async fn get_conflicts(&self) -> Result<Vec<ConflictEntry>> {
        let topology = self.tracker.current()?;
        let _running = self.running.lock().await;
        self.in_progress.store(true, Ordering::SeqCst);

        let mut conflicts = Vec::new();
        for segment in 0..topology.num_segments() {
            let owners = topology.read_ch().owners_of(segment);
            if owners.len() < 2 {
                continue;
            }
            let copies = self.receiver.collect(topology.id, segment, owners).await;
            match copies {
                Ok(copies) => conflicts.extend(copies.into_iter().filter(|c| c.is_divergent())),
                Err(e) => {
                    self.in_progress.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        self.in_progress.store(false, Ordering::SeqCst);
        Ok(conflicts)
    }

    /// Resolve divergent keys of every segment with more than one owner in
    /// `topology`. Copies held by `preferred` members win ties according to
    /// the policy.
    pub async fn resolve_conflicts(
        &self,
        topology: &CacheTopology,
        preferred: &[NodeId],
    ) -> Result<ResolutionReport> {
        let _running = self.running.lock().await;
        self.in_progress.store(true, Ordering::SeqCst);
        info!(
            node_id = self.local_node,
            topology_id = topology.id,
            policy = ?self.policy,
            "Conflict resolution started"
        );

        let mut report = ResolutionReport::default();
        for segment in 0..topology.num_segments() {
            let owners = topology.read_ch().owners_of(segment);
            if owners.len() < 2 {
                continue;
            }
            report.segments_checked += 1;

            let copies = match self.receiver.collect(topology.id, segment, owners).await {
                Ok(copies) => copies,
                Err(e) => {
                    self.in_progress.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };

            let mut writes = Vec::new();
            let mut removals = Vec::new();
            let mut targets: BTreeSet<NodeId> = BTreeSet::new();
            for conflict in copies.into_iter().filter(|c| c.is_divergent()) {
                let preferred_copy = conflict
                    .versions
                    .iter()
                    .find(|(node, _)| preferred.contains(node))
                    .and_then(|(_, e)| e.clone());
                let others: Vec<Option<CacheEntry>> = conflict
                    .versions
                    .iter()
                    .filter(|(node, _)| !preferred.contains(node))
                    .map(|(_, e)| e.clone())
                    .collect();

                targets.extend(conflict.versions.iter().map(|(node, _)| *node));
                match self.policy.merge(preferred_copy.as_ref(), &others) {
                    MergeOutcome::Keep(entry) => {
                        writes.push(entry);
                        report.resolved += 1;
                    }
                    MergeOutcome::Remove => {
                        removals.push(conflict.key.clone());
                        report.resolved += 1;
                    }
                    MergeOutcome::Unresolved => {
                        error!(
                            node_id = self.local_node,
                            segment,
                            key = ?conflict.key,
                            "Merge policy left conflict unresolved"
                        );
                        report.unresolved.push(conflict);
                    }
                }
            }

            if writes.is_empty() && removals.is_empty() {
                continue;
            }
            let targets: Vec<NodeId> = targets.into_iter().collect();
            let command = Command::ApplyResolution {
                segment,
                writes,
                removals,
            };
            for (owner, outcome) in self.rpc.invoke_all(&targets, topology.id, command).await {
                if let Err(e) = outcome {
                    warn!(node_id = self.local_node, owner, segment, error = %e, "Applying resolution failed");
                }
            }
        }

        self.metrics.conflicts_resolved.inc_by(report.resolved as u64);
        self.metrics
            .conflicts_unresolved
            .inc_by(report.unresolved.len() as u64);
        *self.unresolved.lock() = report.unresolved.clone();
        self.in_progress.store(false, Ordering::SeqCst);

        info!(
            node_id = self.local_node,
            segments = report.segments_checked,
            resolved = report.resolved,
            unresolved = report.unresolved.len(),
            "Conflict resolution finished"
        );
        Ok(report)
    }

    /// Resolve against the installed topology with its members preferred.
    pub async fn resolve_current(&self) -> Result<ResolutionReport> {
        let topology = self.tracker.current()?;
        let report = self.resolve_conflicts(&topology, &topology.members).await?;
        if !report.unresolved.is_empty() {
            return Err(Error::UnresolvedConflicts(report.unresolved.len()));
        }
        Ok(report)
    }
}
