//! Process-wide holder of the current topology.
//!
//! Topologies are published as immutable `Arc` snapshots through a watch
//! channel, so readers never see a half-installed topology and can wait for a
//! specific id. Installs are serialized and listeners run in install order.

use crate::error::{Result, TopologyError};
use crate::topology::consistent_hash::CacheTopology;
use crate::types::{NodeId, SegmentId, TopologyId};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Number of superseded topologies kept for in-flight validation.
const DEFAULT_HISTORY: usize = 8;

/// Callback invoked after a topology is installed.
///
/// Implementations must not block and must not install topologies themselves.
pub trait TopologyListener: Send + Sync {
    /// Called with the previous topology (if any) and the new one.
    fn on_topology_changed(&self, old: Option<&Arc<CacheTopology>>, new: &Arc<CacheTopology>);
}

/// Tracks the current and recent topologies of one cache on one node.
pub struct TopologyTracker {
    /// This node's ID.
    local_node: NodeId,

    /// The current snapshot.
    current: watch::Sender<Option<Arc<CacheTopology>>>,

    /// Recently superseded topologies, newest last.
    history: RwLock<VecDeque<Arc<CacheTopology>>>,

    /// Maximum history length.
    max_history: usize,

    /// Registered listeners.
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,

    /// Serializes installs.
    install_lock: Mutex<()>,
}

impl std::fmt::Debug for TopologyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyTracker")
            .field("local_node", &self.local_node)
            .field("topology_id", &self.topology_id())
            .finish()
    }
}

impl TopologyTracker {
    /// Create a tracker with no topology installed.
    pub fn new(local_node: NodeId) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            local_node,
            current,
            history: RwLock::new(VecDeque::new()),
            max_history: DEFAULT_HISTORY,
            listeners: RwLock::new(Vec::new()),
            install_lock: Mutex::new(()),
        }
    }

    /// This node's ID.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// The current topology, if one was installed.
    pub fn snapshot(&self) -> Option<Arc<CacheTopology>> {
        self.current.borrow().clone()
    }

    /// The current topology or an error if none was installed.
    pub fn current(&self) -> Result<Arc<CacheTopology>> {
        self.snapshot()
            .ok_or_else(|| TopologyError::NotInstalled.into())
    }

    /// The current topology id, 0 before the first install.
    pub fn topology_id(&self) -> TopologyId {
        self.current.borrow().as_ref().map_or(0, |t| t.id)
    }

    /// Look up a recently superseded (or the current) topology.
    pub fn historical(&self, id: TopologyId) -> Option<Arc<CacheTopology>> {
        if let Some(current) = self.snapshot() {
            if current.id == id {
                return Some(current);
            }
        }
        self.history.read().iter().find(|t| t.id == id).cloned()
    }

    /// Install a new topology. The id must be strictly greater than the
    /// current one.
    pub fn install(&self, topology: CacheTopology) -> Result<Arc<CacheTopology>> {
        let _guard = self.install_lock.lock();

        let old = self.snapshot();
        let current_id = old.as_ref().map_or(0, |t| t.id);
        if topology.id <= current_id {
            return Err(TopologyError::NotNewer {
                offered: topology.id,
                current: current_id,
            }
            .into());
        }

        let new = Arc::new(topology);
        self.current.send_replace(Some(new.clone()));

        if let Some(old) = &old {
            let mut history = self.history.write();
            history.push_back(old.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        info!(
            node_id = self.local_node,
            topology_id = new.id,
            rebalancing = new.is_rebalancing(),
            members = ?new.members,
            "Installed topology"
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_topology_changed(old.as_ref(), &new);
        }

        Ok(new)
    }

    /// Register a listener called after every install.
    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribe to topology changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CacheTopology>>> {
        self.current.subscribe()
    }

    /// Reject operations tagged with an older topology than ours.
    pub fn check_not_stale(&self, requested: TopologyId) -> Result<()> {
        let current = self.topology_id();
        if requested < current {
            debug!(
                node_id = self.local_node,
                requested, current, "Rejecting stale topology"
            );
            return Err(TopologyError::Stale { requested, current }.into());
        }
        Ok(())
    }

    /// Wait until a topology with at least the given id is installed.
    pub async fn await_topology(
        &self,
        expected: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|t| t.as_ref().map_or(false, |t| t.id >= expected))
                .await
                .map(|t| Option::clone(&t))
        })
        .await;

        match waited {
            Ok(Ok(Some(topology))) => Ok(topology),
            _ => Err(TopologyError::WaitTimeout {
                expected,
                current: self.topology_id(),
            }
            .into()),
        }
    }

    /// Validate a topology id carried by an incoming request: stale ids are
    /// rejected, newer ids are waited for.
    pub async fn validate(
        &self,
        requested: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        self.check_not_stale(requested)?;
        if requested > self.topology_id() {
            return self.await_topology(requested, timeout).await;
        }
        self.current()
    }

    /// Whether this node is a read owner of the segment in the current topology.
    pub fn is_local_owner(&self, segment: SegmentId) -> bool {
        self.snapshot()
            .map_or(false, |t| t.read_ch().is_owner(self.local_node, segment))
    }

    /// Whether this node is the primary read owner of the segment.
    pub fn is_local_primary(&self, segment: SegmentId) -> bool {
        self.snapshot()
            .map_or(false, |t| t.read_ch().primary_of(segment) == Some(self.local_node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        calls: AtomicUsize,
        last_old: Mutex<Option<TopologyId>>,
    }

    impl TopologyListener for CountingListener {
        fn on_topology_changed(&self, old: Option<&Arc<CacheTopology>>, _new: &Arc<CacheTopology>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_old.lock() = old.map(|t| t.id);
        }
    }

    fn topology(id: TopologyId) -> CacheTopology {
        let base = CacheTopology::initial(4, 1, &[1, 2]);
        CacheTopology::new(id, base.members.clone(), base.read_ch().clone(), None)
    }

    #[test]
    fn test_install_requires_increasing_ids() {
        let tracker = TopologyTracker::new(1);
        assert_eq!(tracker.topology_id(), 0);
        assert!(tracker.current().is_err());

        tracker.install(topology(1)).unwrap();
        tracker.install(topology(3)).unwrap();
        assert_eq!(tracker.topology_id(), 3);

        let err = tracker.install(topology(3)).unwrap_err();
        assert!(matches!(
            err,
            Error::Topology(TopologyError::NotNewer { offered: 3, current: 3 })
        ));
        assert!(tracker.install(topology(2)).is_err());
    }

    #[test]
    fn test_listeners_see_old_and_new() {
        let tracker = TopologyTracker::new(1);
        let listener = Arc::new(CountingListener {
            calls: AtomicUsize::new(0),
            last_old: Mutex::new(None),
        });
        tracker.add_listener(listener.clone());

        tracker.install(topology(1)).unwrap();
        assert_eq!(*listener.last_old.lock(), None);
        tracker.install(topology(2)).unwrap();
        assert_eq!(*listener.last_old.lock(), Some(1));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_history_and_stale_check() {
        let tracker = TopologyTracker::new(1);
        for id in 1..=12 {
            tracker.install(topology(id)).unwrap();
        }
        assert!(tracker.historical(12).is_some());
        assert!(tracker.historical(11).is_some());
        assert!(tracker.historical(1).is_none());

        assert!(tracker.check_not_stale(12).is_ok());
        assert!(tracker.check_not_stale(13).is_ok());
        let err = tracker.check_not_stale(5).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_await_topology() {
        let tracker = Arc::new(TopologyTracker::new(1));
        tracker.install(topology(1)).unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.await_topology(2, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.install(topology(2)).unwrap();

        let installed = waiter.await.unwrap().unwrap();
        assert_eq!(installed.id, 2);

        let err = tracker
            .await_topology(9, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Topology(TopologyError::WaitTimeout { expected: 9, current: 2 })
        ));
    }

    #[test]
    fn test_local_ownership() {
        let tracker = TopologyTracker::new(2);
        tracker.install(topology(1)).unwrap();
        assert!(tracker.is_local_primary(1));
        assert!(!tracker.is_local_primary(0));
        assert!(tracker.is_local_owner(1));
        assert!(!tracker.is_local_owner(0));
    }
}
