//! Multi-node test harness.

use crate::config::GridConfig;
use crate::error::{Error, Result};
use crate::node::GridNode;
use crate::testing::network::InMemoryNetwork;
use crate::topology::CacheTopology;
use crate::types::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A set of [`GridNode`]s sharing one [`InMemoryNetwork`].
#[derive(Debug)]
pub struct TestCluster {
    /// The network connecting the nodes.
    pub network: Arc<InMemoryNetwork>,

    /// Configuration every new node starts from.
    template: GridConfig,

    /// Live nodes.
    nodes: BTreeMap<NodeId, Arc<GridNode>>,
}

impl TestCluster {
    /// Start nodes `1..=count` and install the initial topology from node 1.
    pub async fn start(count: usize, template: GridConfig) -> Result<Self> {
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            template,
            nodes: BTreeMap::new(),
        };
        let members: Vec<NodeId> = (1..=count as NodeId).collect();
        for node in &members {
            cluster.add_node(*node)?;
        }
        cluster.node(1)?.coordinator().bootstrap(members).await?;
        Ok(cluster)
    }

    /// Create a node and attach it to the network without making it a member.
    pub fn add_node(&mut self, node_id: NodeId) -> Result<Arc<GridNode>> {
        let config = GridConfig {
            node_id,
            ..self.template.clone()
        };
        let node = GridNode::new(config, self.network.transport(node_id))?;
        self.network.attach(node_id, node.dispatcher());
        self.nodes.insert(node_id, node.clone());
        Ok(node)
    }

    /// Add a node and rebalance it in.
    pub async fn join(&mut self, node_id: NodeId) -> Result<Arc<CacheTopology>> {
        self.add_node(node_id)?;
        self.coordinator()?.coordinator().node_joined(vec![node_id]).await
    }

    /// Crash a node and rebalance it out.
    pub async fn kill(&mut self, node_id: NodeId) -> Result<Arc<CacheTopology>> {
        self.crash(node_id);
        self.coordinator()?.coordinator().nodes_left(vec![node_id]).await
    }

    /// Crash a node without telling the coordinator.
    pub fn crash(&mut self, node_id: NodeId) {
        self.network.crash(node_id);
        self.network.detach(node_id);
        self.nodes.remove(&node_id);
    }

    /// A live node.
    pub fn node(&self, node_id: NodeId) -> Result<&Arc<GridNode>> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| Error::Internal(format!("no node {node_id}")))
    }

    /// Every live node.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<GridNode>> {
        self.nodes.values()
    }

    /// The live node coordinating the newest topology.
    pub fn coordinator(&self) -> Result<&Arc<GridNode>> {
        let newest = self
            .nodes
            .values()
            .filter_map(|n| n.topology())
            .max_by_key(|t| t.id)
            .ok_or_else(|| Error::Internal("no topology installed".to_string()))?;
        let coordinator = newest
            .members
            .iter()
            .find(|m| self.nodes.contains_key(m))
            .copied()
            .ok_or_else(|| Error::Internal("no live coordinator".to_string()))?;
        self.node(coordinator)
    }

    /// Wait until every live member has the same settled topology and no
    /// inbound transfer.
    pub async fn await_stable(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stable() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn is_stable(&self) -> bool {
        let mut ids = self.nodes.values().map(|n| n.topology().map(|t| t.id));
        let Some(Some(first)) = ids.next() else {
            return false;
        };
        ids.all(|id| id == Some(first))
            && self.nodes.values().all(|n| {
                n.topology().map_or(false, |t| !t.is_rebalancing())
                    && !n.is_state_transfer_in_progress()
            })
    }
}
