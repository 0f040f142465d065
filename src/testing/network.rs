//! In-process network for multi-node tests.
//!
//! Every envelope and reply is round-tripped through the wire codec, so
//! anything that would fail to serialize fails here too. Nodes can be
//! crashed, split into partitions, or have single links cut, and a drop
//! probability can be set to lose a fraction of messages.

use crate::error::{Error, NetworkError, Result};
use crate::transport::{
    decode_envelope, decode_reply, encode_envelope, encode_reply, Envelope, MessageDispatcher,
    Reply, Transport,
};
use crate::types::NodeId;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Envelopes delivered to a handler.
    pub delivered: u64,
    /// Envelopes or replies lost to a crash, partition or random drop.
    pub dropped: u64,
}

/// Shared fabric connecting test nodes.
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<MessageDispatcher>>>,
    crashed: RwLock<HashSet<NodeId>>,
    /// Partition groups; nodes in different groups cannot talk. Empty means
    /// fully connected.
    partitions: RwLock<Vec<BTreeSet<NodeId>>>,
    /// Cut links, stored with the smaller id first.
    cut_links: RwLock<HashSet<(NodeId, NodeId)>>,
    drop_probability: RwLock<f64>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport endpoint for a node.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<NodeTransport> {
        Arc::new(NodeTransport {
            node,
            network: self.clone(),
        })
    }

    /// Route envelopes for `node` to `dispatcher`.
    pub fn attach(&self, node: NodeId, dispatcher: &Arc<MessageDispatcher>) {
        self.nodes.write().insert(node, Arc::downgrade(dispatcher));
        self.crashed.write().remove(&node);
    }

    /// Remove a node from the network.
    pub fn detach(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    /// Stop delivering to and from a node.
    pub fn crash(&self, node: NodeId) {
        self.crashed.write().insert(node);
    }

    /// Resume delivering to and from a crashed node.
    pub fn recover(&self, node: NodeId) {
        self.crashed.write().remove(&node);
    }

    /// Split the network into the given groups.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        *self.partitions.write() = groups
            .iter()
            .map(|g| g.iter().copied().collect())
            .collect();
    }

    /// Cut the link between two nodes in both directions.
    pub fn cut(&self, a: NodeId, b: NodeId) {
        self.cut_links.write().insert((a.min(b), a.max(b)));
    }

    /// Remove every partition and cut link.
    pub fn heal(&self) {
        self.partitions.write().clear();
        self.cut_links.write().clear();
    }

    /// Lose this fraction of messages at random.
    pub fn set_drop_probability(&self, probability: f64) {
        *self.drop_probability.write() = probability.clamp(0.0, 1.0);
    }

    /// Whether `from` can currently reach `to`.
    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let crashed = self.crashed.read();
        if crashed.contains(&from) || crashed.contains(&to) {
            return false;
        }
        if !self.nodes.read().contains_key(&to) {
            return false;
        }
        if from == to {
            return true;
        }
        if self.cut_links.read().contains(&(from.min(to), from.max(to))) {
            return false;
        }
        let partitions = self.partitions.read();
        partitions.is_empty()
            || partitions
                .iter()
                .any(|g| g.contains(&from) && g.contains(&to))
    }

    /// Message counters.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn should_drop(&self) -> bool {
        let probability = *self.drop_probability.read();
        probability > 0.0 && rand::rng().random::<f64>() < probability
    }

    async fn deliver(&self, from: NodeId, to: NodeId, envelope: Envelope) -> Result<Reply> {
        if !self.can_reach(from, to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetworkError::Unreachable(to).into());
        }
        if self.should_drop() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(from, to, kind = ?envelope.kind(), "Dropping envelope");
            return Err(NetworkError::Timeout(to).into());
        }

        let bytes = encode_envelope(&envelope)?;
        let Some(dispatcher) = self.nodes.read().get(&to).and_then(Weak::upgrade) else {
            return Err(NetworkError::Unreachable(to).into());
        };

        let envelope = decode_envelope(&bytes)?;
        let reply = tokio::spawn(async move { dispatcher.dispatch(envelope).await })
            .await
            .map_err(|e| Error::Internal(format!("handler task failed: {e}")))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);

        if !self.can_reach(to, from) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetworkError::Timeout(to).into());
        }
        decode_reply(&encode_reply(&reply)?)
    }
}

/// One node's endpoint on an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct NodeTransport {
    node: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait::async_trait]
impl Transport for NodeTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn send(&self, target: NodeId, envelope: Envelope) -> Result<Reply> {
        self.network.deliver(self.node, target, envelope).await
    }

    fn current_view(&self) -> Vec<NodeId> {
        let mut view: Vec<NodeId> = self
            .network
            .nodes
            .read()
            .keys()
            .copied()
            .filter(|n| self.network.can_reach(self.node, *n))
            .collect();
        view.sort_unstable();
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Command, CommandHandler, CommandKind};

    struct Echo;

    #[async_trait::async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, _envelope: Envelope) -> Result<Reply> {
            Ok(Reply::Ack)
        }
    }

    fn dispatcher() -> Arc<MessageDispatcher> {
        let dispatcher = Arc::new(MessageDispatcher::new("c"));
        dispatcher.register(&[CommandKind::TopologyQuery], Arc::new(Echo));
        dispatcher
    }

    fn query(from: NodeId) -> Envelope {
        Envelope::new("c", from, 1, Command::TopologyQuery)
    }

    #[tokio::test]
    async fn test_partitions_and_crashes() {
        let network = InMemoryNetwork::new();
        let (d1, d2, d3) = (dispatcher(), dispatcher(), dispatcher());
        network.attach(1, &d1);
        network.attach(2, &d2);
        network.attach(3, &d3);
        let t1 = network.transport(1);

        assert_eq!(t1.send(2, query(1)).await.unwrap(), Reply::Ack);
        assert_eq!(t1.current_view(), vec![1, 2, 3]);

        network.partition(&[&[1], &[2, 3]]);
        assert!(matches!(
            t1.send(2, query(1)).await,
            Err(Error::Network(NetworkError::Unreachable(2)))
        ));
        assert_eq!(t1.current_view(), vec![1]);
        assert!(network.can_reach(2, 3));

        network.heal();
        network.cut(1, 3);
        assert!(network.can_reach(1, 2));
        assert!(!network.can_reach(3, 1));

        network.heal();
        network.crash(2);
        assert!(t1.send(2, query(1)).await.is_err());
        network.recover(2);
        assert!(t1.send(2, query(1)).await.is_ok());

        let stats = network.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test]
    async fn test_drop_everything() {
        let network = InMemoryNetwork::new();
        let d1 = dispatcher();
        network.attach(1, &d1);
        network.set_drop_probability(1.0);
        let err = network.transport(1).send(1, query(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_dropped_dispatcher_is_unreachable() {
        let network = InMemoryNetwork::new();
        network.attach(1, &dispatcher());
        assert!(network.transport(1).send(1, query(1)).await.is_err());
    }
}
