//! Request/response helper over a [`Transport`].

use crate::error::{NetworkError, Result};
use crate::transport::message::{Command, Envelope, Reply};
use crate::transport::Transport;
use crate::types::{NodeId, TopologyId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::trace;

/// Sends commands for one cache and awaits replies with a timeout.
#[derive(Debug, Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    cache_name: String,
    timeout: Duration,
}

impl RpcClient {
    /// Create a new client.
    pub fn new(transport: Arc<dyn Transport>, cache_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            cache_name: cache_name.into(),
            timeout,
        }
    }

    /// This node's ID.
    pub fn local_node(&self) -> NodeId {
        self.transport.local_node()
    }

    /// Members currently reachable according to the transport.
    pub fn current_view(&self) -> Vec<NodeId> {
        self.transport.current_view()
    }

    /// Copy of this client with a different timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    fn envelope(&self, topology_id: TopologyId, command: Command) -> Envelope {
        Envelope::new(self.cache_name.clone(), self.local_node(), topology_id, command)
    }

    /// Send a command and wait for a successful reply.
    pub async fn invoke(&self, target: NodeId, topology_id: TopologyId, command: Command) -> Result<Reply> {
        let envelope = self.envelope(topology_id, command);
        trace!(target_node = target, kind = ?envelope.kind(), topology_id, "Invoking");

        match tokio::time::timeout(self.timeout, self.transport.send(target, envelope)).await {
            Ok(reply) => reply?.into_result(),
            Err(_) => Err(NetworkError::Timeout(target).into()),
        }
    }

    /// Send a command to several targets concurrently and collect each
    /// outcome in target order.
    pub async fn invoke_all(
        &self,
        targets: &[NodeId],
        topology_id: TopologyId,
        command: Command,
    ) -> Vec<(NodeId, Result<Reply>)> {
        let mut calls = JoinSet::new();
        for (index, target) in targets.iter().copied().enumerate() {
            let client = self.clone();
            let command = command.clone();
            calls.spawn(async move {
                (index, target, client.invoke(target, topology_id, command).await)
            });
        }

        let mut results = Vec::with_capacity(targets.len());
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => trace!(error = %e, "RPC task failed"),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, target, outcome)| (target, outcome))
            .collect()
    }

    /// Send a command without waiting for the reply.
    pub fn send_and_forget(&self, target: NodeId, topology_id: TopologyId, command: Command) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.invoke(target, topology_id, command).await {
                trace!(target_node = target, error = %e, "Fire-and-forget send failed");
            }
        });
    }
}
