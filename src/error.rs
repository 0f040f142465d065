//! Error types for the grid.

use crate::transport::CommandKind;
use crate::types::{NodeId, SegmentId, SegmentSet, TopologyId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the grid.
#[derive(Error, Debug)]
pub enum Error {
    /// Topology related errors.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// A transfer source died or stopped answering.
    #[error("transfer source {source_node} unreachable for segment {segment}")]
    SourceUnreachable {
        segment: SegmentId,
        source_node: NodeId,
    },

    /// No owner is left to provide these segments.
    #[error("segments unavailable: {0:?}")]
    SegmentUnavailable(SegmentSet),

    /// Rebalance did not complete in time.
    #[error("rebalance {topology_id} timed out waiting for {missing:?}")]
    RebalanceTimeout {
        topology_id: TopologyId,
        missing: Vec<NodeId>,
    },

    /// Rebalance failed after exhausting its attempts.
    #[error("rebalance failed: {0}")]
    RebalanceFailed(String),

    /// Conflicts the merge policy could not resolve.
    #[error("{0} conflicts left unresolved")]
    UnresolvedConflicts(usize),

    /// No publisher registered under the request id.
    #[error("publisher not found: {0}")]
    PublisherNotFound(String),

    /// A live publisher is already registered under the request id.
    #[error("publisher already registered and not complete: {0}")]
    PublisherAlreadyRegistered(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller should refresh its topology and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Topology(TopologyError::Stale { .. })
                | Error::Topology(TopologyError::WaitTimeout { .. })
                | Error::Network(NetworkError::Unreachable(_))
                | Error::Network(NetworkError::Timeout(_))
                | Error::SourceUnreachable { .. }
        )
    }
}

/// Topology validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyError {
    /// Operation tagged with an older topology than the receiver's.
    #[error("stale topology {requested}, current is {current}")]
    Stale {
        requested: TopologyId,
        current: TopologyId,
    },

    /// Receiver never installed the topology the sender used.
    #[error("timed out waiting for topology {expected}, current is {current}")]
    WaitTimeout {
        expected: TopologyId,
        current: TopologyId,
    },

    /// Topology ids must strictly increase.
    #[error("topology {offered} does not supersede {current}")]
    NotNewer {
        offered: TopologyId,
        current: TopologyId,
    },

    /// No topology installed yet.
    #[error("no topology installed")]
    NotInstalled,
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Target node is not reachable.
    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    /// Request timed out.
    #[error("request to node {0} timed out")]
    Timeout(NodeId),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Receiver has no handler for the message kind.
    #[error("no handler for {0:?}")]
    HandlerMissing(CommandKind),

    /// The remote handler failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// The reply did not match the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let stale: Error = TopologyError::Stale {
            requested: 3,
            current: 5,
        }
        .into();
        assert!(stale.is_retryable());
        assert!(Error::Network(NetworkError::Unreachable(2)).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::SegmentUnavailable(SegmentSet::from([1])).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::SourceUnreachable {
            segment: 4,
            source_node: 2,
        };
        assert_eq!(err.to_string(), "transfer source 2 unreachable for segment 4");
    }
}
