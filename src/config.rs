//! Configuration types for the grid.

use crate::error::{Error, Result};
use crate::rebalancing::MergePolicyKind;
use crate::types::NodeId;
use std::time::Duration;

/// Main configuration for a grid node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Name of the cache this node serves.
    pub cache_name: String,

    /// Number of segments the key space is split into. Fixed at creation.
    pub num_segments: u32,

    /// Number of owners (primary + backups) per segment.
    pub num_owners: usize,

    /// State transfer configuration.
    pub state_transfer: StateTransferConfig,

    /// Distributed publisher configuration.
    pub publisher: PublisherConfig,

    /// Conflict resolution configuration.
    pub conflict: ConflictResolutionConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cache_name: "default".to_string(),
            num_segments: 256,
            num_owners: 2,
            state_transfer: StateTransferConfig::default(),
            publisher: PublisherConfig::default(),
            conflict: ConflictResolutionConfig::default(),
        }
    }
}

impl GridConfig {
    /// Create a new configuration for the given node.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the cache name.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Set the number of owners per segment.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Set state transfer configuration.
    pub fn with_state_transfer(mut self, state_transfer: StateTransferConfig) -> Self {
        self.state_transfer = state_transfer;
        self
    }

    /// Set publisher configuration.
    pub fn with_publisher(mut self, publisher: PublisherConfig) -> Self {
        self.publisher = publisher;
        self
    }

    /// Set conflict resolution configuration.
    pub fn with_conflict_resolution(mut self, conflict: ConflictResolutionConfig) -> Self {
        self.conflict = conflict;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be > 0".to_string()));
        }
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be > 0".to_string()));
        }
        if self.state_transfer.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".to_string()));
        }
        if self.publisher.batch_size == 0 {
            return Err(Error::Config("publisher batch_size must be > 0".to_string()));
        }
        if self.state_transfer.max_rebalance_attempts == 0 {
            return Err(Error::Config(
                "max_rebalance_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Maximum entries per state chunk.
    pub chunk_size: usize,

    /// How long an inbound transfer may go without progress before the
    /// consumer re-requests the segment from another owner.
    pub transfer_timeout: Duration,

    /// How long a receiver waits for a topology the sender already has.
    pub topology_wait_timeout: Duration,

    /// How long the coordinator waits for every node to confirm a rebalance.
    pub rebalance_timeout: Duration,

    /// Rebalance attempts before the coordinator gives up.
    pub max_rebalance_attempts: usize,

    /// Treat segments with no surviving owner as empty instead of failing.
    pub allow_data_loss: bool,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            transfer_timeout: Duration::from_secs(30),
            topology_wait_timeout: Duration::from_secs(10),
            rebalance_timeout: Duration::from_secs(60),
            max_rebalance_attempts: 3,
            allow_data_loss: false,
        }
    }
}

impl StateTransferConfig {
    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the inbound transfer timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Set the topology wait timeout.
    pub fn with_topology_wait_timeout(mut self, timeout: Duration) -> Self {
        self.topology_wait_timeout = timeout;
        self
    }

    /// Set the rebalance timeout.
    pub fn with_rebalance_timeout(mut self, timeout: Duration) -> Self {
        self.rebalance_timeout = timeout;
        self
    }

    /// Set the maximum number of rebalance attempts.
    pub fn with_max_rebalance_attempts(mut self, attempts: usize) -> Self {
        self.max_rebalance_attempts = attempts;
        self
    }

    /// Allow segments without surviving owners to restart empty.
    pub fn with_allow_data_loss(mut self, allow: bool) -> Self {
        self.allow_data_loss = allow;
        self
    }
}

/// Distributed publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Default number of results per batch.
    pub batch_size: usize,

    /// Timeout for a single publisher RPC.
    pub rpc_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl PublisherConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Conflict resolution configuration.
#[derive(Debug, Clone)]
pub struct ConflictResolutionConfig {
    /// Whether conflicts are resolved automatically on partition merge.
    pub enabled: bool,

    /// Merge policy applied to divergent entries.
    pub merge_policy: MergePolicyKind,
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_policy: MergePolicyKind::PreferredAlways,
        }
    }
}

impl ConflictResolutionConfig {
    /// Set the merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicyKind) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Enable or disable automatic resolution.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GridConfig::new(3);
        assert_eq!(config.node_id, 3);
        assert_eq!(config.num_segments, 256);
        assert_eq!(config.num_owners, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = GridConfig::new(1)
            .with_cache_name("users")
            .with_num_segments(16)
            .with_num_owners(3)
            .with_state_transfer(StateTransferConfig::default().with_chunk_size(10))
            .with_publisher(PublisherConfig::default().with_batch_size(4));

        assert_eq!(config.cache_name, "users");
        assert_eq!(config.num_segments, 16);
        assert_eq!(config.state_transfer.chunk_size, 10);
        assert_eq!(config.publisher.batch_size, 4);
    }

    #[test]
    fn test_invalid_config() {
        assert!(GridConfig::new(1).with_num_segments(0).validate().is_err());
        assert!(GridConfig::new(1).with_num_owners(0).validate().is_err());
        let bad_chunk =
            GridConfig::new(1).with_state_transfer(StateTransferConfig::default().with_chunk_size(0));
        assert!(bad_chunk.validate().is_err());
    }
}
