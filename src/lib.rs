//! Segment-based state transfer for a partitioned in-memory data grid.
//!
//! Keys hash to a fixed number of segments and every segment is held by an
//! ordered list of owner nodes. This crate keeps that ownership correct while
//! members join, leave, crash and re-merge:
//! - **Topology** versioned, immutable ownership maps with a pending phase
//! - **State transfer** segments streamed in chunks from old to new owners
//! - **Rebalancing** a coordinator driving two-phase ownership changes and
//!   conflict resolution after partitions heal
//! - **Publisher** cluster-wide iteration with at-most-once, at-least-once or
//!   exactly-once delivery under segment movement
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::testing::TestCluster;
//! use strata::{DeliveryGuarantee, GridConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GridConfig::default().with_num_segments(64).with_num_owners(2);
//!     let mut cluster = TestCluster::start(3, config).await?;
//!
//!     let node = cluster.node(1)?.clone();
//!     node.put("user:123", "Alice").await?;
//!
//!     // Segments move to the new node before it serves reads.
//!     cluster.join(4).await?;
//!     let entry = cluster.node(4)?.get(b"user:123").await?;
//!     println!("Found: {:?}", entry.map(|e| e.value));
//!
//!     let outcome = node.entries(DeliveryGuarantee::ExactlyOnce)?.collect().await?;
//!     println!("{} entries", outcome.items.len());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  GridNode                   │
//! │  • get / put / remove                       │
//! │  • entries / keys / publish                 │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼────────────────┬──────────────┐
//!     ▼               ▼                ▼              ▼
//! ┌──────────┐  ┌─────────────┐  ┌───────────┐  ┌───────────┐
//! │ Topology │  │   State     │  │Rebalancing│  │ Publisher │
//! │ Tracker  │  │  Transfer   │  │Coordinator│  │  Handler  │
//! └──────────┘  └─────────────┘  └───────────┘  └───────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │     Transport (MessageDispatcher, Rpc)      │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod node;
pub mod publisher;
pub mod rebalancing;
pub mod statetransfer;
pub mod storage;
pub mod testing;
pub mod topology;
pub mod transport;
pub mod types;

pub use config::{ConflictResolutionConfig, GridConfig, PublisherConfig, StateTransferConfig};
pub use error::{Error, NetworkError, Result, TopologyError};
pub use node::GridNode;
pub use types::{CacheEntry, EntryMetadata, NodeId, SegmentId, SegmentSet, TopologyId};

// Re-export topology types
pub use topology::{CacheTopology, ConsistentHash, HashPartitioner, KeyPartitioner, TopologyTracker};

// Re-export state transfer types
pub use statetransfer::{SegmentState, StateChunk, StateConsumer, StateProvider, TransferMode};

// Re-export rebalancing types
pub use rebalancing::{
    ConflictEntry, ConflictManager, MergePolicyKind, RebalanceState, RebalanceType,
    StateTransferCoordinator,
};

// Re-export publisher types
pub use publisher::{
    ClusterPublisher, DeliveryGuarantee, PublisherItem, PublisherOutcome, PublisherRequest,
};

// Re-export storage and transport seams
pub use storage::{DataContainer, InMemoryDataContainer};
pub use transport::{MessageDispatcher, Transport};

// Re-export metrics types
pub use metrics::{Counter, Gauge, GridMetrics, MetricsSnapshot};
