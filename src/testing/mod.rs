//! Testing utilities for the data grid.
//!
//! This module provides an in-process cluster for exercising rebalancing,
//! state transfer and distributed iteration without sockets:
//! - An in-memory network with crash, partition and link-cut injection
//! - A cluster fixture that starts, joins and kills [`GridNode`]s
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   GridNode 1        GridNode 2        GridNode 3      ...       │
//! │   NodeTransport     NodeTransport     NodeTransport             │
//! │        │                 │                 │                    │
//! │        ▼                 ▼                 ▼                    │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                    InMemoryNetwork                        │  │
//! │  │  - bincode round trip of every envelope and reply         │  │
//! │  │  - crashed nodes, partition groups, cut links             │  │
//! │  │  - random message drops                                   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use strata::testing::TestCluster;
//! use strata::GridConfig;
//!
//! let mut cluster = TestCluster::start(3, GridConfig::default()).await?;
//! cluster.node(1)?.put("k", "v").await?;
//!
//! cluster.join(4).await?;
//! cluster.network.partition(&[&[1, 2], &[3, 4]]);
//! ```
//!
//! [`GridNode`]: crate::GridNode

mod cluster;
mod network;

mod state_transfer_tests;

pub use cluster::TestCluster;
pub use network::{InMemoryNetwork, NetworkStats, NodeTransport};
