//! Segment ownership model and topology tracking.
//!
//! The key space is split into a fixed number of segments. Each topology maps
//! every segment to an ordered owner list (primary first, then backups) and is
//! superseded, never mutated, by the next one.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TopologyTracker                        │
//! │   watch<Arc<CacheTopology>>  ──►  listeners (consumer, ...)  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ CacheTopology { id: 7 }                                │  │
//! │  │   current (read)  seg0:[1,2] seg1:[2,3] seg2:[3,1]     │  │
//! │  │   pending (write) seg0:[1,4] seg1:[2,3] seg2:[4,1]     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!
//!   key "user:123" ── xxhash64 mod N ──► segment 2 ──► owners [3, 1]
//! ```
//!
//! # Example
//!
//! ```rust
//! use strata::topology::{diff, CacheTopology, HashPartitioner, KeyPartitioner};
//!
//! let partitioner = HashPartitioner::new(16);
//! let segment = partitioner.segment_of(b"user:123");
//!
//! let t1 = CacheTopology::initial(16, 2, &[1, 2]);
//! let t2 = t1.with_pending(t1.read_ch().rebalance(&[1, 2, 3]));
//!
//! let changes = diff(t1.write_ch(), t2.write_ch());
//! assert!(!changes.gained_by(3).is_empty());
//! assert!(t2.read_ch().primary_of(segment).is_some());
//! ```

mod consistent_hash;
mod ownership;
mod partitioner;
mod tracker;

pub use consistent_hash::{CacheTopology, ConsistentHash};
pub use ownership::{diff, topology_diff, OwnershipDiff};
pub use partitioner::{HashPartitioner, KeyPartitioner};
pub use tracker::{TopologyListener, TopologyTracker};
