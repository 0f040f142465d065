//! Segment state transfer between nodes.
//!
//! When a topology assigns a segment to a node that does not hold it, the
//! node's [`StateConsumer`] requests the segment from a current owner, whose
//! [`StateProvider`] streams it back as [`StateChunk`]s.
//!
//! ```text
//!   consumer (new owner)                         provider (old owner)
//!  ┌──────────────────────┐ StateTransferStart  ┌──────────────────────────┐
//!  │ on_topology_changed  │ ──────────────────► │ start_outbound_transfer  │
//!  │  gained = diff(...)  │                     │  TransferTask per segment│
//!  │                      │   StateResponse     │  chunk, chunk, ..., last │
//!  │ apply_state          │ ◄────────────────── │                          │
//!  │  stale? ─► discard   │ StateTransferCancel │ cancel_outbound_transfer │
//!  │  last?  ─► OWNED     │ ──────────────────► │                          │
//!  └──────────────────────┘                     └──────────────────────────┘
//!            │ RebalanceConfirm
//!            ▼
//!      coordinator
//! ```
//!
//! Cluster listeners are replicated to a joining node before its first
//! request, and keys written by an open local transaction are shielded from
//! incoming state by the [`TransactionTable`].

mod chunk;
mod consumer;
mod listeners;
mod provider;
mod tx;

pub use chunk::{StateChunk, TransferMode};
pub use consumer::{SegmentState, StateConsumer};
pub use listeners::{ClusterListener, ClusterListenerRegistry};
pub use provider::{StateProvider, TransferTask};
pub use tx::{TransactionTable, TxId};
