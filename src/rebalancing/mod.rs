//! Rebalancing: moving segment ownership between members.
//!
//! The coordinator drives a rebalance in two topology steps. First a
//! topology carrying both the current and the pending owners is installed;
//! every member's consumer pulls the segments it gains and confirms. Once all
//! members confirmed, the pending owners are committed.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                  StateTransferCoordinator                     │
//! │                                                               │
//! │  members change ──► install T(n+1){current, pending} ──┐      │
//! │                                                        │      │
//! │           ┌──────────── TopologyUpdate ◄───────────────┘      │
//! │           ▼                                                   │
//! │   consumers pull gained segments ──► RebalanceConfirm         │
//! │                                             │                 │
//! │   all confirmed ──► install T(n+2){pending as current}        │
//! │   timeout       ──► drop silent members, retry                │
//! │   unavailable   ──► abandon pending, report segments          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! After a partition heals, [`StateTransferCoordinator::handle_merge`]
//! installs the union of the partitions' owners and lets the
//! [`ConflictManager`] reconcile keys whose copies diverged before the
//! normal rebalance trims ownership again.

mod conflict;
mod coordinator;

pub use conflict::{
    ConflictEntry, ConflictManager, EntryMergePolicy, MergeOutcome, MergePolicyKind,
    ResolutionReport, StateReceiver,
};
pub use coordinator::{
    RebalanceOperationInfo, RebalanceState, RebalanceType, StateTransferCoordinator,
};
