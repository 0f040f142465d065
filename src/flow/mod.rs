//! Demand-driven batch pulling from non-blocking producers.
//!
//! [`AsyncBatchHandler`] drives a sequence of [`BatchTarget`]s supplied by a
//! [`TargetFactory`] and emits their items into a bounded channel, fetching
//! only while downstream demand is positive and never with more than one
//! fetch outstanding.
//!
//! ```text
//!  consumer                driver task                      targets
//! ┌──────────┐ request(n) ┌──────────────────────────┐  fetch ┌──────────┐
//! │  next()  │ ─────────► │ demand: AtomicI64        │ ─────► │ target 1 │
//! │          │ ◄───────── │ in_flight ∈ {0, 1}       │ ◄───── │ target 2 │
//! └──────────┘  FlowEvent │ cancelled: AtomicBool    │  Batch │   ...    │
//!                         └──────────────────────────┘        └──────────┘
//!                                     ▲ next_target()
//!                               TargetFactory
//! ```

mod handler;

pub use handler::{AsyncBatchHandler, FlowEvent};

use crate::error::{Error, Result};

/// Items returned by one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    /// Fetched items.
    pub items: Vec<T>,

    /// The target has nothing more to produce.
    pub complete: bool,
}

impl<T> Batch<T> {
    /// A batch that leaves the target open.
    pub fn partial(items: Vec<T>) -> Self {
        Self {
            items,
            complete: false,
        }
    }

    /// The target's final batch.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            complete: true,
        }
    }
}

/// A non-blocking producer pulled in bounded batches.
#[async_trait::async_trait]
pub trait BatchTarget: Send {
    /// Item type produced.
    type Item: Send + 'static;

    /// Fetch up to `amount` items. Returning more is tolerated; the surplus
    /// is charged against future demand.
    async fn fetch(&mut self, amount: usize) -> Result<Batch<Self::Item>>;

    /// Stop the target. Called at most once, only if a fetch was issued.
    async fn cancel(&mut self) {}
}

/// What to do after a target failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// End the flow with the error.
    Propagate,
    /// Drop the target and continue with the next one.
    Continue,
}

/// Supplies successive targets.
pub trait TargetFactory: Send + 'static {
    /// Target type supplied.
    type Target: BatchTarget + 'static;

    /// Next target, or None when the flow is complete.
    fn next_target(&mut self) -> Option<Self::Target>;

    /// Decide how a target failure is handled.
    fn on_target_error(&mut self, _error: &Error) -> ErrorAction {
        ErrorAction::Propagate
    }
}
