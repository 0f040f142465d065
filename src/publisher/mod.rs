//! Distributed publisher: iterate a cache across the cluster in batches.
//!
//! The initiating node splits the requested segments by primary owner and
//! pulls batches from each owner, one request at a time per owner. Owners
//! iterate only the segments they are primary for, apply filters and named
//! transforms locally, and report segments that moved away mid-iteration.
//!
//! ```text
//!  initiator                                       owners
//! ┌──────────────────────────┐  InitialPublisher  ┌───────────────────┐
//! │ ClusterPublisherManager  │ ─────────────────► │ PublisherHandler  │
//! │  AsyncBatchHandler       │ ◄───────────────── │  cursor per req   │
//! │   target per owner       │  PublisherResponse │                   │
//! │                          │  NextPublisher ... │                   │
//! │  lost segments ──► re-route to new owner      │                   │
//! │   (AtLeastOnce, ExactlyOnce minus delivered)  │                   │
//! └──────────────────────────┘  CancelPublisher   └───────────────────┘
//! ```
//!
//! | Guarantee     | Segment moved mid-iteration                        |
//! |---------------|----------------------------------------------------|
//! | `AtMostOnce`  | remaining entries dropped, segment reported lost   |
//! | `AtLeastOnce` | segment re-fetched from the new owner              |
//! | `ExactlyOnce` | segment re-fetched, already delivered keys skipped |

mod cluster;
mod handler;
mod request;
mod transform;

pub use cluster::{ClusterPublisher, ClusterPublisherManager, PublisherOutcome};
pub use handler::PublisherHandler;
pub use request::{
    DeliveryGuarantee, PublisherItem, PublisherRequest, PublisherResponse, SegmentResult,
};
pub use transform::{TransformFn, TransformRegistry};
