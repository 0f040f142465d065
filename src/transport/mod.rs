//! Cross-node messaging.
//!
//! Commands are tagged variants inside an [`Envelope`] that also carries the
//! cache name and the sender's topology id. A receiving node routes each
//! envelope through a [`MessageDispatcher`] lookup table to the component that
//! registered for its [`CommandKind`].
//!
//! ```text
//!  node A                                         node B
//! ┌──────────────┐   Envelope{kind, topology_id}  ┌─────────────────────────┐
//! │  RpcClient   │ ─────────── Transport ───────► │   MessageDispatcher     │
//! │  (timeout)   │ ◄───────────  Reply  ───────── │  kind ──► CommandHandler│
//! └──────────────┘                                └─────────────────────────┘
//! ```
//!
//! The transport itself is a collaborator: anything that can deliver an
//! envelope to a node and return its reply implements [`Transport`].

mod dispatcher;
mod message;
mod rpc;

pub use dispatcher::{CommandHandler, MessageDispatcher};
pub use message::{
    decode_envelope, decode_reply, encode_envelope, encode_reply, Command, CommandKind, Envelope,
    Reply,
};
pub use rpc::RpcClient;

use crate::error::Result;
use crate::types::NodeId;

/// Point-to-point request/response messaging between members.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// This node's ID.
    fn local_node(&self) -> NodeId;

    /// Deliver an envelope to a node and wait for its reply.
    async fn send(&self, target: NodeId, envelope: Envelope) -> Result<Reply>;

    /// Members this node can currently see.
    fn current_view(&self) -> Vec<NodeId>;
}
