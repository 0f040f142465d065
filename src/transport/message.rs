//! Tagged message envelope and replies.
//!
//! Every cross-node command travels inside an [`Envelope`] carrying the cache
//! name and the sender's topology id. Receivers dispatch on [`CommandKind`].

use crate::error::{Error, NetworkError, Result, TopologyError};
use crate::publisher::{PublisherRequest, PublisherResponse};
use crate::statetransfer::{ClusterListener, StateChunk, TransferMode};
use crate::topology::CacheTopology;
use crate::types::{CacheEntry, NodeId, SegmentId, SegmentSet, TopologyId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A command addressed to one cache on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Cache the command targets.
    pub cache_name: String,

    /// Sending node.
    pub origin: NodeId,

    /// Topology the sender believed current when sending.
    pub topology_id: TopologyId,

    /// The command payload.
    pub command: Command,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(
        cache_name: impl Into<String>,
        origin: NodeId,
        topology_id: TopologyId,
        command: Command,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            origin,
            topology_id,
            command,
        }
    }

    /// Kind of the carried command.
    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}

/// Cross-node commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Consumer asks a provider to stream segments.
    StateTransferStart {
        segments: SegmentSet,
        mode: TransferMode,
    },

    /// Consumer aborts an outstanding transfer.
    StateTransferCancel { segments: SegmentSet },

    /// Provider delivers chunks.
    StateResponse {
        chunks: Vec<StateChunk>,
        mode: TransferMode,
    },

    /// Conflict resolver asks an owner to stream segments for comparison.
    ConflictResolutionStart { segments: SegmentSet },

    /// Open a publisher on the target.
    InitialPublisher(PublisherRequest),

    /// Pull the next batch of an open publisher.
    NextPublisher { request_id: String },

    /// Close an open publisher.
    CancelPublisher { request_id: String },

    /// Install a topology.
    TopologyUpdate { topology: CacheTopology },

    /// A node finished receiving its gained segments.
    RebalanceConfirm { unavailable: SegmentSet },

    /// Report the installed topology.
    TopologyQuery,

    /// Fetch cluster listener registrations.
    ClusterListeners,

    /// Write merged values and remove conflicting keys.
    ApplyResolution {
        segment: SegmentId,
        writes: Vec<CacheEntry>,
        removals: Vec<Bytes>,
    },

    /// Write entries into the target's storage.
    WriteEntries {
        segment: SegmentId,
        entries: Vec<CacheEntry>,
    },

    /// Remove keys from the target's storage.
    RemoveKeys {
        segment: SegmentId,
        keys: Vec<Bytes>,
    },

    /// Read one entry, honoring ownership.
    ReadEntry { segment: SegmentId, key: Bytes },

    /// Read the target's local copy of an entry regardless of ownership state.
    GetAllVersions { segment: SegmentId, key: Bytes },
}

/// Dispatch key of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    StateTransferStart,
    StateTransferCancel,
    StateResponse,
    ConflictResolutionStart,
    InitialPublisher,
    NextPublisher,
    CancelPublisher,
    TopologyUpdate,
    RebalanceConfirm,
    TopologyQuery,
    ClusterListeners,
    ApplyResolution,
    WriteEntries,
    RemoveKeys,
    ReadEntry,
    GetAllVersions,
}

impl Command {
    /// The dispatch key.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::StateTransferStart { .. } => CommandKind::StateTransferStart,
            Command::StateTransferCancel { .. } => CommandKind::StateTransferCancel,
            Command::StateResponse { .. } => CommandKind::StateResponse,
            Command::ConflictResolutionStart { .. } => CommandKind::ConflictResolutionStart,
            Command::InitialPublisher(_) => CommandKind::InitialPublisher,
            Command::NextPublisher { .. } => CommandKind::NextPublisher,
            Command::CancelPublisher { .. } => CommandKind::CancelPublisher,
            Command::TopologyUpdate { .. } => CommandKind::TopologyUpdate,
            Command::RebalanceConfirm { .. } => CommandKind::RebalanceConfirm,
            Command::TopologyQuery => CommandKind::TopologyQuery,
            Command::ClusterListeners => CommandKind::ClusterListeners,
            Command::ApplyResolution { .. } => CommandKind::ApplyResolution,
            Command::WriteEntries { .. } => CommandKind::WriteEntries,
            Command::RemoveKeys { .. } => CommandKind::RemoveKeys,
            Command::ReadEntry { .. } => CommandKind::ReadEntry,
            Command::GetAllVersions { .. } => CommandKind::GetAllVersions,
        }
    }
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Command accepted.
    Ack,

    /// Outbound transfer started; `missing` lists segments the provider
    /// does not hold.
    TransferStarted { missing: SegmentSet },

    /// A publisher batch.
    Publisher(PublisherResponse),

    /// The installed topology, if any.
    Topology(Option<CacheTopology>),

    /// Cluster listener registrations.
    Listeners(Vec<ClusterListener>),

    /// A single entry lookup.
    Entry(Option<CacheEntry>),

    /// The command's topology was rejected.
    TopologyRejected(TopologyError),

    /// The handler failed.
    Error(String),
}

impl Reply {
    /// Turn failure replies back into errors.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::TopologyRejected(e) => Err(Error::Topology(e)),
            Reply::Error(msg) => Err(Error::Network(NetworkError::Remote(msg))),
            other => Ok(other),
        }
    }

    /// Build the reply for a failed handler.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Topology(e) => Reply::TopologyRejected(e.clone()),
            other => Reply::Error(other.to_string()),
        }
    }

    pub(crate) fn unexpected(&self) -> Error {
        NetworkError::UnexpectedReply(format!("{:?}", self)).into()
    }
}

/// Encode an envelope to bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Decode an envelope from bytes.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    bincode::deserialize(data).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}

/// Encode a reply to bytes.
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    Ok(bincode::serialize(reply)?)
}

/// Decode a reply from bytes.
pub fn decode_reply(data: &[u8]) -> Result<Reply> {
    bincode::deserialize(data).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}
