//! Core types used throughout the grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Node identifier (cluster address) in the grid.
pub type NodeId = u64;

/// Segment identifier, always in `[0, num_segments)`.
pub type SegmentId = u32;

/// Monotonically increasing topology identifier.
pub type TopologyId = u64;

/// Ordered set of segments.
pub type SegmentSet = BTreeSet<SegmentId>;

/// Metadata carried with every stored entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Entry version, incremented by the writer on every update.
    pub version: u64,

    /// Wall clock time of the last write in milliseconds since UNIX epoch.
    pub last_modified_ms: u64,

    /// Absolute expiration time in milliseconds since UNIX epoch.
    /// None means no expiration.
    pub expires_at_ms: Option<u64>,
}

impl EntryMetadata {
    /// Create metadata for a fresh write with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            last_modified_ms: now_millis(),
            expires_at_ms: None,
        }
    }

    /// Set an absolute expiration time.
    pub fn with_expiration(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at_ms
            .map_or(false, |expires| expires <= now_millis())
    }
}

/// A single key/value/metadata triple as stored and transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,

    /// Entry metadata.
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new entry with version 1.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: EntryMetadata::new(1),
        }
    }

    /// Create a new entry with explicit metadata.
    pub fn with_metadata(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata,
        }
    }

    /// Entry version shortcut.
    pub fn version(&self) -> u64 {
        self.metadata.version
    }
}

/// Current wall clock time in milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
