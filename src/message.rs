//! Wire format for record replication.
//!
//! Two payloads travel between nodes: [`RecordMessage`] deltas carried as
//! opaque gossip datagrams, and [`FullState`] snapshots exchanged during TCP
//! push/pull sync. Both are JSON with single-letter field names to keep
//! datagrams small. Encoding is stable across releases; decoders reject
//! anything malformed with a typed error and callers drop the payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::DnsError;

/// The kind of change a delta carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RecordAction {
    /// Add or refresh a hostname.
    Add,
    /// Remove a hostname.
    Remove,
}

impl From<RecordAction> for u8 {
    fn from(action: RecordAction) -> u8 {
        match action {
            RecordAction::Add => 0,
            RecordAction::Remove => 1,
        }
    }
}

impl TryFrom<u8> for RecordAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RecordAction::Add),
            1 => Ok(RecordAction::Remove),
            other => Err(format!("unknown record action: {other}")),
        }
    }
}

/// A single record change broadcast to cluster peers.
///
/// Immutable once emitted: `timestamp` and `node_id` are stamped at the
/// source of the change and never rewritten on relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMessage {
    /// Hostname, lowercase, no trailing dot.
    #[serde(rename = "h")]
    pub hostname: String,
    /// IP the hostname resolves to. Empty for removes.
    #[serde(rename = "i", default)]
    pub ip: String,
    /// Add or remove.
    #[serde(rename = "a")]
    pub action: RecordAction,
    /// Unix nanosecond timestamp for last-writer-wins ordering.
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Node that emitted this version.
    #[serde(rename = "n")]
    pub node_id: String,
}

impl RecordMessage {
    /// Serialize for gossip transmission.
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a gossip payload.
    pub fn decode(data: &[u8]) -> Result<Self, DnsError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// A stored record with the metadata needed for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// IP address.
    #[serde(rename = "i")]
    pub ip: String,
    /// Unix nanosecond timestamp of the retained version.
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Node that created this version.
    #[serde(rename = "n")]
    pub node_id: String,
}

/// The complete record state of one node, exchanged during push/pull sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullState {
    /// Source node identifier.
    #[serde(rename = "node")]
    pub node_id: String,
    /// hostname -> record entry.
    #[serde(rename = "records")]
    pub records: HashMap<String, RecordEntry>,
}

impl FullState {
    /// An empty snapshot attributed to `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            records: HashMap::new(),
        }
    }

    /// Serialize for TCP state sync.
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a peer's snapshot.
    pub fn decode(data: &[u8]) -> Result<Self, DnsError> {
        Ok(serde_json::from_slice(data)?)
    }
}
