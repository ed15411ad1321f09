//! Error types for quay-dns.

use thiserror::Error;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, socket, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Container runtime client error
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// Malformed gossip payload (delta, full-state or discovery packet)
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Malformed membership frame
    #[error("membership codec error: {0}")]
    Membership(#[from] bincode::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Failed to parse address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Cluster join failed (no seed was reachable)
    #[error("cluster join failed: {0}")]
    Join(String),

    /// Component started twice
    #[error("{0} already running")]
    AlreadyRunning(&'static str),
}
