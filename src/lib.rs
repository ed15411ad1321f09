//! quay-dns - Authoritative DNS for container-declared hostnames.
//!
//! Containers declare fully-qualified hostnames through metadata labels;
//! this crate watches the local container runtime, maps each declared name
//! to the host's reachable IPv4 address and answers A queries for those
//! names. Unknown names are silently dropped (for split-DNS setups where a
//! parallel resolver answers) or answered NXDOMAIN. Multiple hosts form a
//! cluster over SWIM-style gossip with last-writer-wins replication, so any
//! node answers for any cluster-wide name.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           quay-dns                             │
//! │                                                                │
//! │  ┌────────────────┐ labels   ┌──────────────────┐              │
//! │  │ Docker Watcher │─────────▶│   Record Store   │              │
//! │  │ (bollard)      │          │ (LWW, lock-free  │              │
//! │  └───────┬────────┘          │     lookups)     │              │
//! │          │ callback          └───┬──────────▲───┘              │
//! │          ▼                       │          │                  │
//! │  ┌────────────────┐          ┌───▼──────────┴───┐              │
//! │  │ Cluster Manager│◀────────▶│   DNS Handler    │◀── UDP/TCP   │
//! │  │ gossip + sync  │ deltas   │ (hickory-server) │     :54      │
//! │  └────────────────┘          └──────────────────┘              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resolution
//!
//! ```text
//! label quay.host.name=app.example.com on a running container
//!   → record store: app.example.com -> <host_ip>
//!   → gossiped to every cluster node
//!   → dig A app.example.com @any-node answers <host_ip>
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use quay_dns::{Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     config.validate().unwrap();
//!
//!     let token = CancellationToken::new();
//!     let server = Server::new(config);
//!     server.run(token).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod watcher;

// Re-export main types
pub use config::{ClusterConfig, Config, DnsConfig, DockerConfig, TelemetryConfig, UnknownAction};
pub use error::DnsError;
pub use handler::QueryHandler;
pub use server::Server;
pub use store::RecordStore;
pub use watcher::DockerWatcher;
