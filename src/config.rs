//! Configuration types for quay-dns.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::DnsError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Container runtime configuration.
    #[serde(default)]
    pub docker: DockerConfig,

    /// Cluster replication configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Validate the whole configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), DnsError> {
        self.dns.validate()?;
        self.docker.validate()?;
        self.cluster.validate()?;
        Ok(())
    }
}

/// Policy for query names not present in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnknownAction {
    /// Return success without writing any response; the client times out.
    /// Lets a parallel split-DNS resolver win the race.
    #[default]
    #[serde(alias = "timeout", alias = "none")]
    Drop,
    /// Answer with NXDOMAIN.
    NxDomain,
    /// Delegate every unknown name to the next handler in the chain.
    Fallthrough,
}

impl UnknownAction {
    /// Parse the configuration spelling, including the aliases accepted by
    /// earlier releases (`timeout` and `none` both mean `drop`).
    pub fn parse(s: &str) -> Result<Self, DnsError> {
        match s.to_ascii_lowercase().as_str() {
            "drop" | "timeout" | "none" => Ok(Self::Drop),
            "nxdomain" => Ok(Self::NxDomain),
            "fallthrough" => Ok(Self::Fallthrough),
            other => Err(DnsError::Config(format!(
                "unknown action: {other} (valid: drop, nxdomain, fallthrough)"
            ))),
        }
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// IPv4 address returned in A answers for names learned locally.
    pub host_ip: String,

    /// TTL for A answers in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// What to do with names we do not know.
    #[serde(default)]
    pub unknown_action: UnknownAction,

    /// Zone suffixes for which unknown names fall through to the next
    /// handler. An empty list matches every zone. `None` disables
    /// fall-through entirely.
    #[serde(default)]
    pub fallthrough_zones: Option<Vec<String>>,
}

impl DnsConfig {
    fn validate(&self) -> Result<(), DnsError> {
        if self.host_ip.is_empty() {
            return Err(DnsError::Config(
                "dns.host_ip is required (set in config or QUAY_DNS__DNS__HOST_IP)".into(),
            ));
        }
        if self.host_ip.parse::<Ipv4Addr>().is_err() {
            return Err(DnsError::Config(format!(
                "dns.host_ip is not a valid IPv4 address: {}",
                self.host_ip
            )));
        }
        Ok(())
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Socket URL for the container runtime.
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    /// Container labels inspected for hostnames. Values are comma-separated
    /// lists of fully-qualified names.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

impl DockerConfig {
    fn validate(&self) -> Result<(), DnsError> {
        if self.labels.is_empty() {
            return Err(DnsError::Config("docker.labels must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            labels: default_labels(),
        }
    }
}

/// Cluster replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether cluster replication is enabled.
    #[serde(default)]
    pub enabled: bool,

    /// Address the membership layer binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port the membership layer binds to (UDP gossip and TCP state sync).
    #[serde(default = "default_cluster_port")]
    pub port: u16,

    /// Seed node addresses (`host:port`). A single comma-separated string is
    /// also accepted. Empty means broadcast discovery.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Unique node identifier. Derived from the OS hostname when clustering
    /// is enabled and this is empty.
    #[serde(default)]
    pub node_name: String,

    /// Shared secret sealing the gossip plane. Must be 16, 24 or 32 bytes
    /// (AES-128/192/256) when non-empty.
    #[serde(default)]
    pub secret: String,

    /// UDP port for broadcast peer discovery.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

impl ClusterConfig {
    fn validate(&self) -> Result<(), DnsError> {
        if self.port == 0 {
            return Err(DnsError::Config(
                "cluster.port must be between 1 and 65535".into(),
            ));
        }
        if self.enabled && self.node_name.is_empty() {
            return Err(DnsError::Config(
                "cluster.node_name is required when clustering is enabled".into(),
            ));
        }
        match self.secret.len() {
            0 | 16 | 24 | 32 => Ok(()),
            n => Err(DnsError::Config(format!(
                "cluster.secret must be 16, 24 or 32 bytes (AES-128/192/256), got {n}"
            ))),
        }
    }

    /// Seed list with comma-separated entries split out and trimmed.
    pub fn seed_addrs(&self) -> Vec<String> {
        self.seeds
            .iter()
            .flat_map(|s| s.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// Fill in the node name from the OS hostname if it was left empty.
    pub fn resolve_node_name(&mut self) {
        if self.enabled && self.node_name.is_empty() {
            self.node_name = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "quay-dns".to_string());
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_bind_addr(),
            port: default_cluster_port(),
            seeds: Vec::new(),
            node_name: String::new(),
            secret: String::new(),
            discovery_port: default_discovery_port(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. "info", "quay_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    // Port 54 leaves 53 free for a host resolver running split DNS.
    "0.0.0.0:54".parse().expect("static listen addr")
}

fn default_ttl() -> u32 {
    60
}

fn default_docker_socket() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_labels() -> Vec<String> {
    // `joyride.host.name` is the pre-rename spelling, kept for deployments
    // that still label containers with it.
    vec!["quay.host.name".to_string(), "joyride.host.name".to_string()]
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_cluster_port() -> u16 {
    7946
}

fn default_discovery_port() -> u16 {
    8889
}

fn default_log_level() -> String {
    "info".to_string()
}
