//! Metrics instrumentation for quay-dns.
//!
//! All metrics are prefixed with `quay_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Hit => "hit",
        QueryResult::Dropped => "dropped",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::Fallthrough => "fallthrough",
        QueryResult::ServFail => "servfail",
    };

    counter!("quay_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("quay_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query outcome for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Query answered from the record store.
    Hit,
    /// Unknown name, query silently dropped (split DNS).
    Dropped,
    /// Unknown name answered with NXDOMAIN.
    NxDomain,
    /// Query delegated to the next handler.
    Fallthrough,
    /// Query failed with SERVFAIL.
    ServFail,
}

/// Record a watcher reconnect.
pub fn record_watcher_reconnect(reason: ReconnectReason) {
    let reason_str = match reason {
        ReconnectReason::InitialConnect => "initial_connect",
        ReconnectReason::ConnectFailed => "connect_failed",
        ReconnectReason::SyncFailed => "sync_failed",
        ReconnectReason::StreamEnded => "stream_ended",
        ReconnectReason::StreamError => "stream_error",
    };

    counter!("quay_dns.watcher.reconnect.count", "reason" => reason_str).increment(1);
}

/// Why the watcher went back through its connect loop.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// First connection to the container runtime.
    InitialConnect,
    /// Connect or ping failed.
    ConnectFailed,
    /// Initial container sync failed.
    SyncFailed,
    /// Event stream ended normally.
    StreamEnded,
    /// Event stream reported an error.
    StreamError,
}

/// Record a container lifecycle event handled by the watcher.
pub fn record_watcher_event(action: &str) {
    counter!("quay_dns.watcher.event.count", "action" => action.to_string()).increment(1);
}

/// Record the outcome of an incoming gossip delta.
pub fn record_gossip_ingest(outcome: GossipIngest) {
    let outcome_str = match outcome {
        GossipIngest::Applied => "applied",
        GossipIngest::Stale => "stale",
        GossipIngest::Dropped => "dropped",
        GossipIngest::Malformed => "malformed",
    };

    counter!("quay_dns.gossip.ingest.count", "outcome" => outcome_str).increment(1);
}

/// What happened to an incoming gossip delta.
#[derive(Debug, Clone, Copy)]
pub enum GossipIngest {
    /// Applied to the store.
    Applied,
    /// Rejected by last-writer-wins.
    Stale,
    /// Dropped because the ingest channel was full.
    Dropped,
    /// Failed to decode.
    Malformed,
}

/// Record a queued outgoing broadcast.
pub fn record_broadcast_queued() {
    counter!("quay_dns.gossip.broadcast.count").increment(1);
}

/// Record a full-state sync, either direction.
pub fn record_state_sync(direction: &'static str) {
    counter!("quay_dns.sync.count", "direction" => direction).increment(1);
}

/// Record current state gauges (called periodically).
pub fn record_state_counts(records: usize, members: usize) {
    gauge!("quay_dns.store.records").set(records as f64);
    gauge!("quay_dns.cluster.members").set(members as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed duration since the timer started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
