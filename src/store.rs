//! In-memory record store with lock-free reads.
//!
//! The DNS hot path runs on every server worker concurrently, so lookups
//! must never contend with writers. The store keeps two immutable maps
//! behind atomic pointers: `hostname -> ip` for queries and
//! `hostname -> RecordMeta` for last-writer-wins conflict resolution.
//! Writers serialize on one short mutex, build a new map by shallow copy
//! plus the single change, and publish it with an atomic store. Readers
//! load the current pointer and index into a map that will never mutate.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

use crate::message::{FullState, RecordAction, RecordEntry, RecordMessage};

/// Wall-clock nanoseconds since the Unix epoch.
///
/// Conflicts are rare (one writer per hostname in practice) and ties are
/// broken by node id, so a monotonic source is not required.
pub fn wall_clock_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Metadata retained per record for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    /// Unix nanosecond timestamp of the retained version.
    pub timestamp: i64,
    /// Node that emitted the retained version.
    pub node_id: String,
}

impl RecordMeta {
    /// True when `(timestamp, node_id)` orders strictly after `self`.
    /// Equal pairs lose: re-presenting the current version is a no-op.
    fn loses_to(&self, timestamp: i64, node_id: &str) -> bool {
        match timestamp.cmp(&self.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => node_id > self.node_id.as_str(),
        }
    }
}

/// Thread-safe hostname -> IP store with LWW replication metadata.
pub struct RecordStore {
    node_id: String,
    data: ArcSwap<HashMap<String, String>>,
    meta: ArcSwap<HashMap<String, RecordMeta>>,
    write_lock: Mutex<()>,
}

impl RecordStore {
    /// Create an empty store. `node_id` stamps locally-originated writes.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            data: ArcSwap::from_pointee(HashMap::new()),
            meta: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// The node id this store stamps on local writes.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Unconditionally add or update a record, stamped with the current
    /// wall clock and the local node id.
    pub fn add(&self, hostname: &str, ip: &str) {
        let hostname = hostname.to_lowercase();
        let _guard = self.write_lock.lock();

        let mut data = (*self.data.load_full()).clone();
        let mut meta = (*self.meta.load_full()).clone();
        data.insert(hostname.clone(), ip.to_string());
        meta.insert(
            hostname,
            RecordMeta {
                timestamp: wall_clock_nanos(),
                node_id: self.node_id.clone(),
            },
        );
        self.data.store(Arc::new(data));
        self.meta.store(Arc::new(meta));
    }

    /// Unconditionally remove a record. No-op if absent.
    pub fn remove(&self, hostname: &str) {
        let hostname = hostname.to_lowercase();
        let _guard = self.write_lock.lock();

        if !self.data.load().contains_key(&hostname) {
            return;
        }
        let mut data = (*self.data.load_full()).clone();
        let mut meta = (*self.meta.load_full()).clone();
        data.remove(&hostname);
        meta.remove(&hostname);
        self.data.store(Arc::new(data));
        self.meta.store(Arc::new(meta));
    }

    /// Look up the IP for a hostname. Case-insensitive, lock-free.
    pub fn lookup(&self, hostname: &str) -> Option<String> {
        let hostname = hostname.to_lowercase();
        self.data.load().get(&hostname).cloned()
    }

    /// Apply a replicated change under last-writer-wins. Returns true iff
    /// the store changed; stale or duplicate versions are rejected.
    pub fn apply(&self, msg: &RecordMessage) -> bool {
        match msg.action {
            RecordAction::Add => {
                self.apply_add(&msg.hostname, &msg.ip, msg.timestamp, &msg.node_id)
            }
            RecordAction::Remove => self.apply_remove(&msg.hostname, msg.timestamp, &msg.node_id),
        }
    }

    fn apply_add(&self, hostname: &str, ip: &str, timestamp: i64, node_id: &str) -> bool {
        let hostname = hostname.to_lowercase();
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.meta.load().get(&hostname) {
            if !existing.loses_to(timestamp, node_id) {
                trace!(%hostname, timestamp, node_id, "stale add rejected");
                return false;
            }
        }

        let mut data = (*self.data.load_full()).clone();
        let mut meta = (*self.meta.load_full()).clone();
        data.insert(hostname.clone(), ip.to_string());
        meta.insert(
            hostname,
            RecordMeta {
                timestamp,
                node_id: node_id.to_string(),
            },
        );
        self.data.store(Arc::new(data));
        self.meta.store(Arc::new(meta));
        true
    }

    fn apply_remove(&self, hostname: &str, timestamp: i64, node_id: &str) -> bool {
        let hostname = hostname.to_lowercase();
        let _guard = self.write_lock.lock();

        if !self.data.load().contains_key(&hostname) {
            return false;
        }
        if let Some(existing) = self.meta.load().get(&hostname) {
            if !existing.loses_to(timestamp, node_id) {
                trace!(%hostname, timestamp, node_id, "stale remove rejected");
                return false;
            }
        }

        let mut data = (*self.data.load_full()).clone();
        let mut meta = (*self.meta.load_full()).clone();
        data.remove(&hostname);
        meta.remove(&hostname);
        self.data.store(Arc::new(data));
        self.meta.store(Arc::new(meta));
        true
    }

    /// Copy the full state, including replication metadata.
    pub fn snapshot(&self) -> FullState {
        let data = self.data.load();
        let meta = self.meta.load();

        let mut state = FullState::new(self.node_id.clone());
        for (hostname, ip) in data.iter() {
            let (timestamp, node_id) = meta
                .get(hostname)
                .map(|m| (m.timestamp, m.node_id.clone()))
                .unwrap_or_default();
            state.records.insert(
                hostname.clone(),
                RecordEntry {
                    ip: ip.clone(),
                    timestamp,
                    node_id,
                },
            );
        }
        state
    }

    /// Merge a peer's snapshot. Every entry is applied as an add under LWW,
    /// so older entries lose and nothing here can fail.
    pub fn merge(&self, state: &FullState) {
        for (hostname, entry) in &state.records {
            self.apply_add(hostname, &entry.ip, entry.timestamp, &entry.node_id);
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.data.load().len()
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.data.load().is_empty()
    }

    /// Copy of all current hostname -> IP pairs.
    pub fn all(&self) -> HashMap<String, String> {
        (*self.data.load_full()).clone()
    }

    /// Replication metadata for one hostname, if present.
    pub fn meta(&self, hostname: &str) -> Option<RecordMeta> {
        self.meta.load().get(&hostname.to_lowercase()).cloned()
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("node_id", &self.node_id)
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_msg(hostname: &str, ip: &str, timestamp: i64, node_id: &str) -> RecordMessage {
        RecordMessage {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            action: RecordAction::Add,
            timestamp,
            node_id: node_id.to_string(),
        }
    }

    fn remove_msg(hostname: &str, timestamp: i64, node_id: &str) -> RecordMessage {
        RecordMessage {
            hostname: hostname.to_string(),
            ip: String::new(),
            action: RecordAction::Remove,
            timestamp,
            node_id: node_id.to_string(),
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let store = RecordStore::new("node1");
        store.add("App.Example.Com", "10.0.0.1");

        assert_eq!(store.lookup("app.example.com").as_deref(), Some("10.0.0.1"));
        assert_eq!(store.lookup("APP.EXAMPLE.COM").as_deref(), Some("10.0.0.1"));
        assert_eq!(store.lookup("other.example.com"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove() {
        let store = RecordStore::new("node1");
        store.add("app.example.com", "10.0.0.1");
        store.remove("APP.example.com");

        assert_eq!(store.lookup("app.example.com"), None);
        assert!(store.is_empty());

        // Removing a missing name is a no-op.
        store.remove("never.example.com");
    }

    #[test]
    fn test_lww_is_order_independent() {
        let older = add_msg("h.example.com", "10.0.0.1", 100, "node1");
        let newer = add_msg("h.example.com", "10.0.0.2", 200, "node1");

        let forward = RecordStore::new("n");
        assert!(forward.apply(&older));
        assert!(forward.apply(&newer));

        let reverse = RecordStore::new("n");
        assert!(reverse.apply(&newer));
        assert!(!reverse.apply(&older));

        assert_eq!(forward.lookup("h.example.com").as_deref(), Some("10.0.0.2"));
        assert_eq!(reverse.lookup("h.example.com").as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_equal_timestamps_tie_break_on_node_id() {
        let store = RecordStore::new("n");
        assert!(store.apply(&add_msg("h.example.com", "10.0.0.1", 100, "node1")));
        assert!(store.apply(&add_msg("h.example.com", "10.0.0.2", 100, "node2")));
        assert_eq!(store.lookup("h.example.com").as_deref(), Some("10.0.0.2"));

        // And the loser is rejected when arriving second.
        let store = RecordStore::new("n");
        assert!(store.apply(&add_msg("h.example.com", "10.0.0.2", 100, "node2")));
        assert!(!store.apply(&add_msg("h.example.com", "10.0.0.1", 100, "node1")));
        assert_eq!(store.lookup("h.example.com").as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_exact_duplicate_is_rejected() {
        let store = RecordStore::new("n");
        let msg = add_msg("h.example.com", "10.0.0.1", 100, "node1");
        assert!(store.apply(&msg));
        assert!(!store.apply(&msg));
    }

    #[test]
    fn test_newer_remove_wins_over_add() {
        let store = RecordStore::new("n");
        assert!(store.apply(&add_msg("h.example.com", "10.0.0.1", 100, "node1")));
        assert!(store.apply(&remove_msg("h.example.com", 200, "node1")));
        assert_eq!(store.lookup("h.example.com"), None);
    }

    #[test]
    fn test_stale_remove_is_rejected() {
        let store = RecordStore::new("n");
        assert!(store.apply(&add_msg("h.example.com", "10.0.0.1", 200, "node1")));
        assert!(!store.apply(&remove_msg("h.example.com", 100, "node2")));
        assert_eq!(store.lookup("h.example.com").as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_remove_for_absent_name_is_rejected() {
        let store = RecordStore::new("n");
        assert!(!store.apply(&remove_msg("h.example.com", 100, "node1")));
    }

    #[test]
    fn test_snapshot_carries_metadata() {
        let store = RecordStore::new("node1");
        assert!(store.apply(&add_msg("a.example.com", "10.0.0.1", 100, "node2")));

        let snap = store.snapshot();
        assert_eq!(snap.node_id, "node1");
        let entry = &snap.records["a.example.com"];
        assert_eq!(entry.ip, "10.0.0.1");
        assert_eq!(entry.timestamp, 100);
        assert_eq!(entry.node_id, "node2");
    }

    #[test]
    fn test_merge_applies_lww_per_entry() {
        let local = RecordStore::new("node1");
        assert!(local.apply(&add_msg("keep.example.com", "10.0.0.1", 200, "node1")));

        let remote = RecordStore::new("node2");
        assert!(remote.apply(&add_msg("keep.example.com", "10.9.9.9", 100, "node2")));
        assert!(remote.apply(&add_msg("new.example.com", "10.0.0.2", 150, "node2")));

        local.merge(&remote.snapshot());

        // The older remote entry lost; the new name was added.
        assert_eq!(
            local.lookup("keep.example.com").as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(local.lookup("new.example.com").as_deref(), Some("10.0.0.2"));
        assert_eq!(local.len(), 2);
    }

    #[test]
    fn test_local_add_stamps_node_id_and_clock() {
        let store = RecordStore::new("node1");
        let before = wall_clock_nanos();
        store.add("h.example.com", "10.0.0.1");
        let after = wall_clock_nanos();

        let meta = store.meta("h.example.com").unwrap();
        assert_eq!(meta.node_id, "node1");
        assert!(meta.timestamp >= before && meta.timestamp <= after);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_records() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        // Each hostname is only ever written with one value, so any torn
        // or partially-published read would surface as a mismatch.
        let store = Arc::new(RecordStore::new("node1"));
        let stop = Arc::new(AtomicBool::new(false));
        const HOSTS: usize = 16;
        const ROUNDS: usize = 25_000;

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        for n in 0..HOSTS {
                            let host = format!("h{n}.example.com");
                            if let Some(ip) = store.lookup(&host) {
                                assert_eq!(ip, format!("10.0.{n}.{n}"));
                            }
                        }
                    }
                })
            })
            .collect();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let n = (round + w) % HOSTS;
                        let host = format!("h{n}.example.com");
                        if round % 3 == 0 {
                            store.remove(&host);
                        } else {
                            store.add(&host, &format!("10.0.{n}.{n}"));
                        }
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }
}
