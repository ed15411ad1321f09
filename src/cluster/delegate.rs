//! Bridge between the membership layer and the record store.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::swim::{BroadcastQueue, Delegate};
use crate::message::{FullState, RecordMessage};
use crate::metrics::{self, GossipIngest};
use crate::store::RecordStore;

/// Buffer size for the incoming-delta channel. A full channel drops the
/// message; the next anti-entropy sync recovers it.
const INGEST_CHANNEL_CAPACITY: usize = 256;

/// Implements the membership [`Delegate`] contract over the record store.
///
/// Incoming deltas are decoded and handed to a bounded channel so the
/// membership layer's timers never block on store writes; a background
/// worker drains the channel and applies each delta under LWW.
pub struct ClusterDelegate {
    store: Arc<RecordStore>,
    broadcasts: BroadcastQueue,
    ingest_tx: mpsc::Sender<RecordMessage>,
    ingest_rx: Mutex<Option<mpsc::Receiver<RecordMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterDelegate {
    /// `num_nodes` reports the live cluster size for broadcast retransmit
    /// scaling.
    pub fn new(
        store: Arc<RecordStore>,
        num_nodes: impl Fn() -> usize + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            broadcasts: BroadcastQueue::new(3, num_nodes),
            ingest_tx,
            ingest_rx: Mutex::new(Some(ingest_rx)),
            worker: Mutex::new(None),
        })
    }

    /// Start the background worker applying incoming deltas.
    pub fn start(&self, token: CancellationToken) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let Some(mut ingest_rx) = self.ingest_rx.lock().take() else {
            return;
        };

        let store = Arc::clone(&self.store);
        *worker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => return,

                    message = ingest_rx.recv() => match message {
                        Some(message) => {
                            if store.apply(&message) {
                                metrics::record_gossip_ingest(GossipIngest::Applied);
                            } else {
                                metrics::record_gossip_ingest(GossipIngest::Stale);
                            }
                        }
                        None => return,
                    },
                }
            }
        }));
    }

    /// Stop the worker and wait for it.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("delegate worker panicked: {e}");
            }
        }
    }

    /// Queue an outgoing delta for gossip to peers.
    pub fn queue_broadcast(&self, message: &RecordMessage) {
        match message.encode() {
            Ok(payload) => {
                self.broadcasts.queue(payload);
                metrics::record_broadcast_queued();
            }
            Err(e) => warn!("failed to encode broadcast: {e}"),
        }
    }

    /// Number of broadcasts still awaiting transmission.
    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }
}

impl Delegate for ClusterDelegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_message(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let message = match RecordMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed gossip delta: {e}");
                metrics::record_gossip_ingest(GossipIngest::Malformed);
                return;
            }
        };

        if self.ingest_tx.try_send(message).is_err() {
            // Channel full (or worker gone): drop, anti-entropy recovers.
            metrics::record_gossip_ingest(GossipIngest::Dropped);
        }
    }

    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.pop(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        self.store.snapshot().encode().unwrap_or_default()
    }

    fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        if buf.is_empty() {
            return;
        }
        match FullState::decode(buf) {
            Ok(state) => {
                debug!(
                    peer = %state.node_id,
                    records = state.records.len(),
                    "merging remote state"
                );
                self.store.merge(&state);
            }
            Err(e) => {
                debug!("dropping malformed remote state: {e}");
                metrics::record_gossip_ingest(GossipIngest::Malformed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RecordAction, RecordEntry};
    use std::time::Duration;

    fn delta(hostname: &str, ip: &str, timestamp: i64, node_id: &str) -> RecordMessage {
        RecordMessage {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            action: RecordAction::Add,
            timestamp,
            node_id: node_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_notify_message_applies_via_worker() {
        let store = Arc::new(RecordStore::new("node1"));
        let delegate = ClusterDelegate::new(Arc::clone(&store), || 1);
        let token = CancellationToken::new();
        delegate.start(token.clone());

        let payload = delta("app.example.com", "10.0.0.1", 100, "node2")
            .encode()
            .unwrap();
        delegate.notify_message(&payload);

        // The worker applies asynchronously.
        for _ in 0..50 {
            if store.lookup("app.example.com").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.lookup("app.example.com").as_deref(), Some("10.0.0.1"));

        token.cancel();
        delegate.stop().await;
    }

    #[tokio::test]
    async fn test_notify_message_drops_malformed_payloads() {
        let store = Arc::new(RecordStore::new("node1"));
        let delegate = ClusterDelegate::new(Arc::clone(&store), || 1);

        delegate.notify_message(b"not json");
        delegate.notify_message(b"");
        assert!(store.is_empty());
    }

    #[test]
    fn test_local_state_round_trips_through_merge() {
        let source = Arc::new(RecordStore::new("node1"));
        assert!(source.apply(&delta("a.example.com", "10.0.0.1", 100, "node1")));
        let source_delegate = ClusterDelegate::new(Arc::clone(&source), || 1);

        let sink = Arc::new(RecordStore::new("node2"));
        let sink_delegate = ClusterDelegate::new(Arc::clone(&sink), || 1);

        let state = source_delegate.local_state(true);
        sink_delegate.merge_remote_state(&state, true);

        assert_eq!(sink.lookup("a.example.com").as_deref(), Some("10.0.0.1"));
        // Metadata survives the round trip: origin stays node1, t=100.
        let meta = sink.meta("a.example.com").unwrap();
        assert_eq!(meta.timestamp, 100);
        assert_eq!(meta.node_id, "node1");
    }

    #[test]
    fn test_merge_remote_state_respects_lww() {
        let store = Arc::new(RecordStore::new("node1"));
        assert!(store.apply(&delta("keep.example.com", "10.0.0.1", 200, "node1")));
        let delegate = ClusterDelegate::new(Arc::clone(&store), || 1);

        let mut remote = FullState::new("node2");
        remote.records.insert(
            "keep.example.com".to_string(),
            RecordEntry {
                ip: "10.9.9.9".to_string(),
                timestamp: 100,
                node_id: "node2".to_string(),
            },
        );
        remote.records.insert(
            "new.example.com".to_string(),
            RecordEntry {
                ip: "10.0.0.2".to_string(),
                timestamp: 150,
                node_id: "node2".to_string(),
            },
        );
        delegate.merge_remote_state(&remote.encode().unwrap(), false);

        assert_eq!(store.lookup("keep.example.com").as_deref(), Some("10.0.0.1"));
        assert_eq!(store.lookup("new.example.com").as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_queue_broadcast_feeds_transmit_queue() {
        let store = Arc::new(RecordStore::new("node1"));
        let delegate = ClusterDelegate::new(store, || 2);

        delegate.queue_broadcast(&delta("a.example.com", "10.0.0.1", 1, "node1"));
        assert_eq!(delegate.pending_broadcasts(), 1);

        let wave = delegate.broadcasts(16, 1400);
        assert_eq!(wave.len(), 1);
        let decoded = RecordMessage::decode(&wave[0]).unwrap();
        assert_eq!(decoded.hostname, "a.example.com");
    }

    #[test]
    fn test_node_meta_is_empty() {
        let store = Arc::new(RecordStore::new("node1"));
        let delegate = ClusterDelegate::new(store, || 1);
        assert!(delegate.node_meta(512).is_empty());
    }
}
