//! UDP broadcast peer discovery.
//!
//! Zero-configuration clustering accelerator: every node announces itself
//! to the IPv4 broadcast address and records announcements from others.
//! The manager feeds the resulting peer table into membership join. This
//! has no effect on correctness; nodes with static seeds skip it entirely.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Magic token marking our announcement packets.
const DISCOVERY_MAGIC: &str = "QUAY-CLUSTER";
/// How often presence is announced.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
/// Read deadline on the listener so cancellation is observed promptly.
const READ_DEADLINE: Duration = Duration::from_secs(1);
/// Maximum accepted packet size.
const MAX_PACKET: usize = 1024;

/// Self-announcement packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Announcement {
    /// Magic token.
    #[serde(rename = "m")]
    magic: String,
    /// Announcing node id.
    #[serde(rename = "n")]
    node_id: String,
    /// Gossip port the announcing node listens on.
    #[serde(rename = "p")]
    cluster_port: u16,
}

/// Broadcast-based peer discovery service.
pub struct PeerDiscovery {
    node_id: String,
    cluster_port: u16,
    discovery_port: u16,
    /// node id -> "ip:cluster_port"
    peers: RwLock<HashMap<String, String>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerDiscovery {
    /// Create the service. `cluster_port` is what we advertise; the
    /// announcement itself travels on `discovery_port`.
    pub fn new(node_id: impl Into<String>, cluster_port: u16, discovery_port: u16) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            cluster_port,
            discovery_port,
            peers: RwLock::new(HashMap::new()),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener and start announcing.
    pub async fn start(self: &Arc<Self>) -> Result<(), std::io::Error> {
        let listener = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.discovery_port)).await?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).listen_loop(listener)));
        tasks.push(tokio::spawn(Arc::clone(self).announce_loop()));

        info!(port = self.discovery_port, "peer discovery started");
        Ok(())
    }

    /// Stop both loops and wait for them.
    pub async fn stop(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("peer discovery stopped");
    }

    /// Currently known peer addresses, suitable for a membership join.
    pub fn peers(&self) -> Vec<String> {
        self.peers.read().values().cloned().collect()
    }

    async fn announce_loop(self: Arc<Self>) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("discovery announce socket failed: {e}");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!("discovery broadcast mode failed: {e}");
            return;
        }

        let packet = Announcement {
            magic: DISCOVERY_MAGIC.to_string(),
            node_id: self.node_id.clone(),
            cluster_port: self.cluster_port,
        };
        let payload = match serde_json::to_vec(&packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("discovery packet encode failed: {e}");
                return;
            }
        };
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port));

        let mut interval = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = interval.tick() => {}
            }

            if let Err(e) = socket.send_to(&payload, target).await {
                debug!("discovery broadcast failed: {e}");
            }
        }
    }

    async fn listen_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            if self.token.is_cancelled() {
                return;
            }

            // Bounded read so cancellation is seen within a second.
            match tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    debug!("discovery read error: {e}");
                    continue;
                }
                Ok(Ok((len, src))) => self.handle_packet(&buf[..len], src),
            }
        }
    }

    /// Record a peer announcement. Malformed, foreign-magic and self
    /// packets are dropped without error.
    fn handle_packet(&self, data: &[u8], src: SocketAddr) {
        let Ok(packet) = serde_json::from_slice::<Announcement>(data) else {
            return;
        };
        if packet.magic != DISCOVERY_MAGIC || packet.node_id == self.node_id {
            return;
        }

        let peer_addr = format!("{}:{}", src.ip(), packet.cluster_port);
        let mut peers = self.peers.write();
        if !peers.contains_key(&packet.node_id) {
            info!(node = %packet.node_id, addr = %peer_addr, "discovered peer");
        }
        peers.insert(packet.node_id, peer_addr);
    }
}
