//! Cluster replication: membership lifecycle, broadcast API, discovery.
//!
//! The manager owns the membership engine, wires the delegate to the record
//! store, and exposes the notify API the watcher callback feeds. A local
//! change is always applied to the local store before it is queued for
//! peers, so a cluster outage never stops local resolution.

pub mod delegate;
pub mod discovery;
pub mod swim;

pub use delegate::ClusterDelegate;
pub use discovery::PeerDiscovery;
pub use swim::{BroadcastQueue, Delegate, Member, MemberState, Membership, MembershipConfig};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::DnsError;
use crate::message::{RecordAction, RecordMessage};
use crate::store::RecordStore;

/// Grace period for the leave broadcast during shutdown.
const LEAVE_GRACE: Duration = Duration::from_secs(5);
/// How often the discovery join loop retries while the node is alone.
const DISCOVERY_JOIN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Constructed,
    Running,
    Stopped,
}

/// Orchestrates membership-based replication of record changes.
pub struct ClusterManager {
    config: ClusterConfig,
    store: Arc<RecordStore>,
    delegate: Arc<ClusterDelegate>,
    membership: Arc<RwLock<Option<Arc<Membership>>>>,
    discovery: RwLock<Option<Arc<PeerDiscovery>>>,
    state: Mutex<ManagerState>,
    token: CancellationToken,
}

impl ClusterManager {
    /// Create a manager. The configuration must already be validated.
    pub fn new(config: ClusterConfig, store: Arc<RecordStore>) -> Arc<Self> {
        let membership: Arc<RwLock<Option<Arc<Membership>>>> = Arc::new(RwLock::new(None));

        let slot = Arc::clone(&membership);
        let delegate = ClusterDelegate::new(Arc::clone(&store), move || {
            slot.read().as_ref().map(|m| m.num_members()).unwrap_or(1)
        });

        Arc::new(Self {
            config,
            store,
            delegate,
            membership,
            discovery: RwLock::new(None),
            state: Mutex::new(ManagerState::Constructed),
            token: CancellationToken::new(),
        })
    }

    /// Bind and start membership, the delegate worker, and (without static
    /// seeds) peer discovery. Starting twice fails.
    pub async fn start(&self) -> Result<(), DnsError> {
        {
            let state = self.state.lock();
            match *state {
                ManagerState::Constructed => {}
                ManagerState::Running => {
                    return Err(DnsError::AlreadyRunning("cluster manager"))
                }
                ManagerState::Stopped => {
                    return Err(DnsError::Config("cluster manager already stopped".into()))
                }
            }
        }

        let mut membership_config = MembershipConfig::new(
            self.config.node_name.clone(),
            self.config.bind_addr.clone(),
            self.config.port,
        );
        if !self.config.secret.is_empty() {
            membership_config.secret_key = Some(self.config.secret.as_bytes().to_vec());
        }

        let delegate: Arc<dyn Delegate> = self.delegate.clone();
        let membership = Membership::new(membership_config, delegate).await?;
        membership.start();
        *self.membership.write() = Some(Arc::clone(&membership));

        self.delegate.start(self.token.child_token());

        if self.config.seed_addrs().is_empty() {
            let discovery = PeerDiscovery::new(
                self.config.node_name.clone(),
                membership.local_addr().port(),
                self.config.discovery_port,
            );
            match discovery.start().await {
                Ok(()) => *self.discovery.write() = Some(discovery),
                Err(e) => warn!("peer discovery failed to start: {e}"),
            }
        }

        *self.state.lock() = ManagerState::Running;
        info!(
            node = %self.config.node_name,
            addr = %membership.local_addr(),
            "cluster started"
        );
        Ok(())
    }

    /// Join the cluster. With static seeds this blocks and surfaces
    /// failure; with broadcast discovery it returns immediately and retries
    /// in the background until shutdown.
    pub async fn join(&self) -> Result<(), DnsError> {
        let membership = self
            .membership
            .read()
            .clone()
            .ok_or_else(|| DnsError::Config("cluster manager not started".into()))?;

        let seeds = self.config.seed_addrs();
        if !seeds.is_empty() {
            let joined = membership.join(&seeds).await?;
            info!(seeds = joined, "joined cluster via static seeds");
            return Ok(());
        }

        let Some(discovery) = self.discovery.read().clone() else {
            info!("no seeds configured and discovery not running, operating standalone");
            return Ok(());
        };

        info!("using broadcast discovery to find cluster peers");
        let token = self.token.clone();
        tokio::spawn(discovery_join_loop(membership, discovery, token));
        Ok(())
    }

    /// Replicate a locally-observed add: apply to the local store first,
    /// then queue for gossip.
    pub fn notify_add(&self, hostname: &str, ip: &str, timestamp: i64) {
        let message = RecordMessage {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            action: RecordAction::Add,
            timestamp,
            node_id: self.config.node_name.clone(),
        };
        self.store.apply(&message);
        self.delegate.queue_broadcast(&message);
    }

    /// Replicate a locally-observed remove.
    pub fn notify_remove(&self, hostname: &str, timestamp: i64) {
        let message = RecordMessage {
            hostname: hostname.to_string(),
            ip: String::new(),
            action: RecordAction::Remove,
            timestamp,
            node_id: self.config.node_name.clone(),
        };
        self.store.apply(&message);
        self.delegate.queue_broadcast(&message);
    }

    /// Tear down in order: cancel, discovery, delegate worker, leave,
    /// shutdown. Idempotent; a no-op when never started.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            let was_running = *state == ManagerState::Running;
            *state = ManagerState::Stopped;
            if !was_running {
                return;
            }
        }

        self.token.cancel();

        let discovery = self.discovery.write().take();
        if let Some(discovery) = discovery {
            discovery.stop().await;
        }

        self.delegate.stop().await;

        let membership = self.membership.write().take();
        if let Some(membership) = membership {
            membership.leave(LEAVE_GRACE).await;
            membership.shutdown().await;
        }

        info!("cluster stopped");
    }

    /// Current cluster members (not known dead), empty before start.
    pub fn members(&self) -> Vec<Member> {
        self.membership
            .read()
            .as_ref()
            .map(|m| m.members())
            .unwrap_or_default()
    }

    /// True when membership is up and sees at least one member.
    pub fn is_healthy(&self) -> bool {
        self.membership
            .read()
            .as_ref()
            .map(|m| m.num_members() > 0)
            .unwrap_or(false)
    }

    /// The advertised gossip address, once started.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.membership.read().as_ref().map(|m| m.local_addr())
    }
}

/// Try discovered peers every few seconds, but only while we are alone.
async fn discovery_join_loop(
    membership: Arc<Membership>,
    discovery: Arc<PeerDiscovery>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(DISCOVERY_JOIN_INTERVAL);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        if membership.num_members() > 1 {
            continue;
        }
        let peers = discovery.peers();
        if peers.is_empty() {
            continue;
        }

        match membership.join(&peers).await {
            Ok(joined) => info!(peers = joined, "joined cluster via discovered peers"),
            Err(e) => debug!("discovered-peer join failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_config(node_name: &str) -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            bind_addr: "127.0.0.1".to_string(),
            port: 1, // replaced by ephemeral bind in tests that start
            node_name: node_name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_noop() {
        let store = Arc::new(RecordStore::new("node1"));
        let manager = ClusterManager::new(cluster_config("node1"), store);
        manager.stop().await;
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_notify_applies_locally_and_queues() {
        let store = Arc::new(RecordStore::new("node1"));
        let manager = ClusterManager::new(cluster_config("node1"), Arc::clone(&store));

        manager.notify_add("app.example.com", "10.0.0.1", 100);
        assert_eq!(store.lookup("app.example.com").as_deref(), Some("10.0.0.1"));
        let meta = store.meta("app.example.com").unwrap();
        assert_eq!(meta.node_id, "node1");
        assert_eq!(manager.delegate.pending_broadcasts(), 1);

        manager.notify_remove("app.example.com", 200);
        assert_eq!(store.lookup("app.example.com"), None);
        assert_eq!(manager.delegate.pending_broadcasts(), 2);
    }

    #[tokio::test]
    async fn test_members_empty_before_start() {
        let store = Arc::new(RecordStore::new("node1"));
        let manager = ClusterManager::new(cluster_config("node1"), store);
        assert!(manager.members().is_empty());
        assert!(!manager.is_healthy());
    }
}
