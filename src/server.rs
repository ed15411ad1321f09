//! Server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::error::DnsError;
use crate::handler::QueryHandler;
use crate::metrics;
use crate::store::RecordStore;
use crate::watcher::{DockerWatcher, RecordChange};

/// Idle timeout for DNS TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);
/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit state gauges.
async fn metrics_loop(
    store: Arc<RecordStore>,
    cluster: Option<Arc<ClusterManager>>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let members = cluster.as_ref().map(|c| c.members().len()).unwrap_or(0);
                metrics::record_state_counts(store.len(), members);
                debug!(records = store.len(), members, "emitted state metrics");
            }
            _ = token.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// The quay-dns server: record store, container watcher, optional cluster
/// replication, and the DNS front end.
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from validated configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until the token is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<(), DnsError> {
        let config = self.config;
        info!(
            listen_addr = %config.dns.listen_addr,
            host_ip = %config.dns.host_ip,
            cluster = config.cluster.enabled,
            "starting quay-dns"
        );

        let node_id = if config.cluster.enabled {
            config.cluster.node_name.clone()
        } else {
            "local".to_string()
        };
        let store = Arc::new(RecordStore::new(node_id));

        // Cluster replication, when enabled.
        let cluster = if config.cluster.enabled {
            let manager = ClusterManager::new(config.cluster.clone(), Arc::clone(&store));
            manager.start().await?;
            if let Err(e) = manager.join().await {
                // Local resolution keeps working; anti-entropy and the
                // discovery loop keep trying to find the cluster.
                warn!("cluster join failed: {e}");
            }
            Some(manager)
        } else {
            None
        };

        // Container watcher, wired into replication when clustering.
        let watcher = Arc::new(DockerWatcher::new(
            &config.docker,
            &config.dns.host_ip,
            Arc::clone(&store),
        ));
        if let Some(manager) = &cluster {
            let manager = Arc::clone(manager);
            watcher.set_callback(Arc::new(move |change: RecordChange| {
                if change.added {
                    manager.notify_add(&change.hostname, &change.ip, change.timestamp);
                } else {
                    manager.notify_remove(&change.hostname, change.timestamp);
                }
            }));
        }
        watcher.start();

        // DNS front end.
        let handler = QueryHandler::new(Arc::clone(&store), &config.dns);
        let mut server = ServerFuture::new(handler);

        let udp_socket = UdpSocket::bind(config.dns.listen_addr).await?;
        info!(addr = %config.dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(config.dns.listen_addr).await?;
        info!(addr = %config.dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        let metrics_handle = tokio::spawn(metrics_loop(
            Arc::clone(&store),
            cluster.clone(),
            token.clone(),
        ));

        info!("quay-dns ready to serve queries");

        tokio::select! {
            _ = token.cancelled() => {
                info!("shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {e}");
                }
            }
        }

        // Orderly teardown: stop feeding the store, then leave the cluster.
        watcher.stop().await;
        if let Some(manager) = cluster {
            manager.stop().await;
        }
        let _ = metrics_handle.await;

        info!("quay-dns stopped");
        Ok(())
    }
}
