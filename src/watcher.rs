//! Container runtime watcher.
//!
//! Consumes the Docker event stream, extracts hostnames from container
//! labels and keeps the record store in sync with the set of running
//! containers. The connect loop survives daemon restarts with exponential
//! backoff; every successful connection starts with a full container sync
//! so changes missed while disconnected are reconciled.

use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DockerConfig;
use crate::error::DnsError;
use crate::metrics::{self, ReconnectReason};
use crate::store::{wall_clock_nanos, RecordStore};

/// Connection timeout for the runtime client, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Backoff bounds for the connect loop.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// A single record change emitted by the watcher.
///
/// `timestamp` is stamped once at emission and travels unchanged through
/// the replication path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    /// Hostname the change applies to.
    pub hostname: String,
    /// IP for adds; empty for removes.
    pub ip: String,
    /// True for an add, false for a remove.
    pub added: bool,
    /// Unix nanosecond timestamp of the change.
    pub timestamp: i64,
}

/// Replication hook invoked for every emitted change.
pub type ChangeCallback = Arc<dyn Fn(RecordChange) + Send + Sync>;

/// Why the event stream stopped.
enum StreamExit {
    Cancelled,
    Ended,
}

/// Watches the container runtime and mirrors label-declared hostnames into
/// the record store.
pub struct DockerWatcher {
    socket: String,
    host_ip: String,
    labels: Vec<String>,
    store: Arc<RecordStore>,
    callback: RwLock<Option<ChangeCallback>>,
    /// container id -> hostnames last registered for it
    containers: Mutex<HashMap<String, Vec<String>>>,
    token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DockerWatcher {
    /// Create a watcher. `host_ip` is the address every local hostname
    /// resolves to.
    pub fn new(config: &DockerConfig, host_ip: impl Into<String>, store: Arc<RecordStore>) -> Self {
        Self {
            socket: config.socket.clone(),
            host_ip: host_ip.into(),
            labels: config.labels.clone(),
            store,
            callback: RwLock::new(None),
            containers: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Set the replication hook. Invoked for each record add/remove, never
    /// while internal locks are held.
    pub fn set_callback(&self, callback: ChangeCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Start the watch loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let watcher = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { watcher.watch_loop().await }));
    }

    /// Cancel the watch loop and wait for it to unwind.
    pub async fn stop(&self) {
        self.token.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("watcher task panicked: {e}");
            }
        }
    }

    /// Connect, sync, stream events; reconnect with exponential backoff on
    /// any failure.
    async fn watch_loop(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut first_connect = true;

        loop {
            if self.token.is_cancelled() {
                return;
            }

            let docker = match self.connect().await {
                Ok(docker) => docker,
                Err(e) => {
                    error!("failed to connect to container runtime: {e}");
                    metrics::record_watcher_reconnect(ReconnectReason::ConnectFailed);
                    if !self.sleep(backoff).await {
                        return;
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            backoff = INITIAL_BACKOFF;
            if first_connect {
                metrics::record_watcher_reconnect(ReconnectReason::InitialConnect);
                first_connect = false;
            }

            if let Err(e) = self.sync_containers(&docker).await {
                error!("container sync failed: {e}");
                metrics::record_watcher_reconnect(ReconnectReason::SyncFailed);
                if !self.sleep(backoff).await {
                    return;
                }
                backoff = next_backoff(backoff);
                continue;
            }

            match self.watch_events(&docker).await {
                Ok(StreamExit::Cancelled) => return,
                Ok(StreamExit::Ended) => {
                    warn!("container event stream ended, reconnecting");
                    metrics::record_watcher_reconnect(ReconnectReason::StreamEnded);
                }
                Err(e) => {
                    error!("container event stream error: {e}");
                    metrics::record_watcher_reconnect(ReconnectReason::StreamError);
                }
            }

            if !self.sleep(backoff).await {
                return;
            }
            backoff = next_backoff(backoff);
        }
    }

    /// Connect to the runtime and verify it answers a ping.
    async fn connect(&self) -> Result<Docker, DnsError> {
        let docker = if self.socket.starts_with("unix://") {
            Docker::connect_with_unix(&self.socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if self.socket.starts_with("tcp://") || self.socket.starts_with("http://") {
            Docker::connect_with_http(&self.socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_local_defaults()?
        };

        docker.ping().await?;
        info!(socket = %self.socket, "connected to container runtime");
        Ok(docker)
    }

    /// Full sync: register hostnames for every running container and drop
    /// records for containers that disappeared while we were not looking.
    async fn sync_containers(&self, docker: &Docker) -> Result<(), DnsError> {
        let options = ListContainersOptions::<String> {
            filters: HashMap::from([("status".to_string(), vec!["running".to_string()])]),
            ..Default::default()
        };
        let containers = docker.list_containers(Some(options)).await?;

        let mut seen = HashSet::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            let hostnames = self.extract_hostnames(&container.labels.unwrap_or_default());
            if !hostnames.is_empty() {
                seen.insert(id.clone());
                self.update(&id, hostnames);
            }
        }

        self.reconcile_absent(&seen);

        info!(containers = seen.len(), "synced running containers");
        self.log_registered();
        Ok(())
    }

    /// Remove every record belonging to a tracked container that is no
    /// longer present.
    fn reconcile_absent(&self, seen: &HashSet<String>) {
        let stale: Vec<(String, Vec<String>)> = {
            let mut tracked = self.containers.lock();
            let ids: Vec<String> = tracked
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| tracked.remove(&id).map(|hostnames| (id, hostnames)))
                .collect()
        };

        for (id, hostnames) in stale {
            debug!(container = %short_id(&id), ?hostnames, "container gone, removing records");
            let timestamp = wall_clock_nanos();
            for hostname in hostnames {
                self.store.remove(&hostname);
                self.emit(RecordChange {
                    hostname,
                    ip: String::new(),
                    added: false,
                    timestamp,
                });
            }
        }
    }

    /// Stream container lifecycle events until cancellation or failure.
    async fn watch_events(&self, docker: &Docker) -> Result<StreamExit, DnsError> {
        let options = EventsOptions::<String> {
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                (
                    "event".to_string(),
                    vec!["start".to_string(), "stop".to_string(), "die".to_string()],
                ),
            ]),
            ..Default::default()
        };
        let mut stream = docker.events(Some(options));

        info!("watching container events");
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => return Ok(StreamExit::Cancelled),

                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        let action = event.action.unwrap_or_default();
                        let id = event.actor.and_then(|a| a.id).unwrap_or_default();
                        if id.is_empty() {
                            continue;
                        }
                        metrics::record_watcher_event(&action);
                        match action.as_str() {
                            "start" => self.handle_start(docker, &id).await,
                            "stop" | "die" => self.handle_stop(&id),
                            _ => {}
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(StreamExit::Ended),
                },
            }
        }
    }

    /// A container started: inspect it and register its hostnames.
    async fn handle_start(&self, docker: &Docker, id: &str) {
        let detail = match docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => detail,
            Err(e) => {
                error!(container = %short_id(id), "failed to inspect started container: {e}");
                return;
            }
        };

        let labels = detail
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();
        let hostnames = self.extract_hostnames(&labels);
        if hostnames.is_empty() {
            return;
        }

        info!(container = %short_id(id), ?hostnames, "container started");
        self.update(id, hostnames);
        self.log_registered();
    }

    /// A container stopped: drop everything it had registered.
    fn handle_stop(&self, id: &str) {
        let hostnames = self.containers.lock().remove(id);
        let Some(hostnames) = hostnames else { return };

        info!(container = %short_id(id), ?hostnames, "container stopped");
        let timestamp = wall_clock_nanos();
        for hostname in hostnames {
            self.store.remove(&hostname);
            self.emit(RecordChange {
                hostname,
                ip: String::new(),
                added: false,
                timestamp,
            });
        }
        self.log_registered();
    }

    /// Replace the tracked hostname set for a container, emitting a remove
    /// for every name that vanished and an add for every new one.
    fn update(&self, id: &str, new_hostnames: Vec<String>) {
        let old_hostnames = self
            .containers
            .lock()
            .insert(id.to_string(), new_hostnames.clone())
            .unwrap_or_default();

        let old: HashSet<&String> = old_hostnames.iter().collect();
        let new: HashSet<&String> = new_hostnames.iter().collect();

        let timestamp = wall_clock_nanos();
        let mut changes = Vec::new();

        for hostname in old_hostnames.iter().filter(|h| !new.contains(*h)) {
            self.store.remove(hostname);
            changes.push(RecordChange {
                hostname: hostname.clone(),
                ip: String::new(),
                added: false,
                timestamp,
            });
        }
        for hostname in new_hostnames.iter().filter(|h| !old.contains(*h)) {
            self.store.add(hostname, &self.host_ip);
            changes.push(RecordChange {
                hostname: hostname.clone(),
                ip: self.host_ip.clone(),
                added: true,
                timestamp,
            });
        }

        for change in changes {
            self.emit(change);
        }
    }

    /// Invoke the replication hook, if set. Callers must not hold locks.
    fn emit(&self, change: RecordChange) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(change);
        }
    }

    /// Union of hostnames across all configured labels, comma-split,
    /// trimmed, deduplicated in first-seen order.
    fn extract_hostnames(&self, labels: &HashMap<String, String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut hostnames = Vec::new();

        for label in &self.labels {
            let Some(value) = labels.get(label) else {
                continue;
            };
            for token in value.split(',') {
                let hostname = token.trim();
                if !hostname.is_empty() && seen.insert(hostname.to_string()) {
                    hostnames.push(hostname.to_string());
                }
            }
        }

        hostnames
    }

    fn log_registered(&self) {
        let mut hostnames: Vec<String> = self.store.all().into_keys().collect();
        hostnames.sort();
        debug!(?hostnames, "registered hostnames");
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
