//! SWIM-style membership substrate.
//!
//! Failure detection and dissemination over UDP (ping/ack with piggybacked
//! member lists, suspect/alive refutation via incarnation numbers) plus a
//! TCP push/pull channel that exchanges full application state for
//! anti-entropy. Application integration happens exclusively through the
//! five-method [`Delegate`] contract; record semantics live elsewhere.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DnsError;
use crate::metrics;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Largest UDP datagram we will send.
const MAX_UDP_PACKET: usize = 1400;
/// Receive buffer for gossip datagrams.
const RECV_BUFFER: usize = 65535;
/// Per-message overhead budgeted when draining broadcasts.
const USER_MSG_OVERHEAD: usize = 16;
/// Upper bound on node metadata returned by the delegate.
const MAX_NODE_META: usize = 512;
/// Members piggybacked on an ack; the full table travels via push/pull.
const MAX_PIGGYBACK_MEMBERS: usize = 12;
/// Upper bound on a TCP push/pull frame.
const MAX_SYNC_FRAME: usize = 16 * 1024 * 1024;
/// Connect timeout for push/pull sync.
const SYNC_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application hooks the membership layer calls into.
///
/// This is the complete integration surface: metadata for the local node,
/// user-message delivery, broadcast draining, and full-state exchange for
/// push/pull sync.
pub trait Delegate: Send + Sync + 'static {
    /// Opaque metadata attached to the local member record. `limit` bounds
    /// the accepted length.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived from a peer. Must not block.
    fn notify_message(&self, payload: &[u8]);

    /// Drain queued user messages, at most `limit` payload bytes counting
    /// `overhead` per message.
    fn broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local application state for push/pull sync. `join` is true when
    /// a new peer is joining.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Merge a peer's full application state.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Liveness state of a member as seen by the local failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Responsive.
    Alive,
    /// Missed a probe; will be declared dead unless refuted.
    Suspect,
    /// Confirmed failed or departed.
    Dead,
}

/// A single cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Unique node name.
    pub name: String,
    /// Gossip address (UDP and TCP share the port).
    pub addr: SocketAddr,
    /// Current liveness state.
    pub state: MemberState,
    /// Logical clock ordering state claims about this member.
    pub incarnation: u64,
    /// Delegate-provided metadata.
    #[serde(default)]
    pub meta: Vec<u8>,
    /// Local receive timestamp; never serialized.
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Wire protocol for the gossip plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum GossipMessage {
    /// Direct health probe.
    Ping { from: Member },
    /// Probe response carrying the responder's member list.
    Ack { from: Member, members: Vec<Member> },
    /// Claim that a member missed its probe.
    Suspect { name: String, incarnation: u64 },
    /// Liveness assertion, refutes an earlier suspicion.
    Alive { member: Member },
    /// Graceful departure.
    Leave { name: String },
    /// Opaque application payload.
    User { payload: Vec<u8> },
}

/// TCP push/pull frame: membership plus application state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncFrame {
    from: Member,
    members: Vec<Member>,
    state: Vec<u8>,
    join: bool,
}

/// Membership tuning. Defaults favor quick convergence over network load;
/// payloads are small and churn happens at human timescales.
#[derive(Clone)]
pub struct MembershipConfig {
    /// Unique local node name.
    pub node_name: String,
    /// Bind address for UDP gossip and TCP sync.
    pub bind_addr: String,
    /// Bind port; 0 picks an ephemeral port.
    pub bind_port: u16,
    /// How often queued broadcasts are gossiped.
    pub gossip_interval: Duration,
    /// How often a random member is probed.
    pub probe_interval: Duration,
    /// How long a probed member has to ack.
    pub probe_timeout: Duration,
    /// Multiplied by the probe interval to get the suspicion deadline.
    pub suspicion_mult: u32,
    /// Broadcast retransmit multiplier.
    pub retransmit_mult: usize,
    /// How many members receive each gossip wave.
    pub gossip_fanout: usize,
    /// Anti-entropy full-state sync period.
    pub push_pull_interval: Duration,
    /// Optional AES key (16/24/32 bytes) sealing the gossip plane.
    pub secret_key: Option<Vec<u8>>,
}

impl MembershipConfig {
    /// Defaults for a LAN cluster.
    pub fn new(node_name: impl Into<String>, bind_addr: impl Into<String>, bind_port: u16) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr: bind_addr.into(),
            bind_port,
            gossip_interval: Duration::from_millis(200),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            suspicion_mult: 4,
            retransmit_mult: 3,
            gossip_fanout: 3,
            push_pull_interval: Duration::from_secs(30),
            secret_key: None,
        }
    }
}

/// Seals and opens gossip packets when a shared key is configured.
enum Sealer {
    Plain,
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Sealer {
    fn new(key: Option<&[u8]>) -> Result<Self, DnsError> {
        match key {
            None => Ok(Self::Plain),
            Some(key) => match key.len() {
                16 => Ok(Self::Aes128(Box::new(
                    Aes128Gcm::new_from_slice(key)
                        .map_err(|e| DnsError::Config(format!("bad cluster secret: {e}")))?,
                ))),
                24 => Ok(Self::Aes192(Box::new(
                    Aes192Gcm::new_from_slice(key)
                        .map_err(|e| DnsError::Config(format!("bad cluster secret: {e}")))?,
                ))),
                32 => Ok(Self::Aes256(Box::new(
                    Aes256Gcm::new_from_slice(key)
                        .map_err(|e| DnsError::Config(format!("bad cluster secret: {e}")))?,
                ))),
                n => Err(DnsError::Config(format!(
                    "cluster secret must be 16, 24 or 32 bytes, got {n}"
                ))),
            },
        }
    }

    fn seal(&self, plain: &[u8]) -> Vec<u8> {
        let encrypt = |sealed: Result<Vec<u8>, aes_gcm::Error>, nonce: [u8; 12]| {
            let mut out = nonce.to_vec();
            out.extend(sealed.unwrap_or_default());
            out
        };

        match self {
            Self::Plain => plain.to_vec(),
            _ => {
                let mut nonce = [0u8; 12];
                rand::thread_rng().fill_bytes(&mut nonce);
                let n = Nonce::from_slice(&nonce);
                match self {
                    Self::Plain => unreachable!(),
                    Self::Aes128(c) => encrypt(c.encrypt(n, plain), nonce),
                    Self::Aes192(c) => encrypt(c.encrypt(n, plain), nonce),
                    Self::Aes256(c) => encrypt(c.encrypt(n, plain), nonce),
                }
            }
        }
    }

    fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::Plain => Some(data.to_vec()),
            _ => {
                if data.len() < 12 {
                    return None;
                }
                let (nonce, ciphertext) = data.split_at(12);
                let n = Nonce::from_slice(nonce);
                match self {
                    Self::Plain => unreachable!(),
                    Self::Aes128(c) => c.decrypt(n, ciphertext).ok(),
                    Self::Aes192(c) => c.decrypt(n, ciphertext).ok(),
                    Self::Aes256(c) => c.decrypt(n, ciphertext).ok(),
                }
            }
        }
    }
}

struct QueuedBroadcast {
    payload: Vec<u8>,
    transmits: usize,
}

/// Queue of pending user broadcasts, each retransmitted a number of times
/// proportional to the logarithm of the cluster size.
pub struct BroadcastQueue {
    queue: Mutex<VecDeque<QueuedBroadcast>>,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
    retransmit_mult: usize,
}

impl BroadcastQueue {
    /// `num_nodes` reports the current cluster size for retransmit scaling.
    pub fn new(
        retransmit_mult: usize,
        num_nodes: impl Fn() -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            num_nodes: Box::new(num_nodes),
            retransmit_mult,
        }
    }

    fn retransmit_limit(&self) -> usize {
        let nodes = (self.num_nodes)().max(1);
        let scale = ((nodes + 1) as f64).log10().ceil() as usize;
        (self.retransmit_mult * scale).max(1)
    }

    /// Enqueue a payload for gossip.
    pub fn queue(&self, payload: Vec<u8>) {
        let transmits = self.retransmit_limit();
        self.queue.lock().push_back(QueuedBroadcast {
            payload,
            transmits,
        });
    }

    /// Take one transmission wave: each returned payload counts `overhead`
    /// plus its own length against `limit`. Payloads with transmissions
    /// remaining go back to the queue.
    pub fn pop(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut queue = self.queue.lock();
        let mut taken = Vec::new();
        let mut used = 0;
        let mut requeue = Vec::new();

        while let Some(front) = queue.front() {
            let cost = overhead + front.payload.len();
            if used + cost > limit {
                break;
            }
            used += cost;
            let Some(mut item) = queue.pop_front() else {
                break;
            };
            item.transmits -= 1;
            taken.push(item.payload.clone());
            if item.transmits > 0 {
                requeue.push(item);
            }
        }

        for item in requeue {
            queue.push_back(item);
        }
        taken
    }

    /// Number of payloads still queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// The membership engine: failure detection, dissemination, anti-entropy.
pub struct Membership {
    config: MembershipConfig,
    delegate: Arc<dyn Delegate>,
    sealer: Sealer,
    socket: Arc<UdpSocket>,
    listener: Mutex<Option<TcpListener>>,
    advertise: SocketAddr,
    members: RwLock<HashMap<String, Member>>,
    incarnation: AtomicU64,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Membership {
    /// Bind the gossip sockets. Fails if the port is already bound.
    pub async fn new(
        config: MembershipConfig,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Self>, DnsError> {
        let sealer = Sealer::new(config.secret_key.as_deref())?;

        let socket = UdpSocket::bind((config.bind_addr.as_str(), config.bind_port)).await?;
        let advertise = socket.local_addr()?;
        // TCP sync shares the (possibly ephemeral) UDP port.
        let listener = TcpListener::bind((config.bind_addr.as_str(), advertise.port())).await?;

        let membership = Arc::new(Self {
            delegate,
            sealer,
            socket: Arc::new(socket),
            listener: Mutex::new(Some(listener)),
            advertise,
            members: RwLock::new(HashMap::new()),
            incarnation: AtomicU64::new(1),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let local = membership.local_member();
        membership
            .members
            .write()
            .insert(local.name.clone(), local);

        info!(node = %membership.config.node_name, addr = %advertise, "membership bound");
        Ok(membership)
    }

    /// Start the background loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let Some(listener) = self.listener.lock().take() else {
            return;
        };

        tasks.push(tokio::spawn(Arc::clone(self).recv_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).probe_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).gossip_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).push_pull_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).accept_loop(listener)));
    }

    /// The address peers should use to reach this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// Members not known to be dead, including the local node.
    pub fn members(&self) -> Vec<Member> {
        self.members
            .read()
            .values()
            .filter(|m| m.state != MemberState::Dead)
            .cloned()
            .collect()
    }

    /// Count of members not known to be dead.
    pub fn num_members(&self) -> usize {
        self.members
            .read()
            .values()
            .filter(|m| m.state != MemberState::Dead)
            .count()
    }

    /// Contact each seed over TCP push/pull. Returns how many answered;
    /// zero reachable seeds is an error.
    pub async fn join(&self, seeds: &[String]) -> Result<usize, DnsError> {
        let mut joined = 0;
        for seed in seeds {
            let addr: SocketAddr = match seed.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(seed = %seed, "ignoring unparseable seed address");
                    continue;
                }
            };
            if addr == self.advertise {
                continue;
            }
            match self.push_pull(addr, true).await {
                Ok(()) => {
                    info!(seed = %addr, "joined via seed");
                    joined += 1;
                }
                Err(e) => warn!(seed = %addr, "seed join failed: {e}"),
            }
        }

        if joined == 0 {
            return Err(DnsError::Join(format!(
                "no seed reachable out of {}",
                seeds.len()
            )));
        }
        Ok(joined)
    }

    /// Announce departure to the cluster, bounded by `grace`.
    pub async fn leave(&self, grace: Duration) {
        let message = GossipMessage::Leave {
            name: self.config.node_name.clone(),
        };
        let _ = tokio::time::timeout(grace, self.broadcast(&message)).await;
    }

    /// Stop all loops and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn local_member(&self) -> Member {
        let mut meta = self.delegate.node_meta(MAX_NODE_META);
        meta.truncate(MAX_NODE_META);
        Member {
            name: self.config.node_name.clone(),
            addr: self.advertise,
            state: MemberState::Alive,
            incarnation: self.incarnation.load(Ordering::SeqCst),
            meta,
            last_seen: None,
        }
    }

    /// Random members eligible as gossip or probe targets.
    fn random_targets(&self, count: usize, include_suspect: bool) -> Vec<Member> {
        let members = self.members.read();
        let candidates: Vec<Member> = members
            .values()
            .filter(|m| m.name != self.config.node_name)
            .filter(|m| {
                m.state == MemberState::Alive
                    || (include_suspect && m.state == MemberState::Suspect)
            })
            .cloned()
            .collect();
        drop(members);

        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, count)
            .cloned()
            .collect()
    }

    async fn send(&self, message: &GossipMessage, addr: SocketAddr) {
        let encoded = match bincode::serialize(message) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed to encode gossip message: {e}");
                return;
            }
        };
        let sealed = self.sealer.seal(&encoded);
        if sealed.len() > MAX_UDP_PACKET {
            warn!(len = sealed.len(), "dropping oversized gossip datagram");
            return;
        }
        if let Err(e) = self.socket.send_to(&sealed, addr).await {
            debug!(peer = %addr, "gossip send failed: {e}");
        }
    }

    async fn broadcast(&self, message: &GossipMessage) {
        let targets: Vec<SocketAddr> = self
            .members
            .read()
            .values()
            .filter(|m| m.name != self.config.node_name && m.state == MemberState::Alive)
            .map(|m| m.addr)
            .collect();
        for addr in targets {
            self.send(message, addr).await;
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => return,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        let Some(plain) = self.sealer.open(&buf[..len]) else {
                            debug!(peer = %src, "dropping unopenable datagram");
                            continue;
                        };
                        match bincode::deserialize::<GossipMessage>(&plain) {
                            Ok(message) => self.handle_message(message, src).await,
                            Err(e) => debug!(peer = %src, "dropping malformed datagram: {e}"),
                        }
                    }
                    Err(e) => {
                        warn!("gossip receive error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handle_message(&self, message: GossipMessage, src: SocketAddr) {
        match message {
            GossipMessage::Ping { from } => {
                self.merge_member(from, Some(src));
                // Piggyback a bounded sample so the ack fits one datagram;
                // push/pull sync carries the full table.
                let reply = GossipMessage::Ack {
                    from: self.local_member(),
                    members: self.random_targets(MAX_PIGGYBACK_MEMBERS, true),
                };
                self.send(&reply, src).await;
            }
            GossipMessage::Ack { from, members } => {
                self.merge_member(from, Some(src));
                for member in members {
                    self.merge_member(member, None);
                }
            }
            GossipMessage::Suspect { name, incarnation } => {
                self.handle_suspect(&name, incarnation).await;
            }
            GossipMessage::Alive { member } => {
                self.merge_member(member, Some(src));
            }
            GossipMessage::Leave { name } => {
                let mut members = self.members.write();
                if let Some(member) = members.get_mut(&name) {
                    info!(node = %name, "member left");
                    member.state = MemberState::Dead;
                }
            }
            GossipMessage::User { payload } => {
                self.delegate.notify_message(&payload);
            }
        }
    }

    /// Fold a member record into the table. Higher incarnations win; equal
    /// incarnations let an Alive claim refute a local Suspect.
    fn merge_member(&self, mut incoming: Member, src: Option<SocketAddr>) {
        if incoming.name == self.config.node_name {
            return;
        }
        if incoming.addr.ip().is_unspecified() {
            match src {
                Some(src) => incoming.addr = SocketAddr::new(src.ip(), incoming.addr.port()),
                None => return,
            }
        }

        let direct = src.is_some();
        let mut members = self.members.write();
        match members.get_mut(&incoming.name) {
            Some(existing) => {
                if direct {
                    existing.last_seen = Some(Instant::now());
                }
                if incoming.incarnation > existing.incarnation {
                    existing.addr = incoming.addr;
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.meta = incoming.meta;
                    existing.last_seen = Some(Instant::now());
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == MemberState::Alive
                    && existing.state == MemberState::Suspect
                {
                    debug!(node = %incoming.name, "suspicion refuted");
                    existing.state = MemberState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                if incoming.state == MemberState::Dead {
                    return;
                }
                info!(node = %incoming.name, addr = %incoming.addr, "discovered member");
                incoming.last_seen = Some(Instant::now());
                members.insert(incoming.name.clone(), incoming);
            }
        }
    }

    async fn handle_suspect(&self, name: &str, incarnation: u64) {
        if name == self.config.node_name {
            // Refute: bump our incarnation and reassert liveness.
            let refuted = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(incarnation = refuted, "refuting suspicion about self");
            let message = GossipMessage::Alive {
                member: self.local_member(),
            };
            self.broadcast(&message).await;
            return;
        }

        let mut members = self.members.write();
        if let Some(member) = members.get_mut(name) {
            if incarnation >= member.incarnation && member.state == MemberState::Alive {
                warn!(node = %name, "member suspected");
                member.state = MemberState::Suspect;
            }
        }
    }

    /// Probe one random member per interval and reap members that stayed
    /// silent past their deadlines.
    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = interval.tick() => {}
            }

            if let Some(target) = self.random_targets(1, true).pop() {
                let probe_sent = Instant::now();
                let ping = GossipMessage::Ping {
                    from: self.local_member(),
                };
                self.send(&ping, target.addr).await;

                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(self.config.probe_timeout) => {}
                }

                let acked = self
                    .members
                    .read()
                    .get(&target.name)
                    .and_then(|m| m.last_seen)
                    .map(|seen| seen >= probe_sent)
                    .unwrap_or(false);
                if !acked {
                    self.handle_suspect(&target.name, target.incarnation).await;
                    let message = GossipMessage::Suspect {
                        name: target.name.clone(),
                        incarnation: target.incarnation,
                    };
                    self.broadcast(&message).await;
                }
            }

            self.reap();
        }
    }

    /// Suspect past the suspicion deadline becomes dead; dead members are
    /// eventually pruned.
    fn reap(&self) {
        let suspicion = self.config.probe_interval * self.config.suspicion_mult;
        let prune = suspicion * 2;
        let now = Instant::now();

        let mut members = self.members.write();
        members.retain(|name, member| {
            if *name == self.config.node_name {
                return true;
            }
            let idle = member
                .last_seen
                .map(|seen| now.duration_since(seen))
                .unwrap_or_default();
            match member.state {
                MemberState::Suspect if idle > suspicion => {
                    warn!(node = %name, "member declared dead");
                    member.state = MemberState::Dead;
                    true
                }
                MemberState::Dead if idle > prune => false,
                _ => true,
            }
        });
    }

    /// Drain the delegate's broadcast queue into user datagrams fanned out
    /// to a few random members per tick.
    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = interval.tick() => {}
            }

            let targets = self.random_targets(self.config.gossip_fanout, false);
            if targets.is_empty() {
                continue;
            }

            let payloads = self
                .delegate
                .broadcasts(USER_MSG_OVERHEAD, MAX_UDP_PACKET - 100);
            for payload in payloads {
                let message = GossipMessage::User { payload };
                for target in &targets {
                    self.send(&message, target.addr).await;
                }
            }
        }
    }

    /// Periodic anti-entropy: full push/pull sync with one random member.
    /// Lost or dropped gossip is repaired here; this loop is mandatory.
    async fn push_pull_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.push_pull_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would sync before anyone joined.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = interval.tick() => {}
            }

            if let Some(target) = self.random_targets(1, false).pop() {
                if let Err(e) = self.push_pull(target.addr, false).await {
                    debug!(peer = %target.addr, "push/pull sync failed: {e}");
                }
            }
        }
    }

    /// Client side of a push/pull exchange.
    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<(), DnsError> {
        let mut stream =
            tokio::time::timeout(SYNC_CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    DnsError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "push/pull connect timed out",
                    ))
                })??;

        let frame = SyncFrame {
            from: self.local_member(),
            members: self.members.read().values().cloned().collect(),
            state: self.delegate.local_state(join),
            join,
        };
        self.write_frame(&mut stream, &frame).await?;
        metrics::record_state_sync("out");

        let remote = self.read_frame(&mut stream).await?;
        self.absorb_sync(remote);
        Ok(())
    }

    /// Server side: accept incoming push/pull connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => return,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let membership = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = membership.handle_sync(stream).await {
                                debug!(peer = %peer, "incoming sync failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("sync accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handle_sync(&self, mut stream: TcpStream) -> Result<(), DnsError> {
        let remote = self.read_frame(&mut stream).await?;
        let join = remote.join;

        let reply = SyncFrame {
            from: self.local_member(),
            members: self.members.read().values().cloned().collect(),
            state: self.delegate.local_state(join),
            join,
        };
        self.write_frame(&mut stream, &reply).await?;

        self.absorb_sync(remote);
        metrics::record_state_sync("in");
        Ok(())
    }

    fn absorb_sync(&self, frame: SyncFrame) {
        let join = frame.join;
        self.merge_member(frame.from, None);
        for member in frame.members {
            self.merge_member(member, None);
        }
        self.delegate.merge_remote_state(&frame.state, join);
    }

    async fn write_frame(&self, stream: &mut TcpStream, frame: &SyncFrame) -> Result<(), DnsError> {
        let encoded = bincode::serialize(frame)?;
        let sealed = self.sealer.seal(&encoded);
        stream.write_all(&(sealed.len() as u32).to_be_bytes()).await?;
        stream.write_all(&sealed).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_frame(&self, stream: &mut TcpStream) -> Result<SyncFrame, DnsError> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_SYNC_FRAME {
            return Err(DnsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized sync frame",
            )));
        }

        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let plain = self.sealer.open(&buf).ok_or_else(|| {
            DnsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "sync frame failed to open",
            ))
        })?;
        Ok(bincode::deserialize(&plain)?)
    }
}
