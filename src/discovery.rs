//! # Peer Discovery
//!
//! Local-network discovery over UDP. Every `announce_interval` the node sends a
//! JSON [`PeerAnnouncement`] to each configured target (by default the limited
//! broadcast address on the discovery port) and listens on the same socket for
//! announcements from others.
//!
//! ## Directory
//!
//! [`PeerDirectory`] holds one [`PeerRecord`] per remote node. A record is created
//! on the first sighting and its `last_seen` refreshed on every later one. Records
//! older than `stale_after` are evicted lazily whenever the directory is read.
//!
//! ## Actor
//!
//! The directory is owned by a single actor task; [`DiscoveryService`] is the
//! cheap-to-clone handle. Readers receive snapshots. Socket errors are logged and
//! the loop backs off before retrying; they never stop the service.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identity::{NodeId, PublicKey};
use crate::messages::{NodeType, PeerAnnouncement, ANNOUNCE_TYPE};

/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Records not refreshed within this window are evicted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Pause after a socket error before the loop continues.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Trust assigned to a newly discovered peer.
pub const INITIAL_TRUST_SCORE: f64 = 0.5;

/// Bound on directory size.
/// SECURITY: A flood of forged node ids cannot grow the directory without limit.
pub const MAX_DISCOVERED_PEERS: usize = 1024;

const RECV_BUFFER_SIZE: usize = 65_535;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Address the discovery socket binds to.
    pub bind_addr: IpAddr,
    /// Port the discovery socket binds to. `0` picks an ephemeral port.
    pub port: u16,
    pub announce_interval: Duration,
    pub stale_after: Duration,
    pub error_backoff: Duration,
    /// Where announcements are sent. Empty means `255.255.255.255:<port>`.
    pub targets: Vec<SocketAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_DISCOVERY_PORT,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            targets: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    fn announce_targets(&self, bound_port: u16) -> Vec<SocketAddr> {
        if self.targets.is_empty() {
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), bound_port)]
        } else {
            self.targets.clone()
        }
    }
}

/// What this node says about itself in every announcement.
#[derive(Clone, Debug)]
pub struct LocalAdvert {
    pub node_id: NodeId,
    pub data_port: u16,
    pub capabilities: Vec<String>,
    pub node_type: NodeType,
    pub shared_repo_ids: Vec<String>,
    pub bandwidth_limit_kbps: u32,
    pub storage_available_mb: u64,
}

impl LocalAdvert {
    fn to_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            kind: ANNOUNCE_TYPE.to_string(),
            node_id: self.node_id.to_hex(),
            port: self.data_port,
            capabilities: self.capabilities.clone(),
            node_type: self.node_type,
            shared_repo_ids: self.shared_repo_ids.clone(),
            bandwidth_limit_kbps: self.bandwidth_limit_kbps,
            storage_available_mb: self.storage_available_mb,
        }
    }
}

// ============================================================================
// Peer Records
// ============================================================================

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub address: IpAddr,
    /// Data (QUIC) port.
    pub port: u16,
    /// Learned from the signed handshake, never from discovery.
    pub public_key: Option<PublicKey>,
    pub capabilities: BTreeSet<String>,
    pub node_type: NodeType,
    pub last_seen: Instant,
    /// In `[0, 1]`. Set by an external reputation collaborator.
    pub trust_score: f64,
    pub shared_repo_ids: BTreeSet<String>,
    pub bandwidth_limit_kbps: u32,
    pub storage_available_mb: u64,
}

impl PeerRecord {
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// A record for a peer first seen through an inbound handshake.
    pub(crate) fn from_handshake(
        node_id: NodeId,
        address: IpAddr,
        port: u16,
        public_key: PublicKey,
        capabilities: &[String],
        node_type: NodeType,
    ) -> Self {
        Self {
            node_id,
            address,
            port,
            public_key: Some(public_key),
            capabilities: capabilities.iter().cloned().collect(),
            node_type,
            last_seen: Instant::now(),
            trust_score: INITIAL_TRUST_SCORE,
            shared_repo_ids: BTreeSet::new(),
            bandwidth_limit_kbps: 0,
            storage_available_mb: 0,
        }
    }

    fn from_announcement(
        node_id: NodeId,
        announcement: &PeerAnnouncement,
        source: IpAddr,
        now: Instant,
    ) -> Self {
        Self {
            node_id,
            address: source,
            port: announcement.port,
            public_key: None,
            capabilities: announcement.capabilities.iter().cloned().collect(),
            node_type: announcement.node_type,
            last_seen: now,
            trust_score: INITIAL_TRUST_SCORE,
            shared_repo_ids: announcement.shared_repo_ids.iter().cloned().collect(),
            bandwidth_limit_kbps: announcement.bandwidth_limit_kbps,
            storage_available_mb: announcement.storage_available_mb,
        }
    }

    fn refresh(&mut self, announcement: &PeerAnnouncement, source: IpAddr, now: Instant) {
        self.address = source;
        self.port = announcement.port;
        self.capabilities = announcement.capabilities.iter().cloned().collect();
        self.node_type = announcement.node_type;
        self.shared_repo_ids = announcement.shared_repo_ids.iter().cloned().collect();
        self.bandwidth_limit_kbps = announcement.bandwidth_limit_kbps;
        self.storage_available_mb = announcement.storage_available_mb;
        self.last_seen = now;
    }
}

/// Live peer directory with lazy staleness eviction.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: HashMap<NodeId, PeerRecord>,
    stale_after: Duration,
    max_peers: usize,
}

impl PeerDirectory {
    pub fn new(stale_after: Duration, max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            stale_after,
            max_peers: max_peers.max(1),
        }
    }

    fn is_stale(&self, record: &PeerRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.last_seen) > self.stale_after
    }

    fn evict_stale(&mut self, now: Instant) {
        let stale_after = self.stale_after;
        self.peers.retain(|node_id, record| {
            let keep = now.saturating_duration_since(record.last_seen) <= stale_after;
            if !keep {
                debug!(peer = %node_id, "evicting stale peer");
            }
            keep
        });
    }

    /// Upsert from an announcement. Returns `true` for a peer that is new or was
    /// past the staleness window.
    pub fn observe(
        &mut self,
        node_id: NodeId,
        announcement: &PeerAnnouncement,
        source: IpAddr,
        now: Instant,
    ) -> bool {
        if let Some(record) = self.peers.get_mut(&node_id) {
            let was_stale = now.saturating_duration_since(record.last_seen) > self.stale_after;
            record.refresh(announcement, source, now);
            return was_stale;
        }

        if self.peers.len() >= self.max_peers {
            self.evict_stale(now);
        }
        if self.peers.len() >= self.max_peers
            && let Some(oldest) = self
                .peers
                .values()
                .min_by_key(|r| r.last_seen)
                .map(|r| r.node_id)
        {
            self.peers.remove(&oldest);
        }

        self.peers.insert(
            node_id,
            PeerRecord::from_announcement(node_id, announcement, source, now),
        );
        true
    }

    /// Snapshot of every record within the staleness window; stale ones are dropped.
    pub fn live(&mut self, now: Instant) -> Vec<PeerRecord> {
        self.evict_stale(now);
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by_key(|r| r.node_id);
        peers
    }

    /// Returns `false` if the peer is unknown or stale.
    pub fn set_trust_score(&mut self, node_id: &NodeId, score: f64, now: Instant) -> bool {
        let stale = match self.peers.get(node_id) {
            Some(record) => self.is_stale(record, now),
            None => return false,
        };
        if stale {
            return false;
        }
        if let Some(record) = self.peers.get_mut(node_id) {
            record.trust_score = if score.is_finite() { score.clamp(0.0, 1.0) } else { record.trust_score };
        }
        true
    }

    pub fn set_public_key(&mut self, node_id: &NodeId, key: PublicKey) {
        if let Some(record) = self.peers.get_mut(node_id) {
            record.public_key = Some(key);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    GetPeers(oneshot::Sender<Vec<PeerRecord>>),
    SetTrustScore(NodeId, f64, oneshot::Sender<bool>),
    RecordPublicKey(NodeId, PublicKey),
    SetSharedRepos(Vec<String>),
    Quit,
}

// ============================================================================
// DiscoveryService Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct DiscoveryService {
    cmd_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl DiscoveryService {
    /// Bind the discovery socket and spawn the actor. The first announcement goes
    /// out immediately.
    pub async fn start(
        config: DiscoveryConfig,
        advert: LocalAdvert,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let socket = bind_socket(SocketAddr::new(config.bind_addr, config.port))
            .with_context(|| format!("failed to bind discovery socket on port {}", config.port))?;
        let local_addr = socket.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let targets = config.announce_targets(local_addr.port());
        let actor = DiscoveryActor {
            socket,
            directory: PeerDirectory::new(config.stale_after, MAX_DISCOVERED_PEERS),
            config,
            targets,
            advert,
            shutdown,
        };
        tokio::spawn(actor.run(cmd_rx));

        info!(addr = %local_addr, "discovery started");
        Ok(Self { cmd_tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live peers, excluding anything past the staleness window.
    pub async fn get_peers(&self) -> Vec<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Hook for the external reputation collaborator; the score is clamped to `[0, 1]`.
    pub async fn set_trust_score(&self, node_id: NodeId, score: f64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SetTrustScore(node_id, score, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn record_public_key(&self, node_id: NodeId, key: PublicKey) {
        let _ = self.cmd_tx.send(Command::RecordPublicKey(node_id, key)).await;
    }

    pub async fn set_shared_repos(&self, repo_ids: Vec<String>) {
        let _ = self.cmd_tx.send(Command::SetSharedRepos(repo_ids)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

/// Broadcast-capable UDP socket with address reuse, so several nodes on one
/// host can share the discovery port.
fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast on discovery socket")?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

// ============================================================================
// DiscoveryActor (owns socket and directory)
// ============================================================================

struct DiscoveryActor {
    socket: UdpSocket,
    config: DiscoveryConfig,
    targets: Vec<SocketAddr>,
    advert: LocalAdvert,
    directory: PeerDirectory,
    shutdown: CancellationToken,
}

impl DiscoveryActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut announce_interval = tokio::time::interval(self.config.announce_interval);
        announce_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("discovery shutting down");
                    break;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::GetPeers(reply)) => {
                            let _ = reply.send(self.directory.live(Instant::now()));
                        }
                        Some(Command::SetTrustScore(node_id, score, reply)) => {
                            let _ = reply.send(
                                self.directory.set_trust_score(&node_id, score, Instant::now()),
                            );
                        }
                        Some(Command::RecordPublicKey(node_id, key)) => {
                            self.directory.set_public_key(&node_id, key);
                        }
                        Some(Command::SetSharedRepos(repo_ids)) => {
                            self.advert.shared_repo_ids = repo_ids;
                            let _ = self.announce().await;
                        }
                        Some(Command::Quit) => {
                            debug!("discovery actor quitting");
                            break;
                        }
                        None => {
                            debug!("discovery handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = announce_interval.tick() => {
                    let _ = self.announce().await;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => self.handle_datagram(&buf[..len], source),
                        Err(e) => {
                            warn!(error = %e, "discovery receive failed, backing off");
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.error_backoff) => {}
                                _ = self.shutdown.cancelled() => break,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Send the announcement to every target. Returns how many sends succeeded.
    async fn announce(&self) -> usize {
        let bytes = match self.advert.to_announcement().encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode announcement");
                return 0;
            }
        };
        let mut sent = 0;
        for target in &self.targets {
            match self.socket.send_to(&bytes, target).await {
                Ok(_) => {
                    sent += 1;
                    trace!(target = %target, "announcement sent");
                }
                Err(e) => warn!(target = %target, error = %e, "announcement send failed"),
            }
        }
        if sent == 0 && !self.targets.is_empty() {
            warn!("no announcement target reachable, backing off");
            tokio::select! {
                _ = tokio::time::sleep(self.config.error_backoff) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
        sent
    }

    fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr) {
        let (announcement, node_id) = match PeerAnnouncement::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(source = %source, error = %e, "ignoring discovery datagram");
                return;
            }
        };
        if node_id == self.advert.node_id {
            return;
        }

        if self
            .directory
            .observe(node_id, &announcement, source.ip(), Instant::now())
        {
            info!(
                peer = %node_id,
                addr = %SocketAddr::new(source.ip(), announcement.port),
                node_type = %announcement.node_type,
                known = self.directory.len(),
                "discovered peer"
            );
        }
    }
}
