//! # High-Level Node API
//!
//! A [`Node`] combines discovery, the connection manager and the file store into
//! one collaboration peer.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::start(NodeConfig::default()).await?;
//! let mut events = node.events().await?;
//!
//! let shares = node.share_repository("./project".as_ref(), AccessLevel::Team).await?;
//! println!("shared {} files", shares.len());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Message Handling
//!
//! Verified envelopes from every connection arrive on one queue and are handled
//! in order:
//!
//! | Message | Effect |
//! |---------|--------|
//! | `file_announce` | Record the file in the remote index |
//! | `key_exchange` | Unwrap and attach the file key to the remote entry |
//! | `sync_request` | Answer with `sync_data`, content wrapped to the requester |
//! | `sync_data` | Unwrap and import the file into the local store |
//! | `ping` | Liveness only |
//!
//! ## Access Rules
//!
//! | Access | Key sent to | Content served to |
//! |--------|-------------|-------------------|
//! | public | nobody (no key) | every connected peer |
//! | team | every connected peer | every connected peer |
//! | private | peers granted via [`Node::authorize_peer`] | the same peers |

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lru::LruCache;
use quinn::Endpoint;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::MessageChannel;
use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, HandshakeContext, PeerEvent,
};
use crate::crypto::{CryptoPool, HybridCipher, LocalKey, TransportKey};
use crate::discovery::{DiscoveryConfig, DiscoveryService, LocalAdvert};
use crate::identity::{NodeId, PeerIdentity};
use crate::messages::{
    Envelope, FileAnnounce, KeyExchange, NodeType, Payload, SyncData, SyncRequest, MAX_FRAME_SIZE,
};
use crate::store::{sanitize_file_name, AccessLevel, FileShare, FileShareStore, StoreConfig};

pub const DEFAULT_DATA_DIR: &str = ".collabnet";

pub const DEFAULT_DATA_PORT: u16 = 8889;

pub const KEY_FILE_NAME: &str = "node_key.pem";

pub const DEFAULT_CAPABILITIES: [&str; 3] = ["sync", "storage", "relay"];

pub const DEFAULT_BANDWIDTH_LIMIT_KBPS: u32 = 10_000;

pub const DEFAULT_STORAGE_AVAILABLE_MB: u64 = 50_000;

/// How long [`Node::download_file`] waits for a peer to answer a sync request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum remote files remembered; least recently touched entries are evicted.
/// SECURITY: Bounds memory spent on peers' announcements.
pub const MAX_REMOTE_FILES: usize = 4096;

/// Largest file served in a single `sync_data` frame.
pub const MAX_SYNC_FILE_SIZE: usize = MAX_FRAME_SIZE - 64 * 1024;

const INBOUND_QUEUE: usize = 1024;

const EVENT_QUEUE: usize = 256;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Configuration and Public Types
// ============================================================================

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// QUIC endpoint address for peer connections.
    pub data_bind: SocketAddr,
    /// Identity key file. Defaults to `<data_dir>/node_key.pem`.
    pub key_file: Option<PathBuf>,
    pub node_type: NodeType,
    pub capabilities: Vec<String>,
    pub bandwidth_limit_kbps: u32,
    pub storage_available_mb: u64,
    /// Crypto worker threads; `0` sizes the pool from available parallelism.
    pub crypto_workers: usize,
    pub fetch_timeout: Duration,
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            data_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_DATA_PORT),
            key_file: None,
            node_type: NodeType::Full,
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            bandwidth_limit_kbps: DEFAULT_BANDWIDTH_LIMIT_KBPS,
            storage_available_mb: DEFAULT_STORAGE_AVAILABLE_MB,
            crypto_workers: 0,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            discovery: DiscoveryConfig::default(),
            connection: ConnectionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    FileAnnounced { file_id: String, source: NodeId },
    FileReceived { file_id: String, source: NodeId },
}

/// A file some peer announced.
#[derive(Clone, Debug)]
pub struct RemoteFile {
    /// Announced record; never carries a key.
    pub file_info: FileShare,
    pub source: NodeId,
    /// Whether the file key arrived through key exchange.
    pub key_received: bool,
}

#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub node_type: NodeType,
    pub trust_score: f64,
    pub capabilities: BTreeSet<String>,
    /// Time since the last announcement or handshake from this peer.
    pub last_seen: Duration,
    pub connection: Option<ConnectionState>,
}

#[derive(Clone, Debug)]
pub struct NetworkStatus {
    pub node_id: NodeId,
    pub running: bool,
    pub discovered_peer_count: usize,
    pub active_connection_count: usize,
    pub shared_file_count: usize,
    pub peers: Vec<PeerStatus>,
    pub remote_files: Vec<RemoteFile>,
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    inner: Arc<NodeInner>,
    events: TakeOnce<NodeEvent>,
    local_addr: SocketAddr,
}

struct RemoteEntry {
    file_info: FileShare,
    source: NodeId,
    key: Option<LocalKey>,
}

/// An outstanding `sync_request`. Only the peer asked may answer it.
struct PendingFetch {
    source: NodeId,
    requested_at: Instant,
    waiters: Vec<oneshot::Sender<bool>>,
}

struct NodeInner {
    identity: Arc<PeerIdentity>,
    config: NodeConfig,
    store: FileShareStore,
    pool: CryptoPool,
    endpoint: Endpoint,
    discovery: DiscoveryService,
    connections: ConnectionManager,
    remote: Mutex<LruCache<String, RemoteEntry>>,
    authorized: RwLock<HashSet<NodeId>>,
    shared_repos: Mutex<BTreeSet<String>>,
    fetches: Mutex<HashMap<String, PendingFetch>>,
    downloads_dir: PathBuf,
    running: AtomicBool,
    shutdown: CancellationToken,
    event_tx: mpsc::Sender<NodeEvent>,
}

impl Node {
    /// Load (or create) the identity, open the store, bind the QUIC endpoint and
    /// start discovery and connection management.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

        let key_path = config
            .key_file
            .clone()
            .unwrap_or_else(|| config.data_dir.join(KEY_FILE_NAME));
        let identity = tokio::task::spawn_blocking(move || PeerIdentity::load_or_generate(&key_path))
            .await
            .context("identity task failed")??;
        let identity = Arc::new(identity);
        let node_id = identity.node_id();

        let pool = match config.crypto_workers {
            0 => CryptoPool::with_default_size(),
            n => CryptoPool::new(n),
        };

        let store = FileShareStore::open(config.store.files_dir(&config.data_dir), node_id)
            .await
            .context("failed to open file store")?;
        let downloads_dir = config.store.downloads_dir(&config.data_dir);

        let transport_key = TransportKey::generate();
        let endpoint = crate::transport::bind_endpoint(config.data_bind, &transport_key)?;
        let local_addr = endpoint.local_addr()?;

        let shutdown = CancellationToken::new();

        let discovery = DiscoveryService::start(
            config.discovery.clone(),
            LocalAdvert {
                node_id,
                data_port: local_addr.port(),
                capabilities: config.capabilities.clone(),
                node_type: config.node_type,
                shared_repo_ids: Vec::new(),
                bandwidth_limit_kbps: config.bandwidth_limit_kbps,
                storage_available_mb: config.storage_available_mb,
            },
            shutdown.clone(),
        )
        .await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (connections, peer_events) = ConnectionManager::spawn(
            config.connection.clone(),
            endpoint.clone(),
            HandshakeContext {
                identity: identity.clone(),
                pool: pool.clone(),
                transport_key: transport_key.public_key_bytes(),
                capabilities: config.capabilities.clone(),
                node_type: config.node_type,
                listen_port: local_addr.port(),
            },
            discovery.clone(),
            inbound_tx,
            shutdown.clone(),
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let remote_cap = NonZeroUsize::new(MAX_REMOTE_FILES).unwrap_or(NonZeroUsize::MIN);

        let inner = Arc::new(NodeInner {
            identity,
            config,
            store,
            pool,
            endpoint,
            discovery,
            connections,
            remote: Mutex::new(LruCache::new(remote_cap)),
            authorized: RwLock::new(HashSet::new()),
            shared_repos: Mutex::new(BTreeSet::new()),
            fetches: Mutex::new(HashMap::new()),
            downloads_dir,
            running: AtomicBool::new(true),
            shutdown,
            event_tx,
        });

        tokio::spawn(dispatch_loop(inner.clone(), inbound_rx));
        tokio::spawn(peer_event_loop(inner.clone(), peer_events));

        info!(node_id = %node_id, addr = %local_addr, "node started");
        Ok(Self {
            inner,
            events: Mutex::new(Some(event_rx)),
            local_addr,
        })
    }

    /// Stop every background task and close all connections and sockets.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.connections.quit().await;
        self.inner.discovery.quit().await;
        self.inner.shutdown.cancel();
        self.inner.endpoint.close(0u32.into(), b"node stopped");
        self.inner.pool.close();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.inner.endpoint.wait_idle()).await;
        info!(node_id = %self.node_id(), "node stopped");
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.identity.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.inner.discovery.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Take the event receiver. Only the first call succeeds.
    pub async fn events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        self.events
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("events receiver already taken"))
    }

    /// Share one file and announce it to every connected peer.
    pub async fn share_file(&self, path: &Path, access_level: AccessLevel) -> Result<FileShare> {
        let share = self.inner.store.share(path, access_level).await?;
        self.inner.announce_everywhere(std::slice::from_ref(&share)).await;
        Ok(share)
    }

    /// Share every file under `path`, skipping `.git` directories, and announce
    /// the successful shares. Files that fail to share are logged and skipped.
    pub async fn share_repository(
        &self,
        path: &Path,
        access_level: AccessLevel,
    ) -> Result<Vec<FileShare>> {
        let files = collect_repository_files(path).await?;
        let mut shares = Vec::with_capacity(files.len());
        for file in files {
            match self.inner.store.share(&file, access_level).await {
                Ok(share) => shares.push(share),
                Err(e) => warn!(file = %file.display(), error = %e, "failed to share file"),
            }
        }

        let repo_id = path
            .file_name()
            .map(|n| sanitize_file_name(&n.to_string_lossy()))
            .unwrap_or_else(|| sanitize_file_name(&path.to_string_lossy()));
        let repos: Vec<String> = {
            let mut repos = self.inner.shared_repos.lock().await;
            repos.insert(repo_id.clone());
            repos.iter().cloned().collect()
        };
        self.inner.discovery.set_shared_repos(repos).await;

        self.inner.announce_everywhere(&shares).await;
        info!(repo = %repo_id, files = shares.len(), access = ?access_level, "repository shared");
        Ok(shares)
    }

    pub async fn get_network_status(&self) -> NetworkStatus {
        let inner = &self.inner;
        let discovered = inner.discovery.get_peers().await;
        let connections = inner.connections.connections().await;

        // A peer can have a dial in flight next to its established connection.
        let mut states: HashMap<NodeId, ConnectionState> = HashMap::new();
        for c in &connections {
            states
                .entry(c.peer.node_id)
                .and_modify(|state| {
                    if c.state == ConnectionState::Established {
                        *state = c.state;
                    }
                })
                .or_insert(c.state);
        }
        let active_connection_count = connections
            .iter()
            .filter(|c| c.state == ConnectionState::Established)
            .count();

        let discovered_peer_count = discovered.len();
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        for record in discovered
            .into_iter()
            .chain(connections.into_iter().map(|c| c.peer))
        {
            if !seen.insert(record.node_id) {
                continue;
            }
            peers.push(PeerStatus {
                node_id: record.node_id,
                address: record.data_addr(),
                node_type: record.node_type,
                trust_score: record.trust_score,
                capabilities: record.capabilities,
                last_seen: record.last_seen.elapsed(),
                connection: states.get(&record.node_id).copied(),
            });
        }

        let remote_files = inner
            .remote
            .lock()
            .await
            .iter()
            .map(|(_, entry)| RemoteFile {
                file_info: entry.file_info.clone(),
                source: entry.source,
                key_received: entry.key.is_some(),
            })
            .collect();

        NetworkStatus {
            node_id: self.node_id(),
            running: self.is_running(),
            discovered_peer_count,
            active_connection_count,
            shared_file_count: inner.store.len().await,
            peers,
            remote_files,
        }
    }

    /// Write a file's plaintext to `destination` (default: the downloads
    /// directory). A file not held locally is requested from the peer that
    /// announced it. Returns `Ok(None)` when the file is neither local nor
    /// fetchable in time.
    pub async fn download_file(
        &self,
        file_share: &FileShare,
        destination: Option<&Path>,
    ) -> Result<Option<PathBuf>> {
        let inner = &self.inner;
        let destination = destination.map(Path::to_path_buf).unwrap_or_else(|| {
            inner
                .downloads_dir
                .join(sanitize_file_name(&file_share.file_name))
        });

        if let Some(path) = inner.store.download(file_share, &destination).await? {
            return Ok(Some(path));
        }

        let (tx, rx) = oneshot::channel();
        let requested = match inner.request(&file_share.file_id, Some(tx)).await {
            Ok(sent) => sent,
            Err(e) => {
                debug!(file_id = %file_share.file_id, error = %e, "file not fetchable");
                false
            }
        };
        let fetched = if requested {
            matches!(
                tokio::time::timeout(inner.config.fetch_timeout, rx).await,
                Ok(Ok(true))
            )
        } else {
            drop(rx);
            false
        };
        inner.prune_fetches(&file_share.file_id).await;

        if !fetched {
            return Ok(None);
        }
        Ok(inner.store.download(file_share, &destination).await?)
    }

    /// Ask the peer that announced `file_id` to send it. Returns `false` when no
    /// peer has announced the file.
    pub async fn request_file(&self, file_id: &str) -> Result<bool> {
        self.inner.request(file_id, None).await
    }

    /// Set a peer's trust score, clamped to `[0, 1]`. Returns `false` for
    /// peers discovery does not know.
    pub async fn set_trust_score(&self, node_id: NodeId, score: f64) -> bool {
        self.inner.discovery.set_trust_score(node_id, score).await
    }

    /// Grant `node_id` access to this node's private files. Keys go out
    /// immediately when the peer is connected.
    pub async fn authorize_peer(&self, node_id: NodeId) {
        let newly = self.inner.authorized.write().await.insert(node_id);
        if !newly {
            return;
        }
        info!(peer = %node_id, "peer authorized for private files");

        let Some(channel) = self.inner.connections.channel(node_id).await else {
            return;
        };
        for share in self.inner.catalog().await {
            if share.access_level == AccessLevel::Private
                && let Err(e) = self.inner.send_key(&channel, &share).await
            {
                debug!(peer = %node_id, file_id = %share.file_id, error = %e, "key exchange failed");
            }
        }
    }

    pub async fn is_authorized(&self, node_id: &NodeId) -> bool {
        self.inner.authorized.read().await.contains(node_id)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

// ============================================================================
// Message Handling
// ============================================================================

/// Whether `peer` may hold the key of a share with `access`.
fn may_receive_key(access: AccessLevel, authorized: bool) -> bool {
    match access {
        AccessLevel::Public => false,
        AccessLevel::Team => true,
        AccessLevel::Private => authorized,
    }
}

/// Whether `peer` may fetch the content of a share with `access`.
fn may_fetch(access: AccessLevel, authorized: bool) -> bool {
    match access {
        AccessLevel::Public | AccessLevel::Team => true,
        AccessLevel::Private => authorized,
    }
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        if self.event_tx.try_send(event).is_err() {
            trace!("node event queue full or unobserved, dropping event");
        }
    }

    /// Files this node owns.
    async fn catalog(&self) -> Vec<FileShare> {
        let local = self.identity.node_id();
        self.store
            .list()
            .await
            .into_iter()
            .filter(|share| share.owner_node_id == local)
            .collect()
    }

    async fn announce_everywhere(&self, shares: &[FileShare]) {
        if shares.is_empty() {
            return;
        }
        for channel in self.connections.established().await {
            self.announce_to(&channel, shares).await;
        }
    }

    async fn announce_to(&self, channel: &MessageChannel, shares: &[FileShare]) {
        let peer = channel.peer_id();
        let authorized = self.authorized.read().await.contains(&peer);
        for share in shares {
            let announce = Payload::FileAnnounce(FileAnnounce {
                file_info: share.without_key(),
            });
            if let Err(e) = channel.send_payload(&announce).await {
                debug!(peer = %peer, error = %e, "file announce failed");
                return;
            }
            if may_receive_key(share.access_level, authorized)
                && let Err(e) = self.send_key(channel, share).await
            {
                debug!(peer = %peer, file_id = %share.file_id, error = %e, "key exchange failed");
            }
        }
        debug!(peer = %peer, files = shares.len(), "files announced");
    }

    async fn send_key(&self, channel: &MessageChannel, share: &FileShare) -> Result<()> {
        let Some(key) = share.encryption_key.clone() else {
            return Ok(());
        };
        let recipient = channel.peer_key().clone();
        let wrapped_key = self
            .pool
            .run(move || HybridCipher::encrypt(&key, &recipient))
            .await??;
        channel
            .send_payload(&Payload::KeyExchange(KeyExchange {
                file_id: share.file_id.clone(),
                wrapped_key,
            }))
            .await?;
        Ok(())
    }

    async fn handle_envelope(&self, peer: NodeId, envelope: Envelope) -> Result<()> {
        match envelope.payload()? {
            Payload::Handshake(_) => {
                debug!(peer = %peer, "ignoring handshake on established connection");
            }
            Payload::FileAnnounce(FileAnnounce { file_info }) => {
                self.record_announcement(peer, file_info).await;
            }
            Payload::KeyExchange(exchange) => self.accept_key(peer, exchange).await?,
            Payload::SyncRequest(SyncRequest { file_id }) => self.serve_sync(peer, file_id).await?,
            Payload::SyncData(data) => {
                let file_id = data.file_id.clone();
                let Some(waiters) = self.take_fetch(peer, &file_id).await else {
                    warn!(peer = %peer, file_id = %file_id, "unsolicited sync data");
                    return Ok(());
                };
                let received = self.receive_sync(peer, data).await;
                let ok = matches!(received, Ok(true));
                for waiter in waiters {
                    let _ = waiter.send(ok);
                }
                if ok {
                    self.emit(NodeEvent::FileReceived {
                        file_id,
                        source: peer,
                    });
                }
                received?;
            }
            Payload::Ping => trace!(peer = %peer, "ping"),
            Payload::Unknown(kind) => debug!(peer = %peer, kind = %kind, "ignoring unknown message type"),
        }
        Ok(())
    }

    async fn record_announcement(&self, peer: NodeId, file_info: FileShare) {
        if file_info.owner_node_id == self.identity.node_id() {
            return;
        }
        let file_id = file_info.file_id.clone();
        {
            let mut remote = self.remote.lock().await;
            let key = remote
                .pop(&file_id)
                .filter(|existing| existing.source == peer)
                .and_then(|existing| existing.key);
            remote.put(
                file_id.clone(),
                RemoteEntry {
                    file_info: file_info.without_key(),
                    source: peer,
                    key,
                },
            );
        }
        info!(peer = %peer, file_id = %file_id, name = %file_info.file_name, "peer shared file");
        self.emit(NodeEvent::FileAnnounced {
            file_id,
            source: peer,
        });
    }

    async fn accept_key(&self, peer: NodeId, exchange: KeyExchange) -> Result<()> {
        let known = self
            .remote
            .lock()
            .await
            .peek(&exchange.file_id)
            .is_some_and(|entry| entry.source == peer);
        if !known {
            warn!(peer = %peer, file_id = %exchange.file_id, "key for unannounced file");
            return Ok(());
        }

        let identity = self.identity.clone();
        let wrapped = exchange.wrapped_key;
        let key = self
            .pool
            .run(move || {
                HybridCipher::decrypt(&wrapped, &identity)
                    .and_then(|bytes| LocalKey::from_slice(&bytes))
            })
            .await??;

        if let Some(entry) = self.remote.lock().await.get_mut(&exchange.file_id)
            && entry.source == peer
        {
            entry.key = Some(key);
            debug!(peer = %peer, file_id = %exchange.file_id, "file key received");
        }
        Ok(())
    }

    async fn serve_sync(&self, peer: NodeId, file_id: String) -> Result<()> {
        let channel = self
            .connections
            .channel(peer)
            .await
            .ok_or_else(|| anyhow!("requesting peer {peer} is no longer connected"))?;
        let authorized = self.authorized.read().await.contains(&peer);

        let held = self.store.read_plaintext(&file_id).await?;
        let response = match held {
            Some((share, plaintext))
                if may_fetch(share.access_level, authorized)
                    && (share.access_level.is_public()
                        || share.owner_node_id == self.identity.node_id()) =>
            {
                if plaintext.len() > MAX_SYNC_FILE_SIZE {
                    warn!(peer = %peer, file_id = %file_id, size = plaintext.len(), "file too large to sync");
                    SyncData {
                        file_id,
                        file_info: Some(share.without_key()),
                        data: None,
                    }
                } else {
                    let recipient = channel.peer_key().clone();
                    let data = self
                        .pool
                        .run(move || HybridCipher::encrypt(&plaintext, &recipient))
                        .await??;
                    debug!(peer = %peer, file_id = %file_id, "serving file");
                    SyncData {
                        file_id,
                        file_info: Some(share.without_key()),
                        data: Some(data),
                    }
                }
            }
            Some((share, _)) => {
                info!(peer = %peer, file_id = %file_id, "sync request refused");
                SyncData {
                    file_id,
                    file_info: Some(share.without_key()),
                    data: None,
                }
            }
            None => {
                debug!(peer = %peer, file_id = %file_id, "sync request for unknown file");
                SyncData {
                    file_id,
                    file_info: None,
                    data: None,
                }
            }
        };
        channel.send_payload(&Payload::SyncData(response)).await?;
        Ok(())
    }

    /// Import a `sync_data` answer. `Ok(false)` means the peer declined.
    async fn receive_sync(&self, peer: NodeId, sync: SyncData) -> Result<bool> {
        let entry = {
            let mut remote = self.remote.lock().await;
            remote
                .get(&sync.file_id)
                .filter(|entry| entry.source == peer)
                .map(|entry| {
                    let key = entry.key.as_ref().map(|k| k.as_bytes().to_vec());
                    FileShare {
                        encryption_key: key,
                        ..entry.file_info.clone()
                    }
                })
        };
        let Some(record) = entry else {
            warn!(peer = %peer, file_id = %sync.file_id, "unsolicited sync data");
            return Ok(false);
        };
        let Some(ciphertext) = sync.data else {
            info!(peer = %peer, file_id = %sync.file_id, "peer declined sync request");
            return Ok(false);
        };
        if let Some(info) = &sync.file_info
            && info.content_hash != record.content_hash
        {
            warn!(peer = %peer, file_id = %sync.file_id, "sync data disagrees with announcement");
            return Ok(false);
        }

        let identity = self.identity.clone();
        let plaintext = self
            .pool
            .run(move || HybridCipher::decrypt(&ciphertext, &identity))
            .await??;
        self.store.import_plaintext(record, &plaintext).await?;
        info!(peer = %peer, file_id = %sync.file_id, "file received");
        Ok(true)
    }

    /// Send a `sync_request` for `file_id` to the peer that announced it and
    /// record it as pending, with `waiter` notified of the outcome.
    async fn request(
        &self,
        file_id: &str,
        waiter: Option<oneshot::Sender<bool>>,
    ) -> Result<bool> {
        let source = self
            .remote
            .lock()
            .await
            .get(file_id)
            .map(|entry| entry.source);
        let Some(source) = source else {
            return Ok(false);
        };

        {
            let timeout = self.config.fetch_timeout;
            let mut fetches = self.fetches.lock().await;
            fetches.retain(|_, pending| {
                pending.requested_at.elapsed() < timeout
                    || pending.waiters.iter().any(|w| !w.is_closed())
            });
            let pending = fetches
                .entry(file_id.to_string())
                .or_insert_with(|| PendingFetch {
                    source,
                    requested_at: Instant::now(),
                    waiters: Vec::new(),
                });
            pending.source = source;
            pending.requested_at = Instant::now();
            pending.waiters.extend(waiter);
        }

        self.connections
            .send_to(
                source,
                &Payload::SyncRequest(SyncRequest {
                    file_id: file_id.to_string(),
                }),
            )
            .await
            .with_context(|| format!("failed to request {file_id} from {source}"))?;
        debug!(file_id, peer = %source, "sync requested");
        Ok(true)
    }

    /// Claim the pending request for `file_id` if `peer` is the one asked and
    /// the request has not expired.
    async fn take_fetch(&self, peer: NodeId, file_id: &str) -> Option<Vec<oneshot::Sender<bool>>> {
        let mut fetches = self.fetches.lock().await;
        let pending = fetches.get(file_id)?;
        let live = pending.requested_at.elapsed() < self.config.fetch_timeout
            || pending.waiters.iter().any(|w| !w.is_closed());
        if pending.source != peer || !live {
            return None;
        }
        fetches.remove(file_id).map(|pending| pending.waiters)
    }

    async fn prune_fetches(&self, file_id: &str) {
        let mut fetches = self.fetches.lock().await;
        if let Some(pending) = fetches.get_mut(file_id) {
            pending.waiters.retain(|w| !w.is_closed());
            if pending.waiters.is_empty() {
                fetches.remove(file_id);
            }
        }
    }
}

async fn dispatch_loop(inner: Arc<NodeInner>, mut inbound_rx: mpsc::Receiver<(NodeId, Envelope)>) {
    loop {
        let (peer, envelope) = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            msg = inbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let kind = envelope.kind.clone();
        if let Err(e) = inner.handle_envelope(peer, envelope).await {
            debug!(peer = %peer, kind = %kind, error = %e, "failed to handle message");
        }
    }
    trace!("dispatch loop finished");
}

async fn peer_event_loop(inner: Arc<NodeInner>, mut events: mpsc::Receiver<PeerEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            PeerEvent::Connected { peer, .. } => {
                inner.emit(NodeEvent::PeerConnected(peer));
                let catalog = inner.catalog().await;
                if !catalog.is_empty()
                    && let Some(channel) = inner.connections.channel(peer).await
                {
                    inner.announce_to(&channel, &catalog).await;
                }
            }
            PeerEvent::Disconnected { peer } => inner.emit(NodeEvent::PeerDisconnected(peer)),
        }
    }
    trace!("peer event loop finished");
}

/// Every regular file under `root`, skipping `.git` directories.
async fn collect_repository_files(root: &Path) -> Result<Vec<PathBuf>> {
    let metadata = tokio::fs::metadata(root)
        .await
        .with_context(|| format!("cannot read repository {}", root.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow!("{} is not a directory", root.display()));
    }

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == ".git" {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
