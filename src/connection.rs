//! # Connection Manager
//!
//! Maintains a bounded set of authenticated [`MessageChannel`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──transport open──► Handshaking ──signed reply verified──► Established
//!      │                              │                                     │
//!      └───────── error / timeout ────┴──── close / liveness / violations ──┴──► Closed
//! ```
//!
//! Every tick the manager reaps dead connections, pings the live ones and dials
//! discovered peers it is not yet connected to, while slots remain. Failed dials
//! back off exponentially per peer and are never fatal.
//!
//! ## Handshake
//!
//! The dialer opens the connection's single bidirectional stream and sends a
//! signed `handshake` envelope; the acceptor verifies it and answers with its own.
//! Each side checks that:
//!
//! - the envelope signature verifies under the public key the handshake carries
//! - the handshake's transport key equals the certificate key on the connection
//! - the envelope is addressed to it (and, for the dialer, comes from the node
//!   discovery announced at that address)
//!
//! The verified key is then anchored for the channel's lifetime.
//!
//! ## Slots
//!
//! Established connections, dials in flight and inbound handshakes in flight all
//! occupy a slot, so `max_connections` is never exceeded even while handshakes
//! race. Inbound connections arriving with no free slot are refused.
//!
//! When two nodes dial each other simultaneously, both keep the connection
//! dialed by the smaller node id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn::Endpoint;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelError, ChannelParts, MessageChannel, DEFAULT_INBOUND_QUEUE};
use crate::crypto::{peer_transport_key, CryptoPool};
use crate::discovery::{DiscoveryService, PeerRecord};
use crate::identity::{NodeId, PeerIdentity};
use crate::messages::{
    Envelope, Handshake, NodeType, Payload, ProtocolError, KIND_HANDSHAKE, PROTOCOL_VERSION,
};
use crate::transport::{self, read_frame, write_frame, TransportError};

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// A connection with no inbound frame for this long is closed.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the handshake exchange after the transport is up.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);

pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(300);

/// Largest handshake frame accepted.
/// SECURITY: Bounds what an unauthenticated peer can make us buffer.
pub const MAX_HANDSHAKE_FRAME: usize = 16 * 1024;

/// Capacity of the lifecycle event queue.
const EVENT_QUEUE: usize = 256;

// ============================================================================
// Configuration and Public Types
// ============================================================================

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub max_connections: usize,
    pub tick_interval: Duration,
    pub liveness_timeout: Duration,
    pub handshake_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Receive queue capacity of each channel.
    pub inbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
            inbound_queue: DEFAULT_INBOUND_QUEUE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Snapshot of one connection.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub peer: PeerRecord,
    pub state: ConnectionState,
    pub direction: Direction,
    /// Time since the last inbound frame; zero before establishment.
    pub idle: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected { peer: NodeId, direction: Direction },
    Disconnected { peer: NodeId },
}

/// What this node says about itself in handshakes.
#[derive(Clone)]
pub(crate) struct HandshakeContext {
    pub identity: Arc<PeerIdentity>,
    pub pool: CryptoPool,
    pub transport_key: [u8; 32],
    pub capabilities: Vec<String>,
    pub node_type: NodeType,
    pub listen_port: u16,
}

impl HandshakeContext {
    async fn signed_handshake(&self, receiver: NodeId) -> Result<Vec<u8>, ChannelError> {
        let payload = Payload::Handshake(Handshake {
            public_key: self.identity.export_public(),
            capabilities: self.capabilities.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            transport_key: self.transport_key,
            node_type: self.node_type,
            listen_port: self.listen_port,
        });
        let mut envelope = Envelope::new(self.identity.node_id(), receiver, &payload)?;
        let identity = self.identity.clone();
        self.pool
            .run(move || -> Result<Vec<u8>, ChannelError> {
                envelope.sign(&identity)?;
                Ok(envelope.to_frame()?)
            })
            .await?
    }

    /// Verify a handshake frame received on `connection`. Returns the sender and
    /// its handshake.
    async fn verify_handshake(
        &self,
        frame: Vec<u8>,
        connection: &quinn::Connection,
        expected_sender: Option<NodeId>,
    ) -> Result<(NodeId, Handshake), ChannelError> {
        let envelope = Envelope::from_frame(&frame)?;
        if envelope.kind != KIND_HANDSHAKE {
            return Err(ProtocolError::HandshakeRequired.into());
        }
        if envelope.receiver_id != self.identity.node_id() {
            return Err(ProtocolError::WrongReceiver.into());
        }
        if expected_sender.is_some_and(|expected| envelope.sender_id != expected) {
            return Err(ProtocolError::UnexpectedSender.into());
        }
        let Payload::Handshake(handshake) = envelope.payload()? else {
            return Err(ProtocolError::HandshakeRequired.into());
        };

        if peer_transport_key(connection) != Some(handshake.transport_key) {
            return Err(ProtocolError::TransportMismatch.into());
        }

        let sender_id = envelope.sender_id;
        let key = handshake.public_key.clone();
        let verified = self.pool.run(move || envelope.verify(&key)).await?;
        if !verified {
            return Err(ProtocolError::BadSignature.into());
        }
        if handshake.protocol_version != PROTOCOL_VERSION {
            debug!(version = %handshake.protocol_version, "peer speaks a different protocol version");
        }
        Ok((sender_id, handshake))
    }
}

// ============================================================================
// Handshakes
// ============================================================================

struct Established {
    peer: PeerRecord,
    channel: Arc<MessageChannel>,
    direction: Direction,
    /// Node that dialed this connection; both ends agree on it.
    dialer: NodeId,
}

struct HandshakeEnv {
    ctx: HandshakeContext,
    inbound_queue: usize,
    shutdown: CancellationToken,
}

async fn dial(
    endpoint: &Endpoint,
    peer: PeerRecord,
    env: &HandshakeEnv,
    cmd_tx: &mpsc::Sender<Command>,
) -> Result<Established, ChannelError> {
    let connection = transport::connect(endpoint, peer.data_addr()).await?;
    let _ = cmd_tx.send(Command::HandshakeStarted(peer.node_id)).await;

    let (mut send, mut recv) = connection.open_bi().await.map_err(TransportError::from)?;
    let hello = env.ctx.signed_handshake(peer.node_id).await?;
    write_frame(&mut send, &hello).await?;

    let reply = read_frame(&mut recv, MAX_HANDSHAKE_FRAME)
        .await?
        .ok_or(TransportError::Closed)?;
    let (peer_id, handshake) = env
        .ctx
        .verify_handshake(reply, &connection, Some(peer.node_id))
        .await?;

    let mut record = peer;
    record.public_key = Some(handshake.public_key.clone());
    record.capabilities = handshake.capabilities.iter().cloned().collect();

    let channel = MessageChannel::open(
        ChannelParts {
            connection,
            send,
            recv,
            identity: env.ctx.identity.clone(),
            peer_id,
            peer_key: handshake.public_key,
            pool: env.ctx.pool.clone(),
        },
        env.inbound_queue,
        &env.shutdown,
    );
    Ok(Established {
        peer: record,
        channel,
        direction: Direction::Outbound,
        dialer: env.ctx.identity.node_id(),
    })
}

async fn accept(incoming: quinn::Incoming, env: &HandshakeEnv) -> Result<Established, ChannelError> {
    let connection = incoming.await.map_err(TransportError::from)?;
    let (mut send, mut recv) = connection.accept_bi().await.map_err(TransportError::from)?;

    let hello = read_frame(&mut recv, MAX_HANDSHAKE_FRAME)
        .await?
        .ok_or(TransportError::Closed)?;
    let (peer_id, handshake) = env.ctx.verify_handshake(hello, &connection, None).await?;

    let reply = env.ctx.signed_handshake(peer_id).await?;
    write_frame(&mut send, &reply).await?;

    let record = PeerRecord::from_handshake(
        peer_id,
        connection.remote_address().ip(),
        handshake.listen_port,
        handshake.public_key.clone(),
        &handshake.capabilities,
        handshake.node_type,
    );
    let channel = MessageChannel::open(
        ChannelParts {
            connection,
            send,
            recv,
            identity: env.ctx.identity.clone(),
            peer_id,
            peer_key: handshake.public_key,
            pool: env.ctx.pool.clone(),
        },
        env.inbound_queue,
        &env.shutdown,
    );
    Ok(Established {
        peer: record,
        channel,
        direction: Direction::Inbound,
        dialer: peer_id,
    })
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, ChannelError>>,
) -> Result<T, ChannelError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(ChannelError::Transport(TransportError::Timeout)))
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Connect(PeerRecord),
    HandshakeStarted(NodeId),
    Dialed(NodeId, Result<Box<Established>, ChannelError>),
    ReserveInbound(oneshot::Sender<bool>),
    Accepted(Result<Box<Established>, ChannelError>),
    GetChannel(NodeId, oneshot::Sender<Option<Arc<MessageChannel>>>),
    GetEstablished(oneshot::Sender<Vec<Arc<MessageChannel>>>),
    Snapshot(oneshot::Sender<Vec<ConnectionInfo>>),
    Disconnect(NodeId),
    Quit,
}

// ============================================================================
// ConnectionManager Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnectionManager {
    /// Spawn the manager actor and the accept loop on `endpoint`.
    ///
    /// Verified envelopes from every channel are forwarded to `inbound_tx`;
    /// lifecycle changes are reported on the returned receiver.
    pub(crate) fn spawn(
        config: ConnectionConfig,
        endpoint: Endpoint,
        ctx: HandshakeContext,
        discovery: DiscoveryService,
        inbound_tx: mpsc::Sender<(NodeId, Envelope)>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        let env = Arc::new(HandshakeEnv {
            ctx,
            inbound_queue: config.inbound_queue,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(accept_loop(
            endpoint.clone(),
            cmd_tx.clone(),
            env.clone(),
            config.handshake_timeout,
            shutdown.clone(),
        ));

        let actor = ConnectionActor {
            local_id: env.ctx.identity.node_id(),
            config,
            endpoint,
            env,
            discovery,
            cmd_tx: cmd_tx.clone(),
            inbound_tx,
            event_tx,
            connections: HashMap::new(),
            dialing: HashMap::new(),
            pending_inbound: 0,
            backoff: HashMap::new(),
            shutdown,
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx }, event_rx)
    }

    /// Dial `peer` now if a slot is free and it is not already connected.
    pub async fn connect(&self, peer: PeerRecord) {
        let _ = self.cmd_tx.send(Command::Connect(peer)).await;
    }

    pub async fn channel(&self, peer: NodeId) -> Option<Arc<MessageChannel>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetChannel(peer, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Channels of every established connection.
    pub async fn established(&self) -> Vec<Arc<MessageChannel>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetEstablished(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn send_to(&self, peer: NodeId, payload: &Payload) -> Result<(), ChannelError> {
        let channel = self
            .channel(peer)
            .await
            .ok_or(ChannelError::Transport(TransportError::Closed))?;
        channel.send_payload(payload).await
    }

    pub async fn disconnect(&self, peer: NodeId) {
        let _ = self.cmd_tx.send(Command::Disconnect(peer)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

async fn accept_loop(
    endpoint: Endpoint,
    cmd_tx: mpsc::Sender<Command>,
    env: Arc<HandshakeEnv>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let (tx, rx) = oneshot::channel();
        if cmd_tx.send(Command::ReserveInbound(tx)).await.is_err() {
            break;
        }
        if !rx.await.unwrap_or(false) {
            debug!(remote = %incoming.remote_address(), "refusing inbound connection: no free slot");
            incoming.refuse();
            continue;
        }

        let cmd_tx = cmd_tx.clone();
        let env = env.clone();
        tokio::spawn(async move {
            let result = with_timeout(handshake_timeout, accept(incoming, &env)).await;
            let _ = cmd_tx.send(Command::Accepted(result.map(Box::new))).await;
        });
    }
    trace!("accept loop finished");
}

// ============================================================================
// ConnectionActor (owns the connection table)
// ============================================================================

struct Connection {
    peer: PeerRecord,
    channel: Arc<MessageChannel>,
    state: ConnectionState,
    direction: Direction,
    dialer: NodeId,
}

/// Per-peer dial backoff: `retry_base * 2^(failures - 1)`, capped at `retry_max`.
struct Backoff {
    failures: u32,
    next_attempt: Instant,
}

impl Backoff {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            next_attempt: now,
        }
    }

    /// Count one more failure at `now` and return the delay before the next dial.
    fn fail(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exp = self.failures.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u32 << exp).min(max);
        self.next_attempt = now + delay;
        delay
    }

    fn ready(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }
}

struct ConnectionActor {
    local_id: NodeId,
    config: ConnectionConfig,
    endpoint: Endpoint,
    env: Arc<HandshakeEnv>,
    discovery: DiscoveryService,
    cmd_tx: mpsc::Sender<Command>,
    inbound_tx: mpsc::Sender<(NodeId, Envelope)>,
    event_tx: mpsc::Sender<PeerEvent>,
    connections: HashMap<NodeId, Connection>,
    dialing: HashMap<NodeId, (PeerRecord, ConnectionState)>,
    pending_inbound: usize,
    backoff: HashMap<NodeId, Backoff>,
    shutdown: CancellationToken,
}

impl ConnectionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut tick_interval = tokio::time::interval(self.config.tick_interval);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("connection manager shutting down");
                    break;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Connect(peer)) => {
                            if self.can_dial(&peer) && self.has_free_slot() {
                                self.start_dial(peer);
                            }
                        }
                        Some(Command::HandshakeStarted(peer)) => {
                            if let Some((_, state)) = self.dialing.get_mut(&peer) {
                                *state = ConnectionState::Handshaking;
                            }
                        }
                        Some(Command::Dialed(peer, result)) => {
                            self.dialing.remove(&peer);
                            match result {
                                Ok(established) => {
                                    self.backoff.remove(&peer);
                                    self.register(*established).await;
                                }
                                Err(e) => self.record_failure(peer, &e),
                            }
                        }
                        Some(Command::ReserveInbound(reply)) => {
                            let free = self.has_free_slot();
                            if free {
                                self.pending_inbound += 1;
                            }
                            let _ = reply.send(free);
                        }
                        Some(Command::Accepted(result)) => {
                            self.pending_inbound = self.pending_inbound.saturating_sub(1);
                            match result {
                                Ok(established) => self.register(*established).await,
                                Err(e) => debug!(error = %e, "inbound handshake failed"),
                            }
                        }
                        Some(Command::GetChannel(peer, reply)) => {
                            let channel = self
                                .connections
                                .get(&peer)
                                .filter(|c| !c.channel.is_closed())
                                .map(|c| c.channel.clone());
                            let _ = reply.send(channel);
                        }
                        Some(Command::GetEstablished(reply)) => {
                            let channels = self
                                .connections
                                .values()
                                .filter(|c| !c.channel.is_closed())
                                .map(|c| c.channel.clone())
                                .collect();
                            let _ = reply.send(channels);
                        }
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(Command::Disconnect(peer)) => {
                            self.close(&peer, "disconnect requested");
                        }
                        Some(Command::Quit) => {
                            debug!("connection manager quitting");
                            break;
                        }
                        None => {
                            debug!("connection manager handle dropped, quitting");
                            break;
                        }
                    }
                }
                _ = tick_interval.tick() => {
                    self.tick().await;
                }
            }
        }

        let peers: Vec<NodeId> = self.connections.keys().copied().collect();
        for peer in peers {
            self.close(&peer, "shutting down");
        }
    }

    fn slots_in_use(&self) -> usize {
        self.connections.len() + self.dialing.len() + self.pending_inbound
    }

    fn has_free_slot(&self) -> bool {
        self.slots_in_use() < self.config.max_connections
    }

    fn can_dial(&self, peer: &PeerRecord) -> bool {
        peer.node_id != self.local_id
            && !self.connections.contains_key(&peer.node_id)
            && !self.dialing.contains_key(&peer.node_id)
            && self
                .backoff
                .get(&peer.node_id)
                .is_none_or(|b| b.ready(Instant::now()))
    }

    async fn tick(&mut self) {
        self.reap();

        for conn in self.connections.values() {
            let channel = conn.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.send_payload(&Payload::Ping).await {
                    trace!(peer = %channel.peer_id(), error = %e, "ping failed");
                }
            });
        }

        if !self.has_free_slot() {
            return;
        }
        for peer in self.discovery.get_peers().await {
            if !self.has_free_slot() {
                break;
            }
            if self.can_dial(&peer) {
                self.start_dial(peer);
            }
        }
    }

    fn reap(&mut self) {
        let liveness = self.config.liveness_timeout;
        let dead: Vec<(NodeId, &'static str)> = self
            .connections
            .iter()
            .filter_map(|(id, c)| {
                if c.channel.is_closed() {
                    Some((*id, "channel closed"))
                } else if c.channel.idle_for() > liveness {
                    Some((*id, "liveness timeout"))
                } else {
                    None
                }
            })
            .collect();
        for (peer, reason) in dead {
            self.close(&peer, reason);
        }
    }

    fn start_dial(&mut self, peer: PeerRecord) {
        let node_id = peer.node_id;
        debug!(peer = %node_id, addr = %peer.data_addr(), "dialing peer");
        self.dialing
            .insert(node_id, (peer.clone(), ConnectionState::Connecting));

        let endpoint = self.endpoint.clone();
        let env = self.env.clone();
        let cmd_tx = self.cmd_tx.clone();
        let limit = self.config.handshake_timeout + transport::CONNECT_TIMEOUT;
        tokio::spawn(async move {
            let result = with_timeout(limit, dial(&endpoint, peer, &env, &cmd_tx)).await;
            let _ = cmd_tx.send(Command::Dialed(node_id, result.map(Box::new))).await;
        });
    }

    fn record_failure(&mut self, peer: NodeId, error: &ChannelError) {
        let now = Instant::now();
        let entry = self.backoff.entry(peer).or_insert_with(|| Backoff::new(now));
        let delay = entry.fail(now, self.config.retry_base, self.config.retry_max);
        debug!(
            peer = %peer,
            error = %error,
            failures = entry.failures,
            retry_in = ?delay,
            "dial failed"
        );
    }

    async fn register(&mut self, established: Established) {
        let peer_id = established.peer.node_id;

        if let Some(existing) = self.connections.get(&peer_id) {
            let keep_existing = !existing.channel.is_closed()
                && existing.dialer != established.dialer
                && existing.dialer < established.dialer;
            if keep_existing {
                debug!(peer = %peer_id, "dropping duplicate connection");
                established.channel.close("duplicate connection");
                return;
            }
            debug!(peer = %peer_id, "replacing connection");
            if let Some(old) = self.connections.remove(&peer_id) {
                old.channel.close("replaced by newer connection");
            }
        } else if self.connections.len() >= self.config.max_connections {
            warn!(peer = %peer_id, "connection cap reached, closing new connection");
            established.channel.close("connection cap reached");
            return;
        }

        if let Some(key) = &established.peer.public_key {
            self.discovery.record_public_key(peer_id, key.clone()).await;
        }

        let channel = established.channel.clone();
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(envelope) = channel.recv().await {
                if inbound_tx.send((channel.peer_id(), envelope)).await.is_err() {
                    break;
                }
            }
        });

        info!(
            peer = %peer_id,
            addr = %established.channel.remote_address(),
            direction = ?established.direction,
            "connection established"
        );
        self.emit(PeerEvent::Connected {
            peer: peer_id,
            direction: established.direction,
        });
        self.connections.insert(
            peer_id,
            Connection {
                peer: established.peer,
                channel: established.channel,
                state: ConnectionState::Established,
                direction: established.direction,
                dialer: established.dialer,
            },
        );
    }

    fn close(&mut self, peer: &NodeId, reason: &str) {
        if let Some(mut conn) = self.connections.remove(peer) {
            conn.state = ConnectionState::Closing;
            conn.channel.close(reason);
            conn.state = ConnectionState::Closed;
            info!(peer = %peer, reason, state = ?conn.state, "connection closed");
            self.emit(PeerEvent::Disconnected { peer: *peer });
        }
    }

    fn emit(&self, event: PeerEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("peer event queue full, dropping event");
        }
    }

    fn snapshot(&self) -> Vec<ConnectionInfo> {
        let established = self.connections.values().map(|c| ConnectionInfo {
            peer: c.peer.clone(),
            state: if c.channel.is_closed() {
                ConnectionState::Closed
            } else {
                c.state
            },
            direction: c.direction,
            idle: c.channel.idle_for(),
        });
        let dialing = self.dialing.values().map(|(peer, state)| ConnectionInfo {
            peer: peer.clone(),
            state: *state,
            direction: Direction::Outbound,
            idle: Duration::ZERO,
        });
        established.chain(dialing).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TransportKey;
    use crate::discovery::{DiscoveryConfig, LocalAdvert};
    use crate::transport::bind_endpoint;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    struct TestPeer {
        identity: Arc<PeerIdentity>,
        manager: ConnectionManager,
        events: mpsc::Receiver<PeerEvent>,
        inbound: mpsc::Receiver<(NodeId, Envelope)>,
        addr: SocketAddr,
        _shutdown: tokio_util::sync::DropGuard,
    }

    async fn peer(max_connections: usize) -> TestPeer {
        peer_with(ConnectionConfig {
            max_connections,
            tick_interval: Duration::from_millis(200),
            ..ConnectionConfig::default()
        })
        .await
    }

    async fn peer_with(config: ConnectionConfig) -> TestPeer {
        let shutdown = CancellationToken::new();
        let identity = Arc::new(PeerIdentity::generate().unwrap());
        let transport_key = TransportKey::generate();
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let endpoint = bind_endpoint(loopback, &transport_key).unwrap();
        let addr = endpoint.local_addr().unwrap();

        let discovery = DiscoveryService::start(
            DiscoveryConfig {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                targets: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9)],
                ..DiscoveryConfig::default()
            },
            LocalAdvert {
                node_id: identity.node_id(),
                data_port: addr.port(),
                capabilities: vec![],
                node_type: NodeType::Full,
                shared_repo_ids: vec![],
                bandwidth_limit_kbps: 0,
                storage_available_mb: 0,
            },
            shutdown.clone(),
        )
        .await
        .unwrap();

        let (inbound_tx, inbound) = mpsc::channel(64);
        let ctx = HandshakeContext {
            identity: identity.clone(),
            pool: CryptoPool::new(2),
            transport_key: transport_key.public_key_bytes(),
            capabilities: vec!["sync".into()],
            node_type: NodeType::Full,
            listen_port: addr.port(),
        };
        let (manager, events) =
            ConnectionManager::spawn(config, endpoint, ctx, discovery, inbound_tx, shutdown.clone());

        TestPeer {
            identity,
            manager,
            events,
            inbound,
            addr,
            _shutdown: shutdown.drop_guard(),
        }
    }

    fn record_of(peer: &TestPeer) -> PeerRecord {
        let mut record = PeerRecord::from_handshake(
            peer.identity.node_id(),
            peer.addr.ip(),
            peer.addr.port(),
            peer.identity.export_public(),
            &[],
            NodeType::Full,
        );
        record.public_key = None;
        record
    }

    fn require_established(info: &[ConnectionInfo], peer: NodeId) {
        assert!(
            info.iter()
                .any(|c| c.peer.node_id == peer && c.state == ConnectionState::Established),
            "no established connection to {peer}"
        );
    }

    async fn next_event(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn handshake_establishes_both_sides_and_carries_envelopes() {
        let mut a = peer(4).await;
        let mut b = peer(4).await;

        a.manager.connect(record_of(&b)).await;

        assert_eq!(
            next_event(&mut a.events).await,
            PeerEvent::Connected { peer: b.identity.node_id(), direction: Direction::Outbound }
        );
        assert_eq!(
            next_event(&mut b.events).await,
            PeerEvent::Connected { peer: a.identity.node_id(), direction: Direction::Inbound }
        );

        let info = a.manager.connections().await;
        require_established(&info, b.identity.node_id());
        assert_eq!(info[0].peer.public_key, Some(b.identity.export_public()));

        a.manager
            .send_to(b.identity.node_id(), &Payload::Ping)
            .await
            .unwrap();
        let (from, envelope) = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (from, envelope) = b.inbound.recv().await.unwrap();
                if envelope.kind == crate::messages::KIND_PING && from == a.identity.node_id() {
                    return (from, envelope);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(from, a.identity.node_id());
        assert_eq!(envelope.receiver_id, b.identity.node_id());
    }

    #[tokio::test]
    async fn cap_is_never_exceeded() {
        let hub = peer(1).await;
        let x = peer(4).await;
        let y = peer(4).await;

        x.manager.connect(record_of(&hub)).await;
        y.manager.connect(record_of(&hub)).await;

        let deadline = Instant::now() + Duration::from_secs(4);
        let mut saw_established = false;
        while Instant::now() < deadline {
            let info = hub.manager.connections().await;
            assert!(info.len() <= 1, "hub exceeded its cap: {}", info.len());
            saw_established |= info.iter().any(|c| c.state == ConnectionState::Established);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(saw_established);
    }

    #[tokio::test]
    async fn wrong_node_id_fails_the_dial() {
        let mut a = peer(4).await;
        let b = peer(4).await;

        let mut impostor = record_of(&b);
        impostor.node_id = NodeId::random();
        a.manager.connect(impostor).await;

        let outcome = tokio::time::timeout(Duration::from_secs(3), a.events.recv()).await;
        assert!(outcome.is_err(), "no connection should be established");
        assert!(a.manager.connections().await.iter().all(|c| c.state != ConnectionState::Established));
    }

    #[tokio::test]
    async fn disconnect_emits_event_and_frees_slot() {
        let mut a = peer(1).await;
        let b = peer(4).await;

        a.manager.connect(record_of(&b)).await;
        assert!(matches!(next_event(&mut a.events).await, PeerEvent::Connected { .. }));

        a.manager.disconnect(b.identity.node_id()).await;
        assert_eq!(
            next_event(&mut a.events).await,
            PeerEvent::Disconnected { peer: b.identity.node_id() }
        );
        assert!(a.manager.connections().await.is_empty());
    }

    #[tokio::test]
    async fn silent_peer_is_reaped_after_liveness_timeout() {
        let mut a = peer_with(ConnectionConfig {
            max_connections: 1,
            tick_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(600),
            ..ConnectionConfig::default()
        })
        .await;
        // never ticks after startup, so it never pings
        let b = peer_with(ConnectionConfig {
            tick_interval: Duration::from_secs(3600),
            ..ConnectionConfig::default()
        })
        .await;

        a.manager.connect(record_of(&b)).await;
        assert!(matches!(next_event(&mut a.events).await, PeerEvent::Connected { .. }));
        let connected_at = Instant::now();

        assert_eq!(
            next_event(&mut a.events).await,
            PeerEvent::Disconnected { peer: b.identity.node_id() }
        );
        assert!(connected_at.elapsed() >= Duration::from_millis(500));
        assert!(a.manager.connections().await.is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(300);
        let now = Instant::now();
        let mut backoff = Backoff::new(now);
        assert!(backoff.ready(now));

        let delays: Vec<_> = (0..10).map(|_| backoff.fail(now, base, max)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[2], Duration::from_secs(8));
        assert_eq!(delays[7], Duration::from_secs(256));
        assert_eq!(delays[8], max);
        assert_eq!(delays[9], max);

        assert!(!backoff.ready(now + Duration::from_secs(299)));
        assert!(backoff.ready(now + max));
    }

    /// Wait until `manager` has nothing in flight or established.
    async fn wait_idle(manager: &ConnectionManager) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !manager.connections().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dial never finished");
    }

    #[tokio::test]
    async fn failed_dials_wait_for_backoff() {
        let retry_base = Duration::from_millis(400);
        let a = peer_with(ConnectionConfig {
            tick_interval: Duration::from_secs(3600),
            retry_base,
            retry_max: Duration::from_secs(10),
            ..ConnectionConfig::default()
        })
        .await;
        let b = peer(4).await;
        let mut impostor = record_of(&b);
        impostor.node_id = NodeId::random();

        a.manager.connect(impostor.clone()).await;
        assert_eq!(a.manager.connections().await.len(), 1);
        wait_idle(&a.manager).await;

        // first failure: no retry before retry_base
        a.manager.connect(impostor.clone()).await;
        assert!(a.manager.connections().await.is_empty());

        tokio::time::sleep(retry_base + Duration::from_millis(50)).await;
        a.manager.connect(impostor.clone()).await;
        assert_eq!(a.manager.connections().await.len(), 1);
        wait_idle(&a.manager).await;

        // second failure: the delay has doubled
        tokio::time::sleep(retry_base + Duration::from_millis(50)).await;
        a.manager.connect(impostor.clone()).await;
        assert!(a.manager.connections().await.is_empty());

        tokio::time::sleep(retry_base).await;
        a.manager.connect(impostor).await;
        assert_eq!(a.manager.connections().await.len(), 1);
    }
}
