//! # Message Channel
//!
//! One [`MessageChannel`] per established connection. It owns the connection's
//! single bidirectional QUIC stream after the handshake and carries signed
//! [`Envelope`]s in both directions.
//!
//! ## Inbound Path
//!
//! ```text
//! frame ─► bounded decode ─► sender/receiver check ─► signature (crypto pool) ─► queue
//!                 └──────────────── any failure: drop + log ───────────────┘
//! ```
//!
//! Only envelopes that verify against the public key anchored by the handshake
//! reach the receive queue. After `MAX_PROTOCOL_VIOLATIONS` rejected frames the
//! channel closes itself.
//!
//! Frames are processed strictly in arrival order, so per-connection ordering is
//! preserved. Delivery is at-most-once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quinn::VarInt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto::{CryptoError, CryptoPool};
use crate::identity::{NodeId, PeerIdentity, PublicKey};
use crate::messages::{Envelope, Payload, ProtocolError, KIND_HANDSHAKE, MAX_FRAME_SIZE};
use crate::transport::{read_frame, write_frame, TransportError};

/// Capacity of each channel's receive queue.
pub const DEFAULT_INBOUND_QUEUE: usize = 256;

/// Rejected frames tolerated before the channel is torn down.
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    Transport(TransportError),
    Protocol(ProtocolError),
    Crypto(CryptoError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Transport(e) => write!(f, "{e}"),
            ChannelError::Protocol(e) => write!(f, "{e}"),
            ChannelError::Crypto(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        ChannelError::Transport(e)
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        ChannelError::Protocol(e)
    }
}

impl From<CryptoError> for ChannelError {
    fn from(e: CryptoError) -> Self {
        ChannelError::Crypto(e)
    }
}

/// Everything a channel needs once the handshake has anchored the peer's key.
pub(crate) struct ChannelParts {
    pub connection: quinn::Connection,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
    pub identity: Arc<PeerIdentity>,
    pub peer_id: NodeId,
    pub peer_key: PublicKey,
    pub pool: CryptoPool,
}

pub struct MessageChannel {
    local_id: NodeId,
    peer_id: NodeId,
    peer_key: PublicKey,
    identity: Arc<PeerIdentity>,
    pool: CryptoPool,
    connection: quinn::Connection,
    send: Mutex<quinn::SendStream>,
    inbound: Mutex<mpsc::Receiver<Envelope>>,
    closed: CancellationToken,
    activity: Arc<Activity>,
}

impl MessageChannel {
    /// Take over the stream and start the inbound pump. The channel closes when
    /// `shutdown` is cancelled.
    pub(crate) fn open(
        parts: ChannelParts,
        inbound_capacity: usize,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let closed = shutdown.child_token();
        let activity = Arc::new(Activity::new());
        let local_id = parts.identity.node_id();

        let reader = InboundPump {
            recv: parts.recv,
            connection: parts.connection.clone(),
            local_id,
            peer_id: parts.peer_id,
            peer_key: parts.peer_key.clone(),
            pool: parts.pool.clone(),
            inbound_tx,
            closed: closed.clone(),
            activity: activity.clone(),
        };
        tokio::spawn(reader.run());

        Arc::new(Self {
            local_id,
            peer_id: parts.peer_id,
            peer_key: parts.peer_key,
            identity: parts.identity,
            pool: parts.pool,
            connection: parts.connection,
            send: Mutex::new(parts.send),
            inbound: Mutex::new(inbound_rx),
            closed,
            activity,
        })
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    /// Sign `envelope` as this node and write it as one frame.
    ///
    /// Waits only on signing and transport backpressure.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        envelope.sender_id = self.local_id;
        envelope.receiver_id = self.peer_id;

        let identity = self.identity.clone();
        let frame = self
            .pool
            .run(move || -> Result<Vec<u8>, ChannelError> {
                envelope.sign(&identity)?;
                Ok(envelope.to_frame()?)
            })
            .await??;

        let mut send = self.send.lock().await;
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            written = write_frame(&mut send, &frame) => written,
        };
        if let Err(e) = &result {
            debug!(peer = %self.peer_id, error = %e, "channel write failed");
            self.close("write failed");
        }
        Ok(result?)
    }

    /// Build, sign and send an envelope carrying `payload`.
    pub async fn send_payload(&self, payload: &Payload) -> Result<(), ChannelError> {
        let envelope = Envelope::new(self.local_id, self.peer_id, payload)?;
        self.send(envelope).await
    }

    /// Next verified envelope. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Envelope> {
        self.inbound.lock().await.recv().await
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.activity.idle()
    }

    pub fn close(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            debug!(peer = %self.peer_id, reason, "closing channel");
            self.closed.cancel();
        }
        self.connection.close(VarInt::from_u32(0), reason.as_bytes());
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Check one inbound frame against the channel's anchored peer.
pub(crate) fn admit(
    frame: &[u8],
    peer_id: NodeId,
    peer_key: &PublicKey,
    local_id: NodeId,
) -> Result<Envelope, ProtocolError> {
    let envelope = Envelope::from_frame(frame)?;
    if envelope.sender_id != peer_id {
        return Err(ProtocolError::UnexpectedSender);
    }
    if envelope.receiver_id != local_id {
        return Err(ProtocolError::WrongReceiver);
    }
    if !envelope.verify(peer_key) {
        return Err(ProtocolError::BadSignature);
    }
    if envelope.kind == KIND_HANDSHAKE {
        return Err(ProtocolError::UnexpectedHandshake);
    }
    Ok(envelope)
}

/// Last inbound frame, as monotonic milliseconds since the channel opened.
struct Activity {
    opened: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }
}

struct InboundPump {
    recv: quinn::RecvStream,
    connection: quinn::Connection,
    local_id: NodeId,
    peer_id: NodeId,
    peer_key: PublicKey,
    pool: CryptoPool,
    inbound_tx: mpsc::Sender<Envelope>,
    closed: CancellationToken,
    activity: Arc<Activity>,
}

impl InboundPump {
    async fn run(mut self) {
        let mut violations = 0u32;

        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = read_frame(&mut self.recv, MAX_FRAME_SIZE) => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(peer = %self.peer_id, "peer finished stream");
                    break;
                }
                Err(e) => {
                    debug!(peer = %self.peer_id, error = %e, "channel read failed");
                    break;
                }
            };
            self.activity.touch();

            let (peer_id, peer_key, local_id) = (self.peer_id, self.peer_key.clone(), self.local_id);
            let admitted = self
                .pool
                .run(move || admit(&frame, peer_id, &peer_key, local_id))
                .await;

            match admitted {
                Ok(Ok(envelope)) => {
                    trace!(peer = %self.peer_id, kind = %envelope.kind, "envelope accepted");
                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        sent = self.inbound_tx.send(envelope) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    violations += 1;
                    warn!(
                        peer = %self.peer_id,
                        error = %e,
                        violations,
                        "dropping invalid envelope"
                    );
                    if violations >= MAX_PROTOCOL_VIOLATIONS {
                        warn!(peer = %self.peer_id, "too many protocol violations, closing channel");
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        self.closed.cancel();
        self.connection.close(VarInt::from_u32(0), b"channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TransportKey;
    use crate::messages::SyncRequest;
    use crate::transport::{bind_endpoint, connect};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[tokio::test]
    async fn idle_time_is_measured_from_last_frame() {
        let activity = Activity::new();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(activity.idle() >= Duration::from_millis(60));

        activity.touch();
        assert!(activity.idle() < Duration::from_millis(60));
    }

    struct Harness {
        channel: Arc<MessageChannel>,
        raw_send: quinn::SendStream,
        sender: PeerIdentity,
        receiver_id: NodeId,
        _keep: (quinn::Endpoint, quinn::Endpoint, quinn::Connection),
    }

    /// A channel on the accepting side, fed by raw frames from a dialer.
    async fn harness() -> Harness {
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let server = bind_endpoint(loopback, &TransportKey::generate()).unwrap();
        let client = bind_endpoint(loopback, &TransportKey::generate()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let sender = PeerIdentity::generate().unwrap();
        let receiver = Arc::new(PeerIdentity::generate().unwrap());
        let receiver_id = receiver.node_id();

        let acceptor = tokio::spawn(async move {
            let accepted = server.accept().await.unwrap().await.unwrap();
            let (send, recv) = accepted.accept_bi().await.unwrap();
            (server, accepted, send, recv)
        });

        let dialer = connect(&client, server_addr).await.unwrap();
        let (mut raw_send, _raw_recv) = dialer.open_bi().await.unwrap();
        // the acceptor only sees the stream once bytes flow
        write_frame(&mut raw_send, &ping_frame(&sender, receiver_id)).await.unwrap();

        let (server, accepted, send, recv) = acceptor.await.unwrap();
        let channel = MessageChannel::open(
            ChannelParts {
                connection: accepted,
                send,
                recv,
                identity: receiver,
                peer_id: sender.node_id(),
                peer_key: sender.export_public(),
                pool: CryptoPool::new(2),
            },
            16,
            &CancellationToken::new(),
        );

        Harness {
            channel,
            raw_send,
            sender,
            receiver_id,
            _keep: (server, client, dialer),
        }
    }

    fn ping_frame(sender: &PeerIdentity, receiver: NodeId) -> Vec<u8> {
        let mut envelope = Envelope::new(sender.node_id(), receiver, &Payload::Ping).unwrap();
        envelope.sign(sender).unwrap();
        envelope.to_frame().unwrap()
    }

    fn request(sender: &PeerIdentity, receiver: NodeId, file_id: &str) -> Envelope {
        let payload = Payload::SyncRequest(SyncRequest { file_id: file_id.to_string() });
        let mut envelope = Envelope::new(sender.node_id(), receiver, &payload).unwrap();
        envelope.sign(sender).unwrap();
        envelope
    }

    #[tokio::test]
    async fn tampered_envelopes_never_reach_the_queue() {
        let mut h = harness().await;
        let first = h.channel.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.payload().unwrap(), Payload::Ping);

        let mut tampered = request(&h.sender, h.receiver_id, "aaaa");
        tampered.payload[5] ^= 0x01;
        write_frame(&mut h.raw_send, &tampered.to_frame().unwrap()).await.unwrap();

        let valid = request(&h.sender, h.receiver_id, "bbbb");
        write_frame(&mut h.raw_send, &valid.to_frame().unwrap()).await.unwrap();

        let received = h.channel.recv_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received, valid);
        assert!(!h.channel.is_closed());
    }

    #[test]
    fn admit_checks_every_binding() {
        let sender = PeerIdentity::generate().unwrap();
        let stranger = PeerIdentity::generate().unwrap();
        let local = NodeId::random();
        let key = sender.export_public();

        let good = request(&sender, local, "cafe");
        assert!(admit(&good.to_frame().unwrap(), sender.node_id(), &key, local).is_ok());

        let forged = request(&stranger, local, "cafe");
        assert_eq!(
            admit(&forged.to_frame().unwrap(), stranger.node_id(), &key, local),
            Err(ProtocolError::BadSignature)
        );
        assert_eq!(
            admit(&forged.to_frame().unwrap(), sender.node_id(), &key, local),
            Err(ProtocolError::UnexpectedSender)
        );

        let misrouted = request(&sender, NodeId::random(), "cafe");
        assert_eq!(
            admit(&misrouted.to_frame().unwrap(), sender.node_id(), &key, local),
            Err(ProtocolError::WrongReceiver)
        );

        assert!(matches!(
            admit(b"junk", sender.node_id(), &key, local),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn repeated_violations_close_the_channel() {
        let mut h = harness().await;
        let _ = h.channel.recv_timeout(Duration::from_secs(5)).await;

        let stranger = PeerIdentity::generate().unwrap();
        for i in 0..MAX_PROTOCOL_VIOLATIONS {
            let forged = request(&stranger, h.receiver_id, &format!("{i:04}"));
            // claim to be the anchored sender
            let mut forged = forged;
            forged.sender_id = h.sender.node_id();
            write_frame(&mut h.raw_send, &forged.to_frame().unwrap()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), h.channel.closed())
            .await
            .expect("channel should close after repeated violations");
        assert!(h.channel.is_closed());
        assert!(h.channel.send_payload(&Payload::Ping).await.is_err());
    }
}
