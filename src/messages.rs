//! # Wire Protocol Messages
//!
//! Two wire formats:
//!
//! | Channel | Format | Type |
//! |---------|--------|------|
//! | UDP discovery | JSON datagram | [`PeerAnnouncement`] |
//! | QUIC stream | `u32` BE length + bincode | [`Envelope`] |
//!
//! An [`Envelope`] carries its payload as a `(kind, bytes)` pair so that a
//! message type this node does not know decodes to [`Payload::Unknown`] instead
//! of failing the whole frame.
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: largest accepted envelope frame (4 MiB)
//! - `MAX_ANNOUNCE_SIZE`: largest accepted discovery datagram
//! - All bincode decoding goes through `deserialize_bounded()`

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{sign_with_domain, verify_with_domain, CryptoError, ENVELOPE_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, random_bytes, NodeId, PeerIdentity, PublicKey};
use crate::store::FileShare;

/// Largest envelope frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Largest discovery datagram accepted.
pub const MAX_ANNOUNCE_SIZE: usize = 8 * 1024;

/// Handshake protocol version string.
pub const PROTOCOL_VERSION: &str = "1.0";

/// `type` field of discovery datagrams.
pub const ANNOUNCE_TYPE: &str = "peer_announce";

pub const KIND_HANDSHAKE: &str = "handshake";
pub const KIND_FILE_ANNOUNCE: &str = "file_announce";
pub const KIND_SYNC_REQUEST: &str = "sync_request";
pub const KIND_SYNC_DATA: &str = "sync_data";
pub const KIND_KEY_EXCHANGE: &str = "key_exchange";
pub const KIND_PING: &str = "ping";

/// Longest `kind` string accepted.
const MAX_KIND_LEN: usize = 64;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Same encoding as [`bincode_options`]; the size check happens on the result.
fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(value)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame or payload failed to decode.
    Malformed(String),
    /// Frame exceeds `MAX_FRAME_SIZE`.
    Oversized { size: usize, max: usize },
    /// Signature missing or not valid for the anchored key.
    BadSignature,
    /// `sender_id` differs from the peer bound to the channel.
    UnexpectedSender,
    /// `receiver_id` is not this node.
    WrongReceiver,
    /// A handshake arrived on an already established channel.
    UnexpectedHandshake,
    /// The first frame on a channel was not a handshake.
    HandshakeRequired,
    /// Handshake transport key differs from the certificate on the connection.
    TransportMismatch,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(detail) => write!(f, "malformed message: {detail}"),
            ProtocolError::Oversized { size, max } => {
                write!(f, "frame too large: {size} bytes (max {max})")
            }
            ProtocolError::BadSignature => write!(f, "envelope signature invalid"),
            ProtocolError::UnexpectedSender => write!(f, "envelope sender does not match channel peer"),
            ProtocolError::WrongReceiver => write!(f, "envelope addressed to another node"),
            ProtocolError::UnexpectedHandshake => write!(f, "handshake on established channel"),
            ProtocolError::HandshakeRequired => write!(f, "expected handshake as first message"),
            ProtocolError::TransportMismatch => write!(f, "handshake does not match transport certificate"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ============================================================================
// Discovery
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Full,
    Light,
    Bridge,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Full => write!(f, "full"),
            NodeType::Light => write!(f, "light"),
            NodeType::Bridge => write!(f, "bridge"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(NodeType::Full),
            "light" => Ok(NodeType::Light),
            "bridge" => Ok(NodeType::Bridge),
            other => Err(format!("unknown node type: {other}")),
        }
    }
}

fn default_data_port() -> u16 {
    8889
}

fn default_bandwidth_kbps() -> u32 {
    1000
}

fn default_storage_mb() -> u64 {
    1000
}

/// Self-announcement broadcast on the discovery port.
///
/// Carries no key material: peers learn each other's public keys only inside
/// the signed handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: String,
    /// Data (QUIC) port of the announcing node.
    #[serde(default = "default_data_port")]
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub shared_repo_ids: Vec<String>,
    #[serde(default = "default_bandwidth_kbps")]
    pub bandwidth_limit_kbps: u32,
    #[serde(default = "default_storage_mb")]
    pub storage_available_mb: u64,
}

impl PeerAnnouncement {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decode and validate a datagram. Returns the announcement and its node id.
    pub fn decode(bytes: &[u8]) -> Result<(Self, NodeId), ProtocolError> {
        if bytes.len() > MAX_ANNOUNCE_SIZE {
            return Err(ProtocolError::Oversized {
                size: bytes.len(),
                max: MAX_ANNOUNCE_SIZE,
            });
        }
        let announcement: PeerAnnouncement =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if announcement.kind != ANNOUNCE_TYPE {
            return Err(ProtocolError::Malformed(format!(
                "unexpected discovery type {:?}",
                announcement.kind
            )));
        }
        let node_id = NodeId::from_hex(&announcement.node_id)
            .map_err(|_| ProtocolError::Malformed("invalid node_id".to_string()))?;
        Ok((announcement, node_id))
    }
}

// ============================================================================
// Envelope Payloads
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub public_key: PublicKey,
    pub capabilities: Vec<String>,
    pub protocol_version: String,
    /// Ed25519 key of the sender's QUIC certificate.
    pub transport_key: [u8; 32],
    pub node_type: NodeType,
    /// Port the sender accepts QUIC connections on.
    pub listen_port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnnounce {
    /// Always sent with `encryption_key` stripped.
    pub file_info: FileShare,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub file_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    pub file_id: String,
    /// Key-stripped record; absent when the file is unknown to the responder.
    pub file_info: Option<FileShare>,
    /// File content hybrid-encrypted to the requester, or `None` when refused.
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub file_id: String,
    /// File key hybrid-encrypted to the receiver.
    pub wrapped_key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Handshake(Handshake),
    FileAnnounce(FileAnnounce),
    SyncRequest(SyncRequest),
    SyncData(SyncData),
    KeyExchange(KeyExchange),
    Ping,
    /// A message type this node does not understand.
    Unknown(String),
}

impl Payload {
    pub fn kind(&self) -> &str {
        match self {
            Payload::Handshake(_) => KIND_HANDSHAKE,
            Payload::FileAnnounce(_) => KIND_FILE_ANNOUNCE,
            Payload::SyncRequest(_) => KIND_SYNC_REQUEST,
            Payload::SyncData(_) => KIND_SYNC_DATA,
            Payload::KeyExchange(_) => KIND_KEY_EXCHANGE,
            Payload::Ping => KIND_PING,
            Payload::Unknown(kind) => kind,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Payload::Handshake(p) => serialize(p),
            Payload::FileAnnounce(p) => serialize(p),
            Payload::SyncRequest(p) => serialize(p),
            Payload::SyncData(p) => serialize(p),
            Payload::KeyExchange(p) => serialize(p),
            Payload::Ping | Payload::Unknown(_) => Ok(Vec::new()),
        }
    }

    pub fn decode(kind: &str, body: &[u8]) -> Result<Self, ProtocolError> {
        fn de<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
            deserialize_bounded(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
        }
        Ok(match kind {
            KIND_HANDSHAKE => Payload::Handshake(de(body)?),
            KIND_FILE_ANNOUNCE => Payload::FileAnnounce(de(body)?),
            KIND_SYNC_REQUEST => Payload::SyncRequest(de(body)?),
            KIND_SYNC_DATA => Payload::SyncData(de(body)?),
            KIND_KEY_EXCHANGE => Payload::KeyExchange(de(body)?),
            KIND_PING => Payload::Ping,
            other => Payload::Unknown(other.to_string()),
        })
    }
}

// ============================================================================
// Envelope
// ============================================================================

pub type MessageId = [u8; 16];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub sender_id: NodeId,
    pub receiver_id: NodeId,
    pub kind: String,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Build an unsigned envelope with a fresh message id.
    pub fn new(sender_id: NodeId, receiver_id: NodeId, payload: &Payload) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_id: random_bytes(),
            sender_id,
            receiver_id,
            kind: payload.kind().to_string(),
            payload: payload.encode_body()?,
            timestamp: now_ms(),
            signature: Vec::new(),
        })
    }

    /// Canonical serialization of every field except the signature.
    ///
    /// Variable-length fields are length-prefixed so no two envelopes share
    /// the same signed bytes.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 16 + 16 + 4 + self.kind.len() + 8 + self.payload.len() + 8);
        buf.extend_from_slice(&self.message_id);
        buf.extend_from_slice(self.sender_id.as_bytes());
        buf.extend_from_slice(self.receiver_id.as_bytes());
        buf.extend_from_slice(&(self.kind.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.kind.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    pub fn sign(&mut self, identity: &PeerIdentity) -> Result<(), CryptoError> {
        self.signature = sign_with_domain(identity, ENVELOPE_SIGNATURE_DOMAIN, &self.signed_bytes())?;
        Ok(())
    }

    pub fn verify(&self, public_key: &PublicKey) -> bool {
        verify_with_domain(
            public_key,
            ENVELOPE_SIGNATURE_DOMAIN,
            &self.signed_bytes(),
            &self.signature,
        )
    }

    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        Payload::decode(&self.kind, &self.payload)
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serialize(self)?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversized {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversized {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let envelope: Envelope =
            deserialize_bounded(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if envelope.kind.is_empty() || envelope.kind.len() > MAX_KIND_LEN {
            return Err(ProtocolError::Malformed("invalid message kind".to_string()));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AccessLevel;

    fn sample_share() -> FileShare {
        FileShare {
            file_id: "f1".to_string(),
            file_name: "notes.md".to_string(),
            content_hash: "00".repeat(32),
            size_bytes: 42,
            owner_node_id: NodeId::random(),
            access_level: AccessLevel::Team,
            encryption_key: None,
            created_at: 1,
        }
    }

    #[test]
    fn signed_envelope_survives_framing() {
        let identity = PeerIdentity::generate().expect("keygen");
        let payload = Payload::FileAnnounce(FileAnnounce { file_info: sample_share() });
        let mut envelope = Envelope::new(identity.node_id(), NodeId::random(), &payload).unwrap();
        envelope.sign(&identity).unwrap();

        let decoded = Envelope::from_frame(&envelope.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.verify(&identity.export_public()));
        assert_eq!(decoded.payload().unwrap(), payload);
    }

    #[test]
    fn any_field_change_breaks_signature() {
        let identity = PeerIdentity::generate().expect("keygen");
        let key = identity.export_public();
        let mut envelope = Envelope::new(
            identity.node_id(),
            NodeId::random(),
            &Payload::SyncRequest(SyncRequest { file_id: "abc".into() }),
        )
        .unwrap();
        envelope.sign(&identity).unwrap();
        assert!(envelope.verify(&key));

        let mut e = envelope.clone();
        e.payload[0] ^= 1;
        assert!(!e.verify(&key));

        let mut e = envelope.clone();
        e.timestamp += 1;
        assert!(!e.verify(&key));

        let mut e = envelope.clone();
        e.receiver_id = NodeId::random();
        assert!(!e.verify(&key));

        let mut e = envelope.clone();
        e.kind = KIND_SYNC_DATA.to_string();
        assert!(!e.verify(&key));

        let mut e = envelope;
        e.signature.clear();
        assert!(!e.verify(&key));
    }

    #[test]
    fn unknown_kind_decodes_to_unknown() {
        let payload = Payload::decode("future_feature", &[1, 2, 3]).unwrap();
        assert_eq!(payload, Payload::Unknown("future_feature".to_string()));
        assert_eq!(Payload::decode(KIND_PING, &[]).unwrap(), Payload::Ping);
        assert!(matches!(
            Payload::decode(KIND_SYNC_REQUEST, &[0xFF]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_frames_are_rejected() {
        assert!(matches!(Envelope::from_frame(&[0u8; 7]), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            Envelope::from_frame(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn announcement_applies_receive_defaults() {
        let node_id = NodeId::random();
        let json = format!(r#"{{"type":"peer_announce","node_id":"{node_id}"}}"#);
        let (announcement, parsed) = PeerAnnouncement::decode(json.as_bytes()).unwrap();

        assert_eq!(parsed, node_id);
        assert_eq!(announcement.port, 8889);
        assert_eq!(announcement.node_type, NodeType::Full);
        assert_eq!(announcement.bandwidth_limit_kbps, 1000);
        assert_eq!(announcement.storage_available_mb, 1000);
        assert!(announcement.capabilities.is_empty());
    }

    #[test]
    fn announcement_rejects_wrong_type_and_bad_id() {
        let node_id = NodeId::random();
        let wrong_type = format!(r#"{{"type":"chat","node_id":"{node_id}"}}"#);
        assert!(PeerAnnouncement::decode(wrong_type.as_bytes()).is_err());

        let bad_id = r#"{"type":"peer_announce","node_id":"zz"}"#;
        assert!(PeerAnnouncement::decode(bad_id.as_bytes()).is_err());
        assert!(PeerAnnouncement::decode(b"not json").is_err());
    }
}
