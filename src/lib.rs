//! # collabnet - LAN Peer-to-Peer File Collaboration
//!
//! collabnet lets machines on a local network find each other, open
//! authenticated channels and exchange shared files:
//!
//! - **Identity**: RSA-2048 keypair per node, random 128-bit node ids
//! - **Discovery**: periodic UDP broadcast of JSON announcements
//! - **Transport**: QUIC with one framed bidirectional stream per peer
//! - **Channels**: every envelope is RSA-PSS signed and verified against the key
//!   anchored at handshake
//! - **Storage**: files addressed by `file_id`, encrypted at rest unless public
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - Each component (discovery, connection manager) has a public Handle and a
//!   private Actor
//! - Handles are cheap to clone and talk to the actor over async channels
//! - Actors own their tables and process commands sequentially
//!
//! All background tasks watch one cancellation token, cancelled by
//! [`Node::stop`].
//!
//! ## Security Model
//!
//! - QUIC certificates use a per-run Ed25519 transport key; the signed handshake
//!   binds that key to the node's RSA identity
//! - Discovery carries no keys; public keys travel only inside signed handshakes
//! - File keys leave a node only hybrid-encrypted (RSA-OAEP + AES-256-CBC) to a
//!   recipient allowed to hold them
//! - Frames, announcements and tables are size-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Node ids, RSA keypairs, signatures |
//! | `crypto` | Hybrid cipher, at-rest cipher, crypto pool, QUIC TLS configs |
//! | `discovery` | UDP announcements and the peer directory |
//! | `connection` | Connection lifecycle, handshake, caps and backoff |
//! | `channel` | Signed envelope exchange over one connection |
//! | `transport` | QUIC endpoint and length-prefixed framing |
//! | `messages` | Wire types and bounded decoding |
//! | `store` | Local file share store |

mod channel;
mod connection;
mod crypto;
mod discovery;
mod identity;
mod messages;
mod node;
mod store;
mod transport;

pub use channel::{ChannelError, MessageChannel, MAX_PROTOCOL_VIOLATIONS};
pub use connection::{
    ConnectionConfig, ConnectionInfo, ConnectionState, Direction, DEFAULT_LIVENESS_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_TICK_INTERVAL,
};
pub use crypto::{CryptoError, CryptoPool, HybridCipher};
pub use discovery::{
    DiscoveryConfig, PeerRecord, DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_DISCOVERY_PORT,
    DEFAULT_STALE_AFTER,
};
pub use identity::{verify, NodeId, PeerIdentity, PublicKey};
pub use messages::{NodeType, PeerAnnouncement, Payload, ProtocolError, MAX_FRAME_SIZE};
pub use node::{
    NetworkStatus, Node, NodeConfig, NodeEvent, PeerStatus, RemoteFile, DEFAULT_DATA_DIR,
    DEFAULT_DATA_PORT,
};
pub use store::{AccessLevel, FileShare, FileShareStore, StorageError, StoreConfig};
pub use transport::TransportError;
