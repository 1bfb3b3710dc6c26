//! # Node Identity
//!
//! This module defines the identity types every other component builds on:
//!
//! - [`NodeId`]: random 128-bit identifier, stable for the lifetime of the process
//! - [`PublicKey`]: shareable RSA public key (SubjectPublicKeyInfo DER)
//! - [`PeerIdentity`]: the node's RSA-2048 keypair plus its [`NodeId`]
//!
//! ## Identity Model
//!
//! Discovery identifies peers by `NodeId` and address only. The public key is
//! learned inside the signed handshake and from then on anchors every envelope
//! received on that connection. The private key never leaves this module except
//! through the PKCS#8 key file written by [`PeerIdentity::load_or_generate`].
//!
//! ## Signatures
//!
//! RSASSA-PSS with SHA-256 and MGF1-SHA256. [`verify`] never panics and never
//! errors: a malformed key or signature is simply not valid.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::crypto::CryptoError;

/// RSA modulus size for node keys.
pub const RSA_KEY_BITS: usize = 2048;

/// Length of a [`NodeId`] in bytes.
pub const NODE_ID_LEN: usize = 16;

/// Upper bound on an encoded public key accepted from the wire.
/// SECURITY: Prevents a peer from forcing large allocations via a bogus key.
pub const MAX_PUBLIC_KEY_DER_LEN: usize = 1024;

#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fill a fixed-size array from the OS CSPRNG.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    if getrandom::getrandom(&mut bytes).is_err() {
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
    }
    bytes
}

// ============================================================================
// NodeId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn random() -> Self {
        Self(random_bytes())
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &hex::encode(self.0)[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

// ============================================================================
// PublicKey
// ============================================================================

/// An RSA public key in SubjectPublicKeyInfo DER form.
///
/// Construction through [`PublicKey::from_der`] validates the encoding, but keys
/// deserialized off the wire are only parsed when used, so every consumer goes
/// through [`PublicKey::to_rsa`] and handles the error.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        if der.len() > MAX_PUBLIC_KEY_DER_LEN {
            return Err(CryptoError::KeyEncoding);
        }
        RsaPublicKey::from_public_key_der(der).map_err(|_| CryptoError::KeyEncoding)?;
        Ok(Self(der.to_vec()))
    }

    fn from_rsa(key: &RsaPublicKey) -> Result<Self, CryptoError> {
        let der = key.to_public_key_der().map_err(|_| CryptoError::KeyEncoding)?;
        Ok(Self(der.as_bytes().to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn to_rsa(&self) -> Result<RsaPublicKey, CryptoError> {
        if self.0.len() > MAX_PUBLIC_KEY_DER_LEN {
            return Err(CryptoError::KeyEncoding);
        }
        RsaPublicKey::from_public_key_der(&self.0).map_err(|_| CryptoError::KeyEncoding)
    }

    /// Short SHA-256 fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(&self.0)[..8])
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

// ============================================================================
// PeerIdentity
// ============================================================================

pub struct PeerIdentity {
    node_id: NodeId,
    private_key: RsaPrivateKey,
    public_key: PublicKey,
}

impl PeerIdentity {
    /// Generate a fresh RSA-2048 keypair (e = 65537) and a random node id.
    ///
    /// Key generation takes hundreds of milliseconds; async callers should run
    /// it on the crypto pool or `spawn_blocking`.
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(|_| CryptoError::KeyGeneration)?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_key = PublicKey::from_rsa(&RsaPublicKey::from(&private_key))?;
        Ok(Self {
            node_id: NodeId::random(),
            private_key,
            public_key,
        })
    }

    /// Load the PKCS#8 PEM private key at `path`, or generate one and persist it.
    ///
    /// The node id is always fresh: it identifies this process, not the key.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read key file {}", path.display()))?;
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|_| CryptoError::KeyEncoding)
                .with_context(|| format!("invalid private key in {}", path.display()))?;
            let identity = Self::from_private_key(private_key)?;
            info!(path = %path.display(), key = %identity.public_key.fingerprint(), "loaded node key");
            return Ok(identity);
        }

        let identity = Self::generate()?;
        identity.write_key_file(path)?;
        info!(path = %path.display(), key = %identity.public_key.fingerprint(), "generated node key");
        Ok(identity)
    }

    fn write_key_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|_| CryptoError::KeyEncoding)?;

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .with_context(|| format!("failed to create key file {}", path.display()))?;
            file.write_all(pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        std::fs::write(path, pem.as_bytes())
            .with_context(|| format!("failed to write key file {}", path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The shareable half of the keypair.
    pub fn export_public(&self) -> PublicKey {
        self.public_key.clone()
    }

    /// RSASSA-PSS / SHA-256 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(data);
        self.private_key
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .map_err(|_| CryptoError::Signing)
    }

    /// Unwrap an RSA-OAEP wrapped key. Failure carries no detail.
    pub(crate) fn unwrap_key(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Length in bytes of anything wrapped to this identity's key.
    pub(crate) fn modulus_len(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.private_key.size()
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Verify an RSASSA-PSS / SHA-256 signature.
///
/// Returns `false` for a foreign, corrupt or truncated key or signature.
pub fn verify(data: &[u8], signature: &[u8], public_key: &PublicKey) -> bool {
    if signature.is_empty() {
        return false;
    }
    let Ok(key) = public_key.to_rsa() else {
        return false;
    };
    let digest = Sha256::digest(data);
    key.verify(Pss::new::<Sha256>(), &digest, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = PeerIdentity::generate().expect("keygen");
        let message = b"hello collaborators";

        let signature = identity.sign(message).expect("sign");
        assert!(verify(message, &signature, &identity.export_public()));
        assert!(!verify(b"wrong message", &signature, &identity.export_public()));
    }

    #[test]
    fn single_bit_mutations_fail_verification() {
        let identity = PeerIdentity::generate().expect("keygen");
        let public_key = identity.export_public();
        let message = b"the quick brown fox".to_vec();
        let signature = identity.sign(&message).expect("sign");

        for bit in [0usize, 7, 13, 64, 151] {
            let mut tampered = message.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(!verify(&tampered, &signature, &public_key), "message bit {bit}");
        }

        for bit in [0usize, 9, 1000, 2047] {
            let mut tampered = signature.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(!verify(&message, &tampered, &public_key), "signature bit {bit}");
        }
    }

    #[test]
    fn verify_rejects_foreign_key_and_garbage() {
        let alice = PeerIdentity::generate().expect("keygen");
        let bob = PeerIdentity::generate().expect("keygen");
        let signature = alice.sign(b"payload").expect("sign");

        assert!(!verify(b"payload", &signature, &bob.export_public()));
        assert!(!verify(b"payload", &[], &alice.export_public()));
        assert!(!verify(b"payload", &signature[..10], &alice.export_public()));

        let garbage: PublicKey = bincode::deserialize(&bincode::serialize(&vec![1u8, 2, 3]).unwrap()).unwrap();
        assert!(!verify(b"payload", &signature, &garbage));
        assert!(PublicKey::from_der(&[1, 2, 3]).is_err());
    }

    #[test]
    fn node_ids_are_unique_and_hex_round_trip() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
        assert_eq!(NodeId::from_hex(&a.to_hex()).unwrap(), a);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn key_file_is_reused_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.pem");

        let first = PeerIdentity::load_or_generate(&path).expect("generate");
        let second = PeerIdentity::load_or_generate(&path).expect("load");

        assert_eq!(first.export_public(), second.export_public());
        assert_ne!(first.node_id(), second.node_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
