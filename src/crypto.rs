//! # Cryptographic Infrastructure
//!
//! - **Hybrid envelopes**: [`HybridCipher`] wraps a fresh AES-256 key with RSA-OAEP
//!   for a recipient and encrypts the payload with AES-256-CBC (PKCS#7).
//! - **At-rest encryption**: [`LocalKey`] with [`seal_local`]/[`open_local`] for
//!   non-public files in the store.
//! - **Signatures**: domain-separated RSA-PSS over canonical byte strings.
//! - **Worker pool**: [`CryptoPool`] keeps RSA work off the async executor.
//! - **TLS**: self-signed Ed25519 transport certificates for QUIC.
//!
//! ## Hybrid Blob Layout
//!
//! ```text
//! [ wrapped_key (RSA modulus bytes, 256 for RSA-2048) | iv (16) | AES-256-CBC ciphertext ]
//! ```
//!
//! ## Transport Binding
//!
//! QUIC certificates carry an ephemeral Ed25519 key that is NOT the node identity.
//! The verifiers below only check that the certificate is well-formed; the binding
//! to a node happens in the signed handshake, which carries the transport key and
//! is checked against the certificate actually presented on the connection.
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` rustls APIs are used intentionally: trust comes from the RSA
//! handshake signature, not from a CA chain.

use std::sync::Arc;
use std::time::Duration;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use quinn::ClientConfig;
use rand::rngs::OsRng;
use rsa::Oaep;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::Sha256;
use tokio::sync::Semaphore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::identity::{random_bytes, PeerIdentity, PublicKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256 key length.
pub const AES_KEY_LEN: usize = 32;

/// CBC initialization vector length (one AES block).
pub const IV_LEN: usize = 16;

const AES_BLOCK_LEN: usize = 16;

// ============================================================================
// Error Types
// ============================================================================

/// Cryptographic failures. Variants never carry key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// RSA key generation failed.
    KeyGeneration,
    /// A key could not be encoded or decoded.
    KeyEncoding,
    /// Producing a signature failed.
    Signing,
    /// Wrapping a key or encrypting a payload failed.
    Encryption,
    /// Any failure to recover plaintext: bad wrapped key, layout or padding.
    Decryption,
    /// The worker pool was shut down before the job ran.
    PoolClosed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::KeyGeneration => write!(f, "key generation failed"),
            CryptoError::KeyEncoding => write!(f, "invalid key encoding"),
            CryptoError::Signing => write!(f, "signing failed"),
            CryptoError::Encryption => write!(f, "encryption failed"),
            CryptoError::Decryption => write!(f, "decryption failed"),
            CryptoError::PoolClosed => write!(f, "crypto worker pool closed"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Domain Separation
// ============================================================================
//
// SECURITY: Every signed structure carries its own prefix so a signature made
// for one purpose can never be replayed as another.

/// Domain separation prefix for envelope signatures.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"collabnet-envelope-v1:";

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

pub fn sign_with_domain(
    identity: &PeerIdentity,
    domain: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    identity.sign(&prefixed(domain, data))
}

pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> bool {
    crate::identity::verify(&prefixed(domain, data), signature, public_key)
}

// ============================================================================
// Symmetric Layer
// ============================================================================

/// A 256-bit AES key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct LocalKey([u8; AES_KEY_LEN]);

impl LocalKey {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; AES_KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::KeyEncoding)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalKey(..)")
    }
}

fn cbc_encrypt(key: &LocalKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.as_bytes().into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn cbc_decrypt(key: &LocalKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::Decryption)?;
    Aes256CbcDec::new(key.as_bytes().into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt `plaintext` at rest: `[iv | ciphertext]`.
pub fn seal_local(key: &LocalKey, plaintext: &[u8]) -> Vec<u8> {
    let iv: [u8; IV_LEN] = random_bytes();
    let ciphertext = cbc_encrypt(key, &iv, plaintext);
    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    blob
}

pub fn open_local(key: &LocalKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < IV_LEN + AES_BLOCK_LEN || (blob.len() - IV_LEN) % AES_BLOCK_LEN != 0 {
        return Err(CryptoError::Decryption);
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    cbc_decrypt(key, iv, ciphertext)
}

// ============================================================================
// Hybrid Cipher
// ============================================================================

/// RSA-OAEP key wrapping around AES-256-CBC payload encryption.
///
/// Key and IV are drawn inside [`HybridCipher::encrypt`]; there is no way for a
/// caller to supply them, so two encryptions of the same plaintext never match.
pub struct HybridCipher;

impl HybridCipher {
    pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
        let rsa_key = recipient.to_rsa()?;
        let key = LocalKey::generate();
        let iv: [u8; IV_LEN] = random_bytes();

        let wrapped = rsa_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;
        let ciphertext = cbc_encrypt(&key, &iv, plaintext);

        let mut blob = Vec::with_capacity(wrapped.len() + IV_LEN + ciphertext.len());
        blob.extend_from_slice(&wrapped);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Invert [`HybridCipher::encrypt`].
    ///
    /// SECURITY: When the wrapped key does not unwrap, a random key is substituted
    /// and CBC decryption still runs, so a bad key and bad padding fail the same way.
    pub fn decrypt(blob: &[u8], identity: &PeerIdentity) -> Result<Vec<u8>, CryptoError> {
        let wrapped_len = identity.modulus_len();
        let min_len = wrapped_len + IV_LEN + AES_BLOCK_LEN;
        if blob.len() < min_len || (blob.len() - wrapped_len - IV_LEN) % AES_BLOCK_LEN != 0 {
            return Err(CryptoError::Decryption);
        }

        let (wrapped, rest) = blob.split_at(wrapped_len);
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        let key = identity
            .unwrap_key(wrapped)
            .ok()
            .map(Zeroizing::new)
            .and_then(|bytes| LocalKey::from_slice(&bytes).ok());
        let key_ok = key.is_some();
        let key = key.unwrap_or_else(LocalKey::generate);

        let plaintext = cbc_decrypt(&key, iv, ciphertext);
        match (key_ok, plaintext) {
            (true, Ok(plaintext)) => Ok(plaintext),
            _ => Err(CryptoError::Decryption),
        }
    }
}

// ============================================================================
// Crypto Worker Pool
// ============================================================================

/// Bounded pool for CPU-bound crypto (keygen, sign, verify, hybrid encrypt/decrypt).
///
/// Jobs run on tokio's blocking threads; the semaphore caps how many run at once
/// so a burst of inbound frames cannot occupy every blocking thread.
#[derive(Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// One worker per available core.
    pub fn with_default_size() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(workers)
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, CryptoError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CryptoError::PoolClosed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|_| CryptoError::PoolClosed)
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

// ============================================================================
// Transport Certificates
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for every collabnet connection.
pub const ALPN: &[u8] = b"collabnet";

/// Server name presented on dial. Identity is established by the handshake.
pub const TLS_SERVER_NAME: &str = "collabnet";

/// QUIC idle timeout. Keep-alives keep established channels well inside it.
pub const QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Ephemeral Ed25519 key backing this process's QUIC certificate.
pub struct TransportKey {
    signing_key: SigningKey,
}

impl TransportKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// RFC 8410 PKCS#8 wrapping of the raw Ed25519 seed.
    fn to_pkcs8_der(&self) -> Zeroizing<Vec<u8>> {
        const PKCS8_PREFIX: [u8; 16] = [
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20,
        ];
        let mut der = Zeroizing::new(Vec::with_capacity(48));
        der.extend_from_slice(&PKCS8_PREFIX);
        der.extend_from_slice(&self.signing_key.to_bytes());
        der
    }
}

pub fn generate_transport_cert(
    key: &TransportKey,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let pkcs8 = key.to_pkcs8_der();
    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.to_vec());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(key.public_key_bytes())),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed transport certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8_der),
    ))
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.max_idle_timeout(Some(
        QUIC_IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of range")?,
    ));
    config.keep_alive_interval(Some(QUIC_KEEP_ALIVE));
    config.max_concurrent_bidi_streams(8u32.into());
    config.max_concurrent_uni_streams(0u32.into());
    Ok(config)
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS versions")?
        .with_client_cert_verifier(Arc::new(TransportCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));
    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TransportCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));
    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    key_bytes.as_ref().try_into().ok()
}

/// The Ed25519 key of the certificate the remote side presented on `connection`.
pub fn peer_transport_key(connection: &quinn::Connection) -> Option<[u8; 32]> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    extract_public_key_from_cert(certs.first()?.as_ref())
}

/// Accepts any well-formed Ed25519 certificate in both directions.
#[derive(Debug)]
struct TransportCertVerifier;

impl TransportCertVerifier {
    fn check(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        extract_public_key_from_cert(end_entity.as_ref())
            .map(|_| ())
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))
    }
}

impl rustls::server::danger::ClientCertVerifier for TransportCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Self::check(end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl rustls::client::danger::ServerCertVerifier for TransportCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Self::check(end_entity)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_round_trip() {
        let identity = PeerIdentity::generate().expect("keygen");
        let public_key = identity.export_public();

        let cases: [&[u8]; 4] = [b"", b"x", &[0xAB; 16], &[7u8; 5000]];
        for plaintext in cases {
            let blob = HybridCipher::encrypt(plaintext, &public_key).expect("encrypt");
            assert_eq!(HybridCipher::decrypt(&blob, &identity).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn hybrid_blob_layout_and_freshness() {
        let identity = PeerIdentity::generate().expect("keygen");
        let public_key = identity.export_public();
        let plaintext = b"same plaintext twice";

        let a = HybridCipher::encrypt(plaintext, &public_key).unwrap();
        let b = HybridCipher::encrypt(plaintext, &public_key).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[256..256 + IV_LEN], b[256..256 + IV_LEN]);

        // 256-byte wrapped key, 16-byte IV, one padded 32-byte ciphertext
        assert_eq!(a.len(), 256 + IV_LEN + 32);
    }

    #[test]
    fn hybrid_failures_are_indistinguishable() {
        let alice = PeerIdentity::generate().expect("keygen");
        let bob = PeerIdentity::generate().expect("keygen");
        let blob = HybridCipher::encrypt(b"for alice only", &alice.export_public()).unwrap();

        // wrong recipient
        assert_eq!(HybridCipher::decrypt(&blob, &bob), Err(CryptoError::Decryption));

        // corrupted wrapped key
        let mut bad_key = blob.clone();
        bad_key[10] ^= 0xFF;
        assert_eq!(HybridCipher::decrypt(&bad_key, &alice), Err(CryptoError::Decryption));

        // corrupted final block breaks the padding
        let mut bad_pad = blob.clone();
        let last = bad_pad.len() - 1;
        bad_pad[last] ^= 0xFF;
        assert!(HybridCipher::decrypt(&bad_pad, &alice).is_err());

        // truncated and misaligned blobs
        assert_eq!(HybridCipher::decrypt(&blob[..100], &alice), Err(CryptoError::Decryption));
        assert_eq!(
            HybridCipher::decrypt(&blob[..blob.len() - 1], &alice),
            Err(CryptoError::Decryption)
        );
    }

    #[test]
    fn local_seal_round_trip_and_wrong_key() {
        let key = LocalKey::generate();
        let blob = seal_local(&key, b"at rest");
        assert_eq!(open_local(&key, &blob).unwrap(), b"at rest");
        assert_ne!(seal_local(&key, b"at rest"), blob);

        let other = LocalKey::generate();
        // a wrong key almost always breaks the padding; if it happens not to,
        // the output still differs from the plaintext
        match open_local(&other, &blob) {
            Ok(pt) => assert_ne!(pt, b"at rest"),
            Err(e) => assert_eq!(e, CryptoError::Decryption),
        }
        assert!(open_local(&key, &blob[..IV_LEN]).is_err());
        assert!(LocalKey::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn domain_separation_blocks_cross_use() {
        let identity = PeerIdentity::generate().expect("keygen");
        let public_key = identity.export_public();
        let signature = sign_with_domain(&identity, ENVELOPE_SIGNATURE_DOMAIN, b"data").unwrap();

        assert!(verify_with_domain(&public_key, ENVELOPE_SIGNATURE_DOMAIN, b"data", &signature));
        assert!(!verify_with_domain(&public_key, b"other-domain:", b"data", &signature));
        assert!(!crate::identity::verify(b"data", &signature, &public_key));
    }

    #[test]
    fn certificate_carries_transport_key() {
        for _ in 0..10 {
            let key = TransportKey::generate();
            let (certs, _key) = generate_transport_cert(&key).expect("cert generation must succeed");
            let extracted = extract_public_key_from_cert(certs[0].as_ref())
                .expect("public key extraction must succeed");
            assert_eq!(extracted, key.public_key_bytes());
        }
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_reports_closure() {
        let pool = CryptoPool::new(2);
        let sum = pool.run(|| (1..=10).sum::<u32>()).await.unwrap();
        assert_eq!(sum, 55);

        pool.close();
        assert_eq!(pool.run(|| 1).await, Err(CryptoError::PoolClosed));
    }
}
