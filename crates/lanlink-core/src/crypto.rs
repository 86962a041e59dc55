//! Link session cryptography.
//!
//! Every device holds a long-term x25519 identity keypair. A link is
//! upgraded from cleartext by running ECDH between our identity secret and
//! the peer's identity public key (taken from its identity record), then
//! deriving a ChaCha20-Poly1305 session cipher from the shared secret.
//!
//! Both directions share one session key, so nonces are scoped by a
//! per-direction domain in addition to a monotonically increasing sequence
//! number: the initiator seals with domain 1 and opens with domain 2, the
//! acceptor the other way around. A given (domain, sequence) pair is never
//! reused under one key.
//!
//! Encrypted records travel as base64 ciphertext lines, keeping the wire
//! line-delimited before and after the upgrade.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of the ChaCha20-Poly1305 nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Context string mixed into the session key derivation.
const SESSION_CONTEXT: &[u8] = b"lanlink session v1";

/// Nonce domain for records sealed by the link initiator.
const DOMAIN_INITIATOR: u32 = 1;

/// Nonce domain for records sealed by the link acceptor.
const DOMAIN_ACCEPTOR: u32 = 2;

/// Errors from key handling and the session cipher.
#[derive(Debug, Error, PartialEq)]
pub enum CryptoError {
    /// A key field was not valid base64 or had the wrong length.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("failed to seal record")]
    Seal,

    /// Decryption or authentication failed.
    #[error("failed to open record")]
    Open,
}

/// Which end of the link we are. Decides the nonce domains of the two
/// directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// The side that dialed the connection.
    Initiator,
    /// The side that accepted the connection.
    Acceptor,
}

/// Long-term x25519 identity keypair.
pub struct IdentityKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeypair {
    /// Generates a fresh identity keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restores a keypair from a base64 secret previously produced by
    /// [`IdentityKeypair::secret_base64`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for bad base64 or wrong length.
    pub fn from_secret_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = decode_key_bytes(encoded)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Base64 form of the secret key, for persistence.
    pub fn secret_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// Base64 form of the public key, as advertised in identity records.
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Colon-hex SHA-256 fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }

    /// Runs ECDH against a peer's base64 identity public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the peer key cannot be
    /// decoded.
    pub fn shared_secret(&self, peer_public_base64: &str) -> Result<[u8; 32], CryptoError> {
        let peer = PublicKey::from(decode_key_bytes(peer_public_base64)?);
        Ok(self.secret.diffie_hellman(&peer).to_bytes())
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("IdentityKeypair")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Colon-hex SHA-256 fingerprint of arbitrary key bytes, e.g.
/// `"ab:34:…"`. Used in trust records and security logs.
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(key_bytes);
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decodes a base64 32-byte key.
fn decode_key_bytes(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes".to_string()))
}

/// Derives the two directional halves of a link session cipher.
///
/// Both ends call this with the same shared secret and their own role and
/// end up with complementary sealer/opener pairs.
pub fn derive_session(shared_secret: &[u8; 32], role: LinkRole) -> (SessionSealer, SessionOpener) {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(SESSION_CONTEXT);
    let key_bytes = hasher.finalize();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key_bytes.as_slice()));

    let (send_domain, recv_domain) = match role {
        LinkRole::Initiator => (DOMAIN_INITIATOR, DOMAIN_ACCEPTOR),
        LinkRole::Acceptor => (DOMAIN_ACCEPTOR, DOMAIN_INITIATOR),
    };

    (
        SessionSealer {
            cipher: cipher.clone(),
            domain: send_domain,
            sequence: 0,
        },
        SessionOpener {
            cipher,
            domain: recv_domain,
            sequence: 0,
        },
    )
}

/// Builds a nonce from the direction domain and record sequence number.
fn nonce_from(domain: u32, sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..4].copy_from_slice(&domain.to_be_bytes());
    nonce[4..12].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Outbound half of a session cipher: seals records in submission order.
pub struct SessionSealer {
    cipher: ChaCha20Poly1305,
    domain: u32,
    sequence: u64,
}

impl SessionSealer {
    /// Encrypts one record and frames it as a base64 line.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Seal`] if encryption fails.
    pub fn seal_record(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = nonce_from(self.domain, self.sequence);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), record)
            .map_err(|_| CryptoError::Seal)?;
        self.sequence = self.sequence.wrapping_add(1);

        let mut line = BASE64.encode(ciphertext).into_bytes();
        line.push(b'\n');
        Ok(line)
    }
}

/// Inbound half of a session cipher: opens records in arrival order.
///
/// The stream transport delivers records in order, so the opener tracks
/// the peer's sequence implicitly; a dropped or reordered record makes
/// authentication fail, which tears the link down.
pub struct SessionOpener {
    cipher: ChaCha20Poly1305,
    domain: u32,
    sequence: u64,
}

impl SessionOpener {
    /// Decrypts one base64 ciphertext line back into a record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Open`] on bad base64, tampering, truncation,
    /// or out-of-sequence input.
    pub fn open_record(&mut self, line: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let trimmed = match line.last() {
            Some(b'\n') => &line[..line.len() - 1],
            _ => line,
        };
        let ciphertext = BASE64.decode(trimmed).map_err(|_| CryptoError::Open)?;

        let nonce = nonce_from(self.domain, self.sequence);
        let record = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Open)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(record)
    }
}
