//! Cryptographic utilities for encrypting and decrypting sensitive data.
//!
//! Uses ChaCha20-Poly1305 AEAD (Authenticated Encryption with Associated Data)
//! for secure encryption with authentication. Keys and sensitive data are
//! automatically zeroed from memory when dropped using the `zeroize` crate.

use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use std::error::Error as StdError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
const KEY_LEN: usize = 32;

/// Size of nonce in bytes (96 bits)
const NONCE_LEN: usize = 12;

/// Size of authentication tag appended to ciphertext (128 bits)
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

/// Errors that can occur during cryptographic operations.
#[derive(Debug)]
pub enum CryptoError {
    /// Failed to generate random bytes from system entropy.
    RandomGeneration,
    /// Encryption operation failed.
    Encryption,
    /// Decryption operation failed (invalid ciphertext or authentication tag).
    Decryption,
    /// Invalid input format (e.g., ciphertext too short).
    InvalidFormat(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::RandomGeneration => write!(f, "failed to generate random bytes"),
            CryptoError::Encryption => write!(f, "encryption failed"),
            CryptoError::Decryption => write!(f, "decryption failed"),
            CryptoError::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl StdError for CryptoError {}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Encryption
    }
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

/// A cryptographic key that is automatically zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    #[zeroize(skip)]
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random encryption key using system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    /// Create an encryption key from existing bytes.
    ///
    /// # Security
    /// The input slice must be exactly 32 bytes. The caller is responsible
    /// for securely managing the source key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Use with caution - the returned slice exposes the raw key material.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Nonce Management
// ---------------------------------------------------------------------------

/// A nonce generator that creates a single random nonce.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl OneNonceSequence {
    fn new(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption/Decryption
// ---------------------------------------------------------------------------

/// Encrypt plaintext using ChaCha20-Poly1305 AEAD.
///
/// Returns a Vec containing: [nonce (12 bytes) || ciphertext || auth_tag (16 bytes)]
///
/// # Example
/// ```
/// use at_core::crypto::{EncryptionKey, encrypt};
///
/// let key = EncryptionKey::generate().unwrap();
/// let plaintext = b"secret data";
/// let ciphertext = encrypt(&key, plaintext).unwrap();
/// ```
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    // Generate random nonce
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    // Create sealing key
    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Encryption)?;
    let nonce_sequence = OneNonceSequence::new(nonce);
    let mut sealing_key = SealingKey::new(unbound_key, nonce_sequence);

    // Prepare buffer: plaintext + space for auth tag
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    // Prepend nonce to ciphertext+tag
    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&in_out);

    Ok(result)
}

/// Decrypt ciphertext using ChaCha20-Poly1305 AEAD.
///
/// Expects input format: [nonce (12 bytes) || ciphertext || auth_tag (16 bytes)]
///
/// # Example
/// ```
/// use at_core::crypto::{EncryptionKey, encrypt, decrypt};
///
/// let key = EncryptionKey::generate().unwrap();
/// let plaintext = b"secret data";
/// let ciphertext = encrypt(&key, plaintext).unwrap();
/// let decrypted = decrypt(&key, &ciphertext).unwrap();
/// assert_eq!(plaintext, &decrypted[..]);
/// ```
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    // Validate minimum length: nonce + tag
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_LEN + TAG_LEN,
            ciphertext.len()
        )));
    }

    // Extract nonce from first 12 bytes
    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("failed to extract nonce".into()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    // Create opening key
    let unbound_key =
        UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| CryptoError::Decryption)?;
    let nonce_sequence = OneNonceSequence::new(nonce);
    let mut opening_key = OpeningKey::new(unbound_key, nonce_sequence);

    // Decrypt ciphertext + tag (everything after nonce)
    let mut in_out = ciphertext[NONCE_LEN..].to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decryption)?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Public session identifiers
// ---------------------------------------------------------------------------

/// Derive a public-facing session id from an internal one: HMAC-SHA-256
/// keyed by `salt`, truncated to 16 hex characters. Deterministic so the
/// same internal id always maps to the same public id, but not invertible
/// without the salt.
pub fn hash_session_id(session_id: &str, salt: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, salt);
    let tag = hmac::sign(&key, session_id.as_bytes());
    tag.as_ref()[..8].iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
