//! RSA-OAEP cipher context.
//!
//! Every data chunk on the wire is one RSA-OAEP ciphertext produced with the
//! *receiver's* public key, using SHA-256 both as the OAEP hash and inside
//! MGF1, with an empty label.  There is no symmetric session key.
//!
//! # How big can a chunk be? (for beginners)
//!
//! OAEP padding eats `2 * hash_len + 2` bytes of every RSA block.  With SHA-256
//! (32-byte hash) and a 2048-bit (256-byte) key that leaves `256 - 66 = 190`
//! bytes of plaintext per ciphertext, which is why the client cuts its outbound
//! buffer into chunks of at most 190 bytes.

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

pub mod keystore;

/// Output size of SHA-256, the OAEP and MGF1 hash.
pub const OAEP_HASH_LEN: usize = 32;

/// Errors produced by the cipher context.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The plaintext does not fit in a single OAEP block for this key.
    #[error("plaintext of {len} bytes exceeds the {max}-byte OAEP limit for this key")]
    PlaintextTooLong { len: usize, max: usize },

    /// Empty plaintexts are never put on the wire.
    #[error("refusing to encrypt an empty plaintext")]
    EmptyPlaintext,

    /// The RSA primitive failed while encrypting.
    #[error("encryption failed: {0}")]
    Encrypt(#[source] rsa::Error),

    /// Wrong key, corrupted ciphertext or bad padding.
    #[error("decryption failed: {0}")]
    Decrypt(#[source] rsa::Error),

    /// The peer's PEM text could not be parsed as an SPKI public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A key could not be serialized to PEM.
    #[error("failed to encode key as PEM: {0}")]
    Encode(String),

    /// Generating a fresh key pair failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Largest plaintext a single RSA-OAEP/SHA-256 ciphertext can carry for a key
/// whose modulus is `key_size_bytes` long.
///
/// # Examples
///
/// ```rust
/// use tunnel_core::crypto::max_oaep_plaintext_len;
///
/// assert_eq!(max_oaep_plaintext_len(256), 190);
/// assert_eq!(max_oaep_plaintext_len(512), 446);
/// ```
pub fn max_oaep_plaintext_len(key_size_bytes: usize) -> usize {
    key_size_bytes.saturating_sub(2 * OAEP_HASH_LEN + 2)
}

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// The other side's public key, received during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKey {
    key: RsaPublicKey,
}

impl PeerKey {
    /// Wraps an already-parsed public key.
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Parses PEM-encoded SubjectPublicKeyInfo bytes, as sent in a handshake frame.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not UTF-8 PEM
    /// text holding an RSA public key.
    pub fn from_pem_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(format!("not UTF-8: {e}")))?;
        let key = RsaPublicKey::from_public_key_pem(text)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Serializes the key as PEM SubjectPublicKeyInfo bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encode`] if serialization fails.
    pub fn to_pem_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map(String::into_bytes)
            .map_err(|e| CryptoError::Encode(e.to_string()))
    }

    /// Modulus size in bytes (256 for a 2048-bit key).
    pub fn key_size_bytes(&self) -> usize {
        self.key.size()
    }

    /// Largest plaintext [`PeerKey::encrypt`] accepts.
    pub fn max_plaintext_len(&self) -> usize {
        max_oaep_plaintext_len(self.key_size_bytes())
    }

    /// Encrypts one chunk for the holder of the matching private key.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::EmptyPlaintext`] for an empty input.
    /// - [`CryptoError::PlaintextTooLong`] above [`PeerKey::max_plaintext_len`].
    /// - [`CryptoError::Encrypt`] if the RSA primitive fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::EmptyPlaintext);
        }
        let max = self.max_plaintext_len();
        if plaintext.len() > max {
            return Err(CryptoError::PlaintextTooLong {
                len: plaintext.len(),
                max,
            });
        }
        self.key
            .encrypt(&mut OsRng, oaep(), plaintext)
            .map_err(CryptoError::Encrypt)
    }

    /// The underlying `rsa` key.
    pub fn as_rsa(&self) -> &RsaPublicKey {
        &self.key
    }
}

/// Our own private key plus its public half.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: PeerKey,
}

impl KeyPair {
    /// Generates a fresh key pair with a modulus of `bits` bits.
    ///
    /// This takes a noticeable amount of time (hundreds of milliseconds for
    /// 2048 bits in an optimised build).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyGeneration`] if `bits` is unusable.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(CryptoError::KeyGeneration)?;
        Ok(Self::from_private(private))
    }

    /// Builds a key pair from an existing private key, deriving the public half.
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = PeerKey::new(RsaPublicKey::from(&private));
        Self { private, public }
    }

    /// Our public key, as sent to the peer during the handshake.
    pub fn public(&self) -> &PeerKey {
        &self.public
    }

    /// The private half, for persistence.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Modulus size in bits.
    pub fn key_size_bits(&self) -> usize {
        self.public.key_size_bytes() * 8
    }

    /// Decrypts one ciphertext produced with our public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decrypt`] for a wrong key, a corrupted
    /// ciphertext or invalid padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(oaep(), ciphertext)
            .map_err(CryptoError::Decrypt)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &self.key_size_bits())
            .field("private", &"<redacted>")
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
