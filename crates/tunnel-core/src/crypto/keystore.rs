//! On-disk persistence of RSA key pairs.
//!
//! Each role keeps two PEM files in the key directory:
//!
//! ```text
//! {role}_private_key.pem   PKCS#8, unencrypted
//! {role}_public_key.pem    SubjectPublicKeyInfo
//! ```
//!
//! where `{role}` is `client` or `server`.  Keys are generated on first start
//! and reused afterwards, so a peer that pins a public key keeps working
//! across restarts.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{info, warn};

use super::{CryptoError, KeyPair, PeerKey};

/// Which binary a key pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// File-name prefix for this role's key files.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while reading or writing key files.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key in {path}: {reason}")]
    InvalidPrivateKey { path: PathBuf, reason: String },

    #[error("invalid public key in {path}: {source}")]
    InvalidPublicKey {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A directory holding the PEM key files for one or both roles.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_key_path(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{role}_private_key.pem"))
    }

    pub fn public_key_path(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{role}_public_key.pem"))
    }

    /// Loads the PKCS#8 private key for `role`.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError`] if the file exists but cannot be read or parsed.
    pub fn load_private_key(&self, role: Role) -> Result<Option<RsaPrivateKey>, KeyStoreError> {
        let path = self.private_key_path(role);
        let Some(pem) = read_if_exists(&path)? else {
            return Ok(None);
        };
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .map(Some)
            .map_err(|e| KeyStoreError::InvalidPrivateKey {
                path,
                reason: e.to_string(),
            })
    }

    /// Loads the SPKI public key for `role`.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError`] if the file exists but cannot be read or parsed.
    pub fn load_public_key(&self, role: Role) -> Result<Option<PeerKey>, KeyStoreError> {
        let path = self.public_key_path(role);
        let Some(pem) = read_if_exists(&path)? else {
            return Ok(None);
        };
        PeerKey::from_pem_bytes(pem.as_bytes())
            .map(Some)
            .map_err(|source| KeyStoreError::InvalidPublicKey { path, source })
    }

    /// Generates a new key pair for `role` and writes both PEM files,
    /// replacing any existing ones.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError`] if generation fails or the files cannot be
    /// written.
    pub fn generate_keys(&self, role: Role, bits: usize) -> Result<KeyPair, KeyStoreError> {
        info!("generating {bits}-bit RSA key pair for {role}");
        let pair = KeyPair::generate(bits)?;

        std::fs::create_dir_all(&self.dir).map_err(|source| KeyStoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let private_pem = pair
            .private_key()
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Encode(e.to_string()))?;
        let private_path = self.private_key_path(role);
        write_file(&private_path, private_pem.as_bytes())?;
        restrict_permissions(&private_path)?;

        let public_pem = pair.public().to_pem_bytes()?;
        write_file(&self.public_key_path(role), &public_pem)?;

        info!("saved {role} keys to {}", self.dir.display());
        Ok(pair)
    }

    /// Loads the key pair for `role`, generating and saving a new one if either
    /// file is missing, unreadable, or the two halves do not match.
    ///
    /// An existing pair is reused even if its size differs from `bits`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError`] only when a fresh pair cannot be generated or
    /// saved.
    pub fn load_or_generate(&self, role: Role, bits: usize) -> Result<KeyPair, KeyStoreError> {
        match (self.load_private_key(role), self.load_public_key(role)) {
            (Ok(Some(private)), Ok(Some(public))) => {
                let pair = KeyPair::from_private(private);
                if pair.public() == &public {
                    info!(
                        "loaded {}-bit {role} keys from {}",
                        pair.key_size_bits(),
                        self.dir.display()
                    );
                    return Ok(pair);
                }
                warn!("{role} public key does not match its private key; regenerating");
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("could not load {role} keys ({e}); regenerating");
            }
            _ => {
                info!("no {role} keys in {}", self.dir.display());
            }
        }
        self.generate_keys(role, bits)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn read_if_exists(path: &Path) -> Result<Option<String>, KeyStoreError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), KeyStoreError> {
    std::fs::write(path, bytes).map_err(|source| KeyStoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), KeyStoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), KeyStoreError> {
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
