//! # tunnel-core
//!
//! Shared library for Serial Tunnel containing the wire framing, the RSA-OAEP
//! cipher context, the on-disk key store, the serial port abstraction and the
//! configuration helpers used by both binaries.
//!
//! # Architecture overview (for beginners)
//!
//! Serial Tunnel moves the byte stream coming out of a local serial port on one
//! machine (the "client") across TCP to another machine (the "server"), which
//! writes the bytes to its own serial port.  Every chunk is encrypted with the
//! receiver's RSA public key, so the TCP link carries nothing readable.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over TCP.  Every message is a 4-byte
//!   big-endian length followed by that many payload bytes.
//!
//! - **`crypto`** – RSA-OAEP (SHA-256) encryption with a peer's public key,
//!   decryption with our own private key, and PEM persistence of key pairs.
//!
//! - **`serial`** – A small trait over "a serial port we can read from and
//!   write to", with a real implementation backed by the `serialport` crate and
//!   an in-memory mock for tests.
//!
//! - **`settings`** – Configuration sections shared by client and server and
//!   the helpers that find, load and save TOML config files.

pub mod crypto;
pub mod protocol;
pub mod serial;
pub mod settings;

pub use crypto::keystore::{KeyStore, KeyStoreError, Role};
pub use crypto::{max_oaep_plaintext_len, CryptoError, KeyPair, PeerKey};
pub use protocol::framing::{
    decode_frame, encode_frame, receive_frame, send_frame, send_frame_within, FrameError, Received,
};
pub use serial::{SerialChannel, SerialError, SerialOpener};
pub use settings::{ConfigError, KeySettings, SerialSettings};
