//! Wire protocol: length-prefixed frames and the constants both peers agree on.
//!
//! A connection starts with a key exchange (client public key first, server
//! public key second, each as one frame of PEM text).  After that every frame
//! carries one RSA-OAEP ciphertext.

use std::time::Duration;

pub mod framing;

pub use framing::{
    decode_frame, encode_frame, receive_frame, send_frame, send_frame_within, FrameError, Received,
    BODY_READ_TIMEOUT, HEADER_SIZE, MAX_FRAME_LEN, SEND_TIMEOUT,
};

/// Plaintext the client encrypts and sends when the link has been idle.
///
/// It carries no type tag: the server drops any plaintext equal to these four
/// bytes, so the client never sends a data chunk that is exactly four zero
/// bytes.
pub const KEEP_ALIVE_PAYLOAD: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// How long either side waits for the peer's public key during the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain (unencrypted, unframed) notice written to a connection refused
/// because the server is at capacity.
pub const SERVER_FULL_NOTICE: &[u8] = b"ERROR: server full.\n";
