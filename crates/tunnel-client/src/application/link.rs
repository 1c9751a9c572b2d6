//! Ports between the session loop and the network.
//!
//! The session loop never touches a socket directly.  It asks a
//! [`Connector`] for a [`Link`] (a connected, handshaken channel to the
//! server) and pushes plaintext chunks into it.  The infrastructure layer
//! provides the TCP implementation; tests provide in-memory ones.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tunnel_core::{CryptoError, FrameError};

/// Why a chunk could not be delivered.
///
/// The two variants drive different recovery: a transport failure keeps the
/// data for the next connection, an encryption failure discards it.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("could not encrypt chunk: {0}")]
    Encrypt(#[source] CryptoError),

    #[error("could not send chunk: {0}")]
    Transport(#[source] FrameError),
}

/// Errors raised while establishing a link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to server at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("server did not send its public key within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("server closed the connection during the handshake")]
    ClosedDuringHandshake,

    #[error("server refused the connection: it is at capacity")]
    ServerFull,

    #[error("server sent an unusable public key: {0}")]
    InvalidPeerKey(#[source] CryptoError),

    #[error("handshake transport error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Something that accepts plaintext chunks for delivery.
#[async_trait]
pub trait ChunkSink: Send {
    /// Encrypts and sends one chunk of at most the link's chunk bound.
    async fn send_chunk(&mut self, plaintext: &[u8]) -> Result<(), ChunkError>;
}

/// A connected, handshaken channel to the server.
#[async_trait]
pub trait Link: ChunkSink {
    /// Largest plaintext chunk the peer's key can carry.
    fn max_chunk_len(&self) -> usize;

    /// Peer description for log messages.
    fn peer(&self) -> String;

    /// Closes the underlying connection.  Errors are ignored.
    async fn close(&mut self);
}

/// Establishes links to one configured server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and completes the key exchange.
    async fn connect(&self) -> Result<Box<dyn Link>, LinkError>;

    /// Target description for log messages, e.g. `127.0.0.1:8000`.
    fn target(&self) -> String;
}
