//! TCP link to the tunnel server.
//!
//! Architecture:
//! - [`TcpConnector`] opens a TCP connection with a bounded wait and runs the
//!   key exchange: our public key goes out first, the server's comes back.
//! - [`TcpServerLink`] owns the connected stream together with the server's
//!   key, so a link can never exist without a key to encrypt for.
//!
//! # The handshake (for beginners)
//!
//! ```text
//! client                                 server
//!   | -- frame: client public key PEM --> |
//!   | <-- frame: server public key PEM -- |
//!   | -- frame: RSA-OAEP(chunk) --------> |   (repeated)
//! ```
//!
//! Nothing authenticates the keys; whoever answers on the server address is
//! trusted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};
use tunnel_core::protocol::{
    receive_frame, send_frame, send_frame_within, FrameError, Received, HANDSHAKE_TIMEOUT,
    SEND_TIMEOUT, SERVER_FULL_NOTICE,
};
use tunnel_core::{CryptoError, KeyPair, PeerKey};

use crate::application::link::{ChunkError, ChunkSink, Connector, Link, LinkError};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct TcpConnectorConfig {
    pub host: String,
    pub port: u16,
    /// Bound on the TCP connect itself.
    pub connect_timeout: Duration,
    /// Bound on waiting for the server's public key.
    pub handshake_timeout: Duration,
    /// Bound on writing one data frame; a server that stops reading breaks
    /// the link after this long.
    pub send_timeout: Duration,
}

impl TcpConnectorConfig {
    /// Connect timeout is half the retry interval, so a hung connect never
    /// delays the next attempt.
    pub fn new(host: impl Into<String>, port: u16, retry_interval: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: retry_interval / 2,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
        }
    }

    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Produces [`TcpServerLink`]s to one server.
pub struct TcpConnector {
    config: TcpConnectorConfig,
    keys: Arc<KeyPair>,
}

impl TcpConnector {
    pub fn new(config: TcpConnectorConfig, keys: Arc<KeyPair>) -> Self {
        Self { config, keys }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<PeerKey, LinkError> {
        let own_pem = self.keys.public().to_pem_bytes()?;
        send_frame(stream, &own_pem).await?;
        debug!("sent client public key ({} bytes)", own_pem.len());

        match receive_frame(stream, self.config.handshake_timeout).await {
            Ok(Received::Message(pem)) => {
                let key = PeerKey::from_pem_bytes(&pem).map_err(LinkError::InvalidPeerKey)?;
                if key.max_plaintext_len() == 0 {
                    return Err(LinkError::InvalidPeerKey(CryptoError::InvalidPublicKey(
                        format!("{}-bit key is too small to carry data", key.key_size_bytes() * 8),
                    )));
                }
                Ok(key)
            }
            Ok(Received::Empty) => Err(LinkError::HandshakeTimeout(self.config.handshake_timeout)),
            Ok(Received::Closed) => Err(LinkError::ClosedDuringHandshake),
            Err(FrameError::FrameTooLarge { declared, .. }) if is_capacity_notice(declared) => {
                Err(LinkError::ServerFull)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The server's rejection notice is raw text, so its first four bytes are read
/// as an absurd length prefix.
fn is_capacity_notice(declared: usize) -> bool {
    u32::try_from(declared)
        .map(|len| len.to_be_bytes()[..] == SERVER_FULL_NOTICE[..4])
        .unwrap_or(false)
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Link>, LinkError> {
        let target = self.config.target();
        let connect = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let mut stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(LinkError::ConnectFailed {
                    addr: target,
                    source,
                })
            }
            Err(_) => {
                return Err(LinkError::ConnectTimeout {
                    addr: target,
                    timeout: self.config.connect_timeout,
                })
            }
        };
        stream.set_nodelay(true).ok();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or(target);

        match self.handshake(&mut stream).await {
            Ok(peer_key) => {
                info!(
                    "handshake with {peer} complete ({}-bit server key)",
                    peer_key.key_size_bytes() * 8
                );
                Ok(Box::new(TcpServerLink {
                    stream,
                    peer_key,
                    peer,
                    send_timeout: self.config.send_timeout,
                }))
            }
            Err(e) => {
                stream.shutdown().await.ok();
                Err(e)
            }
        }
    }

    fn target(&self) -> String {
        self.config.target()
    }
}

/// A connected stream plus the key that data on it is encrypted for.
pub struct TcpServerLink {
    stream: TcpStream,
    peer_key: PeerKey,
    peer: String,
    send_timeout: Duration,
}

#[async_trait]
impl ChunkSink for TcpServerLink {
    async fn send_chunk(&mut self, plaintext: &[u8]) -> Result<(), ChunkError> {
        let ciphertext = self
            .peer_key
            .encrypt(plaintext)
            .map_err(ChunkError::Encrypt)?;
        send_frame_within(&mut self.stream, &ciphertext, self.send_timeout)
            .await
            .map_err(ChunkError::Transport)
    }
}

#[async_trait]
impl Link for TcpServerLink {
    fn max_chunk_len(&self) -> usize {
        self.peer_key.max_plaintext_len()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn close(&mut self) {
        self.stream.shutdown().await.ok();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
