//! One task per accepted connection.
//!
//! # Session phases (for beginners)
//!
//! 1. **Handshake.**  The client speaks first: one frame holding its public
//!    key as PEM.  The server stores it in the registry and answers with its
//!    own public key.  Anything other than a valid key within
//!    [`ServerSettings::handshake_timeout`](super::listener::ServerSettings)
//!    ends the session.
//! 2. **Relay.**  Frames are awaited in short slices so the session notices
//!    its stop flag or the global `running` flag promptly.  Each frame is
//!    decrypted with the server's private key and the plaintext is queued for
//!    the serial writer.  Keep-alives and empty plaintexts are dropped.
//! 3. **Teardown.**  The socket is shut down and the registry record removed,
//!    whatever the reason for ending.
//!
//! A frame that fails to decrypt is logged and skipped; the connection stays
//! up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use tunnel_core::protocol::{receive_frame, send_frame, FrameError, Received, KEEP_ALIVE_PAYLOAD};
use tunnel_core::{CryptoError, PeerKey};

use super::listener::ServerContext;
use crate::application::manage_clients::SessionId;

/// Why a session ended early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no client key within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("client disconnected during the handshake")]
    ClosedDuringHandshake,

    #[error("client sent an invalid public key")]
    InvalidClientKey(#[source] CryptoError),

    #[error("serial writer has stopped")]
    SerialWriterStopped,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Serves one connection to completion, then removes its registry record.
pub async fn run_session<S>(
    mut stream: S,
    id: SessionId,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    ctx: Arc<ServerContext>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match serve(&mut stream, id, addr, &stop, &ctx).await {
        Ok(()) => info!("[{addr}] session ended"),
        Err(e) => warn!("[{addr}] session ended: {e}"),
    }

    stream.shutdown().await.ok();
    ctx.registry.lock().await.remove(id);
}

async fn serve<S>(
    stream: &mut S,
    id: SessionId,
    addr: SocketAddr,
    stop: &AtomicBool,
    ctx: &ServerContext,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_key = receive_client_key(stream, ctx.settings.handshake_timeout).await?;
    info!(
        "[{addr}] client key received ({}-bit)",
        client_key.key_size_bytes() * 8
    );
    ctx.registry.lock().await.set_peer_key(id, client_key);

    let own_pem = ctx.keys.public().to_pem_bytes()?;
    send_frame(stream, &own_pem).await?;
    debug!("[{addr}] server key sent");

    while ctx.is_running() && !stop.load(Ordering::Relaxed) {
        let ciphertext = match receive_frame(stream, ctx.settings.session_poll).await? {
            Received::Empty => continue,
            Received::Closed => {
                info!("[{addr}] client disconnected");
                return Ok(());
            }
            Received::Message(ciphertext) => ciphertext,
        };

        let plaintext = match ctx.keys.decrypt(&ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("[{addr}] decrypt failed; message dropped: {e}");
                continue;
            }
        };

        if plaintext.is_empty() {
            debug!("[{addr}] empty message dropped");
            continue;
        }
        if plaintext == KEEP_ALIVE_PAYLOAD {
            debug!("[{addr}] keep-alive");
            continue;
        }

        debug!("[{addr}] {} bytes for serial", plaintext.len());
        if !ctx.serial.write(plaintext).await {
            return Err(SessionError::SerialWriterStopped);
        }
    }

    Ok(())
}

async fn receive_client_key<S>(stream: &mut S, wait: Duration) -> Result<PeerKey, SessionError>
where
    S: AsyncRead + Unpin,
{
    match receive_frame(stream, wait).await? {
        Received::Message(pem) => {
            PeerKey::from_pem_bytes(&pem).map_err(SessionError::InvalidClientKey)
        }
        Received::Empty => Err(SessionError::HandshakeTimeout(wait)),
        Received::Closed => Err(SessionError::ClosedDuringHandshake),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
