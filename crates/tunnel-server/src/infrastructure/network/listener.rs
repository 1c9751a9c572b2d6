//! Accept loop and admission control.
//!
//! The listener waits for connections in bounded slices of
//! [`ServerSettings::accept_poll`] so it notices the `running` flag going
//! false within one slice.  Each accepted connection is either:
//!
//! - **admitted**: a record is registered and a session task spawned, both
//!   while the registry lock is held, or
//! - **rejected**: the server is at capacity, so the plain-text
//!   [`SERVER_FULL_NOTICE`] is written and the socket closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use tunnel_core::protocol::{HANDSHAKE_TIMEOUT, SERVER_FULL_NOTICE};
use tunnel_core::KeyPair;

use super::session::run_session;
use crate::application::manage_clients::ClientRegistry;
use crate::infrastructure::serial_writer::{SerialWriterHandle, SERIAL_RETRY_INTERVAL};

/// How long a rejected peer gets to read the notice before the socket is
/// dropped.
const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Tunables for the listener and its sessions.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_clients: usize,
    /// Longest single wait on `accept`.
    pub accept_poll: Duration,
    /// Longest single wait for the next frame inside a session.
    pub session_poll: Duration,
    /// Bound on waiting for the client's public key.
    pub handshake_timeout: Duration,
    /// Pause after an accept error.
    pub error_backoff: Duration,
    /// Minimum time between serial open attempts.
    pub serial_retry: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_clients: 5,
            accept_poll: Duration::from_secs(1),
            session_poll: Duration::from_millis(100),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            error_backoff: Duration::from_secs(1),
            serial_retry: SERIAL_RETRY_INTERVAL,
        }
    }
}

/// Everything a listener or session task needs, shared behind one `Arc`.
pub struct ServerContext {
    pub keys: Arc<KeyPair>,
    pub registry: Arc<Mutex<ClientRegistry>>,
    pub serial: SerialWriterHandle,
    pub running: Arc<AtomicBool>,
    pub settings: ServerSettings,
}

impl ServerContext {
    pub fn new(
        keys: Arc<KeyPair>,
        serial: SerialWriterHandle,
        running: Arc<AtomicBool>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            keys,
            registry: Arc::new(Mutex::new(ClientRegistry::new(settings.max_clients))),
            serial,
            running,
            settings,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Accepts connections until `ctx.running` goes false, then drops the
/// listening socket.
pub async fn run_listener(listener: TcpListener, ctx: Arc<ServerContext>) {
    match listener.local_addr() {
        Ok(addr) => info!("listening on {addr}"),
        Err(e) => warn!("listening on an unknown address: {e}"),
    }

    while ctx.is_running() {
        match timeout(ctx.settings.accept_poll, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, addr))) => admit(stream, addr, &ctx).await,
            Ok(Err(e)) => {
                if !ctx.is_running() {
                    break;
                }
                error!("accept error: {e}");
                sleep(ctx.settings.error_backoff).await;
            }
        }
    }

    info!("listener stopped");
}

async fn admit(stream: TcpStream, addr: SocketAddr, ctx: &Arc<ServerContext>) {
    stream.set_nodelay(true).ok();

    let mut registry = ctx.registry.lock().await;
    let Some((id, stop)) = registry.try_register(addr) else {
        let max = registry.max_clients();
        drop(registry);
        warn!("[{addr}] rejected: server full ({max} clients)");
        tokio::spawn(reject(stream, addr));
        return;
    };

    let task = tokio::spawn(run_session(stream, id, addr, stop, Arc::clone(ctx)));
    registry.attach_task(id, task);
    info!(
        "[{addr}] connected ({}/{} clients)",
        registry.len(),
        registry.max_clients()
    );
}

/// Writes the capacity notice, half-closes, and drains whatever the peer
/// already sent so the close is a FIN rather than a reset.
async fn reject(mut stream: TcpStream, addr: SocketAddr) {
    let notice = async {
        stream.write_all(SERVER_FULL_NOTICE).await?;
        stream.shutdown().await
    };
    if let Err(e) = timeout(REJECT_LINGER, notice)
        .await
        .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
    {
        debug!("[{addr}] could not deliver capacity notice: {e}");
        return;
    }

    let mut sink = [0u8; 1024];
    let drain = async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    };
    timeout(REJECT_LINGER, drain).await.ok();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
