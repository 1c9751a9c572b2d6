//! Network infrastructure for the server.
//!
//! # Sub-modules
//!
//! - **`listener`** – Bounded accept loop, admission control against the
//!   client limit, and the shared [`ServerContext`].
//!
//! - **`session`** – Per-connection task: key exchange, then decrypt and hand
//!   each message to the serial writer.
//!
//! [`RelayServer`] ties them together with the serial writer and owns the
//! shutdown order: listener first, then sessions, then the writer.

pub mod listener;
pub mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use tunnel_core::{KeyPair, SerialOpener};

pub use listener::{ServerContext, ServerSettings};

use crate::application::manage_clients::ClientSummary;
use crate::infrastructure::serial_writer::spawn_serial_writer;

/// Time the listener gets to notice shutdown.
const LISTENER_JOIN: Duration = Duration::from_secs(3);
/// Time each session gets to notice its stop flag.
const SESSION_JOIN: Duration = Duration::from_secs(1);
/// Time the serial writer gets to flush its queue.
const WRITER_JOIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A running server: listener, sessions and serial writer.
pub struct RelayServer {
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    listener_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl RelayServer {
    /// Binds `host:port` and starts serving.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn start(
        host: &str,
        port: u16,
        settings: ServerSettings,
        keys: Arc<KeyPair>,
        opener: Arc<dyn SerialOpener>,
    ) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        };
        let listener = TcpListener::bind((host, port)).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let (serial, writer_task) = spawn_serial_writer(opener, settings.serial_retry);
        let ctx = Arc::new(ServerContext::new(
            keys,
            serial,
            Arc::new(AtomicBool::new(true)),
            settings,
        ));
        let listener_task = tokio::spawn(listener::run_listener(listener, Arc::clone(&ctx)));

        Ok(Self {
            local_addr,
            ctx,
            listener_task,
            writer_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Current connections, ordered by address.
    pub async fn clients(&self) -> Vec<ClientSummary> {
        self.ctx.registry.lock().await.snapshot()
    }

    /// Stops accepting, ends every session, then stops the serial writer.
    pub async fn stop(self) {
        let Self {
            ctx,
            mut listener_task,
            writer_task,
            ..
        } = self;

        ctx.running.store(false, Ordering::Relaxed);
        if timeout(LISTENER_JOIN, &mut listener_task).await.is_err() {
            warn!("listener did not stop within {LISTENER_JOIN:?}; aborting");
            listener_task.abort();
            listener_task.await.ok();
        }

        let records = ctx.registry.lock().await.drain();
        for record in &records {
            record.stop.store(true, Ordering::Relaxed);
        }
        for record in records {
            let Some(mut task) = record.task else {
                continue;
            };
            if timeout(SESSION_JOIN, &mut task).await.is_err() {
                warn!("[{}] session did not stop in time; aborting", record.address);
                task.abort();
                task.await.ok();
            }
        }

        // The writer ends once the last queue handle, held by the context, is gone.
        drop(ctx);
        if timeout(WRITER_JOIN, writer_task).await.is_err() {
            warn!("serial writer did not stop within {WRITER_JOIN:?}");
        }
        info!("server stopped");
    }
}
