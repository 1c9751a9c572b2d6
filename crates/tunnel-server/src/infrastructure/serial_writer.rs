//! The server's single serial writer.
//!
//! Every session hands its decrypted bytes to one writer running on tokio's
//! blocking pool.  Owning the port in one place means messages from different
//! clients are written whole, one after another, never interleaved.
//!
//! If the port is missing, messages are dropped (and logged) rather than
//! queued, and reopening is attempted at most once per
//! [`SERIAL_RETRY_INTERVAL`].  A failed or short write closes the port; the
//! message that failed is lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tunnel_core::{SerialChannel, SerialOpener};

/// Minimum time between attempts to open a missing serial port.
pub const SERIAL_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Messages that may wait for the writer before sessions are slowed down.
pub const WRITE_QUEUE_DEPTH: usize = 256;

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The port is not open and could not be (re)opened right now.
    DroppedUnavailable,
    /// The write failed or was short; the port has been closed.
    DroppedWriteFailed,
}

/// Owns the serial channel and the reopen schedule.
pub struct SerialWriter {
    opener: Arc<dyn SerialOpener>,
    channel: Option<Box<dyn SerialChannel>>,
    retry_interval: Duration,
    next_open_attempt: Instant,
}

impl SerialWriter {
    pub fn new(opener: Arc<dyn SerialOpener>, retry_interval: Duration) -> Self {
        Self {
            opener,
            channel: None,
            retry_interval,
            next_open_attempt: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Opens the port if it is closed and an attempt is due.
    ///
    /// Returns whether the port is open afterwards.
    pub fn ensure_open(&mut self) -> bool {
        if self.channel.is_some() {
            return true;
        }
        let now = Instant::now();
        if now < self.next_open_attempt {
            return false;
        }

        match self.opener.open() {
            Ok(channel) => {
                info!("serial port {} opened", self.opener.describe());
                self.channel = Some(channel);
                true
            }
            Err(e) => {
                warn!("serial port unavailable: {e}");
                self.next_open_attempt = now + self.retry_interval;
                false
            }
        }
    }

    /// Writes one message in full, or drops it.
    pub fn write_message(&mut self, bytes: &[u8]) -> WriteOutcome {
        if !self.ensure_open() {
            warn!("serial port closed; dropped {} bytes", bytes.len());
            return WriteOutcome::DroppedUnavailable;
        }
        let Some(channel) = self.channel.as_mut() else {
            return WriteOutcome::DroppedUnavailable;
        };

        match channel.write(bytes) {
            Ok(n) if n == bytes.len() => {
                debug!("wrote {n} bytes to serial");
                WriteOutcome::Written
            }
            Ok(n) => {
                error!(
                    "short serial write ({n} of {} bytes); closing port",
                    bytes.len()
                );
                self.channel = None;
                WriteOutcome::DroppedWriteFailed
            }
            Err(e) => {
                error!("serial write failed; closing port: {e}");
                self.channel = None;
                WriteOutcome::DroppedWriteFailed
            }
        }
    }

    /// Closes the port.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            info!("serial port closed");
        }
    }
}

/// Cloneable sender side of the writer queue.
#[derive(Debug, Clone)]
pub struct SerialWriterHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SerialWriterHandle {
    /// Queues a message for the writer.
    ///
    /// Waits while the queue is full.  Returns `false` if the writer has
    /// stopped.
    pub async fn write(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(bytes).await.is_ok()
    }
}

/// Starts the writer on the blocking pool.
///
/// The port is opened immediately.  The writer stops once every
/// [`SerialWriterHandle`] has been dropped and the queue is empty.
pub fn spawn_serial_writer(
    opener: Arc<dyn SerialOpener>,
    retry_interval: Duration,
) -> (SerialWriterHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
    let mut writer = SerialWriter::new(opener, retry_interval);

    let task = tokio::task::spawn_blocking(move || {
        writer.ensure_open();
        while let Some(message) = rx.blocking_recv() {
            writer.write_message(&message);
        }
        writer.close();
    });

    (SerialWriterHandle { tx }, task)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
