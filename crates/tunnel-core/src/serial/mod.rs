//! Serial port abstraction.
//!
//! The client reads from a serial port and the server writes to one.  Both
//! go through [`SerialChannel`] so the session logic can be tested against the
//! in-memory [`mock`] implementation instead of real hardware.
//!
//! A [`SerialOpener`] knows *which* port to open and produces a fresh
//! [`SerialChannel`] on every call, so a caller can drop a failed handle and
//! try again later.

use thiserror::Error;

pub mod mock;
pub mod native;

pub use native::NativeSerialOpener;

/// Errors raised by serial port operations.
#[derive(Debug, Error)]
pub enum SerialError {
    /// The port could not be opened (missing device, busy, bad settings).
    #[error("failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    /// A read or write on an open port failed.
    #[error("serial I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// The driver reported an error outside of a read or write.
    #[error("serial port {port}: {reason}")]
    Port { port: String, reason: String },
}

/// An open serial port.
///
/// Implementations must never block for long: [`SerialChannel::read_available`]
/// returns only what is already buffered, and [`SerialChannel::write`] is
/// bounded by the port's write timeout.
pub trait SerialChannel: Send {
    /// Returns up to `max_bytes` bytes that are already waiting, possibly none.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError`] if the device failed; the caller should drop
    /// the handle and reopen later.
    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, SerialError>;

    /// Writes `data` and returns how many bytes the port accepted.
    ///
    /// A count lower than `data.len()` means the write timed out part-way;
    /// callers treat that as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError`] if the device failed.
    fn write(&mut self, data: &[u8]) -> Result<usize, SerialError>;

    /// Device name, for log messages.
    fn name(&self) -> &str;
}

/// Produces [`SerialChannel`] handles for one configured port.
pub trait SerialOpener: Send + Sync {
    /// Opens the port.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::Open`] if the device is unavailable.
    fn open(&self) -> Result<Box<dyn SerialChannel>, SerialError>;

    /// Human-readable description such as `COM1 @ 9600 baud`.
    fn describe(&self) -> String;
}
