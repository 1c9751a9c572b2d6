//! In-memory serial port for tests.
//!
//! [`MockSerialOpener`] plays the role of a device: tests push bytes that the
//! "device" produced with [`MockSerialOpener::push_inbound`], inspect what was
//! written with [`MockSerialOpener::written`], and flip failure switches to
//! simulate unplugged cables.  Every handle it opens shares the same state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{SerialChannel, SerialError, SerialOpener};

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    open_count: usize,
    fail_open: bool,
    fail_reads: bool,
    fail_writes: bool,
    short_writes: bool,
}

/// Shared handle to a simulated serial device.
#[derive(Debug, Clone)]
pub struct MockSerialOpener {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSerialOpener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues bytes the device "received" so a later read returns them.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes.iter().copied());
    }

    /// Bytes queued but not yet read.
    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }

    /// All bytes successfully written, concatenated in order.
    pub fn written(&self) -> Vec<u8> {
        self.state().writes.concat()
    }

    /// Each successful write call, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// How many times [`SerialOpener::open`] succeeded.
    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// When set, each write accepts only half of the bytes offered.
    pub fn set_short_writes(&self, short: bool) {
        self.state().short_writes = short;
    }
}

impl SerialOpener for MockSerialOpener {
    fn open(&self) -> Result<Box<dyn SerialChannel>, SerialError> {
        let mut state = self.state();
        if state.fail_open {
            return Err(SerialError::Open {
                port: self.name.clone(),
                reason: "simulated open failure".to_string(),
            });
        }
        state.open_count += 1;
        Ok(Box::new(MockSerialHandle {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn describe(&self) -> String {
        format!("{} (mock)", self.name)
    }
}

/// An "open" handle on a [`MockSerialOpener`].
#[derive(Debug)]
pub struct MockSerialHandle {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSerialHandle {
    fn simulated_failure(&self, what: &str) -> SerialError {
        SerialError::Io {
            port: self.name.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("simulated {what} failure"),
            ),
        }
    }
}

impl SerialChannel for MockSerialHandle {
    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, SerialError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_reads {
            return Err(self.simulated_failure("read"));
        }
        let n = state.inbound.len().min(max_bytes);
        Ok(state.inbound.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SerialError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_writes {
            return Err(self.simulated_failure("write"));
        }
        let accepted = if state.short_writes {
            data.len() / 2
        } else {
            data.len()
        };
        state.writes.push(data[..accepted].to_vec());
        Ok(accepted)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
