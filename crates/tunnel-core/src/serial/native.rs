//! [`SerialOpener`] backed by the `serialport` crate.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use super::{SerialChannel, SerialError, SerialOpener};
use crate::settings::SerialSettings;

/// Opens the configured device as 8N1 without flow control.
#[derive(Debug, Clone)]
pub struct NativeSerialOpener {
    settings: SerialSettings,
}

impl NativeSerialOpener {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

impl SerialOpener for NativeSerialOpener {
    fn open(&self) -> Result<Box<dyn SerialChannel>, SerialError> {
        let port = serialport::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.settings.read_timeout())
            .open()
            .map_err(|e| SerialError::Open {
                port: self.settings.port.clone(),
                reason: e.to_string(),
            })?;

        debug!("opened {}", self.describe());
        Ok(Box::new(NativeSerialChannel {
            name: self.settings.port.clone(),
            port,
            read_timeout: self.settings.read_timeout(),
            write_timeout: self.settings.write_timeout(),
            current_timeout: self.settings.read_timeout(),
        }))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.settings.port, self.settings.baud_rate)
    }
}

struct NativeSerialChannel {
    name: String,
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
    write_timeout: Duration,
    /// `serialport` has one timeout for both directions; this tracks which
    /// one is currently applied.
    current_timeout: Duration,
}

impl NativeSerialChannel {
    fn use_timeout(&mut self, timeout: Duration) -> Result<(), SerialError> {
        if self.current_timeout == timeout {
            return Ok(());
        }
        self.port.set_timeout(timeout).map_err(|e| SerialError::Port {
            port: self.name.clone(),
            reason: e.to_string(),
        })?;
        self.current_timeout = timeout;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> SerialError {
        SerialError::Io {
            port: self.name.clone(),
            source,
        }
    }
}

impl SerialChannel for NativeSerialChannel {
    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, SerialError> {
        let waiting = self.port.bytes_to_read().map_err(|e| SerialError::Port {
            port: self.name.clone(),
            reason: e.to_string(),
        })? as usize;
        if waiting == 0 || max_bytes == 0 {
            return Ok(Vec::new());
        }

        self.use_timeout(self.read_timeout)?;
        let mut buf = vec![0u8; waiting.min(max_bytes)];
        let n = match self.port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::TimedOut => 0,
            Err(e) => return Err(self.io_error(e)),
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SerialError> {
        self.use_timeout(self.write_timeout)?;

        let mut written = 0;
        while written < data.len() {
            match self.port.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(self.io_error(e)),
            }
        }
        self.port.flush().map_err(|e| self.io_error(e))?;
        Ok(written)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
