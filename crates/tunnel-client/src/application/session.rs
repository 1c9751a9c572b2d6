//! The client session loop.
//!
//! One task owns the serial port, the link to the server and the outbound
//! buffer.  Every tick (50 ms by default) it:
//!
//! 1. re-checks the serial port if the serial check is due,
//! 2. (re)connects to the server if the connection check is due,
//! 3. sends an encrypted keep-alive if the link has been idle too long,
//! 4. moves whatever the serial port has buffered into the outbound buffer,
//! 5. drains the outbound buffer to the server.
//!
//! Serial reads continue while the server is unreachable, so data typed
//! during an outage is delivered once the link comes back.  The buffer is
//! capped; at the cap the loop stops reading and lets the device buffer fill
//! instead.
//!
//! # Why checks are rate-limited (for beginners)
//!
//! Opening a missing serial device or connecting to a dead server can each
//! take a while and spam the log.  Gating them behind "next check at" instants
//! keeps a 50 ms loop responsive while retrying only once per interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tunnel_core::protocol::KEEP_ALIVE_PAYLOAD;
use tunnel_core::{SerialChannel, SerialOpener};

use super::link::{Connector, Link};
use super::outbound_buffer::{DrainFailure, OutboundBuffer};

/// Default cap on bytes held while the server is unreachable (1 MiB).
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Stand-in deadline for intervals too long to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Intervals that drive the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Sleep between loop iterations.
    pub tick: Duration,
    /// Minimum time between serial health checks.
    pub serial_check: Duration,
    /// Minimum time between connection attempts.
    pub connection_check: Duration,
    /// Idle time after which a keep-alive is sent.
    pub keep_alive: Duration,
}

impl SessionTimings {
    /// Standard timings for a given retry interval: 50 ms tick, 1 s serial
    /// check, 5 s keep-alive, connection check every `retry_interval`.
    pub fn with_retry_interval(retry_interval: Duration) -> Self {
        Self {
            tick: Duration::from_millis(50),
            serial_check: Duration::from_secs(1),
            connection_check: retry_interval,
            keep_alive: Duration::from_secs(5),
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::with_retry_interval(Duration::from_secs(5))
    }
}

/// Tunable limits for a [`ClientSession`].
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Largest single serial read.
    pub read_chunk: usize,
    /// Cap on buffered bytes awaiting delivery.
    pub max_pending_bytes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_chunk: 1024,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// Owns the serial port, the server link and the outbound buffer.
pub struct ClientSession {
    connector: Arc<dyn Connector>,
    serial_opener: Arc<dyn SerialOpener>,
    serial: Option<Box<dyn SerialChannel>>,
    link: Option<Box<dyn Link>>,
    buffer: OutboundBuffer,
    limits: SessionLimits,
    timings: SessionTimings,
    next_serial_check: Instant,
    next_connection_check: Instant,
    last_activity: Instant,
}

impl ClientSession {
    /// Creates a session with nothing open.  Both checks are due immediately.
    pub fn new(
        connector: Arc<dyn Connector>,
        serial_opener: Arc<dyn SerialOpener>,
        timings: SessionTimings,
        limits: SessionLimits,
    ) -> Self {
        let now = Instant::now();
        Self {
            connector,
            serial_opener,
            serial: None,
            link: None,
            buffer: OutboundBuffer::new(limits.max_pending_bytes),
            limits,
            timings,
            next_serial_check: now,
            next_connection_check: now,
            last_activity: now,
        }
    }

    /// Whether a handshaken link to the server is currently held.
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    /// Whether the serial port is currently open.
    pub fn is_serial_open(&self) -> bool {
        self.serial.is_some()
    }

    /// Bytes read from serial but not yet delivered.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Runs ticks until `running` is cleared, then closes everything.
    pub async fn run(mut self, running: Arc<AtomicBool>) {
        info!(
            "client session started: serial {}, server {}",
            self.serial_opener.describe(),
            self.connector.target()
        );

        let mut ticker = interval(self.timings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while running.load(Ordering::Relaxed) {
            ticker.tick().await;
            self.tick().await;
        }

        self.shutdown().await;
    }

    /// One loop iteration.
    pub async fn tick(&mut self) {
        let now = Instant::now();

        if now >= self.next_serial_check {
            self.check_serial();
            self.next_serial_check = due_after(self.timings.serial_check);
        }

        if now >= self.next_connection_check {
            self.check_connection().await;
            self.next_connection_check = due_after(self.timings.connection_check);
        }

        if self.link.is_some() && self.last_activity.elapsed() >= self.timings.keep_alive {
            self.send_keep_alive().await;
        }

        if !self.pump_serial() {
            return;
        }

        self.flush_buffer().await;
    }

    /// Closes the link and the serial port.  Pending bytes are abandoned.
    pub async fn shutdown(&mut self) {
        self.close_link().await;
        if self.serial.take().is_some() {
            info!("serial port closed");
        }
        if !self.buffer.is_empty() {
            warn!(
                "shutting down with {} undelivered bytes",
                self.buffer.len()
            );
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    fn check_serial(&mut self) {
        if self.serial.is_some() {
            return;
        }
        match self.serial_opener.open() {
            Ok(channel) => {
                info!("serial port {} opened", channel.name());
                self.serial = Some(channel);
            }
            Err(e) => warn!("serial port unavailable: {e}"),
        }
    }

    async fn check_connection(&mut self) {
        if self.link.is_some() {
            return;
        }
        debug!("connecting to {}", self.connector.target());
        match self.connector.connect().await {
            Ok(link) => {
                info!(
                    "connected to {} (chunk bound {} bytes)",
                    link.peer(),
                    link.max_chunk_len()
                );
                self.link = Some(link);
                self.last_activity = Instant::now();
            }
            Err(e) => warn!("connection to {} failed: {e}", self.connector.target()),
        }
    }

    async fn send_keep_alive(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.send_chunk(&KEEP_ALIVE_PAYLOAD).await {
            Ok(()) => {
                debug!("keep-alive sent");
                self.last_activity = Instant::now();
            }
            Err(e) => {
                warn!("keep-alive failed: {e}");
                self.drop_link().await;
            }
        }
    }

    /// Moves buffered serial bytes into the outbound buffer.
    ///
    /// Returns `false` if the serial port failed, which ends the tick.
    fn pump_serial(&mut self) -> bool {
        let Some(serial) = self.serial.as_mut() else {
            return true;
        };
        let budget = self.limits.read_chunk.min(self.buffer.room());
        if budget == 0 {
            return true;
        }

        match serial.read_available(budget) {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    debug!("read {} bytes from serial", bytes.len());
                    self.buffer.extend(&bytes);
                }
                true
            }
            Err(e) => {
                warn!("serial read failed, closing port: {e}");
                self.serial = None;
                self.next_serial_check = Instant::now();
                false
            }
        }
    }

    async fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let max_chunk = link.max_chunk_len();
        let report = self.buffer.drain_into(link.as_mut(), max_chunk).await;
        if report.bytes_sent > 0 {
            self.last_activity = Instant::now();
        }

        match report.failure {
            None => {}
            Some(DrainFailure::Transport { retained, error }) => {
                warn!("send failed, keeping {retained} bytes for the next connection: {error}");
                self.drop_link().await;
            }
            Some(DrainFailure::Encrypt { discarded, error }) => {
                error!("discarded {discarded} pending bytes: {error}");
            }
        }
    }

    /// Closes a broken link and makes the next connection check due now.
    async fn drop_link(&mut self) {
        self.close_link().await;
        self.next_connection_check = Instant::now();
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
            info!("disconnected from {}", link.peer());
        }
    }
}

/// Deadline `interval` from now, saturating at [`FAR_FUTURE`].
fn due_after(interval: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(interval).unwrap_or_else(|| now + FAR_FUTURE)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::link::{ChunkError, ChunkSink, LinkError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tunnel_core::serial::mock::MockSerialOpener;
    use tunnel_core::FrameError;

    /// Shared record of what fake links delivered.
    #[derive(Default)]
    struct Wire {
        chunks: Vec<Vec<u8>>,
        /// Remaining successful sends before every link breaks.
        sends_before_failure: Option<usize>,
        refuse_connections: bool,
        connects: usize,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        wire: Arc<Mutex<Wire>>,
    }

    impl FakeConnector {
        fn wire(&self) -> std::sync::MutexGuard<'_, Wire> {
            self.wire.lock().unwrap()
        }

        fn delivered(&self) -> Vec<u8> {
            self.wire()
                .chunks
                .iter()
                .filter(|c| c.as_slice() != KEEP_ALIVE_PAYLOAD)
                .flatten()
                .copied()
                .collect()
        }
    }

    struct FakeLink {
        wire: Arc<Mutex<Wire>>,
        max_chunk: usize,
    }

    #[async_trait]
    impl ChunkSink for FakeLink {
        async fn send_chunk(&mut self, plaintext: &[u8]) -> Result<(), ChunkError> {
            let mut wire = self.wire.lock().unwrap();
            if let Some(remaining) = wire.sends_before_failure.as_mut() {
                if *remaining == 0 {
                    return Err(ChunkError::Transport(FrameError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "reset",
                    ))));
                }
                *remaining -= 1;
            }
            wire.chunks.push(plaintext.to_vec());
            Ok(())
        }
    }

    #[async_trait]
    impl Link for FakeLink {
        fn max_chunk_len(&self) -> usize {
            self.max_chunk
        }

        fn peer(&self) -> String {
            "fake-server".to_string()
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn Link>, LinkError> {
            let mut wire = self.wire();
            if wire.refuse_connections {
                return Err(LinkError::ClosedDuringHandshake);
            }
            wire.connects += 1;
            Ok(Box::new(FakeLink {
                wire: Arc::clone(&self.wire),
                max_chunk: 190,
            }))
        }

        fn target(&self) -> String {
            "fake-server".to_string()
        }
    }

    /// Timings that make every check due on every tick.
    fn eager_timings() -> SessionTimings {
        SessionTimings {
            tick: Duration::from_millis(1),
            serial_check: Duration::ZERO,
            connection_check: Duration::ZERO,
            keep_alive: Duration::from_secs(3600),
        }
    }

    fn session(
        connector: &FakeConnector,
        device: &MockSerialOpener,
        timings: SessionTimings,
        limits: SessionLimits,
    ) -> ClientSession {
        ClientSession::new(
            Arc::new(connector.clone()),
            Arc::new(device.clone()),
            timings,
            limits,
        )
    }

    #[test]
    fn test_default_timings() {
        let timings = SessionTimings::default();
        assert_eq!(timings.tick, Duration::from_millis(50));
        assert_eq!(timings.serial_check, Duration::from_secs(1));
        assert_eq!(timings.connection_check, Duration::from_secs(5));
        assert_eq!(timings.keep_alive, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_tick_opens_serial_and_connects() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let mut session = session(&connector, &device, eager_timings(), SessionLimits::default());

        // Act
        session.tick().await;

        // Assert
        assert!(session.is_serial_open());
        assert!(session.is_linked());
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_check_intervals_do_not_overflow_the_clock() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let timings = SessionTimings {
            serial_check: Duration::MAX,
            connection_check: Duration::MAX,
            ..eager_timings()
        };
        let mut session = session(&connector, &device, timings, SessionLimits::default());

        // Act
        session.tick().await;
        session.tick().await;

        // Assert: first tick still opened everything, later checks are far off
        assert!(session.is_serial_open());
        assert!(session.is_linked());
        assert_eq!(device.open_count(), 1);
        assert!(session.next_connection_check > Instant::now() + Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_serial_bytes_reach_the_link() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let mut session = session(&connector, &device, eager_timings(), SessionLimits::default());
        session.tick().await;

        // Act
        device.push_inbound(b"HELLO WORLD");
        session.tick().await;

        // Assert
        assert_eq!(connector.delivered(), b"HELLO WORLD");
        assert_eq!(session.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn test_bytes_are_buffered_while_server_is_down() {
        // Arrange
        let connector = FakeConnector::default();
        connector.wire().refuse_connections = true;
        let device = MockSerialOpener::new("MOCK0");
        let mut session = session(&connector, &device, eager_timings(), SessionLimits::default());

        // Act: data arrives while disconnected
        device.push_inbound(b"HELLO ");
        session.tick().await;
        device.push_inbound(b"WORLD");
        session.tick().await;
        let buffered = session.pending_bytes();

        connector.wire().refuse_connections = false;
        session.tick().await;

        // Assert
        assert_eq!(buffered, 11);
        assert_eq!(connector.delivered(), b"HELLO WORLD");
    }

    #[tokio::test]
    async fn test_transport_failure_mid_drain_loses_nothing() {
        // Arrange: the first link accepts two chunks then breaks
        let connector = FakeConnector::default();
        connector.wire().sends_before_failure = Some(2);
        let device = MockSerialOpener::new("MOCK0");
        let limits = SessionLimits {
            read_chunk: 4096,
            ..SessionLimits::default()
        };
        let mut session = session(&connector, &device, eager_timings(), limits);
        session.tick().await;
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        // Act
        device.push_inbound(&data);
        session.tick().await;
        let linked_after_failure = session.is_linked();
        connector.wire().sends_before_failure = None;
        session.tick().await;

        // Assert
        assert!(!linked_after_failure);
        assert_eq!(connector.delivered(), data);
        assert_eq!(connector.wire().connects, 2);
    }

    #[tokio::test]
    async fn test_keep_alive_sent_when_idle_and_never_splits_data() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let timings = SessionTimings {
            keep_alive: Duration::from_millis(20),
            ..eager_timings()
        };
        let mut session = session(&connector, &device, timings, SessionLimits::default());
        session.tick().await;

        // Act
        device.push_inbound(b"first");
        session.tick().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        device.push_inbound(b"second");
        session.tick().await;

        // Assert
        let chunks = connector.wire().chunks.clone();
        assert_eq!(
            chunks,
            vec![
                b"first".to_vec(),
                KEEP_ALIVE_PAYLOAD.to_vec(),
                b"second".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_keep_alive_drops_link_and_reconnects() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let timings = SessionTimings {
            keep_alive: Duration::ZERO,
            connection_check: Duration::from_secs(3600),
            ..eager_timings()
        };
        let mut session = session(&connector, &device, timings, SessionLimits::default());
        session.tick().await;
        connector.wire().sends_before_failure = Some(0);

        // Act
        session.tick().await;
        let linked_after_failure = session.is_linked();
        connector.wire().sends_before_failure = None;
        session.tick().await;

        // Assert: the long connection interval was bypassed
        assert!(!linked_after_failure);
        assert!(session.is_linked());
    }

    #[tokio::test]
    async fn test_serial_read_error_closes_port_and_reopens() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let mut session = session(&connector, &device, eager_timings(), SessionLimits::default());
        session.tick().await;

        // Act
        device.set_fail_reads(true);
        session.tick().await;
        let open_after_error = session.is_serial_open();
        device.set_fail_reads(false);
        session.tick().await;

        // Assert
        assert!(!open_after_error);
        assert!(session.is_serial_open());
        assert_eq!(device.open_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_serial_device_is_retried_only_after_interval() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        device.set_fail_open(true);
        let timings = SessionTimings {
            serial_check: Duration::from_secs(3600),
            ..eager_timings()
        };
        let mut session = session(&connector, &device, timings, SessionLimits::default());

        // Act
        session.tick().await;
        device.set_fail_open(false);
        session.tick().await;

        // Assert
        assert!(!session.is_serial_open());
        assert_eq!(device.open_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_cap_leaves_bytes_in_device() {
        // Arrange
        let connector = FakeConnector::default();
        connector.wire().refuse_connections = true;
        let device = MockSerialOpener::new("MOCK0");
        let limits = SessionLimits {
            read_chunk: 64,
            max_pending_bytes: 100,
        };
        let mut session = session(&connector, &device, eager_timings(), limits);

        // Act
        device.push_inbound(&[7u8; 300]);
        for _ in 0..5 {
            session.tick().await;
        }

        // Assert
        assert_eq!(session.pending_bytes(), 100);
        assert_eq!(device.pending_inbound(), 200);
    }

    #[tokio::test]
    async fn test_run_exits_when_running_is_cleared() {
        // Arrange
        let connector = FakeConnector::default();
        let device = MockSerialOpener::new("MOCK0");
        let session = session(&connector, &device, eager_timings(), SessionLimits::default());
        let running = Arc::new(AtomicBool::new(true));

        // Act
        let handle = tokio::spawn(session.run(Arc::clone(&running)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        running.store(false, Ordering::Relaxed);
        let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;

        // Assert
        assert!(joined.is_ok());
        assert!(connector.wire().connects >= 1);
    }
}
