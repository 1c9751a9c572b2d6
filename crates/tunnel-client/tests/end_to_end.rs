//! End-to-end tests: a real client session talking to a real relay server
//! over loopback TCP, with mock serial ports at both ends.
//!
//! ```text
//! client serial mock ──► ClientSession ══ TCP ══► RelayServer ──► server serial mock
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tunnel_client::application::session::{ClientSession, SessionLimits, SessionTimings};
use tunnel_client::infrastructure::network::{TcpConnector, TcpConnectorConfig};
use tunnel_core::serial::mock::MockSerialOpener;
use tunnel_core::KeyPair;
use tunnel_server::infrastructure::network::{RelayServer, ServerSettings};

fn client_keys() -> Arc<KeyPair> {
    static KEYS: OnceLock<Arc<KeyPair>> = OnceLock::new();
    Arc::clone(KEYS.get_or_init(|| Arc::new(KeyPair::generate(2048).unwrap())))
}

fn server_keys() -> Arc<KeyPair> {
    static KEYS: OnceLock<Arc<KeyPair>> = OnceLock::new();
    Arc::clone(KEYS.get_or_init(|| Arc::new(KeyPair::generate(2048).unwrap())))
}

/// A loopback port nothing is listening on yet.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(port: u16, device: &MockSerialOpener) -> RelayServer {
    let settings = ServerSettings {
        accept_poll: Duration::from_millis(100),
        ..ServerSettings::default()
    };
    RelayServer::start(
        "127.0.0.1",
        port,
        settings,
        server_keys(),
        Arc::new(device.clone()),
    )
    .await
    .expect("server must start")
}

fn start_client(
    port: u16,
    device: &MockSerialOpener,
    keep_alive: Duration,
) -> (Arc<AtomicBool>, JoinHandle<()>) {
    let retry = Duration::from_millis(200);
    let connector = TcpConnector::new(TcpConnectorConfig::new("127.0.0.1", port, retry), client_keys());
    let timings = SessionTimings {
        serial_check: Duration::from_millis(100),
        keep_alive,
        ..SessionTimings::with_retry_interval(retry)
    };
    let session = ClientSession::new(
        Arc::new(connector),
        Arc::new(device.clone()),
        timings,
        SessionLimits::default(),
    );
    let running = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(session.run(Arc::clone(&running)));
    (running, task)
}

async fn wait_for_bytes(device: &MockSerialOpener, len: usize) -> Vec<u8> {
    for _ in 0..250 {
        let written = device.written();
        if written.len() >= len {
            return written;
        }
        sleep(Duration::from_millis(20)).await;
    }
    device.written()
}

#[tokio::test]
async fn test_hello_world_typed_while_server_is_down_is_delivered_later() {
    // Arrange: the client starts first, with nothing listening
    let port = free_port().await;
    let client_serial = MockSerialOpener::new("COM1");
    let server_serial = MockSerialOpener::new("COM3");
    let (running, client) = start_client(port, &client_serial, Duration::from_secs(5));
    client_serial.push_inbound(b"HELLO WORLD");
    sleep(Duration::from_millis(500)).await;
    let consumed_while_down = client_serial.pending_inbound() == 0;

    // Act
    let server = start_server(port, &server_serial).await;
    let delivered = wait_for_bytes(&server_serial, 11).await;

    // Assert
    assert!(consumed_while_down);
    assert_eq!(delivered, b"HELLO WORLD");
    running.store(false, Ordering::Relaxed);
    client.await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_keep_alives_between_messages_do_not_reach_the_serial_port() {
    // Arrange
    let port = free_port().await;
    let client_serial = MockSerialOpener::new("COM1");
    let server_serial = MockSerialOpener::new("COM3");
    let server = start_server(port, &server_serial).await;
    let (running, client) = start_client(port, &client_serial, Duration::from_millis(100));

    // Act: idle long enough for several keep-alives between the two messages
    client_serial.push_inbound(b"first ");
    wait_for_bytes(&server_serial, 6).await;
    sleep(Duration::from_millis(500)).await;
    client_serial.push_inbound(b"second");
    let delivered = wait_for_bytes(&server_serial, 12).await;

    // Assert
    assert_eq!(delivered, b"first second");
    assert_eq!(server.clients().await.len(), 1);
    running.store(false, Ordering::Relaxed);
    client.await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    // Arrange
    let port = free_port().await;
    let client_serial = MockSerialOpener::new("COM1");
    let server_serial = MockSerialOpener::new("COM3");
    let server = start_server(port, &server_serial).await;
    let (running, client) = start_client(port, &client_serial, Duration::from_millis(100));
    client_serial.push_inbound(b"before");
    wait_for_bytes(&server_serial, 6).await;

    // Act: restart the server, then send more
    server.stop().await;
    sleep(Duration::from_millis(600)).await;
    let server = start_server(port, &server_serial).await;
    client_serial.push_inbound(b"after");
    let delivered = wait_for_bytes(&server_serial, 11).await;

    // Assert
    assert_eq!(delivered, b"beforeafter");
    running.store(false, Ordering::Relaxed);
    client.await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_data_ending_in_four_zero_bytes_is_delivered_whole() {
    // Arrange: one full chunk of data followed by a zero word
    let port = free_port().await;
    let client_serial = MockSerialOpener::new("COM1");
    let server_serial = MockSerialOpener::new("COM3");
    let server = start_server(port, &server_serial).await;
    let (running, client) = start_client(port, &client_serial, Duration::from_secs(5));
    let mut data = vec![0x41u8; 190];
    data.extend_from_slice(&[0, 0, 0, 0]);

    // Act
    client_serial.push_inbound(&data);
    let delivered = wait_for_bytes(&server_serial, data.len()).await;

    // Assert
    assert_eq!(delivered, data);
    running.store(false, Ordering::Relaxed);
    client.await.unwrap();
    server.stop().await;
}
