//! Integration tests for the relay server over real loopback TCP.
//!
//! # Purpose
//!
//! These tests drive a [`RelayServer`] the way a tunnel client does, speaking
//! the wire protocol by hand with `tunnel_core`'s framing and cipher types.
//! They verify:
//!
//! - Capacity: with `max_clients = 2` the third connection receives the
//!   plain-text notice and nothing else.
//! - Isolation: a client that sends garbage instead of a key is dropped
//!   without disturbing anyone else.
//! - Relay: decrypted data reaches the serial port, keep-alives do not, and a
//!   frame that fails to decrypt does not end the session.
//! - Listing: the registry reports who is connected and who has a key.
//!
//! The serial port is a `MockSerialOpener`, so written bytes can be inspected.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tunnel_core::protocol::{
    receive_frame, send_frame, Received, KEEP_ALIVE_PAYLOAD, SERVER_FULL_NOTICE,
};
use tunnel_core::serial::mock::MockSerialOpener;
use tunnel_core::{KeyPair, PeerKey};
use tunnel_server::infrastructure::network::{RelayServer, ServerSettings};

const WAIT: Duration = Duration::from_secs(5);

fn server_keys() -> Arc<KeyPair> {
    static KEYS: OnceLock<Arc<KeyPair>> = OnceLock::new();
    Arc::clone(KEYS.get_or_init(|| Arc::new(KeyPair::generate(2048).unwrap())))
}

fn client_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| KeyPair::generate(2048).unwrap())
}

async fn start_server(max_clients: usize, device: &MockSerialOpener) -> RelayServer {
    let settings = ServerSettings {
        max_clients,
        accept_poll: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
        ..ServerSettings::default()
    };
    RelayServer::start(
        "127.0.0.1",
        0,
        settings,
        server_keys(),
        Arc::new(device.clone()),
    )
    .await
    .expect("server must start")
}

/// Connects and completes the key exchange, returning the socket and the
/// server's key.
async fn connect_and_handshake(server: &RelayServer) -> (TcpStream, PeerKey) {
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let pem = client_keys().public().to_pem_bytes().unwrap();
    send_frame(&mut stream, &pem).await.unwrap();
    let Received::Message(server_pem) = receive_frame(&mut stream, WAIT).await.unwrap() else {
        panic!("expected the server key");
    };
    (stream, PeerKey::from_pem_bytes(&server_pem).unwrap())
}

async fn wait_for_writes(device: &MockSerialOpener, count: usize) -> Vec<Vec<u8>> {
    for _ in 0..100 {
        let writes = device.writes();
        if writes.len() >= count {
            return writes;
        }
        sleep(Duration::from_millis(20)).await;
    }
    device.writes()
}

async fn wait_for_client_count(server: &RelayServer, count: usize) -> bool {
    for _ in 0..100 {
        if server.clients().await.len() == count {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

// ── Capacity ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_third_client_is_rejected_when_two_are_connected() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(2, &device).await;
    let (_first, _) = connect_and_handshake(&server).await;
    let (_second, _) = connect_and_handshake(&server).await;

    // Act
    let mut third = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut received = Vec::new();
    timeout(WAIT, third.read_to_end(&mut received))
        .await
        .expect("rejected socket must close")
        .unwrap();

    // Assert
    assert_eq!(received, SERVER_FULL_NOTICE);
    assert_eq!(server.clients().await.len(), 2);
    server.stop().await;
}

#[tokio::test]
async fn test_slot_is_reused_after_a_client_leaves() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(1, &device).await;
    let (first, _) = connect_and_handshake(&server).await;

    // Act
    drop(first);
    let freed = wait_for_client_count(&server, 0).await;
    let (_second, key) = connect_and_handshake(&server).await;

    // Assert
    assert!(freed);
    assert_eq!(key, *server_keys().public());
    server.stop().await;
}

// ── Isolation ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_garbage_handshake_does_not_affect_other_clients() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(5, &device).await;
    let (mut good, key) = connect_and_handshake(&server).await;

    // Act: a second client sends something that is not a key
    let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
    send_frame(&mut bad, b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let bad_outcome = receive_frame(&mut bad, WAIT).await.unwrap();
    send_frame(&mut good, &key.encrypt(b"still here").unwrap())
        .await
        .unwrap();
    let writes = wait_for_writes(&device, 1).await;

    // Assert
    assert_eq!(bad_outcome, Received::Closed);
    assert_eq!(writes, vec![b"still here".to_vec()]);
    assert!(wait_for_client_count(&server, 1).await);
    server.stop().await;
}

// ── Relay ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hello_world_reaches_the_serial_port() {
    let device = MockSerialOpener::new("COM3");
    let server = start_server(5, &device).await;
    let (mut stream, key) = connect_and_handshake(&server).await;

    send_frame(&mut stream, &key.encrypt(b"HELLO WORLD").unwrap())
        .await
        .unwrap();

    let writes = wait_for_writes(&device, 1).await;

    assert_eq!(writes, vec![b"HELLO WORLD".to_vec()]);
    server.stop().await;
}

#[tokio::test]
async fn test_keep_alive_is_not_written_and_order_is_kept() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(5, &device).await;
    let (mut stream, key) = connect_and_handshake(&server).await;

    // Act
    for plaintext in [&b"first"[..], &KEEP_ALIVE_PAYLOAD[..], &b"second"[..]] {
        send_frame(&mut stream, &key.encrypt(plaintext).unwrap())
            .await
            .unwrap();
    }
    let writes = wait_for_writes(&device, 2).await;

    // Assert
    assert_eq!(writes, vec![b"first".to_vec(), b"second".to_vec()]);
    server.stop().await;
}

#[tokio::test]
async fn test_undecryptable_frame_is_skipped_and_session_survives() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(5, &device).await;
    let (mut stream, key) = connect_and_handshake(&server).await;

    // Act: a frame encrypted for the wrong key, then a good one
    let wrong = client_keys().public().encrypt(b"not for the server").unwrap();
    send_frame(&mut stream, &wrong).await.unwrap();
    send_frame(&mut stream, &key.encrypt(b"after").unwrap())
        .await
        .unwrap();
    let writes = wait_for_writes(&device, 1).await;

    // Assert
    assert_eq!(writes, vec![b"after".to_vec()]);
    assert_eq!(server.clients().await.len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_missing_serial_port_drops_data_but_keeps_session() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    device.set_fail_open(true);
    let server = start_server(5, &device).await;
    let (mut stream, key) = connect_and_handshake(&server).await;

    // Act
    send_frame(&mut stream, &key.encrypt(b"lost").unwrap())
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    // Assert
    assert!(device.writes().is_empty());
    assert_eq!(server.clients().await.len(), 1);
    server.stop().await;
}

// ── Listing and shutdown ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_listing_shows_handshake_state() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(5, &device).await;
    let (_keyed, _) = connect_and_handshake(&server).await;
    let _silent = TcpStream::connect(server.local_addr()).await.unwrap();

    // Act
    assert!(wait_for_client_count(&server, 2).await);
    let clients = server.clients().await;

    // Assert
    let complete = clients.iter().filter(|c| c.handshake_complete).count();
    assert_eq!(complete, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_stop_closes_connected_clients() {
    // Arrange
    let device = MockSerialOpener::new("COM3");
    let server = start_server(5, &device).await;
    let (mut stream, _) = connect_and_handshake(&server).await;

    // Act
    timeout(WAIT, server.stop())
        .await
        .expect("stop must finish");
    let after = receive_frame(&mut stream, WAIT).await.unwrap();

    // Assert
    assert_eq!(after, Received::Closed);
}
