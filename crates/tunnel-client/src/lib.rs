//! tunnel-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does tunnel-client do? (for beginners)
//!
//! The *client* sits next to a device that talks over a serial cable.  It:
//!
//! 1. Reads whatever the device sends on the local serial port.
//! 2. Connects to the tunnel server over TCP and swaps RSA public keys.
//! 3. Cuts the serial bytes into chunks small enough for one RSA-OAEP block,
//!    encrypts each with the server's key, and sends it as one frame.
//! 4. Keeps the bytes if the server is unreachable and delivers them, in
//!    order, after reconnecting.
//! 5. Sends an encrypted keep-alive when nothing else has been sent for a
//!    while, so dead connections are noticed.

/// Application layer: the session loop and the ports it depends on.
pub mod application;

/// Infrastructure layer: TCP link, configuration files.
pub mod infrastructure;
