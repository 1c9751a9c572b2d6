//! Application layer for the server.
//!
//! Holds the client registry.  Nothing here touches sockets or serial ports.

pub mod manage_clients;
