//! Client registry: who is connected, and whether they finished the handshake.
//!
//! The `ClientRegistry` is the server's in-memory table of live connections.
//! Each record tracks:
//!
//! - The remote address.
//! - The task serving the connection and a stop flag it polls.
//! - The client's public key, once the handshake has delivered it.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//! accepted ──► registered ──► key received ──► removed
//!     │
//!     └──► rejected (server full)
//! ```
//!
//! The listener registers a record *before* the session task runs, under the
//! registry lock, so two simultaneous connections can never both squeeze into
//! the last free slot.  The session task removes its own record on exit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tunnel_core::PeerKey;
use uuid::Uuid;

/// Identifies one accepted connection for its whole life.
pub type SessionId = Uuid;

/// Live state for one connection.
#[derive(Debug)]
pub struct ClientRecord {
    pub id: SessionId,
    pub address: SocketAddr,
    /// Set to ask the session task to finish.
    pub stop: Arc<AtomicBool>,
    /// The client's key; `None` until the handshake delivers it.
    pub peer_key: Option<PeerKey>,
    pub task: Option<JoinHandle<()>>,
}

/// Read-only view of a record, for the operator listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub session_id: SessionId,
    pub address: SocketAddr,
    pub handshake_complete: bool,
}

/// Bounded table of live connections.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: HashMap<SessionId, ClientRecord>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    /// Adds a record for `address` if there is room.
    ///
    /// Returns the new session id and its stop flag, or `None` at capacity.
    pub fn try_register(&mut self, address: SocketAddr) -> Option<(SessionId, Arc<AtomicBool>)> {
        if self.is_full() {
            return None;
        }
        let id = Uuid::new_v4();
        let stop = Arc::new(AtomicBool::new(false));
        self.clients.insert(
            id,
            ClientRecord {
                id,
                address,
                stop: Arc::clone(&stop),
                peer_key: None,
                task: None,
            },
        );
        Some((id, stop))
    }

    /// Stores the task serving `id`.  Ignored if the record is already gone.
    pub fn attach_task(&mut self, id: SessionId, task: JoinHandle<()>) {
        if let Some(record) = self.clients.get_mut(&id) {
            record.task = Some(task);
        }
    }

    /// Records the client's public key once the handshake has delivered it.
    pub fn set_peer_key(&mut self, id: SessionId, key: PeerKey) {
        if let Some(record) = self.clients.get_mut(&id) {
            record.peer_key = Some(key);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<ClientRecord> {
        self.clients.remove(&id)
    }

    /// Removes and returns every record, for shutdown.
    pub fn drain(&mut self) -> Vec<ClientRecord> {
        self.clients.drain().map(|(_, record)| record).collect()
    }

    /// Snapshot of all connections, ordered by address.
    pub fn snapshot(&self) -> Vec<ClientSummary> {
        let mut summaries: Vec<ClientSummary> = self
            .clients
            .values()
            .map(|record| ClientSummary {
                session_id: record.id,
                address: record.address,
                handshake_complete: record.peer_key.is_some(),
            })
            .collect();
        summaries.sort_by_key(|s| s.address);
        summaries
    }
}

/// Formats a listing for the operator console.
pub fn render_client_table(clients: &[ClientSummary]) -> String {
    if clients.is_empty() {
        return "No clients connected.".to_string();
    }

    let mut out = format!("Connected clients: {}\n", clients.len());
    for client in clients {
        let key_state = if client.handshake_complete {
            "key received"
        } else {
            "awaiting key"
        };
        out.push_str(&format!("  {:<24} {}\n", client.address, key_state));
    }
    out
}
