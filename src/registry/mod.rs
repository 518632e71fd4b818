//! Connection registry
//!
//! The authoritative membership table: one entry per live connection, keyed
//! by the identifier the relay routes with. All connection tasks share a
//! single registry; it is the only state that crosses connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::server::{ProtocolResult, ServerFrame};

/// Identifier assigned to a connection at registration time.
pub type ClientId = String;

/// Outbound queue capacity per connection.
pub const PEER_QUEUE_CAPACITY: usize = 256;

/// Sending half of one connection's outbound queue.
///
/// The WebSocket sink itself is owned by that connection's writer task; every
/// other task reaches the peer through this handle, so no lock is ever held
/// across socket I/O.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    /// Create a handle and the receiving end for the connection's writer task
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue a server frame for delivery to this peer
    ///
    /// Fails when the peer's writer task has already gone away; the caller
    /// decides whether that matters (fan-out ignores it, registration does not).
    pub async fn send(&self, frame: &ServerFrame) -> ProtocolResult<bool> {
        let message = frame.to_message()?;
        Ok(self.tx.send(message).await.is_ok())
    }

    /// Queue a raw WebSocket message (pong replies, close frames)
    pub async fn send_raw(&self, message: Message) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Queue a frame without waiting for capacity
    ///
    /// Used where blocking is not an option, such as under the registry
    /// lock. Returns false when the queue is full or the writer is gone.
    pub fn try_send(&self, frame: &ServerFrame) -> ProtocolResult<bool> {
        let message = frame.to_message()?;
        Ok(self.tx.try_send(message).is_ok())
    }
}

/// Mapping from identifier to live connection handle
///
/// Single source of truth for who is online. The lock guards only the map
/// itself; sends always happen through the cloned [`PeerHandle`] after the
/// lock is released.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, PeerHandle>>,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection and return its freshly generated identifier,
    /// plus whether the `id` envelope reached the connection's queue
    ///
    /// The identifier is a UUID, independent of any transport-level address.
    /// A collision with a live entry is regenerated rather than overwriting,
    /// so two simultaneously-registered connections can never share an id.
    ///
    /// The `id` envelope is queued before the entry becomes visible to
    /// lookups and snapshots, so no routed frame can ever precede it on the
    /// wire. The queue push is a plain channel operation, not socket I/O,
    /// and a fresh queue cannot be full: a `false` means the connection's
    /// writer is already gone.
    pub async fn register(&self, handle: PeerHandle) -> (ClientId, bool) {
        let mut clients = self.clients.write().await;
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !clients.contains_key(&candidate) {
                break candidate;
            }
            warn!("Identifier collision on {}, regenerating", candidate);
        };
        let welcomed = match handle.try_send(&ServerFrame::id(&id)) {
            Ok(queued) => queued,
            Err(e) => {
                warn!("Failed to encode id envelope for {}: {}", id, e);
                false
            }
        };
        clients.insert(id.clone(), handle);
        debug!("Registered client {} ({} online)", id, clients.len());
        (id, welcomed)
    }

    /// Remove a connection; returns whether an entry was actually removed
    ///
    /// Removing an absent identifier is a no-op, so duplicate closure events
    /// cannot trigger a second departure announcement.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(id).is_some();
        if removed {
            debug!("Unregistered client {} ({} online)", id, clients.len());
        }
        removed
    }

    /// Look up the handle for an identifier
    pub async fn lookup(&self, id: &str) -> Option<PeerHandle> {
        self.clients.read().await.get(id).cloned()
    }

    /// Atomic snapshot of every live (identifier, handle) pair
    ///
    /// Taken under a single lock acquisition, so it never observes an entry
    /// mid-insertion or mid-removal.
    pub async fn snapshot(&self) -> Vec<(ClientId, PeerHandle)> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    /// Number of currently registered connections
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no connections are registered
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
