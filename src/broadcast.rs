//! Update fan-out and the per-document registry.
//!
//! Every document gets a [`BroadcastGroup`]: one tokio broadcast channel of
//! pre-encoded frames shared by all connections subscribed to that document.
//! Frames carry the originating connection id so that a sender can filter
//! out its own updates; acks travel directly on the originator's socket and
//! never pass through here.
//!
//! The [`DocumentRegistry`] maps document ids to their room, and is the only
//! process-wide state the server holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::session::DocumentSession;

/// A pre-encoded server message fanned out to a document's subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    /// Connection that caused the message; receivers skip their own frames.
    pub origin: Uuid,
    /// Encoded [`ServerMessage`](crate::protocol::ServerMessage) JSON.
    pub payload: Arc<str>,
}

/// Fan-out channel for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<BroadcastFrame>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group whose subscribers each buffer up to `capacity` frames
    /// before they start lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe to this document's updates.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastFrame> {
        self.sender.subscribe()
    }

    /// Fan a frame out to all current subscribers. Returns how many
    /// receivers got it; zero when nobody is listening.
    pub fn send(&self, origin: Uuid, payload: String) -> usize {
        let frame = BroadcastFrame {
            origin,
            payload: payload.into(),
        };
        let receivers = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        receivers
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames sent over this group's lifetime.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// One document's server-side state: the serialised session plus its fan-out.
pub struct DocumentRoom {
    pub session: Mutex<DocumentSession>,
    pub broadcast: BroadcastGroup,
}

/// Registry mapping document ids to rooms.
pub struct DocumentRegistry {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    broadcast_capacity: usize,
}

impl DocumentRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
        }
    }

    /// Look up an existing room.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Get the room for `doc_id`, creating it from `init` if absent.
    pub async fn get_or_create(
        &self,
        doc_id: &str,
        init: impl FnOnce() -> DocumentSession,
    ) -> Arc<DocumentRoom> {
        // Fast path: read lock only.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(doc_id) {
            return room.clone();
        }
        let room = Arc::new(DocumentRoom {
            session: Mutex::new(init()),
            broadcast: BroadcastGroup::new(self.broadcast_capacity),
        });
        rooms.insert(doc_id.to_string(), room.clone());
        room
    }

    /// Drop a room once its last subscriber is gone. Returns whether the
    /// room was removed.
    pub async fn remove_if_idle(&self, doc_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.broadcast.subscriber_count() == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    /// Number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of all documents with an active room.
    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
