//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── DocumentRoom (doc_id) ── DocumentSession ── history
//! Client B ──┘          │                        │
//!                       │                        └── DocumentStore
//!                       │
//!                  BroadcastGroup
//!                       │
//!             ┌─────────┴─────────┐
//!             ▼                   ▼
//!          Client A            Client B
//! ```
//!
//! A connection joins the document named by its URL path and immediately
//! receives the current state. Pushes are serialised per document: the
//! session lock is held across transform, apply, persistence and the update
//! broadcast, so the fan-out order always equals the history order. The ack
//! goes straight back on the originator's socket, which never receives its
//! own update.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{DocumentRegistry, DocumentRoom};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{DocumentSession, SessionError};
use crate::storage::{DocumentStore, MemoryStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast channel capacity per document.
    pub broadcast_capacity: usize,
    /// Whether joining an unknown document id creates it empty. When false,
    /// unknown ids are rejected.
    pub create_missing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            create_missing: true,
        }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    store: Arc<dyn DocumentStore>,
}

impl CollabServer {
    /// Create a server with an in-memory store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a server with default configuration and an in-memory store.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create a server backed by the given store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.broadcast_capacity));
        Self {
            config,
            registry,
            store,
        }
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The document registry.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = self.registry.clone();
            let store = self.store.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, store, config).await
                {
                    warn!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Drive a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        store: Arc<dyn DocumentStore>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The document id is the URL path, captured during the handshake.
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let doc_id = path.trim_start_matches('/').to_string();
        if doc_id.is_empty() {
            let reply = ServerMessage::Error {
                message: "missing document id in path".to_string(),
            };
            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
            return Ok(());
        }

        let room = match Self::admit(&registry, &*store, &doc_id, config.create_missing).await {
            Ok(room) => room,
            Err(message) => {
                warn!("rejecting {addr}: {message}");
                let reply = ServerMessage::Error { message };
                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                return Ok(());
            }
        };

        let conn_id = Uuid::new_v4();
        // Subscribe and snapshot under the session lock so no update can
        // slip between the initial state and the first broadcast frame.
        let (mut broadcast_rx, initial) = {
            let session = room.session.lock().await;
            let rx = room.broadcast.subscribe();
            let initial = ServerMessage::InitialState {
                doc: session.content().to_string(),
                revision: session.revision(),
            };
            (rx, initial)
        };
        ws_sender.send(Message::Text(initial.encode()?.into())).await?;
        info!("connection {conn_id} from {addr} joined doc {doc_id}");

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let reply = match ClientMessage::decode(text.as_str()) {
                                Ok(client_msg) => {
                                    Self::handle_client_message(&room, &*store, conn_id, client_msg).await
                                }
                                Err(e) => {
                                    warn!("undecodable message from {conn_id}: {e}");
                                    Some(ServerMessage::Error { message: e.to_string() })
                                }
                            };
                            if let Some(reply) = reply {
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("socket error from {conn_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Never echo an update back to its originator.
                            if frame.origin == conn_id {
                                continue;
                            }
                            ws_sender.send(Message::Text(frame.payload.to_string().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // The client will see the revision gap and pull.
                            warn!("connection {conn_id} lagged by {n} updates");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        drop(broadcast_rx);
        if registry.remove_if_idle(&doc_id).await {
            info!("doc {doc_id} idle, room removed");
        }
        info!("connection {conn_id} from {addr} closed");
        Ok(())
    }

    /// Resolve a document id to its room, loading or creating per policy.
    async fn admit(
        registry: &DocumentRegistry,
        store: &dyn DocumentStore,
        doc_id: &str,
        create_missing: bool,
    ) -> Result<Arc<DocumentRoom>, String> {
        if let Some(room) = registry.get(doc_id).await {
            return Ok(room);
        }
        match store.load(doc_id) {
            Ok(Some(record)) => Ok(registry
                .get_or_create(doc_id, move || DocumentSession::from_record(doc_id, record))
                .await),
            Ok(None) if create_missing => {
                if let Err(e) = store.save(doc_id, "", 0, None) {
                    return Err(format!("failed to create document {doc_id}: {e}"));
                }
                Ok(registry
                    .get_or_create(doc_id, || DocumentSession::new(doc_id))
                    .await)
            }
            Ok(None) => Err(format!("unknown document {doc_id}")),
            Err(e) => Err(format!("failed to load document {doc_id}: {e}")),
        }
    }

    /// Process one decoded client message against the document room.
    ///
    /// Runs entirely under the session lock, including the update broadcast,
    /// which keeps the fan-out order identical to the history order.
    async fn handle_client_message(
        room: &DocumentRoom,
        store: &dyn DocumentStore,
        conn_id: Uuid,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Push { revision, op } => {
                let mut session = room.session.lock().await;

                if session.is_degraded() {
                    match store.load(session.doc_id()) {
                        Ok(Some(record)) => {
                            info!("rehydrating degraded doc {} from storage", session.doc_id());
                            session.rehydrate(record);
                        }
                        _ => {
                            return Some(ServerMessage::Error {
                                message: format!(
                                    "document {} is degraded, reload from storage required",
                                    session.doc_id()
                                ),
                            });
                        }
                    }
                }

                let checkpoint = session.checkpoint();
                match session.apply_push(op, revision) {
                    Ok(outcome) => {
                        // The ack must not be sent before the new state is
                        // durably recorded.
                        if let Err(e) = store.save(
                            session.doc_id(),
                            session.content(),
                            session.revision(),
                            Some(&outcome.op),
                        ) {
                            error!("failed to persist doc {}: {e}", session.doc_id());
                            session.restore(checkpoint);
                            return Some(ServerMessage::Error {
                                message: "persistence failure, operation dropped".to_string(),
                            });
                        }

                        let update = ServerMessage::Update {
                            revision: outcome.revision,
                            op: outcome.op,
                        };
                        match update.encode() {
                            Ok(encoded) => {
                                room.broadcast.send(conn_id, encoded);
                            }
                            Err(e) => error!("failed to encode update: {e}"),
                        }
                        Some(ServerMessage::Ack {
                            revision: outcome.revision,
                        })
                    }
                    Err(e @ SessionError::InvalidRevision { .. }) => {
                        warn!("rejected push on doc {}: {e}", session.doc_id());
                        Some(ServerMessage::Error {
                            message: e.to_string(),
                        })
                    }
                    Err(e) => {
                        error!("doc {} degraded: {e}", session.doc_id());
                        Some(ServerMessage::Error {
                            message: e.to_string(),
                        })
                    }
                }
            }

            ClientMessage::Pull { revision } => {
                let session = room.session.lock().await;
                let reply = session.apply_pull(revision);
                Some(ServerMessage::History {
                    start_revision: reply.start_revision,
                    ops: reply.ops,
                    current_revision: reply.current_revision,
                    current_doc_state: reply.current_doc_state,
                })
            }
        }
    }
}
