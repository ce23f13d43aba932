//! Client-side synchronisation.
//!
//! [`ClientSync`] is the synchronisation state machine: it owns the local
//! view of the document and turns editor edits, acks, updates and history
//! replies into explicit state transitions. It performs no IO; whenever the
//! server needs to hear something it hands back a [`ClientMessage`] for the
//! caller to send.
//!
//! [`SyncClient`] wraps the machine in a WebSocket connection: a reader task
//! feeding server messages in, a writer task draining outgoing messages, and
//! a periodic auto-push task (default every 200 ms). All three funnel
//! through one async mutex, so edit, timer and socket events never interleave
//! mid-transition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::operation::{OtError, TextOperation};
use crate::protocol::{ClientMessage, ServerMessage};

/// Synchronisation states of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Connected, waiting for the initial document state.
    #[default]
    Initializing,
    /// Local view matches the last known server state.
    Synchronized,
    /// Local edits are buffered but not yet sent.
    Dirty,
    /// An operation has been pushed and its ack is pending.
    AwaitingPush,
    /// Lost track of the server; waiting for a history reply.
    AwaitingPull,
}

/// Client-side errors surfaced to the embedding editor.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no initial state received yet")]
    NotReady,
    #[error(transparent)]
    Operation(#[from] OtError),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection closed")]
    Closed,
}

/// A single editor edit: `deleted` characters removed and `inserted` text
/// added at `position` of the visible document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditorDelta {
    pub position: usize,
    pub deleted: usize,
    pub inserted: String,
}

/// The synchronisation state machine for one document session.
#[derive(Debug, Default)]
pub struct ClientSync {
    state: SyncState,
    // Content at `server_revision`; outstanding and buffered not applied.
    synced_doc: String,
    // The editor's visible state: synced + outstanding + buffered.
    virtual_doc: String,
    server_revision: u32,
    // Pushed, not yet acked.
    outstanding: Option<TextOperation>,
    // Composed local edits, not yet pushed.
    buffered: Option<TextOperation>,
    // Updates received while a push is in flight.
    update_queue: VecDeque<(u32, TextOperation)>,
}

impl ClientSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// The editor's visible document.
    pub fn content(&self) -> &str {
        &self.virtual_doc
    }

    /// The document as of the last acknowledged server revision.
    pub fn synced_content(&self) -> &str {
        &self.synced_doc
    }

    pub fn server_revision(&self) -> u32 {
        self.server_revision
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn has_buffered(&self) -> bool {
        self.buffered.is_some()
    }

    /// Route any server message to its handler, returning a message to send
    /// back when one is required.
    pub fn handle_message(&mut self, msg: ServerMessage) -> Option<ClientMessage> {
        match msg {
            ServerMessage::InitialState { doc, revision } => {
                self.handle_initial_state(doc, revision);
                None
            }
            ServerMessage::Ack { revision } => self.handle_ack(revision),
            ServerMessage::Update { revision, op } => self.handle_update(revision, op),
            ServerMessage::History {
                start_revision,
                ops,
                current_revision,
                current_doc_state,
            } => {
                self.handle_history(start_revision, ops, current_revision, current_doc_state);
                None
            }
            ServerMessage::Error { message } => self.handle_server_error(&message),
        }
    }

    /// Adopt the initial document state, discarding anything local.
    pub fn handle_initial_state(&mut self, doc: String, revision: u32) {
        self.synced_doc = doc.clone();
        self.virtual_doc = doc;
        self.server_revision = revision;
        self.outstanding = None;
        self.buffered = None;
        self.update_queue.clear();
        self.state = SyncState::Synchronized;
    }

    /// Fold a local edit into the buffered operation and the visible
    /// document. Valid in every state except `Initializing`; a resync in
    /// progress does not block typing.
    pub fn apply_edit(&mut self, delta: &EditorDelta) -> Result<(), ClientError> {
        if self.state() == SyncState::Initializing {
            return Err(ClientError::NotReady);
        }
        let doc_len = self.virtual_doc.chars().count();
        let op = TextOperation::from_edit(delta.position, delta.deleted, &delta.inserted, doc_len)?;
        if op.is_noop() {
            return Ok(());
        }
        self.virtual_doc = op.apply(&self.virtual_doc)?;
        self.buffered = Some(match self.buffered.take() {
            Some(buffered) => buffered.compose(&op)?,
            None => op,
        });
        self.refresh_idle_state();
        Ok(())
    }

    /// The push tick: snapshot the buffered operation into the outstanding
    /// slot and produce the push message. Returns `None` when there is
    /// nothing worth sending or a push/pull is already in flight.
    pub fn take_push(&mut self) -> Option<ClientMessage> {
        if !matches!(self.state(), SyncState::Synchronized | SyncState::Dirty) {
            return None;
        }
        let buffered = self.buffered.take()?;
        if buffered.is_noop() {
            self.refresh_idle_state();
            return None;
        }
        self.state = SyncState::AwaitingPush;
        let op = buffered.clone();
        self.outstanding = Some(buffered);
        Some(ClientMessage::Push {
            revision: self.server_revision,
            op,
        })
    }

    /// Handle the ack for the outstanding push.
    ///
    /// Updates queued while the push was in flight were serialised by the
    /// server before our operation, so they are drained first, with the
    /// outstanding op transformed along. Only then is the outstanding op
    /// folded into the synced document.
    pub fn handle_ack(&mut self, revision: u32) -> Option<ClientMessage> {
        if self.state() == SyncState::AwaitingPull {
            debug!("ignoring ack for revision {revision} while resynchronising");
            return None;
        }
        if self.outstanding.is_none() {
            warn!("ack for revision {revision} without an outstanding push");
            return Some(self.begin_pull());
        }

        while let Some((rev, op)) = self.update_queue.pop_front() {
            if let Some(pull) = self.integrate_update(rev, op) {
                return Some(pull);
            }
        }
        if self.server_revision + 1 != revision {
            warn!(
                "ack for revision {revision} but update queue drained to {}",
                self.server_revision
            );
            return Some(self.begin_pull());
        }

        let Some(outstanding) = self.outstanding.take() else {
            return Some(self.begin_pull());
        };
        match outstanding.apply(&self.synced_doc) {
            Ok(doc) => self.synced_doc = doc,
            Err(e) => {
                warn!("acked operation no longer applies: {e}");
                return Some(self.begin_pull());
            }
        }
        self.server_revision = revision;
        self.reconcile_state();
        None
    }

    /// Handle a broadcast update from another client.
    pub fn handle_update(&mut self, revision: u32, op: TextOperation) -> Option<ClientMessage> {
        match self.state() {
            SyncState::AwaitingPush => {
                self.update_queue.push_back((revision, op));
                None
            }
            SyncState::AwaitingPull => {
                // The pending history reply supersedes live updates; anything
                // it misses will trigger a fresh pull.
                debug!("dropping update {revision} while resynchronising");
                None
            }
            SyncState::Initializing => {
                debug!("dropping update {revision} before initial state");
                None
            }
            SyncState::Synchronized | SyncState::Dirty => self.integrate_update(revision, op),
        }
    }

    /// Handle a history reply, either replaying the missed operations or
    /// resetting to the authoritative state the server sent along.
    pub fn handle_history(
        &mut self,
        start_revision: u32,
        ops: Vec<TextOperation>,
        current_revision: u32,
        current_doc_state: String,
    ) {
        if self.state() != SyncState::AwaitingPull {
            debug!("ignoring unsolicited history starting at {start_revision}");
            return;
        }
        // With a push in limbo the replay could double-apply our own
        // operation, so take the authoritative state instead.
        if start_revision != self.server_revision + 1 || self.outstanding.is_some() {
            self.authoritative_reset(current_doc_state, current_revision);
            return;
        }
        let mut revision = start_revision;
        for op in ops {
            if let Err(e) = self.apply_remote(revision, op) {
                warn!("history replay failed at revision {revision}: {e}");
                self.authoritative_reset(current_doc_state, current_revision);
                return;
            }
            revision += 1;
        }
        self.reconcile_state();
    }

    /// Handle a protocol error from the server by resynchronising.
    pub fn handle_server_error(&mut self, message: &str) -> Option<ClientMessage> {
        warn!("server reported: {message}");
        match self.state() {
            SyncState::Initializing | SyncState::AwaitingPull => None,
            _ => Some(self.begin_pull()),
        }
    }

    /// Integrate an update in a state where it may be applied immediately.
    /// Returns the pull message when the update cannot be used.
    fn integrate_update(&mut self, revision: u32, op: TextOperation) -> Option<ClientMessage> {
        if revision != self.server_revision + 1 {
            warn!(
                "update revision {revision} does not follow {}, resynchronising",
                self.server_revision
            );
            return Some(self.begin_pull());
        }
        if let Err(e) = self.apply_remote(revision, op) {
            warn!("failed to integrate update {revision}: {e}");
            return Some(self.begin_pull());
        }
        self.reconcile_state();
        None
    }

    /// Transform a server operation past the outstanding and buffered ops
    /// and apply it to both document copies.
    ///
    /// The server op applies to the synced document untransformed: updates
    /// only arrive ahead of our own ack, so they were serialised before the
    /// outstanding op and share its base. The visible document needs the op
    /// transformed past both local ops.
    fn apply_remote(&mut self, revision: u32, op: TextOperation) -> Result<(), OtError> {
        let mut for_virtual = op.clone();
        if let Some(outstanding) = self.outstanding.as_mut() {
            if for_virtual.base_len() != outstanding.base_len() {
                return Err(OtError::BaseMismatch {
                    left: for_virtual.base_len(),
                    right: outstanding.base_len(),
                });
            }
            // The server op is earlier in the serialisation order and keeps
            // insertion priority.
            let (transformed, outstanding_prime) = for_virtual.transform(outstanding)?;
            for_virtual = transformed;
            *outstanding = outstanding_prime;
        }
        if let Some(buffered) = self.buffered.as_mut() {
            if for_virtual.base_len() != buffered.base_len() {
                return Err(OtError::BaseMismatch {
                    left: for_virtual.base_len(),
                    right: buffered.base_len(),
                });
            }
            let (transformed, buffered_prime) = for_virtual.transform(buffered)?;
            for_virtual = transformed;
            *buffered = buffered_prime;
        }
        self.synced_doc = op.apply(&self.synced_doc)?;
        self.virtual_doc = for_virtual.apply(&self.virtual_doc)?;
        self.server_revision = revision;
        Ok(())
    }

    /// Enter `AwaitingPull` and produce the pull request.
    fn begin_pull(&mut self) -> ClientMessage {
        self.state = SyncState::AwaitingPull;
        self.update_queue.clear();
        ClientMessage::Pull {
            revision: self.server_revision,
        }
    }

    /// Replace everything local with the authoritative server state.
    fn authoritative_reset(&mut self, doc: String, revision: u32) {
        warn!("resetting to authoritative state at revision {revision}");
        self.synced_doc = doc.clone();
        self.virtual_doc = doc;
        self.server_revision = revision;
        self.outstanding = None;
        self.buffered = None;
        self.update_queue.clear();
        self.state = SyncState::Synchronized;
    }

    /// Recompute the state after an ack or update settles.
    fn reconcile_state(&mut self) {
        if self.outstanding.is_some() {
            self.state = SyncState::AwaitingPush;
            return;
        }
        self.refresh_from_dirtiness();
    }

    /// Recompute Synchronized/Dirty after a local edit. Push and pull states
    /// are preserved.
    fn refresh_idle_state(&mut self) {
        if matches!(self.state(), SyncState::Synchronized | SyncState::Dirty) {
            self.refresh_from_dirtiness();
        }
    }

    fn refresh_from_dirtiness(&mut self) {
        if self.buffered.as_ref().is_some_and(|b| b.is_noop()) {
            self.buffered = None;
        }
        let dirty = self.buffered.is_some() || self.virtual_doc != self.synced_doc;
        self.state = if dirty {
            SyncState::Dirty
        } else {
            SyncState::Synchronized
        };
    }
}

/// Configuration for a [`SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    /// Document to open; appended to the URL as the path.
    pub doc_id: String,
    /// How often buffered edits are pushed.
    pub push_interval: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            doc_id: doc_id.into(),
            push_interval: Duration::from_millis(200),
        }
    }
}

/// Events emitted to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Initial state received; the document is editable.
    Synchronized { revision: u32 },
    /// A remote operation was folded into the visible document.
    Updated { revision: u32 },
    /// The server acknowledged our push.
    Acked { revision: u32 },
    /// A pull round-trip finished.
    Resynced { revision: u32 },
    /// The connection is gone; a reconnect starts a fresh session.
    Disconnected,
}

/// WebSocket client driving a [`ClientSync`] machine.
pub struct SyncClient {
    sync: Arc<Mutex<ClientSync>>,
    outgoing_tx: mpsc::Sender<String>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    doc_id: String,
    reader_task: JoinHandle<()>,
    push_task: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `server_url` and open `doc_id` with default settings.
    pub async fn connect(server_url: &str, doc_id: &str) -> Result<Self, ClientError> {
        Self::connect_with(ClientConfig::new(server_url, doc_id)).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with(config: ClientConfig) -> Result<Self, ClientError> {
        let url = format!("{}/{}", config.server_url, config.doc_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let sync = Arc::new(Mutex::new(ClientSync::new()));
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(256);
        let (event_tx, event_rx) = mpsc::channel::<SyncEvent>(256);

        // Writer task: drain the outgoing channel onto the socket.
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: feed server messages through the state machine.
        let reader_task = {
            let sync = sync.clone();
            let outgoing_tx = outgoing_tx.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            let server_msg = match ServerMessage::decode(text.as_str()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    warn!("undecodable server message: {e}");
                                    continue;
                                }
                            };
                            let event = match &server_msg {
                                ServerMessage::InitialState { revision, .. } => {
                                    Some(SyncEvent::Synchronized {
                                        revision: *revision,
                                    })
                                }
                                ServerMessage::Ack { revision } => Some(SyncEvent::Acked {
                                    revision: *revision,
                                }),
                                ServerMessage::Update { revision, .. } => {
                                    Some(SyncEvent::Updated {
                                        revision: *revision,
                                    })
                                }
                                ServerMessage::History {
                                    current_revision, ..
                                } => Some(SyncEvent::Resynced {
                                    revision: *current_revision,
                                }),
                                ServerMessage::Error { .. } => None,
                            };
                            let outbound = {
                                let mut sync = sync.lock().await;
                                sync.handle_message(server_msg)
                            };
                            if let Some(reply) = outbound {
                                match reply.encode() {
                                    Ok(encoded) => {
                                        let _ = outgoing_tx.send(encoded).await;
                                    }
                                    Err(e) => warn!("failed to encode reply: {e}"),
                                }
                            }
                            if let Some(event) = event {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                let _ = event_tx.send(SyncEvent::Disconnected).await;
            })
        };

        // Auto-push task: the cooperative push tick.
        let push_task = {
            let sync = sync.clone();
            let outgoing_tx = outgoing_tx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(config.push_interval);
                loop {
                    interval.tick().await;
                    let push = {
                        let mut sync = sync.lock().await;
                        sync.take_push()
                    };
                    if let Some(msg) = push {
                        match msg.encode() {
                            Ok(encoded) => {
                                if outgoing_tx.send(encoded).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("failed to encode push: {e}"),
                        }
                    }
                }
            })
        };

        Ok(Self {
            sync,
            outgoing_tx,
            event_rx: Some(event_rx),
            doc_id: config.doc_id,
            reader_task,
            push_task,
        })
    }

    /// Take the event receiver; only the first call returns it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Apply a local edit to the visible document.
    pub async fn edit(
        &self,
        position: usize,
        deleted: usize,
        inserted: &str,
    ) -> Result<(), ClientError> {
        let delta = EditorDelta {
            position,
            deleted,
            inserted: inserted.to_string(),
        };
        self.sync.lock().await.apply_edit(&delta)
    }

    /// Push buffered edits immediately instead of waiting for the tick.
    pub async fn push_now(&self) -> Result<(), ClientError> {
        let push = {
            let mut sync = self.sync.lock().await;
            sync.take_push()
        };
        if let Some(msg) = push {
            let encoded = msg
                .encode()
                .map_err(|e| ClientError::Connection(e.to_string()))?;
            self.outgoing_tx
                .send(encoded)
                .await
                .map_err(|_| ClientError::Closed)?;
        }
        Ok(())
    }

    /// The editor's visible document.
    pub async fn content(&self) -> String {
        self.sync.lock().await.content().to_string()
    }

    pub async fn state(&self) -> SyncState {
        self.sync.lock().await.state()
    }

    pub async fn server_revision(&self) -> u32 {
        self.sync.lock().await.server_revision()
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.push_task.abort();
    }
}
