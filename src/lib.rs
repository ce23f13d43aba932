//! # tandem — real-time collaborative plain-text editing
//!
//! A central server serialises the operations of many concurrent editors so
//! that every client converges to the same document, using operational
//! transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │   JSON messages     │  (central)   │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ ClientSync  │                     │ Document     │
//! │ (sync FSM)  │                     │ Session      │
//! └─────────────┘                     │ (authority)  │
//!                                     └──────┬───────┘
//!                                            │
//!                                   ┌────────┴────────┐
//!                                   │ BroadcastGroup  │
//!                                   │ (fan-out)       │
//!                                   └─────────────────┘
//! ```
//!
//! A local edit becomes a [`TextOperation`] composed into the client's
//! buffered op; the auto-push tick sends it to the server, which transforms
//! it against any concurrently applied history entries, applies it, acks the
//! originator and broadcasts the transformed op to everyone else. Receivers
//! transform the update past their own in-flight ops before applying it, so
//! all replicas converge regardless of interleaving.
//!
//! ## Modules
//!
//! - [`operation`] — the OT algebra: apply, invert, compose, transform
//! - [`protocol`] — wire codec: compact op arrays + JSON message envelopes
//! - [`session`] — per-document authoritative state and serialisation
//! - [`broadcast`] — update fan-out and the document registry
//! - [`server`] — WebSocket host
//! - [`client`] — client sync state machine + WebSocket client
//! - [`storage`] — document store trait and the in-memory backend

pub mod broadcast;
pub mod client;
pub mod operation;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastFrame, BroadcastGroup, DocumentRegistry, DocumentRoom};
pub use client::{
    ClientConfig, ClientError, ClientSync, EditorDelta, SyncClient, SyncEvent, SyncState,
};
pub use operation::{OpComponent, OtError, TextOperation};
pub use protocol::{ClientMessage, DecodeError, ServerMessage};
pub use server::{CollabServer, ServerConfig};
pub use session::{DocumentSession, HistoryReply, PushOutcome, SessionError};
pub use storage::{DocumentRecord, DocumentStore, MemoryStore, StoreError};
