//! Per-document authoritative state.
//!
//! A [`DocumentSession`] owns the content, revision counter and operation
//! history of one document and serialises every push and pull against it.
//! The server keeps each session behind its own async mutex, so for a given
//! document there is a single total order of mutations; different documents
//! proceed independently.

use log::warn;
use thiserror::Error;

use crate::operation::{OtError, TextOperation};
use crate::storage::DocumentRecord;

/// Errors from push/pull handling.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client claimed a revision the server has never issued.
    #[error("revision {given} outside [0, {current}]")]
    InvalidRevision { given: u32, current: u32 },
    /// A transform precondition failed against a stored history entry. The
    /// document's invariants can no longer be trusted; it is degraded until
    /// rehydrated from storage.
    #[error("history inconsistency at revision {revision}: {source}")]
    HistoryInconsistency { revision: u32, source: OtError },
    /// The document is degraded and refuses writes until rehydration.
    #[error("document {0} is degraded, reload from storage required")]
    Degraded(String),
}

/// Result of a successful push: the new revision and the operation as it was
/// actually applied, ready to broadcast and persist.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub revision: u32,
    pub op: TextOperation,
}

/// Reply to a pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryReply {
    pub start_revision: u32,
    pub ops: Vec<TextOperation>,
    pub current_revision: u32,
    pub current_doc_state: String,
    /// Set when the requested revision was out of range and the entire
    /// history was returned instead.
    pub full_reset: bool,
}

/// Snapshot of the mutable state, taken before a push so that a failed
/// persistence write can roll the session back.
#[derive(Debug, Clone)]
pub struct SessionCheckpoint {
    content: String,
    revision: u32,
}

/// Authoritative state of a single document.
#[derive(Debug)]
pub struct DocumentSession {
    doc_id: String,
    content: String,
    revision: u32,
    // history[i] transforms revision i into revision i + 1.
    history: Vec<TextOperation>,
    degraded: bool,
}

impl DocumentSession {
    /// Create an empty document at revision 0.
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: String::new(),
            revision: 0,
            history: Vec::new(),
            degraded: false,
        }
    }

    /// Restore a session from a stored record.
    pub fn from_record(doc_id: impl Into<String>, record: DocumentRecord) -> Self {
        Self {
            doc_id: doc_id.into(),
            content: record.content,
            revision: record.revision,
            history: record.history,
            degraded: false,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn history(&self) -> &[TextOperation] {
        &self.history
    }

    /// Whether the document refuses writes until rehydration.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The session state as a storable record.
    pub fn record(&self) -> DocumentRecord {
        DocumentRecord {
            content: self.content.clone(),
            revision: self.revision,
            history: self.history.clone(),
        }
    }

    /// Snapshot content and revision ahead of a push.
    pub fn checkpoint(&self) -> SessionCheckpoint {
        SessionCheckpoint {
            content: self.content.clone(),
            revision: self.revision,
        }
    }

    /// Roll back to a checkpoint taken before a failed push.
    pub fn restore(&mut self, checkpoint: SessionCheckpoint) {
        self.content = checkpoint.content;
        self.revision = checkpoint.revision;
        self.history.truncate(checkpoint.revision as usize);
    }

    /// Replace the session state with a freshly loaded record, clearing the
    /// degraded flag.
    pub fn rehydrate(&mut self, record: DocumentRecord) {
        self.content = record.content;
        self.revision = record.revision;
        self.history = record.history;
        self.degraded = false;
    }

    /// Accept an operation a client built against `client_revision`.
    ///
    /// The operation is transformed over every history entry the client had
    /// not seen, with the already serialised entries keeping insertion
    /// priority, then applied and appended to the history.
    pub fn apply_push(
        &mut self,
        mut op: TextOperation,
        client_revision: u32,
    ) -> Result<PushOutcome, SessionError> {
        if self.degraded {
            return Err(SessionError::Degraded(self.doc_id.clone()));
        }
        if client_revision > self.revision {
            return Err(SessionError::InvalidRevision {
                given: client_revision,
                current: self.revision,
            });
        }

        for (offset, entry) in self.history[client_revision as usize..].iter().enumerate() {
            let revision = client_revision + offset as u32;
            if op.base_len() != entry.base_len() {
                self.degraded = true;
                return Err(SessionError::HistoryInconsistency {
                    revision,
                    source: OtError::BaseMismatch {
                        left: op.base_len(),
                        right: entry.base_len(),
                    },
                });
            }
            // The stored entry is earlier in the serialisation order, so it
            // goes first and only the transformed client op is kept.
            let (_, transformed) = entry.transform(&op).map_err(|source| {
                self.degraded = true;
                SessionError::HistoryInconsistency { revision, source }
            })?;
            op = transformed;
        }

        let content = op.apply(&self.content).map_err(|source| {
            self.degraded = true;
            SessionError::HistoryInconsistency {
                revision: self.revision,
                source,
            }
        })?;

        self.content = content;
        self.revision += 1;
        self.history.push(op.clone());

        Ok(PushOutcome {
            revision: self.revision,
            op,
        })
    }

    /// Answer a pull for the history since `client_revision`.
    ///
    /// An out-of-range revision yields the entire history so the client can
    /// reset from `current_doc_state`.
    pub fn apply_pull(&self, client_revision: u32) -> HistoryReply {
        if client_revision > self.revision {
            warn!(
                "doc {}: pull for unknown revision {client_revision}, returning full history",
                self.doc_id
            );
            return HistoryReply {
                start_revision: 1,
                ops: self.history.clone(),
                current_revision: self.revision,
                current_doc_state: self.content.clone(),
                full_reset: true,
            };
        }
        HistoryReply {
            start_revision: client_revision + 1,
            ops: self.history[client_revision as usize..].to_vec(),
            current_revision: self.revision,
            current_doc_state: self.content.clone(),
            full_reset: false,
        }
    }
}
