//! Persistent storage seam for collaborative documents.
//!
//! The server talks to storage through the [`DocumentStore`] trait so that a
//! real backend (Redis, RocksDB, ...) can be swapped in without touching the
//! document session logic. [`MemoryStore`] is the default in-process backend
//! and the one the test suite runs against.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::operation::TextOperation;

/// A document as storage sees it: content plus the operation log that
/// produced it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentRecord {
    pub content: String,
    pub revision: u32,
    pub history: Vec<TextOperation>,
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record for document {0}")]
    Corrupt(String),
}

/// Load/save interface for document state.
///
/// A successful `save` must be atomic with respect to concurrent `load`s of
/// the same document id.
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, or `None` if the id is unknown.
    fn load(&self, doc_id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Persist the post-push state of a document. `history_append` is the
    /// operation that produced this revision; it is `None` when recording a
    /// freshly created or seeded document.
    fn save(
        &self,
        doc_id: &str,
        content: &str,
        revision: u32,
        history_append: Option<&TextOperation>,
    ) -> Result<(), StoreError>;
}

/// In-process store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a document with seed content at revision 0.
    pub fn seed(&self, doc_id: impl Into<String>, content: impl Into<String>) {
        let mut records = self.records.lock().expect("store mutex poisoned");
        records.insert(
            doc_id.into(),
            DocumentRecord {
                content: content.into(),
                revision: 0,
                history: Vec::new(),
            },
        );
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.records.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, doc_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let records = self.records.lock().expect("store mutex poisoned");
        Ok(records.get(doc_id).cloned())
    }

    fn save(
        &self,
        doc_id: &str,
        content: &str,
        revision: u32,
        history_append: Option<&TextOperation>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store mutex poisoned");
        let record = records.entry(doc_id.to_string()).or_default();
        record.content = content.to_string();
        record.revision = revision;
        if let Some(op) = history_append {
            record.history.push(op.clone());
        }
        Ok(())
    }
}
