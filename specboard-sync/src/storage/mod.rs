//! Persistence boundaries of the engine.
//!
//! ```text
//! ┌──────────────┐  read/write   ┌───────────────────────────────┐
//! │ SyncServer   │ ────────────► │ DocumentStore                 │
//! │ ConflictMgr  │               │  memory │ filesystem │ RocksDB │
//! └──────┬───────┘               └───────────────────────────────┘
//!        │ put/list/delete       ┌───────────────────────────────┐
//!        └─────────────────────► │ ConflictStore                 │
//!                                │  memory │ RocksDB             │
//!                                └───────────────────────────────┘
//! ```
//!
//! The document store is last-writer-wins; conflict avoidance lives above it.
//! Both traits are synchronous and must tolerate concurrent callers.

pub mod fs;
pub mod memory;
pub mod rocks;

pub use fs::FsDocumentStore;
pub use memory::{MemoryConflictStore, MemoryDocumentStore};
pub use rocks::{RocksStore, StoreConfig};

use uuid::Uuid;

use crate::conflict::{Conflict, IntegrityWarning};
use crate::protocol::DocumentType;

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    /// Backing service refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

/// Authoritative document content, one text per (project, document type).
pub trait DocumentStore: Send + Sync {
    /// Current content, or `None` if the document does not exist.
    fn read(&self, project_id: &str, document_type: DocumentType) -> Result<Option<String>, StoreError>;

    fn write(&self, project_id: &str, document_type: DocumentType, content: &str) -> Result<(), StoreError>;
}

/// Unresolved conflicts and integrity warnings, shared by every session of a project.
pub trait ConflictStore: Send + Sync {
    fn put_conflict(&self, conflict: &Conflict) -> Result<(), StoreError>;

    fn get_conflict(&self, id: Uuid) -> Result<Option<Conflict>, StoreError>;

    /// Unresolved conflicts of a project, oldest remote change first.
    fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, StoreError>;

    /// Returns whether a conflict was removed.
    fn delete_conflict(&self, id: Uuid) -> Result<bool, StoreError>;

    fn put_warning(&self, warning: &IntegrityWarning) -> Result<(), StoreError>;

    /// Warnings of a project, oldest first.
    fn list_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, StoreError>;

    fn delete_warning(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Total number of stored (conflicts, warnings) across all projects.
    fn counts(&self) -> Result<(usize, usize), StoreError>;
}

pub(crate) fn sort_conflicts(conflicts: &mut [Conflict]) {
    conflicts.sort_by(|a, b| {
        a.remote_timestamp
            .cmp(&b.remote_timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn sort_warnings(warnings: &mut [IntegrityWarning]) {
    warnings.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}
