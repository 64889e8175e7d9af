//! In-memory stores.
//!
//! Used by tests and by servers that run without persistence. Both stores
//! can be told to refuse writes (and the document store reads), which
//! simulates a failing backing service.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{sort_conflicts, sort_warnings, ConflictStore, DocumentStore, StoreError};
use crate::conflict::{Conflict, IntegrityWarning};
use crate::protocol::DocumentType;

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<(String, DocumentType), String>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with [`StoreError::Unavailable`].
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn read(&self, project_id: &str, document_type: DocumentType) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("document reads disabled".into()));
        }
        Ok(self
            .documents
            .read()
            .get(&(project_id.to_string(), document_type))
            .cloned())
    }

    fn write(&self, project_id: &str, document_type: DocumentType, content: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("document writes disabled".into()));
        }
        self.documents
            .write()
            .insert((project_id.to_string(), document_type), content.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryConflictStore {
    conflicts: RwLock<HashMap<Uuid, Conflict>>,
    warnings: RwLock<HashMap<Uuid, IntegrityWarning>>,
    fail_writes: AtomicBool,
}

impl MemoryConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent put/delete fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("conflict store writes disabled".into()));
        }
        Ok(())
    }
}

impl ConflictStore for MemoryConflictStore {
    fn put_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        self.check_writable()?;
        self.conflicts.write().insert(conflict.id, conflict.clone());
        Ok(())
    }

    fn get_conflict(&self, id: Uuid) -> Result<Option<Conflict>, StoreError> {
        Ok(self.conflicts.read().get(&id).cloned())
    }

    fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, StoreError> {
        let mut conflicts: Vec<Conflict> = self
            .conflicts
            .read()
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        sort_conflicts(&mut conflicts);
        Ok(conflicts)
    }

    fn delete_conflict(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.conflicts.write().remove(&id).is_some())
    }

    fn put_warning(&self, warning: &IntegrityWarning) -> Result<(), StoreError> {
        self.check_writable()?;
        self.warnings.write().insert(warning.id, warning.clone());
        Ok(())
    }

    fn list_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, StoreError> {
        let mut warnings: Vec<IntegrityWarning> = self
            .warnings
            .read()
            .values()
            .filter(|w| w.project_id == project_id)
            .cloned()
            .collect();
        sort_warnings(&mut warnings);
        Ok(warnings)
    }

    fn delete_warning(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.warnings.write().remove(&id).is_some())
    }

    fn counts(&self) -> Result<(usize, usize), StoreError> {
        Ok((self.conflicts.read().len(), self.warnings.read().len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictType;

    fn conflict(project: &str, remote_ts: u64) -> Conflict {
        Conflict::new(
            project,
            DocumentType::Design,
            "B",
            "C",
            Some("A".to_string()),
            1,
            remote_ts,
            ConflictType::SimultaneousEdit,
        )
    }

    #[test]
    fn test_documents_read_write() {
        let store = MemoryDocumentStore::new();
        assert!(store.read("p", DocumentType::Tasks).unwrap().is_none());

        store.write("p", DocumentType::Tasks, "- [ ] one").unwrap();
        assert_eq!(store.read("p", DocumentType::Tasks).unwrap().as_deref(), Some("- [ ] one"));
        assert!(store.read("other", DocumentType::Tasks).unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_document_write_failure() {
        let store = MemoryDocumentStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.write("p", DocumentType::Tasks, "x"),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_document_read_failure() {
        let store = MemoryDocumentStore::new();
        store.write("p", DocumentType::Tasks, "x").unwrap();
        store.set_fail_reads(true);
        assert!(matches!(
            store.read("p", DocumentType::Tasks),
            Err(StoreError::Unavailable(_))
        ));
        store.set_fail_reads(false);
        assert_eq!(store.read("p", DocumentType::Tasks).unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn test_conflicts_scoped_by_project_and_ordered() {
        let store = MemoryConflictStore::new();
        let late = conflict("p", 20);
        let early = conflict("p", 10);
        let other = conflict("q", 5);
        store.put_conflict(&late).unwrap();
        store.put_conflict(&early).unwrap();
        store.put_conflict(&other).unwrap();

        let listed = store.list_conflicts("p").unwrap();
        assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![early.id, late.id]);
        assert_eq!(store.counts().unwrap(), (3, 0));

        assert!(store.delete_conflict(early.id).unwrap());
        assert!(!store.delete_conflict(early.id).unwrap());
        assert!(store.get_conflict(early.id).unwrap().is_none());
    }

    #[test]
    fn test_failed_delete_keeps_conflict() {
        let store = MemoryConflictStore::new();
        let c = conflict("p", 1);
        store.put_conflict(&c).unwrap();

        store.set_fail_writes(true);
        assert!(store.delete_conflict(c.id).is_err());
        assert!(store.get_conflict(c.id).unwrap().is_some());
    }

    #[test]
    fn test_warnings_roundtrip() {
        let store = MemoryConflictStore::new();
        let warning = IntegrityWarning::new("p", "p/config.json", vec!["bad json".into()], vec![]);
        store.put_warning(&warning).unwrap();
        assert_eq!(store.list_warnings("p").unwrap(), vec![warning.clone()]);
        assert!(store.list_warnings("q").unwrap().is_empty());
        assert!(store.delete_warning(warning.id).unwrap());
        assert!(store.list_warnings("p").unwrap().is_empty());
    }
}
