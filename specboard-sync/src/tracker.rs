//! Per-document local/last-synced bookkeeping.
//!
//! A [`DocumentSyncTracker`] decides, for each remote change, whether it can
//! be applied safely or must be surfaced as a [`Conflict`]. It never touches
//! a store; the session persists whatever the tracker reports.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conflict::{Conflict, ConflictType};
use crate::protocol::{timestamp_now, DocumentType};

const EXTERNAL_MODIFICATION: &str = "document modified externally while you have unsaved changes";

/// Who produced a write to the local content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOrigin {
    /// The user edited the document.
    Local,
    /// Echo of content the tracker itself applied from the server.
    ServerApplied,
}

/// What a remote change did to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Nothing changed locally (identical content or the echo of our own sync).
    Unchanged,
    /// Remote content became the local and last-synced content.
    Applied(String),
    /// Remote content equals the unsaved local edit; the document is clean again.
    Converged,
    /// Local edits were kept; the conflict must be recorded.
    Conflict(Conflict),
}

/// Read-only view of a tracked document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub project_id: String,
    pub document_type: DocumentType,
    pub local_content: String,
    pub last_synced_content: String,
    pub has_unsaved_changes: bool,
    pub last_synced_at: Option<u64>,
    pub error: Option<String>,
    pub pending_conflict: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DocumentSyncTracker {
    project_id: String,
    document_type: DocumentType,
    local_content: String,
    last_synced_content: String,
    local_modified_at: u64,
    last_synced_at: Option<u64>,
    error: Option<String>,
    pending_conflict: Option<Uuid>,
}

impl DocumentSyncTracker {
    /// Tracker for a document that was never loaded; both copies are empty.
    pub fn new(project_id: impl Into<String>, document_type: DocumentType) -> Self {
        Self {
            project_id: project_id.into(),
            document_type,
            local_content: String::new(),
            last_synced_content: String::new(),
            local_modified_at: 0,
            last_synced_at: None,
            error: None,
            pending_conflict: None,
        }
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn local_content(&self) -> &str {
        &self.local_content
    }

    pub fn last_synced_content(&self) -> &str {
        &self.last_synced_content
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.local_content != self.last_synced_content
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn pending_conflict(&self) -> Option<Uuid> {
        self.pending_conflict
    }

    /// Record a write to the local copy. Returns whether it was applied.
    pub fn update_local_content(&mut self, content: impl Into<String>, origin: WriteOrigin) -> bool {
        match origin {
            WriteOrigin::ServerApplied => false,
            WriteOrigin::Local => {
                self.local_content = content.into();
                self.local_modified_at = timestamp_now();
                true
            }
        }
    }

    /// The local copy has been written to the authoritative store.
    pub fn mark_as_saved(&mut self) {
        self.last_synced_content = self.local_content.clone();
        self.last_synced_at = Some(timestamp_now());
        self.error = None;
    }

    /// `content` was written to the authoritative store. Local edits made
    /// since the write was issued stay unsaved.
    pub fn mark_synced_with(&mut self, content: &str) {
        self.last_synced_content = content.to_string();
        self.last_synced_at = Some(timestamp_now());
        self.error = None;
    }

    /// Replace both copies with authoritative content and drop any pending conflict.
    pub fn reset_to(&mut self, content: impl Into<String>) {
        let content = content.into();
        self.local_content = content.clone();
        self.last_synced_content = content;
        self.last_synced_at = Some(timestamp_now());
        self.error = None;
        self.pending_conflict = None;
    }

    /// Apply the content chosen by a conflict resolution.
    pub fn apply_resolution(&mut self, conflict_id: Uuid, content: impl Into<String>) {
        if self.pending_conflict == Some(conflict_id) {
            self.pending_conflict = None;
        }
        let pending = self.pending_conflict;
        self.reset_to(content);
        self.pending_conflict = pending;
    }

    /// Handle a change of the authoritative copy.
    pub fn on_document_changed(&mut self, remote: &str, remote_timestamp: u64) -> RemoteOutcome {
        if !self.has_unsaved_changes() {
            if remote == self.local_content {
                self.last_synced_at = Some(timestamp_now());
                self.error = None;
                return RemoteOutcome::Unchanged;
            }
            self.reset_to(remote);
            return RemoteOutcome::Applied(remote.to_string());
        }

        if remote == self.last_synced_content {
            return RemoteOutcome::Unchanged;
        }

        if remote == self.local_content {
            self.last_synced_content = remote.to_string();
            self.last_synced_at = Some(timestamp_now());
            self.error = None;
            self.pending_conflict = None;
            return RemoteOutcome::Converged;
        }

        let conflict_type = if self.pending_conflict.is_some() {
            ConflictType::ExternalChange
        } else {
            ConflictType::SimultaneousEdit
        };
        let conflict = self.conflict_with(remote, remote_timestamp, conflict_type);
        self.error = Some(EXTERNAL_MODIFICATION.to_string());
        self.pending_conflict = Some(conflict.id);
        RemoteOutcome::Conflict(conflict)
    }

    /// Conflict raised by a save that found the authoritative copy moved.
    pub fn version_mismatch(&mut self, authoritative: &str) -> Conflict {
        let conflict = self.conflict_with(authoritative, timestamp_now(), ConflictType::VersionMismatch);
        self.error = Some(conflict.description.clone());
        self.pending_conflict = Some(conflict.id);
        conflict
    }

    fn conflict_with(&self, remote: &str, remote_timestamp: u64, conflict_type: ConflictType) -> Conflict {
        Conflict::new(
            self.project_id.clone(),
            self.document_type,
            self.local_content.clone(),
            remote,
            Some(self.last_synced_content.clone()),
            self.local_modified_at,
            remote_timestamp,
            conflict_type,
        )
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            project_id: self.project_id.clone(),
            document_type: self.document_type,
            local_content: self.local_content.clone(),
            last_synced_content: self.last_synced_content.clone(),
            has_unsaved_changes: self.has_unsaved_changes(),
            last_synced_at: self.last_synced_at,
            error: self.error.clone(),
            pending_conflict: self.pending_conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(content: &str) -> DocumentSyncTracker {
        let mut tracker = DocumentSyncTracker::new("alpha", DocumentType::Requirements);
        tracker.reset_to(content);
        tracker
    }

    #[test]
    fn test_dirty_flag_is_derived() {
        let mut tracker = loaded("A");
        assert!(!tracker.has_unsaved_changes());

        tracker.update_local_content("B", WriteOrigin::Local);
        assert!(tracker.has_unsaved_changes());

        tracker.update_local_content("A", WriteOrigin::Local);
        assert!(!tracker.has_unsaved_changes());
    }

    #[test]
    fn test_safe_update_when_clean() {
        let mut tracker = loaded("A");
        let outcome = tracker.on_document_changed("C", 10);
        assert_eq!(outcome, RemoteOutcome::Applied("C".into()));
        assert_eq!(tracker.local_content(), "C");
        assert_eq!(tracker.last_synced_content(), "C");
        assert!(!tracker.has_unsaved_changes());
        assert!(tracker.error().is_none());
    }

    #[test]
    fn test_identical_remote_is_noop() {
        let mut tracker = loaded("A");
        assert_eq!(tracker.on_document_changed("A", 10), RemoteOutcome::Unchanged);
        assert_eq!(tracker.local_content(), "A");
    }

    #[test]
    fn test_echo_after_save_is_noop() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        tracker.mark_as_saved();
        assert!(!tracker.has_unsaved_changes());

        assert_eq!(tracker.on_document_changed("B", 10), RemoteOutcome::Unchanged);
        assert_eq!(tracker.local_content(), "B");
        assert_eq!(tracker.last_synced_content(), "B");
        assert!(tracker.pending_conflict().is_none());
        assert!(tracker.error().is_none());
    }

    #[test]
    fn test_conflict_when_dirty() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);

        let conflict = match tracker.on_document_changed("C", 10) {
            RemoteOutcome::Conflict(c) => c,
            other => panic!("expected conflict, got {other:?}"),
        };
        assert_eq!(conflict.local_content, "B");
        assert_eq!(conflict.remote_content, "C");
        assert_eq!(conflict.base_content.as_deref(), Some("A"));
        assert_eq!(conflict.conflict_type, ConflictType::SimultaneousEdit);
        assert_eq!(conflict.remote_timestamp, 10);

        // Local content untouched, error set
        assert_eq!(tracker.local_content(), "B");
        assert_eq!(tracker.last_synced_content(), "A");
        assert!(tracker.has_unsaved_changes());
        assert_eq!(tracker.error(), Some(EXTERNAL_MODIFICATION));
        assert_eq!(tracker.pending_conflict(), Some(conflict.id));
    }

    #[test]
    fn test_second_remote_change_is_external_change() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        let first = tracker.on_document_changed("C", 10);
        let second = tracker.on_document_changed("D", 20);

        let (RemoteOutcome::Conflict(first), RemoteOutcome::Conflict(second)) = (first, second) else {
            panic!("expected two conflicts");
        };
        assert_ne!(first.id, second.id);
        assert_eq!(second.conflict_type, ConflictType::ExternalChange);
    }

    #[test]
    fn test_echo_of_last_sync_while_dirty() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        assert_eq!(tracker.on_document_changed("A", 10), RemoteOutcome::Unchanged);
        assert_eq!(tracker.local_content(), "B");
        assert!(tracker.error().is_none());
    }

    #[test]
    fn test_remote_equal_to_local_converges() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        assert_eq!(tracker.on_document_changed("B", 10), RemoteOutcome::Converged);
        assert!(!tracker.has_unsaved_changes());
        assert_eq!(tracker.last_synced_content(), "B");
    }

    #[test]
    fn test_server_applied_echo_ignored() {
        let mut tracker = loaded("A");
        tracker.on_document_changed("C", 10);

        // The editor reports back the content we just applied
        assert!(!tracker.update_local_content("C", WriteOrigin::ServerApplied));
        assert!(!tracker.has_unsaved_changes());

        // A stale echo must not clobber state either
        assert!(!tracker.update_local_content("A", WriteOrigin::ServerApplied));
        assert_eq!(tracker.local_content(), "C");
    }

    #[test]
    fn test_mark_as_saved() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        tracker.mark_as_saved();
        assert!(!tracker.has_unsaved_changes());
        assert_eq!(tracker.last_synced_content(), "B");
        assert!(tracker.snapshot().last_synced_at.is_some());
    }

    #[test]
    fn test_mark_synced_with_keeps_newer_edits() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        let saved = tracker.local_content().to_string();
        tracker.update_local_content("BC", WriteOrigin::Local);

        tracker.mark_synced_with(&saved);
        assert_eq!(tracker.last_synced_content(), "B");
        assert!(tracker.has_unsaved_changes());
    }

    #[test]
    fn test_apply_resolution_clears_pending() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        let RemoteOutcome::Conflict(conflict) = tracker.on_document_changed("C", 10) else {
            panic!("expected conflict");
        };

        tracker.apply_resolution(conflict.id, "B");
        assert!(tracker.pending_conflict().is_none());
        assert!(!tracker.has_unsaved_changes());
        assert!(tracker.error().is_none());
        assert_eq!(tracker.last_synced_content(), "B");
    }

    #[test]
    fn test_version_mismatch() {
        let mut tracker = loaded("A");
        tracker.update_local_content("B", WriteOrigin::Local);
        let conflict = tracker.version_mismatch("Z");
        assert_eq!(conflict.conflict_type, ConflictType::VersionMismatch);
        assert_eq!(conflict.remote_content, "Z");
        assert_eq!(conflict.base_content.as_deref(), Some("A"));
        assert!(tracker.error().is_some());
    }
}
