//! Conflicts, integrity warnings, and the manager that resolves them.
//!
//! A [`Conflict`] is created by a document tracker when a remote change
//! arrives while the client holds unsaved edits. It stays in the
//! [`ConflictStore`] until one of the four resolutions succeeds; resolution
//! is terminal and a later detection produces a new conflict with a new id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::SyncError;
use crate::merge::{three_way_merge, MergeResult};
use crate::protocol::{timestamp_now, DocumentType};
use crate::storage::{ConflictStore, DocumentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Remote change while local unsaved changes exist.
    SimultaneousEdit,
    /// Another remote change while a conflict for the document is still open.
    ExternalChange,
    /// A save found the authoritative copy moved since the last sync.
    VersionMismatch,
}

impl ConflictType {
    fn describe(&self, document_type: DocumentType) -> String {
        match self {
            ConflictType::SimultaneousEdit => format!(
                "The {document_type} document was modified externally while you had unsaved changes"
            ),
            ConflictType::ExternalChange => format!(
                "The {document_type} document changed again externally before the previous conflict was resolved"
            ),
            ConflictType::VersionMismatch => format!(
                "The {document_type} document changed on disk since it was last synced; saving would overwrite it"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: Uuid,
    pub project_id: String,
    pub document_type: DocumentType,
    /// Project-qualified path, `<project_id>/<relative_path>`.
    pub file_path: String,
    pub relative_path: String,
    pub local_content: String,
    pub remote_content: String,
    /// Last content both sides agreed on, when known.
    pub base_content: Option<String>,
    pub local_timestamp: u64,
    pub remote_timestamp: u64,
    pub conflict_type: ConflictType,
    pub description: String,
}

impl Conflict {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: impl Into<String>,
        document_type: DocumentType,
        local_content: impl Into<String>,
        remote_content: impl Into<String>,
        base_content: Option<String>,
        local_timestamp: u64,
        remote_timestamp: u64,
        conflict_type: ConflictType,
    ) -> Self {
        let project_id = project_id.into();
        let relative_path = document_type.file_name().to_string();
        Self {
            id: Uuid::new_v4(),
            file_path: format!("{project_id}/{relative_path}"),
            project_id,
            document_type,
            relative_path,
            local_content: local_content.into(),
            remote_content: remote_content.into(),
            base_content,
            local_timestamp,
            remote_timestamp,
            conflict_type,
            description: conflict_type.describe(document_type),
        }
    }
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Keep the local edit; it becomes the authoritative content.
    Local,
    /// Discard the local edit in favour of the remote content.
    Remote,
    /// Use the three-way merge, only if it has no conflicting regions.
    Merge,
    /// Use caller-supplied content.
    Manual,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
            Resolution::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub conflict_id: Uuid,
    pub resolution: Resolution,
    #[serde(default)]
    pub manual_content: Option<String>,
    pub resolved_by: String,
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    pub conflict_id: Uuid,
    pub project_id: String,
    pub document_type: DocumentType,
    pub resolution: Resolution,
    /// Content every party should now hold for the document.
    pub content: String,
}

/// Non-blocking flag that synchronized content failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityWarning {
    pub id: Uuid,
    pub project_id: String,
    pub file_path: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub timestamp: u64,
}

impl IntegrityWarning {
    pub fn new(
        project_id: impl Into<String>,
        file_path: impl Into<String>,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            file_path: file_path.into(),
            errors,
            warnings,
            timestamp: timestamp_now(),
        }
    }
}

/// Lists, resolves and previews conflicts; raises and dismisses warnings.
pub struct ConflictManager {
    documents: Arc<dyn DocumentStore>,
    store: Arc<dyn ConflictStore>,
    /// Serializes resolutions so a conflict is settled at most once.
    resolving: Mutex<()>,
}

impl ConflictManager {
    pub fn new(documents: Arc<dyn DocumentStore>, store: Arc<dyn ConflictStore>) -> Self {
        Self {
            documents,
            store,
            resolving: Mutex::new(()),
        }
    }

    pub fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, SyncError> {
        Ok(self.store.list_conflicts(project_id)?)
    }

    /// Persist a freshly detected conflict.
    pub fn record(&self, conflict: &Conflict) -> Result<(), SyncError> {
        self.store.put_conflict(conflict)?;
        log::info!(
            "Conflict {} recorded for {} ({:?})",
            conflict.id,
            conflict.file_path,
            conflict.conflict_type
        );
        Ok(())
    }

    pub fn get(&self, conflict_id: Uuid) -> Result<Conflict, SyncError> {
        self.store
            .get_conflict(conflict_id)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id}")))
    }

    /// Settle a conflict.
    ///
    /// The chosen content is written before the conflict is deleted, so a
    /// store failure at either step leaves the conflict listed and the call
    /// can be retried.
    pub fn resolve_conflict(&self, request: &ResolveRequest) -> Result<ResolveOutcome, SyncError> {
        let _guard = self.resolving.lock();
        let conflict = self.get(request.conflict_id)?;

        let content = match request.resolution {
            Resolution::Local => conflict.local_content.clone(),
            // The authoritative copy may have moved on since detection
            Resolution::Remote => self
                .documents
                .read(&conflict.project_id, conflict.document_type)?
                .unwrap_or_else(|| conflict.remote_content.clone()),
            Resolution::Merge => {
                let merged = merge_conflict(&conflict);
                if !merged.success {
                    return Err(SyncError::MergeIncomplete(merged.conflicts.len()));
                }
                merged.merged_content
            }
            Resolution::Manual => request.manual_content.clone().ok_or_else(|| {
                SyncError::InvalidRequest("manual resolution requires manualContent".into())
            })?,
        };

        // Remote content already is the authoritative copy.
        if request.resolution != Resolution::Remote {
            self.documents
                .write(&conflict.project_id, conflict.document_type, &content)?;
        }
        self.store.delete_conflict(conflict.id)?;

        log::info!(
            "Conflict {} on {} resolved with '{}' by {}",
            conflict.id,
            conflict.file_path,
            request.resolution,
            request.resolved_by
        );

        Ok(ResolveOutcome {
            conflict_id: conflict.id,
            project_id: conflict.project_id,
            document_type: conflict.document_type,
            resolution: request.resolution,
            content,
        })
    }

    /// Merge preview for a stored conflict. Pure; never persisted.
    pub fn compute_merge(&self, conflict_id: Uuid) -> Result<MergeResult, SyncError> {
        let conflict = self.get(conflict_id)?;
        Ok(merge_conflict(&conflict))
    }

    pub fn raise_integrity_warning(
        &self,
        project_id: &str,
        file_path: &str,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<IntegrityWarning, SyncError> {
        let warning = IntegrityWarning::new(project_id, file_path, errors, warnings);
        self.store.put_warning(&warning)?;
        log::warn!(
            "Integrity warning {} for {}: {} error(s), {} warning(s)",
            warning.id,
            file_path,
            warning.errors.len(),
            warning.warnings.len()
        );
        Ok(warning)
    }

    pub fn dismiss_integrity_warning(&self, warning_id: Uuid) -> Result<(), SyncError> {
        if self.store.delete_warning(warning_id)? {
            log::debug!("Integrity warning {warning_id} dismissed");
            Ok(())
        } else {
            Err(SyncError::NotFound(format!("integrity warning {warning_id}")))
        }
    }

    pub fn list_integrity_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, SyncError> {
        Ok(self.store.list_warnings(project_id)?)
    }

    pub fn store(&self) -> &Arc<dyn ConflictStore> {
        &self.store
    }
}

fn merge_conflict(conflict: &Conflict) -> MergeResult {
    three_way_merge(
        conflict.base_content.as_deref(),
        &conflict.local_content,
        &conflict.remote_content,
    )
}
