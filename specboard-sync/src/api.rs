//! The boundary between sync sessions and the server.
//!
//! [`SyncApi`] is implemented in process by `SyncServer` and over WebSocket
//! by `RemoteApi`. Sessions only ever talk to a `dyn SyncApi`.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::conflict::{Conflict, IntegrityWarning, ResolveOutcome, ResolveRequest};
use crate::error::SyncError;
use crate::merge::MergeResult;
use crate::protocol::{ChangeEvent, DocumentType, RpcCall, RpcReply};

/// Ordered stream of a project's change events.
///
/// `next()` yields `None` once the server ends the stream and `Some(Err(_))`
/// on a transport failure. Dropping the subscription unsubscribes.
pub struct Subscription {
    id: Uuid,
    project_id: String,
    rx: mpsc::Receiver<Result<ChangeEvent, SyncError>>,
    task: Option<AbortHandle>,
}

impl Subscription {
    pub fn new(
        id: Uuid,
        project_id: impl Into<String>,
        rx: mpsc::Receiver<Result<ChangeEvent, SyncError>>,
        task: Option<AbortHandle>,
    ) -> Self {
        Self {
            id,
            project_id: project_id.into(),
            rx,
            task,
        }
    }

    /// Subscription fed by an arbitrary channel.
    pub fn from_channel(
        project_id: impl Into<String>,
        rx: mpsc::Receiver<Result<ChangeEvent, SyncError>>,
    ) -> Self {
        Self::new(Uuid::new_v4(), project_id, rx, None)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub async fn next(&mut self) -> Option<Result<ChangeEvent, SyncError>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .finish()
    }
}

#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Open the event stream of a project. The first event is `connected`.
    async fn subscribe(&self, project_id: &str) -> Result<Subscription, SyncError>;

    async fn start_watcher(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError>;

    async fn stop_watcher(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError>;

    async fn watcher_status(&self, project_id: &str) -> Result<bool, SyncError>;

    /// Authoritative content; `NotFound` if the document does not exist.
    async fn fetch_document(&self, project_id: &str, document_type: DocumentType) -> Result<String, SyncError>;

    async fn save_document(
        &self,
        project_id: &str,
        document_type: DocumentType,
        content: &str,
    ) -> Result<(), SyncError>;

    async fn list_conflicts(&self, project_id: &str) -> Result<Vec<Conflict>, SyncError>;

    async fn record_conflict(&self, conflict: &Conflict) -> Result<(), SyncError>;

    async fn resolve_conflict(&self, request: &ResolveRequest) -> Result<ResolveOutcome, SyncError>;

    async fn merge_preview(&self, conflict_id: Uuid) -> Result<MergeResult, SyncError>;

    async fn raise_warning(
        &self,
        project_id: &str,
        file_path: &str,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Result<IntegrityWarning, SyncError>;

    async fn list_warnings(&self, project_id: &str) -> Result<Vec<IntegrityWarning>, SyncError>;

    async fn dismiss_warning(&self, warning_id: Uuid) -> Result<(), SyncError>;
}

/// Execute an RPC call against an API implementation.
pub async fn dispatch(api: &dyn SyncApi, call: RpcCall) -> Result<RpcReply, SyncError> {
    Ok(match call {
        RpcCall::StartWatcher { project_id, holder } => {
            api.start_watcher(&project_id, holder).await?;
            RpcReply::Ack
        }
        RpcCall::StopWatcher { project_id, holder } => {
            api.stop_watcher(&project_id, holder).await?;
            RpcReply::Ack
        }
        RpcCall::WatcherStatus { project_id } => RpcReply::WatcherStatus(api.watcher_status(&project_id).await?),
        RpcCall::FetchDocument {
            project_id,
            document_type,
        } => RpcReply::Document(api.fetch_document(&project_id, document_type).await?),
        RpcCall::SaveDocument {
            project_id,
            document_type,
            content,
        } => {
            api.save_document(&project_id, document_type, &content).await?;
            RpcReply::Ack
        }
        RpcCall::ListConflicts { project_id } => RpcReply::Conflicts(api.list_conflicts(&project_id).await?),
        RpcCall::RecordConflict { conflict } => {
            api.record_conflict(&conflict).await?;
            RpcReply::Ack
        }
        RpcCall::ResolveConflict { request } => RpcReply::Resolved(api.resolve_conflict(&request).await?),
        RpcCall::MergePreview { conflict_id } => RpcReply::Merge(api.merge_preview(conflict_id).await?),
        RpcCall::RaiseWarning {
            project_id,
            file_path,
            errors,
            warnings,
        } => RpcReply::Warning(api.raise_warning(&project_id, &file_path, errors, warnings).await?),
        RpcCall::ListWarnings { project_id } => RpcReply::Warnings(api.list_warnings(&project_id).await?),
        RpcCall::DismissWarning { warning_id } => {
            api.dismiss_warning(warning_id).await?;
            RpcReply::Ack
        }
    })
}
