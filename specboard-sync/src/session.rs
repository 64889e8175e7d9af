//! Client side of the engine: one sync session per client per project.
//!
//! ```text
//!   disconnected ──start_sync──► connecting ──subscribed──► connected
//!        ▲                          │  ▲                       │
//!        │                    error │  │ backoff timer         │ stream error / end
//!        │                          ▼  │                       ▼
//!        └───────stop_sync────────  error ◄────────────────────┘
//! ```
//!
//! A stream failure schedules a reconnect after `base * 2^attempts` until
//! `max_reconnect_attempts` reconnects have failed; the session then stays in
//! `error` until `start_sync` is called again. `start_sync` and `stop_sync`
//! are serialized by a per-session async mutex, and every background task is
//! tagged with the generation it was started in so nothing it does lands
//! after a later `stop_sync`.
//!
//! Work that fails against the server is not dropped. A conflict the store
//! refused is queued and recorded again, and a document whose fetch failed is
//! marked stale and fetched again. Both retries run on the next event
//! (heartbeats included), on `trigger_sync_check` and before conflicts are
//! listed or resolved.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{Subscription, SyncApi};
use crate::config::SessionConfig;
use crate::conflict::{Conflict, IntegrityWarning, Resolution, ResolveOutcome, ResolveRequest};
use crate::error::SyncError;
use crate::integrity::check_document;
use crate::merge::MergeResult;
use crate::observers::{ContextObserver, ProgressObserver, TaskProgress};
use crate::protocol::{timestamp_now, validate_project_id, ChangeEvent, DocumentType};
use crate::tracker::{DocumentSnapshot, DocumentSyncTracker, RemoteOutcome, WriteOrigin};

const MAX_ATTEMPTS_REACHED: &str = "max reconnection attempts reached";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub project_id: String,
    pub connection_status: ConnectionStatus,
    pub last_update: Option<u64>,
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    /// Whether the change source reported itself as watching.
    pub is_active: bool,
}

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SyncStatus),
    /// A safe update replaced the local content.
    DocumentUpdated {
        document_type: DocumentType,
        content: String,
    },
    ConflictDetected(Conflict),
    /// The conflict could not be stored yet; it is retried until it is.
    ConflictNotRecorded {
        conflict_id: Uuid,
        error: String,
    },
    ConflictResolved(ResolveOutcome),
    IntegrityWarning(IntegrityWarning),
    WatcherError(String),
    ProgressChanged(TaskProgress),
}

/// Result of [`SyncSession::save_document`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved,
    /// The authoritative copy moved since the last sync; nothing was written.
    Conflict(Conflict),
}

struct SessionState {
    status: ConnectionStatus,
    last_update: Option<u64>,
    error: Option<String>,
    reconnect_attempts: u32,
    is_active: bool,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl SessionState {
    fn snapshot(&self, project_id: &str) -> SyncStatus {
        SyncStatus {
            project_id: project_id.to_string(),
            connection_status: self.status,
            last_update: self.last_update,
            error: self.error.clone(),
            reconnect_attempts: self.reconnect_attempts,
            is_active: self.is_active,
        }
    }

    /// Invalidate every task of the current generation and hand them back for aborting.
    fn next_generation(&mut self) -> (u64, [Option<JoinHandle<()>>; 2]) {
        self.generation += 1;
        (self.generation, [self.pump.take(), self.reconnect.take()])
    }
}

struct SessionInner {
    id: Uuid,
    project_id: String,
    api: Arc<dyn SyncApi>,
    config: SessionConfig,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    documents: Mutex<HashMap<DocumentType, DocumentSyncTracker>>,
    progress: Mutex<ProgressObserver>,
    context: Mutex<ContextObserver>,
    events: broadcast::Sender<SessionEvent>,
    /// Detected conflicts the server has not accepted yet.
    unrecorded: Mutex<Vec<Conflict>>,
    /// Documents whose change notification could not be fetched, with the
    /// notification's timestamp.
    stale: Mutex<HashMap<DocumentType, u64>>,
}

pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    pub fn new(
        project_id: impl Into<String>,
        api: Arc<dyn SyncApi>,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let project_id = project_id.into();
        validate_project_id(&project_id)?;

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let documents = DocumentType::ALL
            .into_iter()
            .map(|t| (t, DocumentSyncTracker::new(project_id.clone(), t)))
            .collect();
        let context = ContextObserver::new(config.recent_files_limit);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                project_id,
                api,
                config,
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(SessionState {
                    status: ConnectionStatus::Disconnected,
                    last_update: None,
                    error: None,
                    reconnect_attempts: 0,
                    is_active: false,
                    generation: 0,
                    pump: None,
                    reconnect: None,
                }),
                documents: Mutex::new(documents),
                progress: Mutex::new(ProgressObserver::new()),
                context: Mutex::new(context),
                events,
                unrecorded: Mutex::new(Vec::new()),
                stale: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.lock().snapshot(&self.inner.project_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start (or restart) synchronization.
    ///
    /// On failure the session is left in `error` with a reconnect scheduled,
    /// and the error is returned.
    pub async fn start_sync(&self) -> Result<(), SyncError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (generation, stale) = {
            let mut st = self.inner.state.lock();
            st.reconnect_attempts = 0;
            st.error = None;
            st.next_generation()
        };
        for task in stale.into_iter().flatten() {
            task.abort();
        }

        log::info!("Starting sync for project '{}'", self.inner.project_id);
        self.inner.clone().connect(generation).await
    }

    /// Stop synchronization. Valid in any state; idempotent.
    pub async fn stop_sync(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let stale = {
            let mut st = self.inner.state.lock();
            let (_, stale) = st.next_generation();
            let changed = st.status != ConnectionStatus::Disconnected;
            st.status = ConnectionStatus::Disconnected;
            st.error = None;
            st.reconnect_attempts = 0;
            st.is_active = false;
            if changed {
                self.inner.emit_status(&st);
            }
            stale
        };
        for task in stale.into_iter().flatten() {
            task.abort();
        }

        if let Err(e) = self
            .inner
            .api
            .stop_watcher(&self.inner.project_id, self.inner.id)
            .await
        {
            log::warn!("Stop request for project '{}' failed: {e}", self.inner.project_id);
        }
        log::info!("Stopped sync for project '{}'", self.inner.project_id);
    }

    /// Poll watcher liveness and retry work that failed earlier.
    ///
    /// Updates `last_update` and `is_active`; queued conflicts are recorded
    /// and stale documents fetched again.
    pub async fn trigger_sync_check(&self) -> Result<bool, SyncError> {
        let result = self.inner.api.watcher_status(&self.inner.project_id).await;
        let watching = matches!(result, Ok(true));

        let generation = {
            let mut st = self.inner.state.lock();
            st.last_update = Some(timestamp_now());
            if st.is_active != watching {
                st.is_active = watching;
                self.inner.emit_status(&st);
            }
            st.generation
        };
        self.inner.retry_pending(generation).await;
        result
    }

    /// Stop and consume the session.
    pub async fn close(self) {
        self.stop_sync().await;
    }

    /// Fetch the authoritative content and make it both the local and the
    /// last-synced copy. A missing document loads as empty.
    pub async fn load_document(&self, document_type: DocumentType) -> Result<DocumentSnapshot, SyncError> {
        let content = match self
            .inner
            .api
            .fetch_document(&self.inner.project_id, document_type)
            .await
        {
            Ok(content) => content,
            Err(SyncError::NotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };

        let snapshot = self.inner.with_tracker(document_type, |tracker| {
            tracker.reset_to(content.as_str());
            tracker.snapshot()
        });
        if document_type == DocumentType::Tasks {
            self.inner.observe_progress(&content);
        }
        Ok(snapshot)
    }

    /// Record an edit. Writes tagged `ServerApplied` are echoes and are ignored.
    pub fn update_local_content(&self, document_type: DocumentType, content: &str, origin: WriteOrigin) -> bool {
        self.inner
            .with_tracker(document_type, |tracker| tracker.update_local_content(content, origin))
    }

    pub fn mark_as_saved(&self, document_type: DocumentType) {
        self.inner.with_tracker(document_type, DocumentSyncTracker::mark_as_saved);
    }

    /// Write the local copy if the authoritative copy has not moved since the
    /// last sync; otherwise raise a `version_mismatch` conflict.
    pub async fn save_document(&self, document_type: DocumentType) -> Result<SaveOutcome, SyncError> {
        let (local, base) = self.inner.with_tracker(document_type, |tracker| {
            (
                tracker.local_content().to_string(),
                tracker.last_synced_content().to_string(),
            )
        });

        let current = match self
            .inner
            .api
            .fetch_document(&self.inner.project_id, document_type)
            .await
        {
            Ok(content) => Some(content),
            Err(SyncError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(current) = current.filter(|c| *c != base && *c != local) {
            let conflict = self
                .inner
                .with_tracker(document_type, |tracker| tracker.version_mismatch(&current));
            self.inner.record_conflict(&conflict).await;
            log::warn!(
                "Save of {} refused: changed since last sync (conflict {})",
                conflict.file_path,
                conflict.id
            );
            self.inner.emit(SessionEvent::ConflictDetected(conflict.clone()));
            return Ok(SaveOutcome::Conflict(conflict));
        }

        self.inner
            .api
            .save_document(&self.inner.project_id, document_type, &local)
            .await?;
        self.inner
            .with_tracker(document_type, |tracker| tracker.mark_synced_with(&local));
        Ok(SaveOutcome::Saved)
    }

    pub fn document(&self, document_type: DocumentType) -> DocumentSnapshot {
        self.inner.with_tracker(document_type, |tracker| tracker.snapshot())
    }

    pub async fn list_conflicts(&self) -> Result<Vec<Conflict>, SyncError> {
        self.inner.flush_unrecorded().await;
        self.inner.api.list_conflicts(&self.inner.project_id).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: Resolution,
        manual_content: Option<String>,
    ) -> Result<ResolveOutcome, SyncError> {
        let request = ResolveRequest {
            conflict_id,
            resolution,
            manual_content,
            resolved_by: self.inner.id.to_string(),
        };
        self.inner.flush_unrecorded().await;
        let outcome = self.inner.api.resolve_conflict(&request).await?;

        self.inner.with_tracker(outcome.document_type, |tracker| {
            tracker.apply_resolution(conflict_id, outcome.content.as_str())
        });
        self.inner.emit(SessionEvent::ConflictResolved(outcome.clone()));
        self.inner.after_sync(outcome.document_type, &outcome.content).await;
        Ok(outcome)
    }

    pub async fn merge_preview(&self, conflict_id: Uuid) -> Result<MergeResult, SyncError> {
        self.inner.api.merge_preview(conflict_id).await
    }

    pub async fn list_integrity_warnings(&self) -> Result<Vec<IntegrityWarning>, SyncError> {
        self.inner.api.list_warnings(&self.inner.project_id).await
    }

    pub async fn dismiss_integrity_warning(&self, warning_id: Uuid) -> Result<(), SyncError> {
        self.inner.api.dismiss_warning(warning_id).await
    }

    pub fn task_progress(&self) -> TaskProgress {
        self.inner.progress.lock().progress()
    }

    pub fn recent_files(&self) -> Vec<String> {
        self.inner.context.lock().recent()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let (stale, attached) = {
            let mut st = self.inner.state.lock();
            let (_, stale) = st.next_generation();
            (stale, st.status != ConnectionStatus::Disconnected)
        };
        for task in stale.into_iter().flatten() {
            task.abort();
        }

        // Release the watcher if the session was dropped without stop_sync
        if attached {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let api = self.inner.api.clone();
                let project_id = self.inner.project_id.clone();
                let holder = self.inner.id;
                runtime.spawn(async move {
                    if let Err(e) = api.stop_watcher(&project_id, holder).await {
                        log::warn!("Stop request for dropped session on '{project_id}' failed: {e}");
                    }
                });
            }
        }
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn emit_status(&self, st: &SessionState) {
        self.emit(SessionEvent::StatusChanged(st.snapshot(&self.project_id)));
    }

    fn with_tracker<R>(&self, document_type: DocumentType, f: impl FnOnce(&mut DocumentSyncTracker) -> R) -> R {
        let mut documents = self.documents.lock();
        let tracker = documents
            .entry(document_type)
            .or_insert_with(|| DocumentSyncTracker::new(self.project_id.clone(), document_type));
        f(tracker)
    }

    fn observe_progress(&self, content: &str) {
        let changed = self.progress.lock().update(content);
        if let Some(progress) = changed {
            self.emit(SessionEvent::ProgressChanged(progress));
        }
    }

    /// Take a watcher hold and subscribe. The hold is released again when
    /// subscribing fails.
    async fn open(&self) -> Result<Subscription, SyncError> {
        self.api.start_watcher(&self.project_id, self.id).await?;
        match self.api.subscribe(&self.project_id).await {
            Ok(subscription) => Ok(subscription),
            Err(e) => {
                self.release_watcher().await;
                Err(e)
            }
        }
    }

    async fn release_watcher(&self) {
        if let Err(e) = self.api.stop_watcher(&self.project_id, self.id).await {
            log::warn!("Releasing watcher on project '{}' failed: {e}", self.project_id);
        }
    }

    async fn connect(self: Arc<Self>, generation: u64) -> Result<(), SyncError> {
        {
            let mut st = self.state.lock();
            if st.generation != generation {
                return Ok(());
            }
            st.status = ConnectionStatus::Connecting;
            self.emit_status(&st);
        }

        let opened = self.open().await;

        let mut st = self.state.lock();
        if st.generation != generation {
            // Stopped meanwhile; dropping the subscription unsubscribes
            return Ok(());
        }
        match opened {
            Ok(subscription) => {
                st.status = ConnectionStatus::Connected;
                st.reconnect_attempts = 0;
                st.error = None;
                st.is_active = true;
                st.last_update = Some(timestamp_now());
                st.pump = Some(tokio::spawn(self.clone().pump(generation, subscription)));
                log::info!("Project '{}' connected", self.project_id);
                self.emit_status(&st);
                Ok(())
            }
            Err(e) => {
                drop(st);
                self.on_stream_error(generation, e.to_string());
                Err(e)
            }
        }
    }

    /// Mark the connection failed and schedule the next reconnect, if any remain.
    fn on_stream_error(self: &Arc<Self>, generation: u64, message: String) {
        let mut st = self.state.lock();
        if st.generation != generation {
            return;
        }
        st.pump = None;
        st.status = ConnectionStatus::Error;
        st.is_active = false;

        if st.reconnect_attempts < self.config.max_reconnect_attempts {
            let delay = self.config.backoff_delay(st.reconnect_attempts);
            st.reconnect_attempts += 1;
            log::warn!(
                "Project '{}' sync failed ({message}); reconnect {}/{} in {delay:?}",
                self.project_id,
                st.reconnect_attempts,
                self.config.max_reconnect_attempts
            );
            st.error = Some(message);

            let session = Arc::clone(self);
            st.reconnect = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Failures reschedule themselves through on_stream_error
                let _ = session.connect(generation).await;
            }));
        } else {
            log::error!("Project '{}' sync failed ({message}); {MAX_ATTEMPTS_REACHED}", self.project_id);
            st.error = Some(MAX_ATTEMPTS_REACHED.to_string());
            st.reconnect = None;

            // Nothing reconnects from here; the hold is retaken by start_sync
            let session = Arc::clone(self);
            tokio::spawn(async move { session.release_watcher().await });
        }
        self.emit_status(&st);
    }

    /// Consume a subscription in order until it fails or the session moves on.
    async fn pump(self: Arc<Self>, generation: u64, mut subscription: Subscription) {
        while let Some(item) = subscription.next().await {
            match item {
                Ok(event) => {
                    if !self.handle_event(generation, event).await {
                        return;
                    }
                }
                Err(e) => {
                    drop(subscription);
                    self.on_stream_error(generation, e.to_string());
                    return;
                }
            }
        }
        self.on_stream_error(generation, "event stream ended".to_string());
    }

    /// Returns false once the generation is stale.
    async fn handle_event(&self, generation: u64, event: ChangeEvent) -> bool {
        {
            let mut st = self.state.lock();
            if st.generation != generation {
                return false;
            }
            st.last_update = Some(timestamp_now());
            if let ChangeEvent::Heartbeat { is_watching, .. } = &event {
                if st.is_active != *is_watching {
                    st.is_active = *is_watching;
                    self.emit_status(&st);
                }
            }
        }

        match &event {
            ChangeEvent::FileChanged { .. } => {
                self.context.lock().observe(&event);
            }
            ChangeEvent::DocumentChanged {
                document_type,
                timestamp,
                ..
            } => self.on_document_changed(generation, *document_type, *timestamp).await,
            ChangeEvent::WatcherError { message, .. } => {
                log::warn!("Watcher error on project '{}': {message}", self.project_id);
                self.emit(SessionEvent::WatcherError(message.clone()));
            }
            ChangeEvent::Connected { .. } | ChangeEvent::Heartbeat { .. } => {}
        }
        self.retry_pending(generation).await;
        true
    }

    async fn on_document_changed(&self, generation: u64, document_type: DocumentType, timestamp: u64) {
        let remote = match self.api.fetch_document(&self.project_id, document_type).await {
            Ok(content) => content,
            Err(SyncError::NotFound(_)) => {
                log::debug!("{}/{} vanished before it could be fetched", self.project_id, document_type);
                return;
            }
            Err(e) => {
                log::warn!("Fetching {}/{} failed, marked stale: {e}", self.project_id, document_type);
                self.stale
                    .lock()
                    .entry(document_type)
                    .and_modify(|t| *t = (*t).max(timestamp))
                    .or_insert(timestamp);
                return;
            }
        };

        // Decided under the state lock so a concurrent stop_sync cannot interleave
        let outcome = {
            let st = self.state.lock();
            if st.generation != generation {
                return;
            }
            self.with_tracker(document_type, |tracker| tracker.on_document_changed(&remote, timestamp))
        };

        match outcome {
            RemoteOutcome::Applied(content) => {
                log::debug!("Safe update of {}/{}", self.project_id, document_type);
                self.emit(SessionEvent::DocumentUpdated {
                    document_type,
                    content: content.clone(),
                });
                self.after_sync(document_type, &content).await;
            }
            RemoteOutcome::Conflict(conflict) => {
                log::warn!(
                    "Conflict {} ({:?}) on {}",
                    conflict.id,
                    conflict.conflict_type,
                    conflict.file_path
                );
                self.record_conflict(&conflict).await;
                self.emit(SessionEvent::ConflictDetected(conflict));
            }
            RemoteOutcome::Converged => {
                log::debug!("{}/{} converged with local edits", self.project_id, document_type);
            }
            RemoteOutcome::Unchanged => {}
        }
    }

    /// Store a detected conflict, queueing it when the server refuses.
    async fn record_conflict(&self, conflict: &Conflict) {
        if let Err(e) = self.api.record_conflict(conflict).await {
            log::error!("Recording conflict {} failed, queued for retry: {e}", conflict.id);
            self.unrecorded.lock().push(conflict.clone());
            self.emit(SessionEvent::ConflictNotRecorded {
                conflict_id: conflict.id,
                error: e.to_string(),
            });
        }
    }

    /// Record queued conflicts in detection order, stopping at the first failure.
    async fn flush_unrecorded(&self) {
        let queued: Vec<Conflict> = self.unrecorded.lock().clone();
        for conflict in queued {
            if let Err(e) = self.api.record_conflict(&conflict).await {
                log::debug!("Conflict {} still not recorded: {e}", conflict.id);
                return;
            }
            log::info!("Recorded queued conflict {}", conflict.id);
            self.unrecorded.lock().retain(|c| c.id != conflict.id);
        }
    }

    /// Fetch documents marked stale again. Failures mark them stale anew.
    async fn refresh_stale(&self, generation: u64) {
        let stale: Vec<(DocumentType, u64)> = self.stale.lock().drain().collect();
        for (document_type, timestamp) in stale {
            log::debug!("Refetching stale {}/{}", self.project_id, document_type);
            self.on_document_changed(generation, document_type, timestamp).await;
        }
    }

    async fn retry_pending(&self, generation: u64) {
        self.flush_unrecorded().await;
        self.refresh_stale(generation).await;
    }

    /// Validation and observers after content became authoritative locally.
    async fn after_sync(&self, document_type: DocumentType, content: &str) {
        let report = check_document(document_type, content);
        if !report.is_clean() {
            let file_path = format!("{}/{}", self.project_id, document_type.file_name());
            match self
                .api
                .raise_warning(&self.project_id, &file_path, report.errors, report.warnings)
                .await
            {
                Ok(warning) => self.emit(SessionEvent::IntegrityWarning(warning)),
                Err(e) => log::error!("Raising integrity warning for {file_path} failed: {e}"),
            }
        }
        if document_type == DocumentType::Tasks {
            self.observe_progress(content);
        }
    }
}
