//! Change sources and the holder registry that keeps them running.
//!
//! A project's change source runs while at least one holder (a sync session
//! or an open subscription) is attached. Attaching the first holder starts
//! the source; detaching the last one stops it. Attach and detach are
//! idempotent per holder.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::broadcast::ChannelManager;
use crate::config::WatcherConfig;
use crate::error::SyncError;
use crate::protocol::{ChangeEvent, DocumentType, FileChangeKind};
use crate::storage::DocumentStore;

/// Something that observes a project's documents and publishes change events.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Begin watching. Calling it for a project already watched is a no-op.
    async fn start(&self, project_id: &str, sink: Arc<ChannelManager>) -> Result<(), SyncError>;

    /// Stop watching. Calling it for a project not watched is a no-op.
    async fn stop(&self, project_id: &str) -> Result<(), SyncError>;

    fn is_watching(&self, project_id: &str) -> bool;

    /// Whether writes made through the document store are noticed by the source.
    /// When not, the server announces its own writes.
    fn observes_writes(&self) -> bool {
        true
    }
}

/// Reference counts change source holders per project.
pub struct WatcherRegistry {
    source: Arc<dyn ChangeSource>,
    sink: Arc<ChannelManager>,
    holders: tokio::sync::Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl WatcherRegistry {
    pub fn new(source: Arc<dyn ChangeSource>, sink: Arc<ChannelManager>) -> Self {
        Self {
            source,
            sink,
            holders: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Attach a holder, starting the source for the first one.
    ///
    /// If the source fails to start the holder is not attached.
    pub async fn attach(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError> {
        let mut holders = self.holders.lock().await;
        let first = !holders.get(project_id).is_some_and(|set| !set.is_empty());

        if first {
            self.source.start(project_id, self.sink.clone()).await?;
            log::info!("Change source started for project '{project_id}'");
        }
        holders
            .entry(project_id.to_string())
            .or_default()
            .insert(holder);
        Ok(())
    }

    /// Detach a holder, stopping the source when none remain.
    pub async fn detach(&self, project_id: &str, holder: Uuid) -> Result<(), SyncError> {
        let mut holders = self.holders.lock().await;
        let Some(set) = holders.get_mut(project_id) else {
            return Ok(());
        };
        if !set.remove(&holder) || !set.is_empty() {
            return Ok(());
        }
        holders.remove(project_id);

        self.source.stop(project_id).await?;
        log::info!("Change source stopped for project '{project_id}'");
        Ok(())
    }

    pub async fn holder_count(&self, project_id: &str) -> usize {
        self.holders.lock().await.get(project_id).map_or(0, HashSet::len)
    }

    pub fn is_watching(&self, project_id: &str) -> bool {
        self.source.is_watching(project_id)
    }

    pub fn source(&self) -> &Arc<dyn ChangeSource> {
        &self.source
    }
}

/// Change source driven by an embedding process through `SyncServer::publish`.
#[derive(Default)]
pub struct ManualChangeSource {
    watching: Mutex<HashSet<String>>,
    starts: Mutex<HashMap<String, usize>>,
    fail_starts: AtomicBool,
}

impl ManualChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent starts fail, simulating an unreachable watcher.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// How many times the source was started for a project.
    pub fn start_count(&self, project_id: &str) -> usize {
        self.starts.lock().get(project_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ChangeSource for ManualChangeSource {
    async fn start(&self, project_id: &str, _sink: Arc<ChannelManager>) -> Result<(), SyncError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!(
                "watcher for project '{project_id}' unavailable"
            )));
        }
        if self.watching.lock().insert(project_id.to_string()) {
            *self.starts.lock().entry(project_id.to_string()).or_default() += 1;
        }
        Ok(())
    }

    async fn stop(&self, project_id: &str) -> Result<(), SyncError> {
        self.watching.lock().remove(project_id);
        Ok(())
    }

    fn is_watching(&self, project_id: &str) -> bool {
        self.watching.lock().contains(project_id)
    }

    fn observes_writes(&self) -> bool {
        false
    }
}

/// Change source that polls a document store at a fixed interval.
pub struct PollingWatcher {
    documents: Arc<dyn DocumentStore>,
    config: WatcherConfig,
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

type Snapshot = HashMap<DocumentType, Option<String>>;

impl PollingWatcher {
    pub fn new(documents: Arc<dyn DocumentStore>, config: WatcherConfig) -> Self {
        Self {
            documents,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(documents: &dyn DocumentStore, project_id: &str) -> Result<Snapshot, SyncError> {
        let mut snapshot = Snapshot::new();
        for document_type in DocumentType::ALL {
            snapshot.insert(document_type, documents.read(project_id, document_type)?);
        }
        Ok(snapshot)
    }

    /// Events describing the difference between two snapshots.
    fn diff(project_id: &str, before: &Snapshot, after: &Snapshot) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for document_type in DocumentType::ALL {
            let old = before.get(&document_type).and_then(Option::as_ref);
            let new = after.get(&document_type).and_then(Option::as_ref);
            let kind = match (old, new) {
                (None, Some(_)) => FileChangeKind::Created,
                (Some(a), Some(b)) if a != b => FileChangeKind::Modified,
                (Some(_), None) => FileChangeKind::Removed,
                _ => continue,
            };
            events.push(ChangeEvent::file_changed(project_id, document_type.file_name(), kind));
            if kind != FileChangeKind::Removed {
                events.push(ChangeEvent::document_changed(project_id, document_type));
            }
        }
        events
    }
}

#[async_trait]
impl ChangeSource for PollingWatcher {
    async fn start(&self, project_id: &str, sink: Arc<ChannelManager>) -> Result<(), SyncError> {
        if self.tasks.lock().contains_key(project_id) {
            return Ok(());
        }

        let mut last = Self::snapshot(self.documents.as_ref(), project_id)?;
        let documents = self.documents.clone();
        let project = project_id.to_string();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            // First tick completes immediately
            interval.tick().await;
            let mut failing = false;
            loop {
                interval.tick().await;
                match Self::snapshot(documents.as_ref(), &project) {
                    Ok(current) => {
                        failing = false;
                        for event in Self::diff(&project, &last, &current) {
                            log::debug!("Project '{}': {}", project, event.event_name());
                            sink.publish(event).await;
                        }
                        last = current;
                    }
                    Err(e) => {
                        // Report once per failure streak
                        if !failing {
                            log::error!("Polling project '{project}' failed: {e}");
                            sink.publish(ChangeEvent::watcher_error(&project, e.to_string())).await;
                        }
                        failing = true;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.insert(project_id.to_string(), handle.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self, project_id: &str) -> Result<(), SyncError> {
        if let Some(handle) = self.tasks.lock().remove(project_id) {
            handle.abort();
        }
        Ok(())
    }

    fn is_watching(&self, project_id: &str) -> bool {
        self.tasks.lock().contains_key(project_id)
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
