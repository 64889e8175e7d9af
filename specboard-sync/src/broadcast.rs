//! Per-project fan-out of change events.
//!
//! Every project gets one tokio broadcast channel; each subscriber holds an
//! independent receiver that buffers up to `capacity` events. A subscriber
//! that falls further behind loses the oldest events and reports the loss
//! through [`ProjectChannel::record_lagged`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{timestamp_now, ChangeEvent};

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters updated on the publish path.
#[derive(Default)]
struct AtomicChannelStats {
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub id: Uuid,
    pub connected_at: u64,
}

/// Broadcast channel of a single project.
pub struct ProjectChannel {
    project_id: String,
    sender: broadcast::Sender<ChangeEvent>,
    subscribers: RwLock<HashMap<Uuid, SubscriberInfo>>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl ProjectChannel {
    pub fn new(project_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            project_id: project_id.into(),
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicChannelStats::default(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Register a subscriber and hand out its receiver.
    ///
    /// The receiver only sees events published after this call returns.
    pub async fn add_subscriber(&self, id: Uuid) -> broadcast::Receiver<ChangeEvent> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(
            id,
            SubscriberInfo {
                id,
                connected_at: timestamp_now(),
            },
        );
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, id: &Uuid) -> Option<SubscriberInfo> {
        self.subscribers.write().await.remove(id)
    }

    /// Send an event to every current receiver. Returns how many received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the event is simply not observed.
        self.sender.send(event).unwrap_or(0)
    }

    /// Account for events a lagging receiver skipped.
    pub fn record_lagged(&self, skipped: u64) {
        self.stats.events_dropped.fetch_add(skipped, Ordering::Relaxed);
        log::warn!(
            "Subscriber of project '{}' lagged, {} event(s) dropped",
            self.project_id,
            skipped
        );
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps project ids to their channels.
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<ProjectChannel>>>,
    capacity: usize,
}

impl ChannelManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get_or_create(&self, project_id: &str) -> Arc<ProjectChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(project_id) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Another task may have created it between the two locks
        if let Some(channel) = channels.get(project_id) {
            return channel.clone();
        }

        let channel = Arc::new(ProjectChannel::new(project_id, self.capacity));
        channels.insert(project_id.to_string(), channel.clone());
        log::debug!("Created channel for project '{project_id}'");
        channel
    }

    pub async fn get(&self, project_id: &str) -> Option<Arc<ProjectChannel>> {
        self.channels.read().await.get(project_id).cloned()
    }

    /// Publish to the project's channel if one exists. Returns receiver count.
    pub async fn publish(&self, event: ChangeEvent) -> usize {
        match self.get(event.project_id()).await {
            Some(channel) => channel.publish(event),
            None => {
                log::trace!("No channel for project '{}', event dropped", event.project_id());
                0
            }
        }
    }

    /// Drop a project's channel once nobody subscribes to it.
    pub async fn remove_if_empty(&self, project_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(project_id) {
            if channel.subscriber_count().await == 0 {
                channels.remove(project_id);
                log::debug!("Removed empty channel for project '{project_id}'");
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_projects(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}
