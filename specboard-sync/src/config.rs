//! Configuration of the server, sessions and change sources.

use std::time::Duration;

pub use crate::storage::StoreConfig;

/// Event stream server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:4455")
    pub bind_addr: String,
    /// Events buffered per subscriber before the oldest are dropped
    pub broadcast_capacity: usize,
    /// Interval between heartbeat events on every subscription
    pub heartbeat_interval: Duration,
    /// Maximum concurrent subscriptions per project
    pub max_subscribers_per_project: usize,
    /// Shared secret required on the handshake when set
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4455".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            max_subscribers_per_project: 64,
            token: None,
        }
    }
}

/// Sync session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnects attempted after a stream failure before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles on every attempt
    pub reconnect_base_delay: Duration,
    /// Relative paths remembered by the context observer
    pub recent_files_limit: usize,
    /// Capacity of the session event feed
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            recent_files_limit: 10,
            event_capacity: 128,
        }
    }
}

impl SessionConfig {
    /// Delay before the reconnect that follows `attempts` failed ones.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempts))
    }
}

/// Polling change source configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let config = SessionConfig::default();
        let delays: Vec<u64> = (0..5).map(|n| config.backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_backoff_saturates() {
        let config = SessionConfig::default();
        assert!(config.backoff_delay(200) >= config.backoff_delay(20));
    }
}
