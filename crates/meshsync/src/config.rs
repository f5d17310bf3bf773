//! Configuration of the sync stream handlers.

use std::time::Duration;

use meshsync_mux::SessionConfig;
use meshsync_sync::{HealthCheckConfig, WatchdogConfig, ZoneWatchConfig};

use crate::error::{MeshSyncError, Result};

/// Everything the embedder tunes. Values are supplied by the embedder;
/// nothing is read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-stream session sizing and send timeout.
    pub session: SessionConfig,
    /// Flush and full-resync intervals of the per-peer watchdog.
    pub watchdog: WatchdogConfig,
    /// Zone health polling (global only).
    pub zone_watch: ZoneWatchConfig,
    /// Interval handed to zones in health check responses (global only).
    pub health_check: HealthCheckConfig,
    /// Queue depth of each event bus subscriber.
    pub event_bus_buffer: usize,
    /// Delay before ACKing a response, throttling the peer.
    pub response_backoff: Duration,
    /// React to store events; otherwise rebuild every flush interval.
    pub use_event_based_watchdog: bool,
    /// Identifies this control plane instance on zone insights.
    pub instance_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            watchdog: WatchdogConfig::default(),
            zone_watch: ZoneWatchConfig::default(),
            health_check: HealthCheckConfig::default(),
            event_bus_buffer: 100,
            response_backoff: Duration::ZERO,
            use_event_based_watchdog: true,
            instance_id: random_instance_id(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.watchdog.validate()?;
        self.zone_watch.validate()?;
        self.health_check.validate()?;
        if self.event_bus_buffer == 0 {
            return Err(MeshSyncError::Config("event_bus_buffer must be positive".into()));
        }
        if self.instance_id.is_empty() {
            return Err(MeshSyncError::Config("instance_id must not be empty".into()));
        }
        Ok(())
    }
}

fn random_instance_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_instance_ids_differ() {
        assert_ne!(SyncConfig::default().instance_id, SyncConfig::default().instance_id);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let config = SyncConfig {
            event_bus_buffer: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MeshSyncError::Config(_))));

        let mut config = SyncConfig::default();
        config.session.buffer_size = 0;
        assert!(matches!(config.validate(), Err(MeshSyncError::Stream(_))));

        let mut config = SyncConfig::default();
        config.watchdog.flush_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(MeshSyncError::Sync(_))));
    }
}
