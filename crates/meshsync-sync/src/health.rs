//! Zone health checks.
//!
//! Zones negotiating the zone-ping-health feature call the global health
//! check periodically. Global records the time on the zone's insight,
//! which the zone watch later reads to declare silent zones offline. The
//! response tells the zone when to call next.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use meshsync_core::TenantId;
use meshsync_store::{insight, ResourceManager};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Interval handed to zones in health check responses.
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(SyncError::Config("health check interval must be positive".into()));
        }
        Ok(())
    }
}

/// Global side of the health check.
pub struct HealthCheckService {
    manager: Arc<dyn ResourceManager>,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl HealthCheckService {
    pub fn new(manager: Arc<dyn ResourceManager>, config: HealthCheckConfig) -> Self {
        Self {
            manager,
            interval: config.interval,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record a health check from `zone` and return the next interval.
    ///
    /// A failure to record is logged, not returned: the zone should keep
    /// calling at the usual pace.
    pub async fn health_check(&self, tenant: &TenantId, zone: &str) -> Result<Duration> {
        if zone.is_empty() {
            return Err(SyncError::InvalidArgument("health check without zone".into()));
        }
        let now = self.clock.now();
        if let Err(e) = insight::record_health_check(self.manager.as_ref(), tenant, zone, now).await {
            tracing::error!(zone, %tenant, "couldn't update zone insight: {}", e);
        }
        Ok(self.interval)
    }
}

/// Zone side of the health check.
#[async_trait]
pub trait HealthCheckClient: Send + Sync {
    /// Report health; returns the interval to wait before the next call.
    async fn health_check(&self) -> Result<Duration>;
}

/// Calls a [`HealthCheckService`] in the same process.
pub struct LocalHealthCheckClient {
    service: Arc<HealthCheckService>,
    tenant: TenantId,
    zone: String,
}

impl LocalHealthCheckClient {
    pub fn new(service: Arc<HealthCheckService>, tenant: TenantId, zone: impl Into<String>) -> Self {
        Self {
            service,
            tenant,
            zone: zone.into(),
        }
    }
}

#[async_trait]
impl HealthCheckClient for LocalHealthCheckClient {
    async fn health_check(&self) -> Result<Duration> {
        self.service.health_check(&self.tenant, &self.zone).await
    }
}

/// Call `client` until `cancel` fires.
///
/// The next call waits for the interval the peer returned, or
/// `default_interval` when it returned zero or failed. A peer that does
/// not implement health checks ends the loop; the sync streams keep
/// running.
pub async fn run_health_check_loop(
    client: Arc<dyn HealthCheckClient>,
    default_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = match client.health_check().await {
            Ok(interval) if interval.is_zero() => default_interval,
            Ok(interval) => interval,
            Err(e) if e.is_unimplemented() => {
                tracing::info!("health check not implemented by peer, stopping");
                return;
            }
            Err(e) => {
                tracing::warn!("health check failed: {}", e);
                default_interval
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(next) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use meshsync_store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::SystemTime;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_service_records_time_and_returns_interval() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)));
        let service = HealthCheckService::new(
            store.clone(),
            HealthCheckConfig {
                interval: Duration::from_secs(7),
            },
        )
        .with_clock(clock.clone());
        let tenant = TenantId::default_tenant();

        assert_eq!(service.health_check(&tenant, "zone-1").await.unwrap(), Duration::from_secs(7));
        assert_eq!(
            insight::read_health_check_time(store.as_ref(), &tenant, "zone-1").await.unwrap(),
            Some(clock.now())
        );

        clock.advance(Duration::from_secs(30));
        service.health_check(&tenant, "zone-1").await.unwrap();
        assert_eq!(
            insight::read_health_check_time(store.as_ref(), &tenant, "zone-1").await.unwrap(),
            Some(clock.now())
        );
    }

    #[tokio::test]
    async fn test_service_rejects_missing_zone() {
        let service = HealthCheckService::new(Arc::new(MemoryStore::new()), HealthCheckConfig::default());
        assert!(matches!(
            service.health_check(&TenantId::default_tenant(), "").await,
            Err(SyncError::InvalidArgument(_))
        ));
    }

    struct Scripted {
        replies: Mutex<VecDeque<Result<Duration>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Duration>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl HealthCheckClient for Scripted {
        async fn health_check(&self) -> Result<Duration> {
            self.calls.lock().unwrap().push(Instant::now());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(SyncError::Unimplemented("done".into())))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_follows_peer_interval() {
        let client = Arc::new(Scripted::new(vec![
            Ok(Duration::from_secs(3)),
            Ok(Duration::ZERO),
            Err(SyncError::Config("transient".into())),
            Ok(Duration::from_secs(1)),
        ]));

        run_health_check_loop(client.clone(), Duration::from_secs(10), CancellationToken::new()).await;

        assert_eq!(
            client.gaps(),
            vec![
                Duration::from_secs(3),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(1),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let client = Arc::new(Scripted::new(vec![Ok(Duration::from_secs(3600))]));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_health_check_loop(client.clone(), Duration::from_secs(10), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(HealthCheckConfig::default().validate().is_ok());
        assert!(HealthCheckConfig { interval: Duration::ZERO }.validate().is_err());
    }
}
