//! Zone watch: declare zones offline when their health checks stop.
//!
//! ## Overview
//!
//! When a zone opens a stream, the watch records the zone's last health
//! check time as a baseline. On each poll it re-reads the time; a zone is
//! declared offline only when it has health checked since the baseline
//! and that check is older than the timeout. A zone that never checked in
//! after connecting (for example an older zone without the feature) is
//! never flagged.
//!
//! The watch also tracks the newest stream of each type per zone. When a
//! zone reconnects, the stream it replaced is cancelled through a
//! `StreamCancelled` event.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use meshsync_core::TenantId;
use meshsync_events::{
    Event, EventBus, Listener, StreamCancelled, StreamType, ZoneOpenedStream, ZoneWentOffline,
};
use meshsync_store::{insight, ReadOnlyResourceManager};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneWatchConfig {
    pub poll_interval: Duration,
    /// How old the last health check may get before the zone is offline.
    pub timeout: Duration,
}

impl Default for ZoneWatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl ZoneWatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("zone watch poll_interval must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(SyncError::Config("zone watch timeout must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ZoneState {
    /// Health check time seen when the zone was first tracked.
    baseline: Option<SystemTime>,
    /// Newest connection time per stream type.
    streams: BTreeMap<StreamType, SystemTime>,
}

pub struct ZoneWatch {
    manager: Arc<dyn ReadOnlyResourceManager>,
    bus: EventBus,
    listener: Listener,
    config: ZoneWatchConfig,
    clock: Arc<dyn Clock>,
    zones: HashMap<(TenantId, String), ZoneState>,
}

impl ZoneWatch {
    /// Create a watch. It subscribes immediately, so streams opened before
    /// [`run`](Self::run) starts are not missed.
    pub fn new(manager: Arc<dyn ReadOnlyResourceManager>, bus: EventBus, config: ZoneWatchConfig) -> Self {
        let listener = bus.subscribe_where(|e| matches!(e, Event::ZoneOpenedStream(_)));
        Self {
            manager,
            bus,
            listener,
            config,
            clock: Arc::new(SystemClock),
            zones: HashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of zones being watched.
    pub fn tracked(&self) -> usize {
        self.zones.len()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut poll = interval_at(Instant::now() + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.listener.close();
                    return;
                }
                _ = poll.tick() => self.poll().await,
                event = self.listener.recv() => match event {
                    Some(Event::ZoneOpenedStream(opened)) => self.on_stream_opened(opened).await,
                    Some(_) => {}
                    None => {
                        self.listener = Listener::never();
                    }
                },
            }
        }
    }

    async fn on_stream_opened(&mut self, opened: ZoneOpenedStream) {
        let key = (opened.tenant_id.clone(), opened.zone.clone());

        if !self.zones.contains_key(&key) {
            let baseline =
                match insight::read_health_check_time(self.manager.as_ref(), &opened.tenant_id, &opened.zone).await {
                    Ok(time) => time,
                    Err(e) => {
                        tracing::warn!(zone = %opened.zone, tenant = %opened.tenant_id, "couldn't read health check: {}", e);
                        None
                    }
                };
            self.zones.insert(
                key.clone(),
                ZoneState {
                    baseline,
                    streams: BTreeMap::new(),
                },
            );
        }

        let Some(state) = self.zones.get_mut(&key) else {
            return;
        };
        let replaced = match state.streams.get(&opened.stream_type).copied() {
            Some(previous) if previous < opened.conn_time => {
                state.streams.insert(opened.stream_type, opened.conn_time);
                Some(previous)
            }
            // An older stream announced late: it is the one to close.
            Some(previous) if previous > opened.conn_time => Some(opened.conn_time),
            Some(_) => None,
            None => {
                state.streams.insert(opened.stream_type, opened.conn_time);
                None
            }
        };

        if let Some(conn_time) = replaced {
            tracing::info!(zone = %opened.zone, stream_type = %opened.stream_type, "closing replaced stream");
            self.bus.send(StreamCancelled {
                zone: opened.zone,
                tenant_id: opened.tenant_id,
                stream_type: opened.stream_type,
                conn_time,
            });
        }
    }

    async fn poll(&mut self) {
        let now = self.clock.now();
        let mut offline = Vec::new();

        for ((tenant, zone), state) in &self.zones {
            let last = match insight::read_health_check_time(self.manager.as_ref(), tenant, zone).await {
                Ok(Some(last)) => last,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(%zone, %tenant, "couldn't read health check: {}", e);
                    continue;
                }
            };

            let fresh_since_open = state.baseline.map_or(true, |baseline| last > baseline);
            let silent_for = now.duration_since(last).unwrap_or(Duration::ZERO);
            if fresh_since_open && silent_for > self.config.timeout {
                offline.push((tenant.clone(), zone.clone()));
            }
        }

        for (tenant, zone) in offline {
            self.zones.remove(&(tenant.clone(), zone.clone()));
            tracing::info!(%zone, %tenant, "zone went offline");
            self.bus.send(ZoneWentOffline { zone, tenant_id: tenant });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use meshsync_store::MemoryStore;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        offline: Listener,
        cancelled: Listener,
        watch: ZoneWatch,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(16);
        let clock = Arc::new(ManualClock::new(epoch(1_000)));
        let offline = bus.subscribe_where(|e| matches!(e, Event::ZoneWentOffline(_)));
        let cancelled = bus.subscribe_where(|e| matches!(e, Event::StreamCancelled(_)));
        let watch = ZoneWatch::new(
            store.clone(),
            bus,
            ZoneWatchConfig {
                poll_interval: Duration::from_secs(5),
                timeout: TIMEOUT,
            },
        )
        .with_clock(clock.clone());
        Harness {
            store,
            clock,
            offline,
            cancelled,
            watch,
        }
    }

    fn opened(zone: &str, stream_type: StreamType, conn_time: SystemTime) -> ZoneOpenedStream {
        ZoneOpenedStream {
            zone: zone.into(),
            tenant_id: TenantId::default_tenant(),
            stream_type,
            conn_time,
        }
    }

    async fn health_check(h: &Harness, zone: &str) {
        insight::record_health_check(h.store.as_ref(), &TenantId::default_tenant(), zone, h.clock.now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offline_after_timeout_exactly_once() {
        let mut h = harness();
        health_check(&h, "zone-1").await;
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, h.clock.now()))
            .await;

        h.clock.advance(Duration::from_secs(10));
        health_check(&h, "zone-1").await;

        // Exactly at the timeout the zone is still online.
        h.clock.advance(TIMEOUT);
        h.watch.poll().await;
        assert!(h.offline.try_recv().is_none());

        h.clock.advance(Duration::from_secs(1));
        h.watch.poll().await;
        match h.offline.try_recv() {
            Some(Event::ZoneWentOffline(e)) => assert_eq!(e.zone, "zone-1"),
            other => panic!("expected offline event, got {other:?}"),
        }
        assert_eq!(h.watch.tracked(), 0);

        h.clock.advance(TIMEOUT);
        h.watch.poll().await;
        assert!(h.offline.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_healthy_zone_stays_online() {
        let mut h = harness();
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, h.clock.now()))
            .await;

        for _ in 0..20 {
            h.clock.advance(Duration::from_secs(30));
            health_check(&h, "zone-1").await;
            h.watch.poll().await;
        }
        assert!(h.offline.try_recv().is_none());
        assert_eq!(h.watch.tracked(), 1);
    }

    #[tokio::test]
    async fn test_zone_without_fresh_check_is_not_flagged() {
        let mut h = harness();
        health_check(&h, "zone-1").await;
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, h.clock.now()))
            .await;

        h.clock.advance(TIMEOUT * 10);
        h.watch.poll().await;
        assert!(h.offline.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_zone_first_checking_in_after_open() {
        let mut h = harness();
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, h.clock.now()))
            .await;
        health_check(&h, "zone-1").await;

        h.clock.advance(TIMEOUT + Duration::from_secs(1));
        h.watch.poll().await;
        assert!(matches!(h.offline.try_recv(), Some(Event::ZoneWentOffline(_))));
    }

    #[tokio::test]
    async fn test_second_stream_keeps_baseline() {
        let mut h = harness();
        health_check(&h, "zone-1").await;
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, h.clock.now()))
            .await;

        h.clock.advance(Duration::from_secs(5));
        health_check(&h, "zone-1").await;
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::ZoneToGlobal, h.clock.now()))
            .await;

        h.clock.advance(TIMEOUT + Duration::from_secs(1));
        h.watch.poll().await;
        assert!(matches!(h.offline.try_recv(), Some(Event::ZoneWentOffline(_))));
    }

    #[tokio::test]
    async fn test_reconnect_cancels_replaced_stream() {
        let mut h = harness();
        let first = h.clock.now();
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, first))
            .await;
        assert!(h.cancelled.try_recv().is_none());

        let second = first + Duration::from_secs(1);
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, second))
            .await;
        match h.cancelled.try_recv() {
            Some(Event::StreamCancelled(e)) => {
                assert_eq!(e.conn_time, first);
                assert_eq!(e.stream_type, StreamType::GlobalToZone);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }

        // A late announcement of an older stream cancels that stream.
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::GlobalToZone, first))
            .await;
        match h.cancelled.try_recv() {
            Some(Event::StreamCancelled(e)) => assert_eq!(e.conn_time, first),
            other => panic!("expected cancellation, got {other:?}"),
        }

        // Other stream types are independent.
        h.watch
            .on_stream_opened(opened("zone-1", StreamType::ZoneToGlobal, first))
            .await;
        assert!(h.cancelled.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_events_and_polls() {
        let h = harness();
        let Harness {
            store,
            clock,
            mut offline,
            watch,
            ..
        } = h;
        let bus_sender = watch.bus.clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch.run(cancel.clone()));

        bus_sender.send(opened("zone-1", StreamType::GlobalToZone, clock.now()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        insight::record_health_check(store.as_ref(), &TenantId::default_tenant(), "zone-1", clock.now())
            .await
            .unwrap();
        clock.advance(TIMEOUT + Duration::from_secs(1));

        let event = tokio::time::timeout(Duration::from_secs(30), offline.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::ZoneWentOffline(_))));

        cancel.cancel();
        handle.await.unwrap();
    }
}
