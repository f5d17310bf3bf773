//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a global control plane and
//! any number of zones, each with its own store and event bus, connected
//! over in-memory streams.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meshsync::{GlobalSyncServer, SyncConfig, ZoneSyncClient};
use meshsync_core::{Resource, ResourceKey, ResourceType, TenantId};
use meshsync_events::EventBus;
use meshsync_mux::{pipe, MultiplexStream, StreamMetadata};
use meshsync_store::MemoryStore;
use meshsync_sync::filter::ORIGIN_ZONE;
use meshsync_sync::{HealthCheckConfig, WatchdogConfig, ZoneWatchConfig, ORIGIN_LABEL};

pub const MESH: &str = "Mesh";
pub const TRAFFIC_POLICY: &str = "TrafficPolicy";
pub const DATAPLANE: &str = "Dataplane";

/// Types global sends to zones.
pub fn global_types() -> Vec<ResourceType> {
    vec![ResourceType::new(MESH), ResourceType::new(TRAFFIC_POLICY)]
}

/// Types zones send to global.
pub fn zone_types() -> Vec<ResourceType> {
    vec![ResourceType::new(DATAPLANE)]
}

pub fn mesh(name: &str) -> Resource {
    Resource::new(ResourceType::new(MESH), ResourceKey::global(name), json!({ "mtls": false }))
}

pub fn traffic_policy(name: &str, mesh: &str, spec: serde_json::Value) -> Resource {
    Resource::new(ResourceType::new(TRAFFIC_POLICY), ResourceKey::new(name, mesh), spec)
}

/// A dataplane created on a zone, labelled as zone-originated.
pub fn dataplane(name: &str, mesh: &str, port: u16) -> Resource {
    Resource::new(
        ResourceType::new(DATAPLANE),
        ResourceKey::new(name, mesh),
        json!({ "port": port }),
    )
    .with_label(ORIGIN_LABEL, ORIGIN_ZONE)
}

/// Timings short enough for tests running in real time.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        watchdog: WatchdogConfig {
            flush_interval: Duration::from_millis(10),
            full_resync_interval: Duration::from_secs(1),
        },
        zone_watch: ZoneWatchConfig {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
        },
        health_check: HealthCheckConfig {
            interval: Duration::from_millis(50),
        },
        ..Default::default()
    }
}

/// One zone control plane.
pub struct ZoneFixture {
    pub name: String,
    pub bus: EventBus,
    pub store: Arc<MemoryStore>,
    pub client: Arc<ZoneSyncClient>,
}

/// A global control plane with its store and bus.
pub struct SyncFixture {
    pub tenant: TenantId,
    pub bus: EventBus,
    pub global_store: Arc<MemoryStore>,
    pub global: Arc<GlobalSyncServer>,
    config: SyncConfig,
}

impl SyncFixture {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let bus = EventBus::new(config.event_bus_buffer);
        let global_store = Arc::new(MemoryStore::with_event_bus(bus.clone()));
        let global = GlobalSyncServer::new(
            global_store.clone(),
            bus.clone(),
            global_types(),
            zone_types(),
            config.clone(),
        )
        .expect("valid config");

        Self {
            tenant: TenantId::default_tenant(),
            bus,
            global_store,
            global: Arc::new(global),
            config,
        }
    }

    /// A new zone with an empty store.
    pub fn zone(&self, name: &str) -> ZoneFixture {
        let bus = EventBus::new(self.config.event_bus_buffer);
        let store = Arc::new(MemoryStore::with_event_bus(bus.clone()));
        let client = ZoneSyncClient::new(
            store.clone(),
            bus.clone(),
            name,
            self.tenant.clone(),
            zone_types(),
            global_types(),
            self.config.clone(),
        )
        .expect("valid config");

        ZoneFixture {
            name: name.to_string(),
            bus,
            store,
            client: Arc::new(client),
        }
    }

    /// Open a multiplexed stream between global and `zone`.
    pub fn connect(&self, zone: &ZoneFixture) -> Connection {
        let (global_end, zone_end) = pipe(zone.client.metadata(), StreamMetadata::new(), 64);
        let cancel = [global_end.cancel_token(), zone_end.cancel_token()];

        let global = self.global.clone();
        let global_end: Arc<dyn MultiplexStream> = Arc::new(global_end);
        let global_task = tokio::spawn(async move { global.serve(global_end).await });

        let client = zone.client.clone();
        let zone_end: Arc<dyn MultiplexStream> = Arc::new(zone_end);
        let zone_task = tokio::spawn(async move { client.serve(zone_end).await });

        Connection {
            global: global_task,
            zone: zone_task,
            cancel,
        }
    }
}

impl Default for SyncFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// The two handlers of one connection.
pub struct Connection {
    pub global: JoinHandle<meshsync::Result<()>>,
    pub zone: JoinHandle<meshsync::Result<()>>,
    cancel: [CancellationToken; 2],
}

impl Connection {
    /// End the stream on both sides, as a dropped connection would.
    pub fn disconnect(&self) {
        for token in &self.cancel {
            token.cancel();
        }
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
