//! The global control plane side of zone sync.
//!
//! ## Overview
//!
//! Zones dial global. Each stream is either `GlobalToZone` (global
//! serves its resources to the zone), `ZoneToGlobal` (global subscribes
//! to resources the zone owns) or a multiplexed stream carrying both.
//!
//! On every stream global:
//!
//! 1. Validates the metadata: a client id, and the delta protocol.
//! 2. Records the zone and its stream connection on the zone insight.
//! 3. For zones negotiating health pings, announces the stream so the
//!    zone watch can track it, and listens for the zone going offline
//!    or the stream being superseded.
//! 4. Runs the watchdog and delta server, the delta sync client, or
//!    both, until the stream ends.

use std::sync::Arc;
use std::time::SystemTime;

use meshsync_core::{Features, Node, Resource, ResourceType, TenantId, FEATURE_ZONE_PING_HEALTH};
use meshsync_events::{Event, EventBus, Listener, StreamType, ZoneOpenedStream};
use meshsync_mux::{MultiplexStream, NodeInfo, Session};
use meshsync_store::{insight, ResourceManager};
use meshsync_sync::filter::{global_provided_filter, WithLabel, ORIGIN_ZONE};
use meshsync_sync::{
    Clock, CompositeMapper, HashSuffix, HealthCheckService, ResourceMapper, ResourcePredicate,
    ResourceSyncer, SnapshotCache, StatusTracker, StoreResourceSyncer, SyncMetrics, SystemClock,
    ZoneWatch, ORIGIN_LABEL, ZONE_LABEL,
};

use crate::config::SyncConfig;
use crate::endpoint::{Consumer, Endpoint, Roles};
use crate::error::Result;
use crate::GLOBAL_NODE_ID;

/// Accepts sync streams from zones.
pub struct GlobalSyncServer {
    endpoint: Endpoint,
    health: Arc<HealthCheckService>,
    clock: Arc<dyn Clock>,
}

impl GlobalSyncServer {
    /// `provided` types are sent to zones; `consumed` types are accepted
    /// from them.
    pub fn new<M>(
        manager: Arc<M>,
        bus: EventBus,
        provided: impl IntoIterator<Item = ResourceType>,
        consumed: impl IntoIterator<Item = ResourceType>,
        config: SyncConfig,
    ) -> Result<Self>
    where
        M: ResourceManager + 'static,
    {
        let endpoint = Endpoint::new(
            manager,
            bus,
            provided.into_iter().collect(),
            consumed.into_iter().collect(),
            Arc::new(global_provided_filter()),
            config,
        )?;
        let health = Arc::new(HealthCheckService::new(
            endpoint.manager.clone(),
            endpoint.config.health_check.clone(),
        ));

        Ok(Self {
            endpoint,
            health,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` for connection times, health checks and the zone watch.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.health = Arc::new(
            HealthCheckService::new(self.endpoint.manager.clone(), self.endpoint.config.health_check.clone())
                .with_clock(clock.clone()),
        );
        self.clock = clock;
        self
    }

    /// Serve global resources to a zone.
    pub async fn global_to_zone(&self, stream: Arc<dyn MultiplexStream>) -> Result<()> {
        self.handle(stream, &[StreamType::GlobalToZone]).await
    }

    /// Receive zone resources.
    pub async fn zone_to_global(&self, stream: Arc<dyn MultiplexStream>) -> Result<()> {
        self.handle(stream, &[StreamType::ZoneToGlobal]).await
    }

    /// Both directions over one multiplexed stream.
    pub async fn serve(&self, stream: Arc<dyn MultiplexStream>) -> Result<()> {
        self.handle(stream, &[StreamType::GlobalToZone, StreamType::ZoneToGlobal])
            .await
    }

    /// A watch declaring zones offline when their health checks stop.
    ///
    /// It subscribes on creation; run it with [`ZoneWatch::run`].
    pub fn zone_watch(&self) -> ZoneWatch {
        ZoneWatch::new(
            self.endpoint.reader.clone(),
            self.endpoint.bus.clone(),
            self.endpoint.config.zone_watch.clone(),
        )
        .with_clock(self.clock.clone())
    }

    /// The service zones call to report health.
    pub fn health_check_service(&self) -> Arc<HealthCheckService> {
        self.health.clone()
    }

    /// Per-zone delivery statistics.
    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.endpoint.status
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.endpoint.metrics
    }

    /// Snapshots currently held for connected zones.
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.endpoint.cache
    }

    /// Close every open stream.
    pub fn shutdown(&self) {
        self.endpoint.shutdown.cancel();
    }

    async fn handle(&self, stream: Arc<dyn MultiplexStream>, stream_types: &[StreamType]) -> Result<()> {
        let metadata = stream.metadata().clone();
        let zone = metadata.client_id()?.to_string();
        metadata.require_delta()?;
        let tenant = metadata.tenant();
        let features = metadata.features();
        let conn_time = self.clock.now();

        tracing::info!(zone = %zone, %tenant, streams = ?stream_types, "zone connected");
        self.record_connection(&tenant, &zone, stream_types, conn_time).await;

        let disconnect = if features.has(FEATURE_ZONE_PING_HEALTH) {
            let listener = self.subscribe_disconnect(&tenant, &zone, stream_types, conn_time);
            for stream_type in stream_types {
                self.endpoint.bus.send(ZoneOpenedStream {
                    zone: zone.clone(),
                    tenant_id: tenant.clone(),
                    stream_type: *stream_type,
                    conn_time,
                });
            }
            listener
        } else {
            Listener::never()
        };

        let roles = Roles {
            serve: stream_types.contains(&StreamType::GlobalToZone),
            consume: stream_types.contains(&StreamType::ZoneToGlobal).then(|| Consumer {
                node: NodeInfo {
                    id: GLOBAL_NODE_ID.to_string(),
                    tenant: tenant.as_str().to_string(),
                    features: Vec::new(),
                },
                syncer: self.zone_syncer(&tenant, &zone),
            }),
        };

        let node = Node::new(zone.clone(), tenant).with_features(features);
        let session = Session::new(zone, stream, self.endpoint.config.session.clone());
        self.endpoint.drive(session, node, roles, disconnect).await
    }

    async fn record_connection(
        &self,
        tenant: &TenantId,
        zone: &str,
        stream_types: &[StreamType],
        conn_time: SystemTime,
    ) {
        let manager = self.endpoint.manager.as_ref();
        if let Err(e) = insight::create_zone_if_absent(manager, tenant, zone).await {
            tracing::error!(zone, %tenant, "couldn't create zone: {}", e);
        }
        for stream_type in stream_types {
            let recorded = insight::record_stream_connection(
                manager,
                tenant,
                zone,
                *stream_type,
                &self.endpoint.config.instance_id,
                conn_time,
            )
            .await;
            if let Err(e) = recorded {
                tracing::error!(zone, %tenant, stream = %stream_type, "couldn't update zone insight: {}", e);
            }
        }
    }

    /// Events that end this stream: the zone went offline, or a newer
    /// stream of one of our types replaced this one.
    fn subscribe_disconnect(
        &self,
        tenant: &TenantId,
        zone: &str,
        stream_types: &[StreamType],
        conn_time: SystemTime,
    ) -> Listener {
        let (tenant, zone) = (tenant.clone(), zone.to_string());
        let stream_types = stream_types.to_vec();
        self.endpoint.bus.subscribe_where(move |event| match event {
            Event::ZoneWentOffline(offline) => offline.zone == zone && offline.tenant_id == tenant,
            Event::StreamCancelled(cancelled) => {
                cancelled.zone == zone
                    && cancelled.tenant_id == tenant
                    && cancelled.conn_time == conn_time
                    && stream_types.contains(&cancelled.stream_type)
            }
            _ => false,
        })
    }

    /// Stores zone resources labelled with their origin zone, under a
    /// name hashed with the zone so two zones never share a key. Syncs
    /// only ever delete resources of that zone.
    fn zone_syncer(&self, tenant: &TenantId, zone: &str) -> Arc<dyn ResourceSyncer> {
        let mappers: Vec<Arc<dyn ResourceMapper>> = vec![
            Arc::new(WithLabel::new(ORIGIN_LABEL, ORIGIN_ZONE)),
            Arc::new(WithLabel::new(ZONE_LABEL, zone)),
            Arc::new(HashSuffix::new([ZONE_LABEL])),
        ];
        let owner = zone.to_string();
        let scope: ResourcePredicate =
            Arc::new(move |_: &Features, r: &Resource| r.label(ZONE_LABEL) == Some(owner.as_str()));

        Arc::new(
            StoreResourceSyncer::new(self.endpoint.manager.clone(), tenant.clone())
                .with_mapper(Arc::new(CompositeMapper::new(mappers)))
                .with_scope(scope),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{hashed_name, ResourceKey};
    use meshsync_mux::{pipe, StreamMetadata, CLIENT_ID_KEY, KDS_VERSION_KEY, KDS_VERSION_V3};
    use meshsync_store::{MemoryStore, ReadOnlyResourceManager};
    use meshsync_sync::DISPLAY_NAME_LABEL;

    fn server(store: Arc<MemoryStore>, bus: EventBus) -> GlobalSyncServer {
        GlobalSyncServer::new(
            store,
            bus,
            [ResourceType::new("Mesh")],
            [ResourceType::new("Dataplane")],
            SyncConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_stream_without_client_id() {
        let server = server(Arc::new(MemoryStore::new()), EventBus::default());
        let metadata = StreamMetadata::new().with(KDS_VERSION_KEY, KDS_VERSION_V3);
        let (global, _zone) = pipe(metadata, StreamMetadata::new(), 8);

        let err = server.global_to_zone(Arc::new(global)).await.unwrap_err();
        assert!(matches!(err, crate::MeshSyncError::Stream(meshsync_mux::MuxError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_rejects_legacy_protocol() {
        let server = server(Arc::new(MemoryStore::new()), EventBus::default());
        let metadata = StreamMetadata::new().with(CLIENT_ID_KEY, "zone-1");
        let (global, _zone) = pipe(metadata, StreamMetadata::new(), 8);

        let err = server.zone_to_global(Arc::new(global)).await.unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[tokio::test]
    async fn test_zone_syncer_labels_and_scopes() {
        let store = Arc::new(MemoryStore::new());
        let server = server(store.clone(), EventBus::default());
        let tenant = TenantId::default_tenant();
        let dataplane = ResourceType::new("Dataplane");

        let other = Resource::new(dataplane.clone(), ResourceKey::new("dp-2", "default"), serde_json::json!({}))
            .with_label(ZONE_LABEL, "zone-2");
        store.create(&tenant, other).await.unwrap();

        let syncer = server.zone_syncer(&tenant, "zone-1");
        syncer
            .sync(meshsync_sync::UpstreamResponse {
                resource_type: dataplane.clone(),
                added: vec![Resource::new(
                    dataplane.clone(),
                    ResourceKey::new("dp-1", "default"),
                    serde_json::json!({ "port": 80 }),
                )],
                removed: Vec::new(),
                is_initial: true,
            })
            .await
            .unwrap();

        let name = hashed_name("default", "dp-1", &["zone-1"]);
        let stored = store
            .get(&tenant, &dataplane, &ResourceKey::new(name, "default"))
            .await
            .unwrap();
        assert_eq!(stored.label(ORIGIN_LABEL), Some(ORIGIN_ZONE));
        assert_eq!(stored.label(ZONE_LABEL), Some("zone-1"));
        assert_eq!(stored.label(DISPLAY_NAME_LABEL), Some("dp-1"));
        // Owned by zone-2, untouched by zone-1's full state.
        assert!(store
            .get(&tenant, &dataplane, &ResourceKey::new("dp-2", "default"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_zones_with_same_resource_name_do_not_collide() {
        let store = Arc::new(MemoryStore::new());
        let server = server(store.clone(), EventBus::default());
        let tenant = TenantId::default_tenant();
        let dataplane = ResourceType::new("Dataplane");
        let web = Resource::new(dataplane.clone(), ResourceKey::new("web", "default"), serde_json::json!({}));

        for zone in ["zone-1", "zone-2"] {
            server
                .zone_syncer(&tenant, zone)
                .sync(meshsync_sync::UpstreamResponse {
                    resource_type: dataplane.clone(),
                    added: vec![web.clone()],
                    removed: Vec::new(),
                    is_initial: true,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list(&tenant, &dataplane).await.unwrap().len(), 2);

        server
            .zone_syncer(&tenant, "zone-1")
            .sync(meshsync_sync::UpstreamResponse {
                resource_type: dataplane.clone(),
                added: Vec::new(),
                removed: vec!["web.default".to_string()],
                is_initial: false,
            })
            .await
            .unwrap();

        let left = store.list(&tenant, &dataplane).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].label(ZONE_LABEL), Some("zone-2"));
        assert_eq!(left[0].key.name, hashed_name("default", "web", &["zone-2"]));
    }
}
