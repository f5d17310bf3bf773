//! The zone control plane side of zone sync.
//!
//! A zone dials global and presents itself through stream metadata. On
//! `GlobalToZone` it consumes global resources; on `ZoneToGlobal` it
//! serves the resources it owns, those labelled with a zone origin.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use meshsync_core::{Features, Node, Resource, ResourceType, TenantId, FEATURE_ZONE_PING_HEALTH};
use meshsync_events::{EventBus, Listener};
use meshsync_mux::{
    MultiplexStream, NodeInfo, Session, StreamMetadata, CLIENT_ID_KEY, FEATURES_KEY,
    KDS_VERSION_KEY, KDS_VERSION_V3, TENANT_KEY,
};
use meshsync_store::ResourceManager;
use meshsync_sync::filter::{zone_provided_filter, WithLabel, ORIGIN_GLOBAL, ORIGIN_ZONE};
use meshsync_sync::{
    run_health_check_loop, HealthCheckClient, ResourcePredicate, ResourceSyncer, SnapshotCache,
    StatusTracker, StoreResourceSyncer, SyncMetrics, ORIGIN_LABEL,
};

use crate::config::SyncConfig;
use crate::endpoint::{Consumer, Endpoint, Roles};
use crate::error::{MeshSyncError, Result};
use crate::GLOBAL_NODE_ID;

/// Syncs one zone with global.
pub struct ZoneSyncClient {
    endpoint: Endpoint,
    zone: String,
    tenant: TenantId,
    features: Features,
}

impl ZoneSyncClient {
    /// `provided` types are sent to global; `consumed` types are accepted
    /// from it. Health pings are negotiated by default.
    pub fn new<M>(
        manager: Arc<M>,
        bus: EventBus,
        zone: impl Into<String>,
        tenant: TenantId,
        provided: impl IntoIterator<Item = ResourceType>,
        consumed: impl IntoIterator<Item = ResourceType>,
        config: SyncConfig,
    ) -> Result<Self>
    where
        M: ResourceManager + 'static,
    {
        let zone = zone.into();
        if zone.is_empty() {
            return Err(MeshSyncError::Config("zone name must not be empty".into()));
        }
        let endpoint = Endpoint::new(
            manager,
            bus,
            provided.into_iter().collect(),
            consumed.into_iter().collect(),
            Arc::new(zone_provided_filter()),
            config,
        )?;
        let mut features = Features::new();
        features.insert(FEATURE_ZONE_PING_HEALTH);

        Ok(Self {
            endpoint,
            zone,
            tenant,
            features,
        })
    }

    /// Replace the features announced to global.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Metadata to open streams to global with.
    pub fn metadata(&self) -> StreamMetadata {
        let mut metadata = StreamMetadata::new()
            .with(CLIENT_ID_KEY, self.zone.as_str())
            .with(KDS_VERSION_KEY, KDS_VERSION_V3)
            .with(TENANT_KEY, self.tenant.as_str());
        for feature in self.features.iter() {
            metadata.append(FEATURES_KEY, feature);
        }
        metadata
    }

    /// Receive global resources.
    pub async fn global_to_zone(&self, stream: Arc<dyn MultiplexStream>) -> Result<()> {
        self.handle(stream, false, true).await
    }

    /// Send zone resources to global.
    pub async fn zone_to_global(&self, stream: Arc<dyn MultiplexStream>) -> Result<()> {
        self.handle(stream, true, false).await
    }

    /// Both directions over one multiplexed stream.
    pub async fn serve(&self, stream: Arc<dyn MultiplexStream>) -> Result<()> {
        self.handle(stream, true, true).await
    }

    /// Report health to global until `cancel` fires.
    pub async fn run_health_check(&self, client: Arc<dyn HealthCheckClient>, cancel: CancellationToken) {
        run_health_check_loop(client, self.endpoint.config.health_check.interval, cancel).await;
    }

    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.endpoint.status
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.endpoint.metrics
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.endpoint.cache
    }

    /// Close every open stream.
    pub fn shutdown(&self) {
        self.endpoint.shutdown.cancel();
    }

    async fn handle(&self, stream: Arc<dyn MultiplexStream>, serve: bool, consume: bool) -> Result<()> {
        tracing::info!(zone = %self.zone, serve, consume, "connected to global");

        let roles = Roles {
            serve,
            consume: consume.then(|| Consumer {
                node: NodeInfo {
                    id: self.zone.clone(),
                    tenant: self.tenant.as_str().to_string(),
                    features: self.features.iter().map(str::to_string).collect(),
                },
                syncer: self.global_syncer(),
            }),
        };

        let node = Node::new(GLOBAL_NODE_ID, self.tenant.clone()).with_features(self.features.clone());
        let session = Session::new(GLOBAL_NODE_ID, stream, self.endpoint.config.session.clone());
        self.endpoint.drive(session, node, roles, Listener::never()).await
    }

    /// Stores global resources labelled with a global origin. A full
    /// state response never deletes resources this zone owns.
    fn global_syncer(&self) -> Arc<dyn ResourceSyncer> {
        let scope: ResourcePredicate =
            Arc::new(|_: &Features, r: &Resource| r.label(ORIGIN_LABEL) != Some(ORIGIN_ZONE));

        Arc::new(
            StoreResourceSyncer::new(self.endpoint.manager.clone(), self.tenant.clone())
                .with_mapper(Arc::new(WithLabel::new(ORIGIN_LABEL, ORIGIN_GLOBAL)))
                .with_scope(scope),
        )
    }
}
