//! Delta sync client: consume a peer's resources into the local store.
//!
//! ## Overview
//!
//! [`DeltaSyncClient`] subscribes to every type it consumes, hands each
//! response to a [`ResourceSyncer`] and ACKs it, or NACKs it with the
//! failure so the sending side can force a resend.
//!
//! [`StoreResourceSyncer`] is the usual syncer: it upserts added
//! resources and deletes removed ones. The first response of a type is
//! the peer's full state, so local resources it does not mention are
//! deleted too.
//!
//! A mapper may rename resources. The name the peer used is kept in the
//! [`DISPLAY_NAME_LABEL`] label so later removals still find them.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use meshsync_core::{decode_resource, Features, Resource, ResourceKey, ResourceType, TenantId};
use meshsync_mux::{ClientStream, DeltaDiscoveryRequest, DeltaDiscoveryResponse, ErrorDetail, NodeInfo};
use meshsync_store::{upsert, ResourceManager};

use crate::error::{Result, SyncError};
use crate::filter::{Identity, ResourceMapper, ResourcePredicate, DISPLAY_NAME_LABEL};
use crate::server::WILDCARD;

const UPSERT_RETRIES: usize = 5;

/// One decoded delta response.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub resource_type: ResourceType,
    pub added: Vec<Resource>,
    /// Snapshot names of removed resources.
    pub removed: Vec<String>,
    /// First response of this type on the stream: the full state.
    pub is_initial: bool,
}

/// Applies upstream responses locally.
#[async_trait]
pub trait ResourceSyncer: Send + Sync {
    async fn sync(&self, update: UpstreamResponse) -> anyhow::Result<()>;
}

/// Syncer writing into a resource manager.
pub struct StoreResourceSyncer {
    manager: Arc<dyn ResourceManager>,
    tenant: TenantId,
    mapper: Arc<dyn ResourceMapper>,
    scope: Option<ResourcePredicate>,
}

impl StoreResourceSyncer {
    pub fn new(manager: Arc<dyn ResourceManager>, tenant: TenantId) -> Self {
        Self {
            manager,
            tenant,
            mapper: Arc::new(Identity),
            scope: None,
        }
    }

    /// Rewrite incoming resources before storing them.
    pub fn with_mapper(mut self, mapper: Arc<dyn ResourceMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Only local resources matching `scope` are owned by this peer, and
    /// only those are ever deleted.
    pub fn with_scope(mut self, scope: ResourcePredicate) -> Self {
        self.scope = Some(scope);
        self
    }

    fn in_scope(&self, resource: &Resource) -> bool {
        self.scope
            .as_ref()
            .map_or(true, |scope| scope(&Features::new(), resource))
    }

    /// Map and store one resource. Returns the snapshot name it is
    /// stored under.
    async fn store(&self, incoming: Resource) -> anyhow::Result<String> {
        let upstream_name = incoming.key.name.clone();
        let mut incoming = self.mapper.map(&Features::new(), incoming)?;
        if incoming.key.name != upstream_name {
            incoming
                .meta
                .labels
                .insert(DISPLAY_NAME_LABEL.to_string(), upstream_name);
        }
        let resource_type = incoming.resource_type.clone();
        let key = incoming.key.clone();

        match self.manager.get(&self.tenant, &resource_type, &key).await {
            Ok(existing) if existing.spec == incoming.spec && existing.meta.labels == incoming.meta.labels => {
                return Ok(key.snapshot_name());
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        upsert(
            self.manager.as_ref(),
            &self.tenant,
            &resource_type,
            &key,
            UPSERT_RETRIES,
            |local| {
                local.spec = incoming.spec.clone();
                local.meta.labels = incoming.meta.labels.clone();
            },
        )
        .await?;
        Ok(key.snapshot_name())
    }
}

/// The snapshot name the peer knows a local resource by.
fn upstream_name(resource: &Resource) -> String {
    match resource.label(DISPLAY_NAME_LABEL) {
        Some(name) => ResourceKey::new(name, resource.key.mesh.as_str()).snapshot_name(),
        None => resource.snapshot_name(),
    }
}

#[async_trait]
impl ResourceSyncer for StoreResourceSyncer {
    async fn sync(&self, update: UpstreamResponse) -> anyhow::Result<()> {
        let removed: HashSet<&str> = update.removed.iter().map(String::as_str).collect();

        let mut keep = HashSet::with_capacity(update.added.len());
        for resource in update.added {
            keep.insert(self.store(resource).await?);
        }

        let local = self.manager.list(&self.tenant, &update.resource_type).await?;
        for resource in local {
            if !self.in_scope(&resource) {
                continue;
            }
            let stale = if update.is_initial {
                !keep.contains(&resource.snapshot_name())
            } else {
                removed.contains(upstream_name(&resource).as_str())
            };
            if !stale {
                continue;
            }
            match self
                .manager
                .delete(&self.tenant, &update.resource_type, &resource.key)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Consumes the delta responses of a peer.
pub struct DeltaSyncClient {
    node: NodeInfo,
    types: BTreeSet<ResourceType>,
    syncer: Arc<dyn ResourceSyncer>,
    response_backoff: Duration,
}

impl DeltaSyncClient {
    pub fn new(
        node: NodeInfo,
        types: impl IntoIterator<Item = ResourceType>,
        syncer: Arc<dyn ResourceSyncer>,
    ) -> Self {
        Self {
            node,
            types: types.into_iter().collect(),
            syncer,
            response_backoff: Duration::ZERO,
        }
    }

    /// Delay every ACK, throttling how fast the peer can push.
    pub fn with_response_backoff(mut self, backoff: Duration) -> Self {
        self.response_backoff = backoff;
        self
    }

    /// Subscribe and apply responses until the stream ends or `cancel`
    /// fires. Cancellation returns `Ok(())`.
    pub async fn run(&self, stream: ClientStream, cancel: CancellationToken) -> Result<()> {
        for resource_type in &self.types {
            stream
                .send(DeltaDiscoveryRequest {
                    node: Some(self.node.clone()),
                    type_url: resource_type.to_string(),
                    resource_names_subscribe: vec![WILDCARD.to_string()],
                    ..Default::default()
                })
                .await?;
        }

        let mut initialized = BTreeSet::new();
        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                response = stream.recv() => response?,
            };

            let request = self.apply(response, &mut initialized).await;

            if !self.response_backoff.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.response_backoff) => {}
                }
            }
            stream.send(request).await?;
        }
    }

    /// Apply one response and build its ACK or NACK.
    async fn apply(
        &self,
        response: DeltaDiscoveryResponse,
        initialized: &mut BTreeSet<ResourceType>,
    ) -> DeltaDiscoveryRequest {
        let resource_type = ResourceType::new(response.type_url.as_str());
        let mut reply = DeltaDiscoveryRequest {
            node: Some(self.node.clone()),
            type_url: response.type_url.clone(),
            response_nonce: response.nonce.clone(),
            ..Default::default()
        };

        match self.sync(&resource_type, response, initialized).await {
            Ok(()) => {
                initialized.insert(resource_type);
            }
            Err(e) => {
                tracing::warn!(peer = %self.node.id, %resource_type, "rejecting response: {}", e);
                reply.error_detail = Some(ErrorDetail::internal(e.to_string()));
            }
        }
        reply
    }

    async fn sync(
        &self,
        resource_type: &ResourceType,
        response: DeltaDiscoveryResponse,
        initialized: &BTreeSet<ResourceType>,
    ) -> Result<()> {
        if !self.types.contains(resource_type) {
            return Err(SyncError::UnknownType(response.type_url));
        }

        let mut added = Vec::with_capacity(response.resources.len());
        for wire in &response.resources {
            let resource = decode_resource(&wire.resource)?;
            if &resource.resource_type != resource_type {
                return Err(SyncError::UnknownType(resource.resource_type.to_string()));
            }
            added.push(resource);
        }

        let update = UpstreamResponse {
            resource_type: resource_type.clone(),
            added,
            removed: response.removed_resources,
            is_initial: !initialized.contains(resource_type),
        };
        self.syncer
            .sync(update)
            .await
            .map_err(|source| SyncError::Syncer {
                resource_type: resource_type.clone(),
                source,
            })
    }
}
