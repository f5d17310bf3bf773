//! Events published on the bus.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use meshsync_core::{ResourceKey, ResourceType, TenantId};

/// The store operation behind a [`ResourceChangedEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Direction of a sync stream between global and a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamType {
    GlobalToZone,
    ZoneToGlobal,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::GlobalToZone => "globalToZone",
            StreamType::ZoneToGlobal => "zoneToGlobal",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource was created, updated or deleted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceChangedEvent {
    pub operation: Operation,
    pub resource_type: ResourceType,
    pub key: ResourceKey,
    pub tenant_id: TenantId,
}

/// A zone opened a sync stream to this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneOpenedStream {
    pub zone: String,
    pub tenant_id: TenantId,
    pub stream_type: StreamType,
    pub conn_time: SystemTime,
}

/// A zone stopped reporting health and is considered offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneWentOffline {
    pub zone: String,
    pub tenant_id: TenantId,
}

/// A specific stream of a zone must be closed, e.g. because a newer one
/// of the same type replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCancelled {
    pub zone: String,
    pub tenant_id: TenantId,
    pub stream_type: StreamType,
    pub conn_time: SystemTime,
}

/// Every event the bus carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ResourceChanged(ResourceChangedEvent),
    ZoneOpenedStream(ZoneOpenedStream),
    ZoneWentOffline(ZoneWentOffline),
    StreamCancelled(StreamCancelled),
}

impl Event {
    /// The tenant the event belongs to.
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Event::ResourceChanged(e) => &e.tenant_id,
            Event::ZoneOpenedStream(e) => &e.tenant_id,
            Event::ZoneWentOffline(e) => &e.tenant_id,
            Event::StreamCancelled(e) => &e.tenant_id,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ResourceChanged(_) => "ResourceChanged",
            Event::ZoneOpenedStream(_) => "ZoneOpenedStream",
            Event::ZoneWentOffline(_) => "ZoneWentOffline",
            Event::StreamCancelled(_) => "StreamCancelled",
        }
    }
}

impl From<ResourceChangedEvent> for Event {
    fn from(e: ResourceChangedEvent) -> Self {
        Event::ResourceChanged(e)
    }
}

impl From<ZoneOpenedStream> for Event {
    fn from(e: ZoneOpenedStream) -> Self {
        Event::ZoneOpenedStream(e)
    }
}

impl From<ZoneWentOffline> for Event {
    fn from(e: ZoneWentOffline) -> Self {
        Event::ZoneWentOffline(e)
    }
}

impl From<StreamCancelled> for Event {
    fn from(e: StreamCancelled) -> Self {
        Event::StreamCancelled(e)
    }
}
