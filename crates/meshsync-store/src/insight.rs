//! Zone and ZoneInsight resources.
//!
//! A `ZoneInsight` is a global-scoped resource named after its zone. Its
//! spec records the last health check and the sync streams of the zone:
//!
//! ```text
//! {
//!   "healthCheck": { "time": <unix ms> },
//!   "kdsStreams": {
//!     "globalToZone": { "connectTime": <unix ms>, "globalInstanceId": "..." },
//!     "zoneToGlobal": { ... }
//!   }
//! }
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use meshsync_core::{Resource, ResourceKey, ResourceType, TenantId};
use meshsync_events::StreamType;

use crate::error::{Result, StoreError};
use crate::traits::{upsert, ReadOnlyResourceManager, ResourceManager};

pub const ZONE_TYPE: &str = "Zone";
pub const ZONE_INSIGHT_TYPE: &str = "ZoneInsight";

/// Conflicting writers (health checks, stream bookkeeping) retry this often.
const UPSERT_CONFLICT_RETRIES: usize = 5;

pub fn zone_type() -> ResourceType {
    ResourceType::new(ZONE_TYPE)
}

pub fn zone_insight_type() -> ResourceType {
    ResourceType::new(ZONE_INSIGHT_TYPE)
}

/// The last health check recorded in a zone insight, if any.
pub fn health_check_time(insight: &Resource) -> Result<Option<SystemTime>> {
    match insight.spec.pointer("/healthCheck/time") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|ms| Some(from_millis(ms)))
            .ok_or_else(|| StoreError::InvalidData(format!("healthCheck.time is not a timestamp: {value}"))),
    }
}

/// Record a health check time on a zone insight.
pub fn set_health_check_time(insight: &mut Resource, time: SystemTime) {
    ensure_object(&mut insight.spec)["healthCheck"] = json!({ "time": to_millis(time) });
}

/// Record a sync stream connection on a zone insight.
///
/// An older connect time never overwrites a newer one.
pub fn set_stream_connection(
    insight: &mut Resource,
    stream_type: StreamType,
    instance_id: &str,
    connect_time: SystemTime,
) {
    let spec = ensure_object(&mut insight.spec);
    let streams = ensure_object(&mut spec["kdsStreams"]);
    let stream = ensure_object(&mut streams[stream_type.as_str()]);

    let newer = stream
        .get("connectTime")
        .and_then(Value::as_u64)
        .map_or(true, |existing| existing < to_millis(connect_time));
    if newer {
        stream["connectTime"] = json!(to_millis(connect_time));
        stream["globalInstanceId"] = json!(instance_id);
    }
}

/// Read the current health check time of a zone.
///
/// A zone without an insight has never reported.
pub async fn read_health_check_time<M>(
    manager: &M,
    tenant: &TenantId,
    zone: &str,
) -> Result<Option<SystemTime>>
where
    M: ReadOnlyResourceManager + ?Sized,
{
    match manager
        .get(tenant, &zone_insight_type(), &ResourceKey::global(zone))
        .await
    {
        Ok(insight) => health_check_time(&insight),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Upsert the health check time of a zone.
pub async fn record_health_check<M>(
    manager: &M,
    tenant: &TenantId,
    zone: &str,
    time: SystemTime,
) -> Result<Resource>
where
    M: ResourceManager + ?Sized,
{
    upsert(
        manager,
        tenant,
        &zone_insight_type(),
        &ResourceKey::global(zone),
        UPSERT_CONFLICT_RETRIES,
        |insight| set_health_check_time(insight, time),
    )
    .await
}

/// Upsert a stream connection of a zone.
pub async fn record_stream_connection<M>(
    manager: &M,
    tenant: &TenantId,
    zone: &str,
    stream_type: StreamType,
    instance_id: &str,
    connect_time: SystemTime,
) -> Result<Resource>
where
    M: ResourceManager + ?Sized,
{
    upsert(
        manager,
        tenant,
        &zone_insight_type(),
        &ResourceKey::global(zone),
        UPSERT_CONFLICT_RETRIES,
        |insight| set_stream_connection(insight, stream_type, instance_id, connect_time),
    )
    .await
}

/// Create the `Zone` resource on first connect if it does not exist yet.
pub async fn create_zone_if_absent<M>(manager: &M, tenant: &TenantId, zone: &str) -> Result<()>
where
    M: ResourceManager + ?Sized,
{
    let key = ResourceKey::global(zone);
    match manager.get(tenant, &zone_type(), &key).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::info!(zone, %tenant, "creating zone");
            let resource = Resource::new(zone_type(), key, json!({ "enabled": true }));
            match manager.create(tenant, resource).await {
                Ok(_) | Err(StoreError::AlreadyExists { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

fn ensure_object(value: &mut Value) -> &mut Value {
    if !value.is_object() {
        *value = Value::Object(Default::default());
    }
    value
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn insight() -> Resource {
        Resource::new(zone_insight_type(), ResourceKey::global("zone-1"), Value::Null)
    }

    #[test]
    fn test_health_check_time_absent() {
        assert_eq!(health_check_time(&insight()).unwrap(), None);
    }

    #[test]
    fn test_health_check_time_set_and_read() {
        let mut r = insight();
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        set_health_check_time(&mut r, t);
        assert_eq!(health_check_time(&r).unwrap(), Some(t));
    }

    #[test]
    fn test_health_check_time_invalid() {
        let mut r = insight();
        r.spec = json!({"healthCheck": {"time": "yesterday"}});
        assert!(matches!(health_check_time(&r), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_stream_connection_keeps_newest() {
        let mut r = insight();
        let newer = UNIX_EPOCH + Duration::from_secs(200);
        let older = UNIX_EPOCH + Duration::from_secs(100);

        set_stream_connection(&mut r, StreamType::GlobalToZone, "cp-2", newer);
        set_stream_connection(&mut r, StreamType::GlobalToZone, "cp-1", older);

        assert_eq!(
            r.spec.pointer("/kdsStreams/globalToZone/globalInstanceId"),
            Some(&json!("cp-2"))
        );
    }

    #[tokio::test]
    async fn test_record_and_read_health_check() {
        let store = MemoryStore::new();
        let tenant = TenantId::default_tenant();
        assert_eq!(read_health_check_time(&store, &tenant, "zone-1").await.unwrap(), None);

        let t = UNIX_EPOCH + Duration::from_secs(42);
        record_health_check(&store, &tenant, "zone-1", t).await.unwrap();
        assert_eq!(
            read_health_check_time(&store, &tenant, "zone-1").await.unwrap(),
            Some(t)
        );
    }

    #[tokio::test]
    async fn test_create_zone_if_absent_is_idempotent() {
        let store = MemoryStore::new();
        let tenant = TenantId::default_tenant();
        create_zone_if_absent(&store, &tenant, "zone-1").await.unwrap();
        create_zone_if_absent(&store, &tenant, "zone-1").await.unwrap();
        assert_eq!(store.list(&tenant, &zone_type()).await.unwrap().len(), 1);
    }
}
