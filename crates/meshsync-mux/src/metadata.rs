//! Stream metadata: the headers a peer presents when it opens a stream.

use std::collections::BTreeMap;

use meshsync_core::{Features, TenantId};

use crate::error::{MuxError, Result};

pub const CLIENT_ID_KEY: &str = "client-id";
pub const KDS_VERSION_KEY: &str = "kds-version";
pub const TENANT_KEY: &str = "tenant";
pub const FEATURES_KEY: &str = "features";

/// Legacy state-of-the-world protocol.
pub const KDS_VERSION_V2: &str = "v2";
/// Delta protocol.
pub const KDS_VERSION_V3: &str = "v3";

/// Multi-valued, case-insensitive header map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMetadata(BTreeMap<String, Vec<String>>);

impl StreamMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to a key.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Builder form of [`StreamMetadata::append`].
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.append(key, value);
        self
    }

    /// The first value of a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of a key.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The peer's client id. Required on every sync stream.
    pub fn client_id(&self) -> Result<&str> {
        match self.get(CLIENT_ID_KEY) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(MuxError::InvalidArgument(format!(
                "\"{CLIENT_ID_KEY}\" is not present in stream metadata"
            ))),
        }
    }

    /// The requested protocol version. Defaults to the legacy one.
    pub fn kds_version(&self) -> &str {
        self.get(KDS_VERSION_KEY).unwrap_or(KDS_VERSION_V2)
    }

    /// Fail unless the peer speaks the delta protocol.
    pub fn require_delta(&self) -> Result<()> {
        match self.kds_version() {
            KDS_VERSION_V3 => Ok(()),
            other => Err(MuxError::Unimplemented(format!(
                "kds version {other} is not supported, only {KDS_VERSION_V3}"
            ))),
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.get(TENANT_KEY)
            .map(TenantId::new)
            .unwrap_or_default()
    }

    /// Negotiated features. Values may repeat the key or be comma separated.
    pub fn features(&self) -> Features {
        self.get_all(FEATURES_KEY)
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::FEATURE_ZONE_PING_HEALTH;

    #[test]
    fn test_missing_client_id_is_invalid_argument() {
        let md = StreamMetadata::new();
        assert!(matches!(md.client_id(), Err(MuxError::InvalidArgument(_))));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let md = StreamMetadata::new().with("Client-ID", "zone-1");
        assert_eq!(md.client_id().unwrap(), "zone-1");
    }

    #[test]
    fn test_default_version_is_legacy() {
        let md = StreamMetadata::new();
        assert_eq!(md.kds_version(), KDS_VERSION_V2);
        assert!(md.require_delta().unwrap_err().is_unimplemented());
    }

    #[test]
    fn test_features_split() {
        let md = StreamMetadata::new()
            .with(FEATURES_KEY, format!("{FEATURE_ZONE_PING_HEALTH}, other"))
            .with(FEATURES_KEY, "third");
        let features = md.features();
        assert!(features.has(FEATURE_ZONE_PING_HEALTH));
        assert!(features.has("other"));
        assert!(features.has("third"));
    }

    #[test]
    fn test_tenant_defaults() {
        assert!(StreamMetadata::new().tenant().is_default());
        assert_eq!(
            StreamMetadata::new().with(TENANT_KEY, "acme").tenant(),
            TenantId::new("acme")
        );
    }
}
