//! Error types for the store module.

use thiserror::Error;

use meshsync_core::{ResourceKey, ResourceType};

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No resource under this key.
    #[error("{resource_type} {key} not found")]
    NotFound {
        resource_type: ResourceType,
        key: ResourceKey,
    },

    /// A resource already exists under this key.
    #[error("{resource_type} {key} already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        key: ResourceKey,
    },

    /// Optimistic concurrency check failed.
    #[error("conflict on {resource_type} {key}: expected version {expected}, found {actual}")]
    Conflict {
        resource_type: ResourceType,
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    /// Stored data does not have the expected shape.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Resource serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
