//! Error types for meshsync core.

use thiserror::Error;

use crate::types::ResourceType;

/// Errors raised while building, encoding or checking snapshots.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A supported resource type is missing from a snapshot.
    #[error("snapshot is missing supported resource type {0}")]
    MissingType(ResourceType),

    /// A snapshot carries a type it does not declare as supported.
    #[error("snapshot carries undeclared resource type {0}")]
    UndeclaredType(ResourceType),

    /// An item is keyed under a name that does not match its resource.
    #[error("resource {name} of type {resource_type} is stored under key {stored_as}")]
    MisplacedResource {
        resource_type: ResourceType,
        name: String,
        stored_as: String,
    },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
