//! Error types for the sync module.

use thiserror::Error;

use meshsync_core::{CoreError, ResourceType};
use meshsync_mux::MuxError;
use meshsync_store::StoreError;

/// Errors that can occur while reconciling or delivering resources.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Snapshot construction or encoding failed.
    #[error("snapshot error: {0}")]
    Core(#[from] CoreError),

    /// Reading or writing resources failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The session or its transport failed.
    #[error("stream error: {0}")]
    Stream(#[from] MuxError),

    /// A resource mapper rejected a resource.
    #[error("could not map {resource_type} {name}: {source}")]
    Mapper {
        resource_type: ResourceType,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The resource syncer could not apply a response.
    #[error("could not sync {resource_type}: {source}")]
    Syncer {
        resource_type: ResourceType,
        #[source]
        source: anyhow::Error,
    },

    /// A message named a resource type this side does not handle.
    #[error("unknown resource type: {0}")]
    UnknownType(String),

    /// The peer does not implement the requested RPC.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// The loop was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Normal termination: cancellation or a clean end of stream.
    pub fn is_graceful(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::Stream(e) => e.is_graceful(),
            _ => false,
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        match self {
            SyncError::Unimplemented(_) => true,
            SyncError::Stream(e) => e.is_unimplemented(),
            _ => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
