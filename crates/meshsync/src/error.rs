//! Error types for the stream handlers.

use meshsync_mux::MuxError;
use meshsync_store::StoreError;
use meshsync_sync::SyncError;
use thiserror::Error;

/// Errors that end a sync stream or reject a configuration.
#[derive(Debug, Error)]
pub enum MeshSyncError {
    /// Session or metadata error.
    #[error("stream error: {0}")]
    Stream(#[from] MuxError),

    /// Reconciliation or delivery error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// A stream task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

impl MeshSyncError {
    /// Normal termination: cancellation or a clean end of stream.
    pub fn is_graceful(&self) -> bool {
        match self {
            MeshSyncError::Stream(e) => e.is_graceful(),
            MeshSyncError::Sync(e) => e.is_graceful(),
            _ => false,
        }
    }

    /// The peer asked for something this side does not implement.
    pub fn is_unimplemented(&self) -> bool {
        match self {
            MeshSyncError::Stream(e) => e.is_unimplemented(),
            MeshSyncError::Sync(e) => e.is_unimplemented(),
            _ => false,
        }
    }
}

/// Result type for stream handlers.
pub type Result<T> = std::result::Result<T, MeshSyncError>;
