//! Error types for the mux module.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by transports and sessions.
///
/// Cloneable so the first session error can be handed to every role.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// The stream ended normally.
    #[error("end of stream")]
    Eof,

    /// The stream was cancelled locally.
    #[error("stream cancelled")]
    Cancelled,

    /// Physical send or receive failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A physical send did not complete within the per-message timeout.
    #[error("send to peer {peer} stuck for more than {timeout:?}")]
    SendStuck { peer: String, timeout: Duration },

    /// A received message could not be handed to its logical role within
    /// the per-message timeout.
    #[error("delivery from peer {peer} stuck for more than {timeout:?}")]
    RecvStuck { peer: String, timeout: Duration },

    /// The peer sent a message the session does not accept.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Required stream metadata is missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer asked for something this side does not implement.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Frame encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

impl MuxError {
    /// Normal termination: not worth logging as an error.
    pub fn is_graceful(&self) -> bool {
        matches!(self, MuxError::Eof | MuxError::Cancelled)
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, MuxError::Unimplemented(_))
    }
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => MuxError::Eof,
            _ => MuxError::Transport(e.to_string()),
        }
    }
}

/// Result type for mux operations.
pub type Result<T> = std::result::Result<T, MuxError>;
