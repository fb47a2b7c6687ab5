//! Server error types.

use crate::config::ConfigError;
use ricochet_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ricochet_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no identity lookup configured")]
    NoCallback,

    #[error("server is already listening")]
    InUse,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to a protocol error code, when the error has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ServerError::Protocol(e) => Some(e.code()),
            ServerError::NoCallback => Some(ErrorCode::ServerNoCallback),
            ServerError::InUse => Some(ErrorCode::ServerInUse),
            ServerError::Io(_) | ServerError::Config(_) | ServerError::ShuttingDown => None,
        }
    }

    /// Returns whether this error comes from misconfiguring the server
    /// before it started.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            ServerError::NoCallback | ServerError::InUse | ServerError::Config(_)
        )
    }
}
