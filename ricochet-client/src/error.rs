//! Client error types.

use ricochet_protocol::{ErrorCode, WireError};
use serde_json::Value;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ricochet_protocol::ProtocolError),

    #[error("invalid connect options: {0}")]
    InvalidOptions(String),

    #[error("not connected")]
    NotConnected,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("already connected")]
    AlreadyConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("authentication rejected")]
    AuthFailed,

    #[error("request timed out (local: {local})")]
    Timeout { local: bool },

    #[error("remote error: {0}")]
    Remote(WireError),

    #[error("request rejected by peer: {0}")]
    Rejected(Value),
}

impl ClientError {
    /// Converts to a protocol error code, when the error has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Io(_) => Some(ErrorCode::ClientSend),
            ClientError::Protocol(e) => Some(e.code()),
            ClientError::NotConnected | ClientError::ConnectionClosed => {
                Some(ErrorCode::ClientConnection)
            }
            ClientError::NotAuthenticated => Some(ErrorCode::ClientAuth),
            ClientError::AlreadyConnected => Some(ErrorCode::ClientConnected),
            ClientError::Timeout { .. } => Some(ErrorCode::MessageTimeout),
            ClientError::Remote(e) => Some(e.code),
            ClientError::InvalidOptions(_)
            | ClientError::ConnectTimeout
            | ClientError::AuthFailed
            | ClientError::Rejected(_) => None,
        }
    }

    /// Returns whether the request timed out on this side rather than on
    /// the peer.
    pub fn is_local_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { local: true })
    }

    /// Returns whether retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::NotConnected
                | ClientError::ConnectionClosed
                | ClientError::ConnectTimeout
                | ClientError::Timeout { .. }
        )
    }
}
