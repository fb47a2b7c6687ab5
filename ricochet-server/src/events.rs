//! Server lifecycle and routing events.

use ricochet_protocol::{Frame, WireError};
use std::net::SocketAddr;
use uuid::Uuid;

/// Default event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Event published by a running server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A socket was accepted.
    ClientConnected { id: Uuid, addr: SocketAddr },
    /// A connection authenticated and bound its channel.
    ClientReady { id: Uuid, channel: String },
    /// A handshake failed or timed out. The connection is being evicted.
    ClientAuthFailed { id: Uuid, error: WireError },
    /// A connection is gone.
    ClientDisconnected { id: Uuid, channel: Option<String> },
    /// A frame from this connection could not be processed.
    MessageError { id: Uuid, error: WireError },
    /// A frame was written to the recipient's queue.
    MessageRouted { recipient: Uuid, frame: Frame },
}

impl ServerEvent {
    /// Connection the event concerns.
    pub fn connection_id(&self) -> Uuid {
        match self {
            ServerEvent::ClientConnected { id, .. }
            | ServerEvent::ClientReady { id, .. }
            | ServerEvent::ClientAuthFailed { id, .. }
            | ServerEvent::ClientDisconnected { id, .. }
            | ServerEvent::MessageError { id, .. } => *id,
            ServerEvent::MessageRouted { recipient, .. } => *recipient,
        }
    }
}
