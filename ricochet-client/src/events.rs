//! Client lifecycle and error events.

use ricochet_protocol::{Groups, WireError};
use serde_json::Value;

/// Default event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event published by a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The first socket of a `connect()` call is open.
    Connected,
    /// A socket opened by the reconnect loop is open.
    Reconnected,
    /// Opening a socket failed.
    ConnectionFailed { error: String },
    /// The socket closed and a reconnect is scheduled.
    Disconnected { reason: Option<String> },
    /// The socket closed after `close()`. No reconnect follows.
    Closed,
    /// The server accepted our credentials.
    Ready { channel: String, groups: Groups },
    /// The server rejected our credentials. The socket is being closed.
    AuthFailed { reply: Value },
    /// A frame could not be written.
    SendError { id: Option<String>, error: WireError },
    /// An inbound frame was dropped.
    ReceiveError { error: WireError },
}
