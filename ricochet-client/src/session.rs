//! Client session state.

use ricochet_protocol::Groups;

/// Snapshot of the client's connection and authentication state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// A socket is open.
    pub connected: bool,
    /// The server accepted our credentials.
    pub authenticated: bool,
    /// Channel bound by the server.
    pub channel: Option<String>,
    /// Groups granted by the server.
    pub groups: Groups,
    /// Cleared by `close()` to stop reconnecting.
    pub active_connection: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            authenticated: false,
            channel: None,
            groups: Groups::default(),
            active_connection: true,
        }
    }
}

impl SessionState {
    /// Clears everything a closed socket invalidates.
    pub(crate) fn reset(&mut self) {
        self.connected = false;
        self.authenticated = false;
        self.channel = None;
        self.groups = Groups::default();
    }
}
