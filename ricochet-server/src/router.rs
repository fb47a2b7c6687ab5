//! Channel routing table.
//!
//! Connections are registered on accept and channels are bound on successful
//! authentication. The channel map is maintained incrementally: `bind` and
//! `remove` update it under one write lock together with the connection's
//! identity, so a lookup never sees a channel without a live owner.

use crate::auth::Identity;
use crate::connection::Connection;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use ricochet_protocol::{ErrorCode, Frame, WireError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Receives frames addressed to a channel with no live connection.
///
/// Returning `Err` reports that code to the sender; `Ok` swallows the frame.
#[async_trait]
pub trait UnroutedHandler: Send + Sync {
    async fn unrouted(&self, frame: &Frame) -> Result<(), ErrorCode>;
}

/// Routing decision for one frame.
pub enum Route {
    /// Deliver to this connection.
    Deliver(Arc<Connection>),
    /// No connection is bound to the target channel.
    Unrouted,
    /// Delivery is not allowed.
    Rejected(ErrorCode),
}

/// Live connections and channel bindings.
#[derive(Default)]
pub struct Router {
    connections: DashMap<Uuid, Arc<Connection>>,
    channels: RwLock<HashMap<String, Uuid>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an accepted connection.
    pub fn insert(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    /// Binds the connection to its identity's channel.
    ///
    /// `announce` runs after the uniqueness check and before the channel
    /// becomes visible to other connections. It must not block.
    pub fn bind<F>(&self, conn: &Connection, identity: Identity, announce: F) -> Result<(), WireError>
    where
        F: FnOnce(&Identity),
    {
        let mut channels = self.channels.write();
        if let Some(owner) = channels.get(&identity.channel) {
            return Err(WireError::new(ErrorCode::AuthChannel)
                .with_detail("channel", identity.channel.clone())
                .with_detail("owner", owner.to_string()));
        }

        announce(&identity);
        channels.insert(identity.channel.clone(), conn.id());
        debug!(channel = %identity.channel, id = %conn.id(), "Channel bound");
        conn.set_identity(identity);
        Ok(())
    }

    /// Removes a connection and releases its channel.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        if let Some(channel) = conn.channel() {
            let mut channels = self.channels.write();
            if channels.get(&channel) == Some(id) {
                channels.remove(&channel);
                debug!(channel = %channel, id = %id, "Channel released");
            }
        }
        Some(conn)
    }

    /// Returns the connection bound to `channel`.
    pub fn resolve(&self, channel: &str) -> Option<Arc<Connection>> {
        let id = *self.channels.read().get(channel)?;
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Decides where a stamped frame goes.
    ///
    /// `from` and `groups` must already carry the sender's identity.
    pub fn route(&self, frame: &Frame) -> Route {
        if frame.headers.to == frame.headers.from {
            return Route::Rejected(ErrorCode::MessageSelf);
        }

        let recipient = match self.resolve(&frame.headers.to) {
            Some(recipient) => recipient,
            None => return Route::Unrouted,
        };

        match recipient.identity() {
            Some(identity) if identity.groups.admits(&frame.headers.groups) => {
                Route::Deliver(recipient)
            }
            Some(_) => Route::Rejected(ErrorCode::MessageGroup),
            None => Route::Unrouted,
        }
    }

    /// Returns every live connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use ricochet_protocol::{Groups, Headers, MessageType};
    use serde_json::json;

    fn identity(channel: &str, groups: Groups) -> Identity {
        Identity {
            channel: channel.into(),
            groups,
            private_key: format!("{}-private", channel),
            public_key: format!("{}-public", channel),
        }
    }

    fn frame(from: &str, to: &str, groups: Groups) -> Frame {
        let mut headers = Headers::new("id-1", MessageType::Message);
        headers.from = from.into();
        headers.to = to.into();
        headers.handle = "ping".into();
        headers.groups = groups;
        Frame::new(headers, json!({}))
    }

    fn bound(router: &Router, channel: &str, groups: Groups) -> Arc<Connection> {
        let conn = test_connection();
        router.insert(conn.clone());
        router.bind(&conn, identity(channel, groups), |_| {}).unwrap();
        conn
    }

    #[tokio::test]
    async fn test_bind_and_resolve() {
        let router = Router::new();
        let conn = bound(&router, "alpha", Groups::named(["g1"]));

        assert!(conn.is_authenticated());
        assert_eq!(router.resolve("alpha").unwrap().id(), conn.id());
        assert!(router.resolve("beta").is_none());
        assert_eq!(router.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_uniqueness() {
        let router = Router::new();
        let first = bound(&router, "alpha", Groups::All);

        let second = test_connection();
        router.insert(second.clone());
        let mut announced = false;
        let err = router
            .bind(&second, identity("alpha", Groups::All), |_| announced = true)
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::AuthChannel);
        assert!(!announced);
        assert!(!second.is_authenticated());
        assert_eq!(router.resolve("alpha").unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_remove_releases_channel() {
        let router = Router::new();
        let conn = bound(&router, "alpha", Groups::All);

        assert!(router.remove(&conn.id()).is_some());
        assert!(router.resolve("alpha").is_none());
        assert_eq!(router.connection_count(), 0);
        assert!(router.remove(&conn.id()).is_none());

        // The channel is free again.
        bound(&router, "alpha", Groups::All);
    }

    #[tokio::test]
    async fn test_route_self_addressed() {
        let router = Router::new();
        bound(&router, "alpha", Groups::All);
        let route = router.route(&frame("alpha", "alpha", Groups::All));
        assert!(matches!(route, Route::Rejected(ErrorCode::MessageSelf)));
    }

    #[tokio::test]
    async fn test_route_unrouted() {
        let router = Router::new();
        let route = router.route(&frame("alpha", "nobody", Groups::All));
        assert!(matches!(route, Route::Unrouted));
    }

    #[tokio::test]
    async fn test_route_group_rejected() {
        let router = Router::new();
        bound(&router, "beta", Groups::named(["c", "d"]));
        let route = router.route(&frame("alpha", "beta", Groups::named(["a", "b"])));
        assert!(matches!(route, Route::Rejected(ErrorCode::MessageGroup)));
    }

    #[tokio::test]
    async fn test_route_all_recipient_admits_anyone() {
        let router = Router::new();
        let beta = bound(&router, "beta", Groups::All);
        match router.route(&frame("alpha", "beta", Groups::named(["a", "b"]))) {
            Route::Deliver(conn) => assert_eq!(conn.id(), beta.id()),
            _ => panic!("expected delivery"),
        }
    }

    #[tokio::test]
    async fn test_route_shared_group() {
        let router = Router::new();
        bound(&router, "beta", Groups::named(["g1", "g2"]));
        let route = router.route(&frame("alpha", "beta", Groups::named(["g1"])));
        assert!(matches!(route, Route::Deliver(_)));
    }
}
