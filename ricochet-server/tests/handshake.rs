//! End-to-end authentication handshake.

mod common;

use common::{client, connect, options, record, server, start, RawPeer, WAIT};
use ricochet_client::{ClientError, ClientEvent};
use ricochet_protocol::{ErrorCode, Frame, Groups, Headers, MessageType, WireError};
use ricochet_server::ServerEvent;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;

async fn auth_failure(events: &mut broadcast::Receiver<ServerEvent>) -> WireError {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ServerEvent::ClientAuthFailed { error, .. }) = events.recv().await {
                return error;
            }
        }
    })
    .await
    .expect("auth failure reported")
}

/// Follows client events until `Closed`. Returns whether the credentials
/// were rejected and whether the client closed without reconnecting.
async fn client_outcome(events: &mut broadcast::Receiver<ClientEvent>) -> (bool, bool) {
    let mut rejected = false;
    let mut reconnected = false;
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::AuthFailed { .. }) => rejected = true,
                Ok(ClientEvent::Reconnected) => reconnected = true,
                Ok(ClientEvent::Closed) => break,
                _ => {}
            }
        }
    })
    .await
    .expect("client closed");
    (rejected, !reconnected)
}

#[tokio::test]
async fn test_raw_handshake() {
    let alpha = record("alpha", Groups::named(["g1", "g2"]));
    let (server, addr) = start(server(vec![alpha.clone()])).await;

    let mut peer = RawPeer::connect(addr).await;
    let reply = peer.authenticate(&alpha).await;
    assert_eq!(
        reply,
        json!({"auth": true, "channel": "alpha", "groups": ["g1", "g2"]})
    );
    assert_eq!(server.channels(), vec!["alpha".to_string()]);
    server.shutdown();
}

#[tokio::test]
async fn test_stale_stamp_rejected() {
    let alpha = record("alpha", Groups::named(["g1"]));
    let (server, addr) = start(server(vec![alpha.clone()])).await;
    let mut events = server.subscribe();

    let mut peer = RawPeer::connect(addr).await;
    let credentials = peer.credentials(&alpha, Duration::from_secs(600));
    peer.send(&credentials).await;

    assert_eq!(peer.recv().await, Some(json!({"auth": false})));
    assert_eq!(peer.recv().await, None);
    assert_eq!(auth_failure(&mut events).await.code, ErrorCode::AuthExpiredKey);
    assert!(server.channels().is_empty());
    server.shutdown();
}

#[tokio::test]
async fn test_silent_socket_evicted() {
    let alpha = record("alpha", Groups::named(["g1"]));
    let (server, addr) = start(server(vec![alpha])).await;
    let mut events = server.subscribe();

    let mut peer = RawPeer::connect(addr).await;
    assert_eq!(peer.recv().await, None);
    assert_eq!(auth_failure(&mut events).await.code, ErrorCode::AuthTimeout);
    server.shutdown();
}

#[tokio::test]
async fn test_frame_before_auth() {
    let alpha = record("alpha", Groups::named(["g1"]));
    let (server, addr) = start(server(vec![alpha])).await;
    let mut events = server.subscribe();

    let mut peer = RawPeer::connect(addr).await;
    let mut headers = Headers::new("m-1", MessageType::Message);
    headers.to = "beta".into();
    headers.handle = "ping".into();
    peer.send(&Frame::new(headers, json!({}))).await;

    assert_eq!(peer.recv().await, Some(json!({"auth": false})));
    assert_eq!(peer.recv().await, None);
    assert_eq!(auth_failure(&mut events).await.code, ErrorCode::AuthMalformed);
    server.shutdown();
}

#[tokio::test]
async fn test_channel_conflict() {
    let alpha = record("alpha", Groups::named(["g1"]));
    let (server, addr) = start(server(vec![alpha.clone()])).await;

    let first = connect(addr, &alpha).await;

    let second = client();
    let mut events = second.subscribe();
    second.connect(options(addr, &alpha)).await.unwrap();

    // A rejected client gives up instead of reconnecting.
    assert_eq!(client_outcome(&mut events).await, (true, true));
    assert!(!second.status().active_connection);
    assert!(!second.is_connected());

    assert!(first.status().authenticated);
    assert_eq!(server.channels(), vec!["alpha".to_string()]);
    server.shutdown();
}

#[tokio::test]
async fn test_wrong_auth_key() {
    let alpha = record("alpha", Groups::named(["g1"]));
    let (server, addr) = start(server(vec![alpha.clone()])).await;
    let mut events = server.subscribe();

    let client = client();
    let mut client_events = client.subscribe();
    client
        .connect(options(addr, &alpha).with_auth_key("not-the-key"))
        .await
        .unwrap();
    assert_eq!(client_outcome(&mut client_events).await, (true, true));
    assert!(matches!(client.wait_ready().await, Err(ClientError::NotConnected)));
    assert_eq!(auth_failure(&mut events).await.code, ErrorCode::AuthAuthKey);
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_public_key() {
    let alpha = record("alpha", Groups::named(["g1"]));
    let stranger = record("stranger", Groups::named(["g1"]));
    let (server, addr) = start(server(vec![alpha])).await;
    let mut events = server.subscribe();

    let mut peer = RawPeer::connect(addr).await;
    assert_eq!(peer.authenticate(&stranger).await, json!({"auth": false}));
    assert_eq!(auth_failure(&mut events).await.code, ErrorCode::AuthFailure);
    server.shutdown();
}

#[tokio::test]
async fn test_no_groups_rejected() {
    let idle = record("idle", Groups::default());
    let (server, addr) = start(server(vec![idle.clone()])).await;

    let mut peer = RawPeer::connect(addr).await;
    assert_eq!(peer.authenticate(&idle).await, json!({"auth": false}));
    server.shutdown();
}
