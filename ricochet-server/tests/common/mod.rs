//! Helpers shared by the end-to-end tests.

#![allow(dead_code)]

use ricochet_client::{Client, ClientConfig, ConnectOptions};
use ricochet_protocol::{
    now_millis, AuthFrame, Decoder, Encoder, Envelope, Groups, ProtocolConfig, TimeoutConfig,
};
use ricochet_server::{IdentityRecord, Server, ServerConfig, StaticIdentities};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Protocol settings with timeouts short enough for tests.
pub fn protocol() -> ProtocolConfig {
    ProtocolConfig::default().with_timeouts(TimeoutConfig {
        message_ms: 2_000,
        latency_buffer_ms: 250,
        reconnect_ms: 100,
        auth_ms: 300,
        ..Default::default()
    })
}

pub fn record(channel: &str, groups: Groups) -> IdentityRecord {
    IdentityRecord {
        ip: "127.0.0.1".into(),
        private_key: format!("{}-private", channel),
        public_key: format!("{}-public", channel),
        auth_key: format!("{}-auth", channel),
        channel: channel.into(),
        groups,
    }
}

pub fn server(records: Vec<IdentityRecord>) -> Server {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_protocol(protocol());
    Server::new(config).with_identity_lookup(Arc::new(StaticIdentities::new(records)))
}

/// Starts `server` and returns it with its bound address.
pub async fn start(server: Server) -> (Arc<Server>, SocketAddr) {
    let addr = server.listen().await.expect("listen");
    (Arc::new(server), addr)
}

pub fn options(addr: SocketAddr, record: &IdentityRecord) -> ConnectOptions {
    ConnectOptions::new(record.public_key.clone(), record.private_key.clone())
        .with_auth_key(record.auth_key.clone())
        .with_port(addr.port())
}

pub fn client() -> Client {
    Client::new(ClientConfig::default().with_protocol(protocol()))
}

/// Connects a client and waits until it is authenticated.
pub async fn connect(addr: SocketAddr, record: &IdentityRecord) -> Client {
    let client = client();
    client.connect(options(addr, record)).await.expect("connect");
    tokio::time::timeout(WAIT, client.wait_ready())
        .await
        .expect("ready in time")
        .expect("authenticated");
    client
}

/// A peer speaking the wire protocol directly.
pub struct RawPeer {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
    pub envelope: Envelope,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let protocol = protocol();
        Self {
            stream: TcpStream::connect(addr).await.expect("connect"),
            decoder: protocol.decoder(),
            encoder: protocol.encoder(),
            envelope: protocol.envelope(),
        }
    }

    /// Builds credentials for `record` stamped `age` in the past.
    pub fn credentials(&self, record: &IdentityRecord, age: Duration) -> AuthFrame {
        AuthFrame::seal(
            &self.envelope,
            &record.public_key,
            &record.private_key,
            &record.auth_key,
            now_millis() - age.as_millis() as i64,
        )
        .expect("seal")
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) {
        let bytes = self.encoder.encode(value).expect("encode");
        self.stream.write_all(&bytes).await.expect("write");
    }

    /// Next decoded value, or `None` once the server closed the socket.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, async {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(value) = self.decoder.decode().expect("decode") {
                    return Some(value);
                }
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => self.decoder.extend(&buf[..n]),
                }
            }
        })
        .await
        .expect("server answered in time")
    }

    /// Authenticates as `record` and returns the server's answer.
    pub async fn authenticate(&mut self, record: &IdentityRecord) -> Value {
        let credentials = self.credentials(record, Duration::ZERO);
        self.send(&credentials).await;
        self.recv().await.expect("auth reply")
    }
}
