//! Per-connection pipeline.
//!
//! Each accepted socket gets a read loop, an inbound queue that runs the
//! handshake or routes frames one at a time, and an outbound queue that owns
//! the write half.

use crate::auth::{normalize_ip, Authenticator, Identity};
use crate::events::ServerEvent;
use crate::router::{Route, Router, UnroutedHandler};
use crate::server::ServerStats;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use ricochet_protocol::frame::SERVER_REQUIRED_HEADERS;
use ricochet_protocol::{
    parse_frame, AuthReply, DeliveryQueue, Encoder, Envelope, ErrorCode, Frame, Processor,
    ProtocolConfig, QueueClosed, ReplyStatus, WireError,
};
use serde::Serialize;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frame counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Frames this connection sent that reached a recipient.
    pub sent: u64,
    /// Frames delivered to this connection.
    pub received: u64,
}

/// A live client connection.
pub struct Connection {
    id: Uuid,
    addr: SocketAddr,
    remote_ip: IpAddr,
    identity: RwLock<Option<Identity>>,
    outbound: DeliveryQueue<Bytes>,
    sent: AtomicU64,
    received: AtomicU64,
    closing: AtomicBool,
    evicted: Notify,
    connected_at: Instant,
}

impl Connection {
    pub fn new(id: Uuid, addr: SocketAddr, outbound: DeliveryQueue<Bytes>) -> Self {
        Self {
            id,
            addr,
            remote_ip: normalize_ip(addr.ip()),
            identity: RwLock::new(None),
            outbound,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            evicted: Notify::new(),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Remote address with IPv4-mapped IPv6 unwrapped.
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    pub fn channel(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.channel.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.read().is_some()
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        *self.identity.write() = Some(identity);
    }

    /// Queues encoded bytes for the socket.
    pub async fn send(&self, bytes: Bytes) -> Result<(), QueueClosed> {
        self.outbound.push(bytes).await
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    /// Returns the connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Asks the read loop to drop this connection.
    pub fn evict(&self) {
        self.closing.store(true, Ordering::Release);
        self.evicted.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// State shared by every connection of one server.
pub(crate) struct Shared {
    pub protocol: ProtocolConfig,
    pub encoder: Encoder,
    pub envelope: Envelope,
    pub authenticator: Authenticator,
    pub unrouted: Option<Arc<dyn UnroutedHandler>>,
    pub router: Arc<Router>,
    pub events: broadcast::Sender<ServerEvent>,
    pub stats: Arc<ServerStats>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Runs the handshake for an unauthenticated connection.
    async fn handshake(&self, conn: &Arc<Connection>, value: Value) {
        let result = match self.authenticator.authenticate(value, conn.remote_ip()).await {
            Ok(identity) => self.bind(conn, identity).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(channel) => {
                info!("[{}] Client ready (channel={})", conn.addr(), channel);
                self.emit(ServerEvent::ClientReady {
                    id: conn.id(),
                    channel,
                });
            }
            Err(error) => {
                warn!("[{}] Authentication failed: {}", conn.addr(), error);
                if let Ok(bytes) = self.encoder.encode(&AuthReply::rejected()) {
                    let _ = conn.send(bytes).await;
                }
                self.emit(ServerEvent::ClientAuthFailed {
                    id: conn.id(),
                    error,
                });
                conn.evict();
            }
        }
    }

    /// Binds the channel and queues `{auth:true}` ahead of any routed frame.
    async fn bind(&self, conn: &Arc<Connection>, identity: Identity) -> Result<String, WireError> {
        let accepted = AuthReply::accepted(identity.channel.clone(), identity.groups.clone());
        let bytes = self.encoder.encode(&accepted)?;
        let slot = conn
            .outbound
            .reserve()
            .await
            .map_err(|_| WireError::new(ErrorCode::MessageNoClient))?;

        let channel = identity.channel.clone();
        self.router
            .bind(conn, identity, move |_| slot.fill(bytes))?;
        Ok(channel)
    }

    /// Validates, stamps and routes one frame from an authenticated
    /// connection.
    async fn route(&self, conn: &Arc<Connection>, value: Value) {
        let identity = match conn.identity() {
            Some(identity) => identity,
            None => return,
        };

        let mut frame = match parse_frame(value, SERVER_REQUIRED_HEADERS) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[{}] Dropping frame: {}", conn.addr(), e);
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                self.emit(ServerEvent::MessageError {
                    id: conn.id(),
                    error: e.into(),
                });
                return;
            }
        };

        frame.headers.from = identity.channel.clone();
        frame.headers.groups = identity.groups.clone();

        if frame.headers.encrypted {
            match self.envelope.decrypt_json(&identity.private_key, &frame.body) {
                Ok(body) => frame.body = body,
                Err(e) => {
                    self.fail(conn, &identity, &frame, e.into()).await;
                    return;
                }
            }
        }

        if let Err(error) = self.deliver(conn, &frame).await {
            self.fail(conn, &identity, &frame, error).await;
        }
    }

    async fn deliver(&self, sender: &Connection, frame: &Frame) -> Result<(), WireError> {
        let recipient = match self.router.route(frame) {
            Route::Deliver(recipient) => recipient,
            Route::Rejected(code) => return Err(WireError::new(code)),
            Route::Unrouted => {
                return match &self.unrouted {
                    Some(handler) => handler.unrouted(frame).await.map_err(WireError::new),
                    None => Err(WireError::new(ErrorCode::MessageNoRecipient)),
                };
            }
        };

        let key = recipient
            .identity()
            .map(|identity| identity.private_key)
            .ok_or_else(|| WireError::new(ErrorCode::MessageNoClient))?;

        let mut outgoing = frame.clone();
        if outgoing.headers.encrypted {
            outgoing.body = self
                .envelope
                .encrypt_json(&key, &frame.body, Some(&frame.headers.id))?;
        }

        let bytes = self.encoder.encode(&outgoing)?;
        recipient
            .send(bytes)
            .await
            .map_err(|_| WireError::new(ErrorCode::ClientSend))?;

        sender.sent.fetch_add(1, Ordering::Relaxed);
        recipient.received.fetch_add(1, Ordering::Relaxed);
        self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);

        debug!(
            "[{}] Routed {:?} {} -> {} (id={})",
            sender.addr(),
            outgoing.headers.kind,
            outgoing.headers.from,
            outgoing.headers.to,
            outgoing.headers.id
        );
        self.emit(ServerEvent::MessageRouted {
            recipient: recipient.id(),
            frame: outgoing,
        });
        Ok(())
    }

    /// Reports a routing failure, answering the sender if it asked for a
    /// reply.
    async fn fail(&self, conn: &Connection, identity: &Identity, frame: &Frame, error: WireError) {
        debug!(
            "[{}] Frame {} to '{}' failed: {}",
            conn.addr(),
            frame.headers.id,
            frame.headers.to,
            error
        );
        self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        self.emit(ServerEvent::MessageError {
            id: conn.id(),
            error: error
                .clone()
                .with_detail("frame", frame.headers.id.clone())
                .with_detail("to", frame.headers.to.clone()),
        });

        if !frame.is_request() {
            return;
        }

        let mut reply = frame.reply(ReplyStatus::Error, error.to_body());
        reply.headers.groups = identity.groups.clone();
        if reply.headers.encrypted {
            match self
                .envelope
                .encrypt_json(&identity.private_key, &reply.body, Some(&reply.headers.id))
            {
                Ok(body) => reply.body = body,
                Err(e) => {
                    warn!("[{}] Unable to seal error reply: {}", conn.addr(), e);
                    return;
                }
            }
        }

        match self.encoder.encode(&reply) {
            Ok(bytes) => {
                let _ = conn.send(bytes).await;
            }
            Err(e) => warn!("[{}] Unable to encode error reply: {}", conn.addr(), e),
        }
    }
}

/// Runs the handshake or routes each inbound frame, in arrival order.
struct Inbound {
    conn: Arc<Connection>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Processor<Value> for Inbound {
    async fn process(&mut self, value: Value) {
        if self.conn.is_closing() {
            return;
        }
        if self.conn.is_authenticated() {
            self.shared.route(&self.conn, value).await;
        } else {
            self.shared.handshake(&self.conn, value).await;
        }
    }
}

/// Owns the write half of a socket.
struct SocketWriter {
    writer: OwnedWriteHalf,
    id: Uuid,
    addr: SocketAddr,
    events: broadcast::Sender<ServerEvent>,
    failed: bool,
}

#[async_trait]
impl Processor<Bytes> for SocketWriter {
    async fn process(&mut self, bytes: Bytes) {
        if self.failed {
            return;
        }
        if let Err(e) = self.writer.write_all(&bytes).await {
            warn!("[{}] Write error: {}", self.addr, e);
            self.failed = true;
            let error = WireError::new(ErrorCode::ClientSend).with_detail("cause", e.to_string());
            let _ = self.events.send(ServerEvent::MessageError { id: self.id, error });
        }
    }

    async fn finish(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Serves one accepted socket until it closes, is evicted, or the server
/// shuts down.
pub(crate) async fn serve(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let queue_size = shared.protocol.queue_size;

    let id = Uuid::new_v4();
    let (outbound, _writer_task) = DeliveryQueue::spawn(
        "outbound",
        queue_size,
        SocketWriter {
            writer,
            id,
            addr,
            events: shared.events.clone(),
            failed: false,
        },
    );
    let conn = Arc::new(Connection::new(id, addr, outbound));

    shared.router.insert(conn.clone());
    info!("Client connected: {} (id={})", addr, id);
    shared.emit(ServerEvent::ClientConnected { id, addr });

    let (inbound, inbound_task) = DeliveryQueue::spawn(
        "inbound",
        queue_size,
        Inbound {
            conn: conn.clone(),
            shared: shared.clone(),
        },
    );

    let mut decoder = shared.protocol.decoder();
    let mut buf = [0u8; 8192];
    let auth_deadline = tokio::time::sleep(shared.protocol.timeouts.auth());
    tokio::pin!(auth_deadline);

    let drain = 'read: loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("[{}] Connection closed by client", addr);
                        break 'read true;
                    }
                    Ok(n) => {
                        debug!("[{}] Received {} bytes", addr, n);
                        decoder.extend(&buf[..n]);
                    }
                    Err(e) => {
                        debug!("[{}] Read error: {}", addr, e);
                        break 'read false;
                    }
                }
            }

            _ = &mut auth_deadline, if !conn.is_authenticated() => {
                let error = WireError::new(ErrorCode::AuthTimeout)
                    .with_detail("ip", conn.remote_ip().to_string());
                warn!("[{}] Authentication timed out", addr);
                shared.emit(ServerEvent::ClientAuthFailed { id, error });
                break 'read false;
            }

            _ = conn.evicted.notified() => {
                debug!("[{}] Evicted", addr);
                break 'read false;
            }

            _ = shutdown.recv() => {
                debug!("[{}] Shutdown signal received", addr);
                break 'read false;
            }
        }

        loop {
            match decoder.decode() {
                Ok(Some(value)) => {
                    if inbound.push(value).await.is_err() {
                        break 'read false;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    warn!("[{}] Dropping connection: {}", addr, e);
                    shared.emit(ServerEvent::MessageError { id, error: e.into() });
                    break 'read false;
                }
                Err(e) => {
                    debug!("[{}] Bad frame: {}", addr, e);
                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    shared.emit(ServerEvent::MessageError { id, error: e.into() });
                }
            }
        }
    };

    drop(inbound);
    if drain && !conn.is_closing() {
        let _ = inbound_task.await;
    } else {
        inbound_task.abort();
    }

    let channel = conn.channel();
    shared.router.remove(&id);
    info!(
        "Client disconnected: {} (id={}, channel={})",
        addr,
        id,
        channel.as_deref().unwrap_or("-")
    );
    shared.emit(ServerEvent::ClientDisconnected { id, channel });
}
