//! Socket pipeline and reconnect loop.
//!
//! Each socket gets an outbound queue that owns the write half and seals
//! bodies, and an inbound queue that applies the handshake reply, checks
//! headers and settles replies one frame at a time. Messages and requests
//! are handed to their handlers on separate tasks, so a handler awaiting a
//! reply of its own never holds up intake. The supervisor task owns the
//! read half and replaces the socket when it drops.

use crate::config::{ClientConfig, ConnectOptions};
use crate::error::ClientError;
use crate::events::{ClientEvent, DEFAULT_EVENT_CAPACITY};
use crate::handler::{Handlers, Incoming, Outcome};
use crate::registry::PendingRegistry;
use crate::reply::Responder;
use crate::session::SessionState;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use ricochet_protocol::frame::CLIENT_REQUIRED_HEADERS;
use ricochet_protocol::{
    now_millis, parse_frame, AuthFrame, AuthReply, DeliveryQueue, Encoder, Envelope, ErrorCode,
    Frame, MessageType, Processor, ProtocolError, WireError,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default read buffer size (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Item written by the outbound queue.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Credential frame, sent before the session is authenticated.
    Auth(AuthFrame),
    /// Routed frame with a plaintext body.
    Frame(Frame),
}

/// Handles of the socket currently in use.
#[derive(Clone)]
pub(crate) struct Link {
    pub outbound: DeliveryQueue<Outgoing>,
    closer: Arc<Notify>,
}

/// State shared by a client, its queues and its supervisor.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub encoder: Encoder,
    pub envelope: Envelope,
    pub session: Mutex<SessionState>,
    pub options: Mutex<Option<ConnectOptions>>,
    pub link: Mutex<Option<Link>>,
    pub registry: Arc<PendingRegistry>,
    pub handlers: Handlers,
    pub events: broadcast::Sender<ClientEvent>,
    /// Bumped by `close()`; wakes the supervisor wherever it waits.
    pub stop: watch::Sender<u64>,
    /// Set while a supervisor owns the connection.
    pub attached: AtomicBool,
}

impl Shared {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let (stop, _) = watch::channel(0);
        Self {
            encoder: config.protocol.encoder(),
            envelope: config.protocol.envelope(),
            registry: Arc::new(PendingRegistry::new(
                config.protocol.timeouts.latency_buffer(),
            )),
            session: Mutex::new(SessionState::default()),
            options: Mutex::new(None),
            link: Mutex::new(None),
            handlers: Handlers::default(),
            events,
            stop,
            attached: AtomicBool::new(false),
            config,
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn outbound(&self) -> Option<DeliveryQueue<Outgoing>> {
        self.link.lock().as_ref().map(|link| link.outbound.clone())
    }

    /// Opens a TCP connection to the configured server.
    pub async fn dial(&self, options: &ConnectOptions) -> Result<TcpStream, ClientError> {
        let address = options.address();
        debug!("Connecting to {}...", address);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(address.as_str()),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;

        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Asks the supervisor to close the socket and stop reconnecting.
    pub fn request_stop(&self) {
        self.session.lock().active_connection = false;
        self.stop.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn stopped(&self) -> bool {
        !self.session.lock().active_connection
    }
}

/// An attached socket, ready to be read.
pub(crate) struct Socket {
    reader: OwnedReadHalf,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    inbound: DeliveryQueue<Value>,
    inbound_task: JoinHandle<()>,
    closer: Arc<Notify>,
}

/// Wires a fresh socket into the client and queues the credential frame.
pub(crate) async fn attach(
    shared: &Arc<Shared>,
    stream: TcpStream,
    options: &ConnectOptions,
    first: bool,
) -> Result<Socket, ClientError> {
    let auth = AuthFrame::seal(
        &shared.envelope,
        &options.public_key,
        &options.private_key,
        &options.auth_key,
        now_millis(),
    )?;

    let (reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(Some(writer)));
    let closer = Arc::new(Notify::new());
    let queue_size = shared.config.protocol.queue_size;

    let (outbound, _writer_task) = DeliveryQueue::spawn(
        "outbound",
        queue_size,
        SocketWriter {
            writer: writer.clone(),
            shared: shared.clone(),
            private_key: options.private_key.clone(),
        },
    );
    let (inbound, inbound_task) = DeliveryQueue::spawn(
        "inbound",
        queue_size,
        Inbound {
            shared: shared.clone(),
            outbound: outbound.clone(),
            private_key: options.private_key.clone(),
            closer: closer.clone(),
        },
    );

    shared.session.lock().connected = true;
    *shared.link.lock() = Some(Link {
        outbound: outbound.clone(),
        closer: closer.clone(),
    });

    if first {
        info!("Connected to {}", options.address());
        shared.emit(ClientEvent::Connected);
    } else {
        info!("Reconnected to {}", options.address());
        shared.emit(ClientEvent::Reconnected);
    }

    outbound
        .push(Outgoing::Auth(auth))
        .await
        .map_err(|_| ClientError::ConnectionClosed)?;

    Ok(Socket {
        reader,
        writer,
        inbound,
        inbound_task,
        closer,
    })
}

/// Reads the socket until it closes, then detaches it from the client.
///
/// Returns the transport error that ended the socket, if any.
async fn run(shared: &Arc<Shared>, socket: Socket, stop: &mut watch::Receiver<u64>) -> Option<String> {
    let Socket {
        mut reader,
        writer,
        inbound,
        inbound_task,
        closer,
    } = socket;

    let mut decoder = shared.config.protocol.decoder();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let (drain, reason) = 'read: loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Connection closed by server");
                        break 'read (true, None);
                    }
                    Ok(n) => {
                        debug!("Received {} bytes", n);
                        decoder.extend(&buf[..n]);
                    }
                    Err(e) => {
                        debug!("Read error: {}", e);
                        break 'read (false, Some(e.to_string()));
                    }
                }
            }

            _ = closer.notified() => {
                debug!("Closing socket");
                break 'read (false, None);
            }

            _ = stop.changed() => {
                debug!("Close requested");
                break 'read (false, None);
            }
        }

        loop {
            match decoder.decode() {
                Ok(Some(value)) => {
                    if inbound.push(value).await.is_err() {
                        break 'read (false, None);
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    warn!("Dropping connection: {}", e);
                    let reason = e.to_string();
                    shared.emit(ClientEvent::ReceiveError { error: e.into() });
                    break 'read (false, Some(reason));
                }
                Err(e) => {
                    debug!("Bad frame: {}", e);
                    shared.emit(ClientEvent::ReceiveError { error: e.into() });
                }
            }
        }
    };

    drop(inbound);
    if drain {
        let _ = inbound_task.await;
    } else {
        inbound_task.abort();
    }

    {
        let mut link = shared.link.lock();
        let ours = link
            .as_ref()
            .map(|link| Arc::ptr_eq(&link.closer, &closer))
            .unwrap_or(false);
        if ours {
            *link = None;
        }
    }

    if let Some(mut writer) = writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }

    shared.session.lock().reset();
    shared.registry.reset();
    reason
}

/// Runs sockets until the client is closed, reconnecting after every drop.
///
/// Without a first socket, it starts by retrying the initial connect.
pub(crate) async fn supervise(
    shared: Arc<Shared>,
    socket: Option<Socket>,
    mut stop: watch::Receiver<u64>,
) {
    let mut first = socket.is_none();
    let mut next = socket;
    loop {
        let socket = match next.take() {
            Some(socket) => socket,
            None => match reconnect(&shared, &mut stop, first).await {
                Some(socket) => socket,
                None => break,
            },
        };
        first = false;

        let reason = run(&shared, socket, &mut stop).await;
        if shared.stopped() {
            break;
        }

        warn!(
            "Disconnected ({}), reconnecting in {:?}",
            reason.as_deref().unwrap_or("closed"),
            shared.config.protocol.timeouts.reconnect()
        );
        shared.emit(ClientEvent::Disconnected { reason });
    }

    info!("Connection closed");
    shared.attached.store(false, Ordering::SeqCst);
    shared.emit(ClientEvent::Closed);
}

async fn reconnect(
    shared: &Arc<Shared>,
    stop: &mut watch::Receiver<u64>,
    first: bool,
) -> Option<Socket> {
    let delay = shared.config.protocol.timeouts.reconnect();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {}
        }
        if shared.stopped() {
            return None;
        }

        let options = shared.options.lock().clone()?;
        let result = match shared.dial(&options).await {
            Ok(stream) if shared.stopped() => {
                drop(stream);
                return None;
            }
            Ok(stream) => attach(shared, stream, &options, first).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(socket) => return Some(socket),
            Err(e) => {
                debug!("Reconnect failed: {}", e);
                shared.emit(ClientEvent::ConnectionFailed {
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Owns the write half of a socket.
struct SocketWriter {
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    shared: Arc<Shared>,
    private_key: String,
}

impl SocketWriter {
    fn encode(&self, item: Outgoing) -> Result<Bytes, ProtocolError> {
        match item {
            Outgoing::Auth(frame) => self.shared.encoder.encode(&frame),
            Outgoing::Frame(mut frame) => {
                if frame.headers.encrypted {
                    frame.body = self.shared.envelope.encrypt_json(
                        &self.private_key,
                        &frame.body,
                        Some(&frame.headers.id),
                    )?;
                }
                self.shared.encoder.encode(&frame)
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), WireError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| WireError::new(ErrorCode::ClientConnection))?;
        writer.write_all(bytes).await.map_err(|e| {
            WireError::new(ErrorCode::ClientSend).with_detail("cause", e.to_string())
        })
    }
}

#[async_trait]
impl Processor<Outgoing> for SocketWriter {
    async fn process(&mut self, item: Outgoing) {
        let (id, is_request) = match &item {
            Outgoing::Auth(_) => (None, false),
            Outgoing::Frame(frame) => (Some(frame.headers.id.clone()), frame.is_request()),
        };

        let result = match self.encode(item) {
            Ok(bytes) => self.write(&bytes).await,
            Err(e) => Err(e.into()),
        };

        if let Err(error) = result {
            warn!(
                "Send failed (id={}): {}",
                id.as_deref().unwrap_or("auth"),
                error
            );
            if let (Some(id), true) = (&id, is_request) {
                self.shared.registry.cancel(id, error.clone());
            }
            self.shared.emit(ClientEvent::SendError { id, error });
        }
    }
}

/// Handles inbound frames in arrival order.
struct Inbound {
    shared: Arc<Shared>,
    outbound: DeliveryQueue<Outgoing>,
    private_key: String,
    closer: Arc<Notify>,
}

impl Inbound {
    async fn receive(&self, value: Value) -> Result<(), WireError> {
        let session = self.shared.session.lock().clone();
        if !session.authenticated {
            return self.authenticate(value);
        }

        let mut frame = parse_frame(value, CLIENT_REQUIRED_HEADERS)?;
        if session.channel.as_deref() != Some(frame.headers.to.as_str()) {
            return Err(WireError::new(ErrorCode::MessageChannel)
                .with_detail("to", frame.headers.to.clone()));
        }
        if !session.groups.admits(&frame.headers.groups) {
            return Err(WireError::new(ErrorCode::MessageGroup)
                .with_detail("from", frame.headers.from.clone()));
        }
        if frame.headers.encrypted {
            frame.body = self
                .shared
                .envelope
                .decrypt_json(&self.private_key, &frame.body)?;
        }

        match frame.headers.kind {
            MessageType::Reply => self
                .shared
                .registry
                .dispatch(&frame.headers.id, frame.headers.status, frame.body)
                .map_err(|code| WireError::new(code).with_detail("id", frame.headers.id.clone())),
            MessageType::Message => {
                self.dispatch(Incoming {
                    frame,
                    responder: None,
                });
                Ok(())
            }
            MessageType::Request => {
                let responder = Responder::new(&frame, self.outbound.clone());
                self.dispatch(Incoming {
                    frame,
                    responder: Some(responder),
                });
                Ok(())
            }
        }
    }

    /// Applies the server's answer to our credentials.
    fn authenticate(&self, value: Value) -> Result<(), WireError> {
        if !AuthReply::matches(&value) {
            return Err(WireError::new(ErrorCode::MessageAuth));
        }

        match serde_json::from_value::<AuthReply>(value.clone()) {
            Ok(AuthReply {
                auth: true,
                channel: Some(channel),
                groups: Some(groups),
            }) => {
                {
                    let mut session = self.shared.session.lock();
                    session.authenticated = true;
                    session.channel = Some(channel.clone());
                    session.groups = groups.clone();
                }
                info!("Authenticated (channel={})", channel);
                self.shared.emit(ClientEvent::Ready { channel, groups });
            }
            _ => {
                warn!("Authentication rejected by server");
                self.shared.session.lock().active_connection = false;
                self.shared.emit(ClientEvent::AuthFailed { reply: value });
                self.closer.notify_one();
            }
        }
        Ok(())
    }

    /// Hands a message or request to its handler on a task of its own.
    fn dispatch(&self, incoming: Incoming) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let handle = incoming.handle().to_string();
            if let Outcome::Declined(mut incoming) = shared.handlers.dispatch(incoming).await {
                let error =
                    WireError::new(ErrorCode::MessageNotHandled).with_detail("handle", handle);
                if let Some(responder) = incoming.take_responder() {
                    let _ = responder.error(error.clone()).await;
                }
                debug!("Unhandled frame: {}", error);
                shared.emit(ClientEvent::ReceiveError { error });
            }
        });
    }
}

#[async_trait]
impl Processor<Value> for Inbound {
    async fn process(&mut self, value: Value) {
        if let Err(error) = self.receive(value).await {
            debug!("Dropping inbound frame: {}", error);
            self.shared.emit(ClientEvent::ReceiveError { error });
        }
    }
}
