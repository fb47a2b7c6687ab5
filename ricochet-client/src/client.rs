//! High-level client API.

use crate::config::{ClientConfig, ConnectOptions, SendOptions};
use crate::connection::{attach, supervise, Outgoing, Shared};
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::handler::Handler;
use crate::registry::generate_id;
use crate::reply::PendingReply;
use crate::session::SessionState;
use parking_lot::Mutex;
use ricochet_protocol::{DeliveryQueue, Frame, Headers, MessageType};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// High-level client for a ricochet server.
pub struct Client {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            supervisor: Mutex::new(None),
        }
    }

    /// Connects to the server and sends our credentials.
    ///
    /// Returns once the socket is open; authentication completes in the
    /// background (see [`wait_ready`](Self::wait_ready)). A failure to open
    /// the first socket is returned as is, unless
    /// [`ClientConfig::retry_initial_connect`] is set, in which case it is
    /// retried like any later drop. Once connected, every drop is followed
    /// by reconnect attempts until [`close`](Self::close).
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), ClientError> {
        self.shared.config.validate()?;
        options.validate()?;
        if self.shared.attached.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        *self.shared.options.lock() = Some(options.clone());
        self.shared.session.lock().active_connection = true;
        let stop = self.shared.stop.subscribe();

        let result = match self.shared.dial(&options).await {
            Ok(stream) => attach(&self.shared, stream, &options, true).await,
            Err(e) => Err(e),
        };
        let socket = match result {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::debug!("Connection failed: {}", e);
                self.shared.session.lock().reset();
                *self.shared.link.lock() = None;
                self.shared.emit(ClientEvent::ConnectionFailed {
                    error: e.to_string(),
                });
                if !self.shared.config.retry_initial_connect {
                    self.shared.attached.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                None
            }
        };

        let task = tokio::spawn(supervise(self.shared.clone(), socket, stop));
        *self.supervisor.lock() = Some(task);
        Ok(())
    }

    /// Waits until the server accepts our credentials.
    ///
    /// Fails with `NotConnected` once no connection is being maintained.
    pub async fn wait_ready(&self) -> Result<SessionState, ClientError> {
        let mut events = self.subscribe();
        loop {
            let status = self.status();
            if status.authenticated {
                return Ok(status);
            }
            if !self.shared.attached.load(Ordering::SeqCst) {
                return Err(ClientError::NotConnected);
            }
            match events.recv().await {
                Ok(ClientEvent::Ready { .. }) => continue,
                Ok(ClientEvent::AuthFailed { .. }) => return Err(ClientError::AuthFailed),
                Ok(ClientEvent::Closed) => return Err(ClientError::ConnectionClosed),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ClientError::ConnectionClosed)
                }
            }
        }
    }

    /// Closes the connection and stops reconnecting.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.shared.request_stop();
        let task = self.supervisor.lock().take();
        match task {
            Some(task) => {
                let _ = task.await;
                Ok(())
            }
            None => Err(ClientError::NotConnected),
        }
    }

    /// Subscribes to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Returns a snapshot of the session state.
    pub fn status(&self) -> SessionState {
        self.shared.session.lock().clone()
    }

    /// Returns whether a socket is open.
    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().connected
    }

    /// Returns the number of requests awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.shared.registry.len()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Sends a fire-and-forget message.
    pub async fn message(&self, to: &str, handle: &str, body: Value) -> Result<(), ClientError> {
        self.message_with(to, handle, body, SendOptions::default())
            .await
    }

    pub async fn message_with(
        &self,
        to: &str,
        handle: &str,
        body: Value,
        options: SendOptions,
    ) -> Result<(), ClientError> {
        let outbound = self.outbound()?;
        let headers = headers(generate_id(), MessageType::Message, to, handle, &options);
        outbound
            .push(Outgoing::Frame(Frame::new(headers, body)))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Sends a request with the configured default timeout.
    pub async fn request(
        &self,
        to: &str,
        handle: &str,
        body: Value,
    ) -> Result<PendingReply, ClientError> {
        self.request_with(to, handle, body, SendOptions::default())
            .await
    }

    pub async fn request_with(
        &self,
        to: &str,
        handle: &str,
        body: Value,
        options: SendOptions,
    ) -> Result<PendingReply, ClientError> {
        let outbound = self.outbound()?;
        let deadline = options.deadline(&self.shared.config.protocol);
        let reply = self.shared.registry.register(deadline);

        let mut headers = headers(
            reply.id().to_string(),
            MessageType::Request,
            to,
            handle,
            &options,
        );
        headers.timeout = deadline.map(|d| d.as_millis() as u64);

        tracing::debug!("Sending request id={} to {}/{}", reply.id(), to, handle);
        if outbound
            .push(Outgoing::Frame(Frame::new(headers, body)))
            .await
            .is_err()
        {
            self.shared.registry.remove(reply.id());
            return Err(ClientError::ConnectionClosed);
        }
        Ok(reply)
    }

    fn outbound(&self) -> Result<DeliveryQueue<Outgoing>, ClientError> {
        {
            let session = self.shared.session.lock();
            if !session.connected {
                return Err(ClientError::NotConnected);
            }
            if !session.authenticated {
                return Err(ClientError::NotAuthenticated);
            }
        }
        self.shared.outbound().ok_or(ClientError::NotConnected)
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Registers the handler for `name`, replacing any previous one.
    pub fn handle<H: Handler + 'static>(&self, name: impl Into<String>, handler: H) -> bool {
        self.shared.handlers.insert(name.into(), Arc::new(handler))
    }

    /// Sets the handler for frames no named handler took.
    pub fn fallback<H: Handler + 'static>(&self, handler: H) {
        self.shared.handlers.set_fallback(Some(Arc::new(handler)));
    }

    pub fn remove_handle(&self, name: &str) -> bool {
        self.shared.handlers.remove(name)
    }

    /// Removes every handler, the fallback included.
    pub fn flush_handles(&self) {
        self.shared.handlers.clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

fn headers(
    id: String,
    kind: MessageType,
    to: &str,
    handle: &str,
    options: &SendOptions,
) -> Headers {
    let mut headers = Headers::new(id, kind);
    headers.to = to.to_string();
    headers.handle = handle.to_string();
    headers.encrypted = options.encrypted;
    headers
}
