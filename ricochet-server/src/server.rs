//! TCP server implementation.

use crate::auth::Authenticator;
use crate::config::ConfigError;
use crate::connection::{serve, ConnectionStats, Shared};
use crate::error::ServerError;
use crate::events::{ServerEvent, DEFAULT_EVENT_CAPACITY};
use crate::identity::IdentityLookup;
use crate::router::{Router, UnroutedHandler};
use parking_lot::Mutex;
use ricochet_protocol::ProtocolConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Wire protocol settings.
    pub protocol: ProtocolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], ricochet_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub messages_routed: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Routing server.
pub struct Server {
    config: ServerConfig,
    lookup: Option<Arc<dyn IdentityLookup>>,
    unrouted: Option<Arc<dyn UnroutedHandler>>,
    router: Arc<Router>,
    stats: Arc<ServerStats>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: broadcast::Sender<()>,
    listening: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a new server. An identity lookup must be set before
    /// [`listen`](Self::listen).
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (events_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            config,
            lookup: None,
            unrouted: None,
            router: Arc::new(Router::new()),
            stats: Arc::new(ServerStats::default()),
            events: events_tx,
            shutdown: shutdown_tx,
            listening: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Sets the collaborator that resolves credential frames.
    pub fn with_identity_lookup(mut self, lookup: Arc<dyn IdentityLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Sets the collaborator for frames addressed to unbound channels.
    pub fn with_unrouted_handler(mut self, handler: Arc<dyn UnroutedHandler>) -> Self {
        self.unrouted = Some(handler);
        self
    }

    /// Subscribes to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address. A server listens at most once.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let lookup = self.lookup.clone().ok_or(ServerError::NoCallback)?;
        self.config
            .protocol
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::InUse);
        }

        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;

        let protocol = self.config.protocol.clone();
        let shared = Arc::new(Shared {
            encoder: protocol.encoder(),
            envelope: protocol.envelope(),
            authenticator: Authenticator::new(lookup, &protocol),
            unrouted: self.unrouted.clone(),
            router: self.router.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            protocol,
        });

        let shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(
            listener,
            shared,
            self.config.max_connections,
            self.shutdown.clone(),
            shutdown_rx,
        ));
        *self.accept_task.lock() = Some(task);
        *self.local_addr.lock() = Some(addr);

        tracing::info!("Server listening on {}", addr);
        Ok(addr)
    }

    /// Listens and serves until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        self.listen().await?;
        let _ = shutdown_rx.recv().await;

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Stops accepting and drops every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the frame counters of the connection bound to `channel`.
    pub fn connection_stats(&self, channel: &str) -> Option<ConnectionStats> {
        self.router.resolve(channel).map(|conn| conn.stats())
    }

    /// Returns the number of live connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.router.connection_count()
    }

    /// Returns the channels currently bound.
    pub fn channels(&self) -> Vec<String> {
        self.router
            .connections()
            .iter()
            .filter_map(|conn| conn.channel())
            .collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    max_connections: usize,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let stats = shared.stats.clone();
                        if stats.connections_active.load(Ordering::Relaxed) >= max_connections as u64 {
                            tracing::warn!("Connection limit reached, rejecting {}", addr);
                            continue;
                        }

                        stats.connections_total.fetch_add(1, Ordering::Relaxed);
                        stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let shared = shared.clone();
                        let conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            serve(stream, addr, shared, conn_shutdown).await;
                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Server shutting down");
                break;
            }
        }
    }
}
