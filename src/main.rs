//! ricochet - Channel-routed TCP messaging
//!
//! Runs a routing server that authenticates clients against a static identity
//! table and forwards frames between their channels.

use ricochet_server::{Config, Server, ServerEvent, StaticIdentities};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RICOCHET_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("RICOCHET_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("RICOCHET_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting ricochet server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!("  Queue size: {}", config.protocol.queue_size);
    tracing::info!("  Auth timeout: {}ms", config.protocol.timeouts.auth_ms);
    if config.identities.is_empty() {
        tracing::warn!("  Identities: none configured, every client will be rejected");
    } else {
        tracing::info!("  Identities: {}", config.identities.len());
    }

    let lookup = Arc::new(StaticIdentities::new(config.identities.clone()));
    let server = Arc::new(Server::new(config.server_config()).with_identity_lookup(lookup));

    // Log lifecycle events
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::ClientAuthFailed { id, error }) => {
                    tracing::warn!("Authentication failed (id={}): {}", id, error.code);
                }
                Ok(ServerEvent::MessageError { id, error }) => {
                    tracing::debug!("Frame error (id={}): {}", id, error.code);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
