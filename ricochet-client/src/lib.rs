//! # ricochet-client
//!
//! Client library for ricochet.
//!
//! This crate provides:
//! - Async TCP client with the credential handshake
//! - Messages, and requests correlated with their replies
//! - Per-handle handlers with a fallback and reply-capable responders
//! - Automatic reconnection after an established session drops

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod registry;
pub mod reply;
pub mod session;

pub use client::Client;
pub use config::{ClientConfig, ConnectOptions, RequestTimeout, SendOptions};
pub use error::ClientError;
pub use events::ClientEvent;
pub use handler::{handler_fn, Handler, HandlerFn, Incoming, Outcome};
pub use reply::{PendingReply, RequestEvent, Responder};
pub use session::SessionState;
