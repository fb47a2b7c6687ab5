//! # ricochet-server
//!
//! Routing server for ricochet.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Credential validation against a pluggable identity lookup
//! - Channel binding with uniqueness enforcement
//! - Group-authorized routing with an optional unrouted fallback
//! - Authentication deadlines and per-connection statistics
//! - Layered YAML/environment configuration

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod router;
pub mod server;

pub use auth::{Authenticator, Identity};
pub use config::{Config, ConfigError, NetworkConfig};
pub use connection::{Connection, ConnectionStats};
pub use error::ServerError;
pub use events::ServerEvent;
pub use identity::{IdentityLookup, IdentityRecord, LookupError, StaticIdentities};
pub use router::{Route, Router, UnroutedHandler};
pub use server::{Server, ServerConfig, ServerStats};
