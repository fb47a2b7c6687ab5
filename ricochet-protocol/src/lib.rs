//! # ricochet-protocol
//!
//! Protocol engine shared by the ricochet client and server.
//!
//! This crate provides:
//! - Delimiter-terminated JSON framing with partial-read buffering
//! - Frame, header and credential types with boundary validation
//! - The symmetric crypto envelope for bodies and credentials
//! - Stable error codes and the wire error report
//! - Bounded sequential delivery queues
//! - Shared protocol configuration

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod queue;

pub use codec::{Decoder, Encoder};
pub use config::{CipherKind, ProtocolConfig, TimeoutConfig};
pub use crypto::Envelope;
pub use error::{ErrorCode, ProtocolError, WireError};
pub use frame::{
    parse_auth_frame, parse_frame, AuthFrame, AuthReply, Frame, Groups, Headers, MessageType,
    ReplyStatus,
};
pub use queue::{DeliveryQueue, Processor, QueueClosed, QueueSlot};

/// Default port for a ricochet server.
pub const DEFAULT_PORT: u16 = 23225;

/// Default frame delimiter. Compact JSON never contains a raw CR or LF.
pub const DEFAULT_DELIMITER: &str = "\r\n\r\n";

/// Default separator between plaintext and nonce marker inside the envelope.
pub const DEFAULT_ENCRYPTION_SEPARATOR: &str = "\u{1f}\u{1f}\u{1f}";

/// Marker appended after the separator when no per-message nonce is given.
pub const DEFAULT_NONCE_MARKER: &str = "\n\n\n\n\n\n\n\n\n\n\n\n\n\n\n\n";

/// Maximum buffered bytes for a single frame (16 MiB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
