//! Protocol configuration shared by client and server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Symmetric cipher used by the crypto envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 with a 96-bit random nonce.
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 with a 192-bit random nonce.
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

/// Protocol timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default request timeout when the caller does not set one.
    pub message_ms: u64,
    /// Slack added to a request timeout before the local timer fires.
    pub latency_buffer_ms: u64,
    /// Delay before a client reconnects after an unexpected close.
    pub reconnect_ms: u64,
    /// Time a server connection has to authenticate.
    pub auth_ms: u64,
    /// Maximum age of an auth stamp.
    pub auth_stamp_window_ms: u64,
    /// How far in the future an auth stamp may be.
    pub clock_skew_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            message_ms: 30_000,
            latency_buffer_ms: 500,
            reconnect_ms: 2_000,
            auth_ms: 5_000,
            auth_stamp_window_ms: 60_000,
            clock_skew_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn message(&self) -> Duration {
        Duration::from_millis(self.message_ms)
    }

    pub fn latency_buffer(&self) -> Duration {
        Duration::from_millis(self.latency_buffer_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    pub fn auth(&self) -> Duration {
        Duration::from_millis(self.auth_ms)
    }
}

/// Settings both ends of a connection must agree on, plus queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Frame delimiter appended after every encoded frame.
    pub delimiter: String,
    /// Separator between plaintext and nonce marker inside the envelope.
    pub encryption_separator: String,
    /// Envelope cipher.
    pub cipher: CipherKind,
    /// Items a delivery queue holds before `push` waits.
    pub queue_size: usize,
    /// Largest frame the decoder buffers before giving up on the stream.
    pub max_frame_bytes: usize,
    /// Protocol timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            delimiter: crate::DEFAULT_DELIMITER.to_string(),
            encryption_separator: crate::DEFAULT_ENCRYPTION_SEPARATOR.to_string(),
            cipher: CipherKind::default(),
            queue_size: 4,
            max_frame_bytes: crate::MAX_FRAME_BYTES,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Checks settings the codec and envelope cannot work without.
    pub fn validate(&self) -> Result<(), crate::ProtocolError> {
        if self.delimiter.is_empty() {
            return Err(crate::ProtocolError::InvalidConfig("delimiter must not be empty"));
        }
        if self.encryption_separator.is_empty() {
            return Err(crate::ProtocolError::InvalidConfig(
                "encryption_separator must not be empty",
            ));
        }
        if self.queue_size == 0 {
            return Err(crate::ProtocolError::InvalidConfig("queue_size must be at least 1"));
        }
        Ok(())
    }

    /// Builds the frame encoder for this configuration.
    pub fn encoder(&self) -> crate::Encoder {
        crate::Encoder::new(&self.delimiter)
    }

    /// Builds a fresh frame decoder for this configuration.
    pub fn decoder(&self) -> crate::Decoder {
        crate::Decoder::new(&self.delimiter).with_max_frame_bytes(self.max_frame_bytes)
    }

    /// Builds the crypto envelope for this configuration.
    pub fn envelope(&self) -> crate::Envelope {
        crate::Envelope::new(self.cipher, &self.encryption_separator)
    }
}
