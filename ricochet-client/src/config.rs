//! Client configuration, connect options and per-send options.

use crate::error::ClientError;
use ricochet_protocol::{ProtocolConfig, DEFAULT_PORT};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wire protocol settings. Must match the server.
    pub protocol: ProtocolConfig,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Keep retrying when the first connect fails instead of returning the
    /// error.
    pub retry_initial_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            connect_timeout: Duration::from_secs(10),
            retry_initial_connect: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_initial_connect(mut self, retry: bool) -> Self {
        self.retry_initial_connect = retry;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        self.protocol.validate()?;
        Ok(())
    }
}

/// Where to connect and which credentials to present.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub public_key: String,
    pub private_key: String,
    pub auth_key: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            public_key: String::new(),
            private_key: String::new(),
            auth_key: String::new(),
        }
    }
}

impl ConnectOptions {
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth_key(mut self, auth_key: impl Into<String>) -> Self {
        self.auth_key = auth_key.into();
        self
    }

    /// `host:port` form accepted by the resolver.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        let mut missing = Vec::new();
        if self.public_key.is_empty() {
            missing.push("public_key");
        }
        if self.private_key.is_empty() {
            missing.push("private_key");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ClientError::InvalidOptions(format!(
                "'{}' required",
                missing.join("', '")
            )))
        }
    }
}

/// How long a request waits for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestTimeout {
    /// Use the configured message timeout.
    #[default]
    Default,
    /// Wait this long, plus the configured latency buffer.
    After(Duration),
    /// Wait until a terminal reply or disconnect.
    Never,
}

/// Options for a single message or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    /// Seal the body under the connection key.
    pub encrypted: bool,
    /// Reply deadline. Ignored for plain messages.
    pub timeout: RequestTimeout,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = RequestTimeout::After(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = RequestTimeout::Never;
        self
    }

    /// Resolves the request deadline against the configured default.
    pub(crate) fn deadline(&self, protocol: &ProtocolConfig) -> Option<Duration> {
        match self.timeout {
            RequestTimeout::Default => Some(protocol.timeouts.message()),
            RequestTimeout::After(timeout) => Some(timeout),
            RequestTimeout::Never => None,
        }
    }
}
