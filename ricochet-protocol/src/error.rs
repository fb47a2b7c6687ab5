//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing, validation or
/// envelope handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes buffered without delimiter (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("decrypt failed: {0}")]
    Decrypt(&'static str),

    #[error("encrypt failed")]
    Encrypt,

    #[error("invalid protocol config: {0}")]
    InvalidConfig(&'static str),
}

impl ProtocolError {
    /// Returns whether the error poisons the byte stream it came from.
    ///
    /// Everything except an oversized frame is isolated to one segment.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::Io(_)
                | ProtocolError::InvalidConfig(_)
        )
    }

    /// Maps the error onto the stable code reported to peers.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Json(_) | ProtocolError::InvalidUtf8 | ProtocolError::NotAnObject => {
                ErrorCode::MessageBadJson
            }
            ProtocolError::FrameTooLarge { .. }
            | ProtocolError::MissingFields(_)
            | ProtocolError::InvalidConfig(_) => ErrorCode::MessageMalformed,
            ProtocolError::Decrypt(_) | ProtocolError::Encrypt => ErrorCode::MessageDecrypt,
            ProtocolError::Io(_) => ErrorCode::ClientSend,
        }
    }
}

/// Stable error codes.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client-side send errors
    ClientConnection,
    ClientAuth,
    ClientSend,
    ClientConnected,

    // Frame errors
    #[serde(rename = "message_badjson")]
    MessageBadJson,
    MessageMalformed,
    MessageAuth,
    MessageChannel,
    MessageGroup,
    MessageDecrypt,
    #[serde(rename = "message_notfound")]
    MessageNotFound,
    MessageTimeout,
    #[serde(rename = "message_nothandled")]
    MessageNotHandled,
    MessageSelf,
    #[serde(rename = "message_norecipient")]
    MessageNoRecipient,
    #[serde(rename = "message_noclient")]
    MessageNoClient,

    // Handshake errors
    AuthMalformed,
    AuthFailure,
    AuthLookup,
    #[serde(rename = "auth_nogroups")]
    AuthNoGroups,
    AuthIp,
    #[serde(rename = "auth_authkey")]
    AuthAuthKey,
    #[serde(rename = "auth_expiredkey")]
    AuthExpiredKey,
    AuthChannel,
    AuthTimeout,

    // Setup errors
    #[serde(rename = "server_nocallback")]
    ServerNoCallback,
    #[serde(rename = "server_inuse")]
    ServerInUse,
}

impl ErrorCode {
    /// Returns the stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ClientConnection => "client_connection",
            ErrorCode::ClientAuth => "client_auth",
            ErrorCode::ClientSend => "client_send",
            ErrorCode::ClientConnected => "client_connected",
            ErrorCode::MessageBadJson => "message_badjson",
            ErrorCode::MessageMalformed => "message_malformed",
            ErrorCode::MessageAuth => "message_auth",
            ErrorCode::MessageChannel => "message_channel",
            ErrorCode::MessageGroup => "message_group",
            ErrorCode::MessageDecrypt => "message_decrypt",
            ErrorCode::MessageNotFound => "message_notfound",
            ErrorCode::MessageTimeout => "message_timeout",
            ErrorCode::MessageNotHandled => "message_nothandled",
            ErrorCode::MessageSelf => "message_self",
            ErrorCode::MessageNoRecipient => "message_norecipient",
            ErrorCode::MessageNoClient => "message_noclient",
            ErrorCode::AuthMalformed => "auth_malformed",
            ErrorCode::AuthFailure => "auth_failure",
            ErrorCode::AuthLookup => "auth_lookup",
            ErrorCode::AuthNoGroups => "auth_nogroups",
            ErrorCode::AuthIp => "auth_ip",
            ErrorCode::AuthAuthKey => "auth_authkey",
            ErrorCode::AuthExpiredKey => "auth_expiredkey",
            ErrorCode::AuthChannel => "auth_channel",
            ErrorCode::AuthTimeout => "auth_timeout",
            ErrorCode::ServerNoCallback => "server_nocallback",
            ErrorCode::ServerInUse => "server_inuse",
        }
    }

    /// Human-readable message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ClientConnection => "No live connection to the server",
            ErrorCode::ClientAuth => "Connection is not authenticated",
            ErrorCode::ClientSend => "Failed to write to the socket",
            ErrorCode::ClientConnected => "Client is already connected",
            ErrorCode::MessageBadJson => "Unable to parse frame JSON",
            ErrorCode::MessageMalformed => "Frame is missing required fields",
            ErrorCode::MessageAuth => "Frame received before authentication",
            ErrorCode::MessageChannel => "Frame addressed to a different channel",
            ErrorCode::MessageGroup => "Sender and recipient share no group",
            ErrorCode::MessageDecrypt => "Unable to decrypt frame body",
            ErrorCode::MessageNotFound => "No pending request matches the reply id",
            ErrorCode::MessageTimeout => "Request timed out",
            ErrorCode::MessageNotHandled => "No handler accepted the frame",
            ErrorCode::MessageSelf => "Frame is addressed to its own channel",
            ErrorCode::MessageNoRecipient => "No connection is bound to the target channel",
            ErrorCode::MessageNoClient => "Connection no longer exists",
            ErrorCode::AuthMalformed => "Credential frame is malformed",
            ErrorCode::AuthFailure => "Identity lookup failed",
            ErrorCode::AuthLookup => "Identity lookup returned an incomplete record",
            ErrorCode::AuthNoGroups => "Identity has no groups",
            ErrorCode::AuthIp => "Connection address does not match the identity",
            ErrorCode::AuthAuthKey => "Auth key does not match",
            ErrorCode::AuthExpiredKey => "Auth stamp is outside the accepted window",
            ErrorCode::AuthChannel => "Channel is already bound to another connection",
            ErrorCode::AuthTimeout => "Authentication did not complete in time",
            ErrorCode::ServerNoCallback => "No identity lookup configured",
            ErrorCode::ServerInUse => "Server is already listening",
        }
    }

    /// Returns whether the code belongs to the handshake stage.
    pub fn is_auth(&self) -> bool {
        self.as_str().starts_with("auth_")
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error report exchanged on the wire and fanned out through events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {error}")]
pub struct WireError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub error: String,

    /// Free-form diagnostic context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl WireError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            error: code.message().to_string(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Body of an error reply: `{error, code}`.
    pub fn to_body(&self) -> Value {
        serde_json::json!({
            "error": self.error,
            "code": self.code,
        })
    }
}

impl From<ErrorCode> for WireError {
    fn from(code: ErrorCode) -> Self {
        WireError::new(code)
    }
}

impl From<ProtocolError> for WireError {
    fn from(err: ProtocolError) -> Self {
        let wire = WireError::new(err.code());
        match err {
            ProtocolError::MissingFields(fields) => wire.with_detail("missing", fields),
            other => wire.with_detail("cause", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::MessageGroup).unwrap();
        assert_eq!(json, "\"message_group\"");

        let parsed: ErrorCode = serde_json::from_str("\"auth_expiredkey\"").unwrap();
        assert_eq!(parsed, ErrorCode::AuthExpiredKey);
    }

    #[test]
    fn test_serialized_form_matches_as_str() {
        for code in [
            ErrorCode::MessageBadJson,
            ErrorCode::MessageNotFound,
            ErrorCode::MessageNoRecipient,
            ErrorCode::AuthAuthKey,
            ErrorCode::ServerInUse,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, serde_json::Value::from(code.as_str()));
        }
    }

    #[test]
    fn test_display_matches_as_str() {
        for code in [
            ErrorCode::ClientConnection,
            ErrorCode::MessageBadJson,
            ErrorCode::MessageNotHandled,
            ErrorCode::AuthTimeout,
            ErrorCode::ServerInUse,
        ] {
            assert_eq!(code.to_string(), code.as_str());
            assert!(!code.message().is_empty());
        }
    }

    #[test]
    fn test_is_auth() {
        assert!(ErrorCode::AuthChannel.is_auth());
        assert!(ErrorCode::AuthTimeout.is_auth());
        assert!(!ErrorCode::MessageAuth.is_auth());
        assert!(!ErrorCode::ClientAuth.is_auth());
    }

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(
            ProtocolError::MissingFields(vec!["to".into()]).code(),
            ErrorCode::MessageMalformed
        );
        assert_eq!(ProtocolError::InvalidUtf8.code(), ErrorCode::MessageBadJson);
        assert_eq!(
            ProtocolError::Decrypt("tag").code(),
            ErrorCode::MessageDecrypt
        );
        assert!(ProtocolError::FrameTooLarge { size: 10, max: 5 }.is_fatal());
        assert!(!ProtocolError::InvalidUtf8.is_fatal());
    }

    #[test]
    fn test_missing_fields_display() {
        let err = ProtocolError::MissingFields(vec!["id".into(), "type".into()]);
        assert_eq!(err.to_string(), "missing required fields: id, type");
    }

    #[test]
    fn test_wire_error_body() {
        let err = WireError::new(ErrorCode::MessageSelf).with_detail("to", "alpha");
        let body = err.to_body();
        assert_eq!(body["code"], "message_self");
        assert_eq!(body["error"], ErrorCode::MessageSelf.message());
        assert!(body.get("details").is_none());
    }

    #[test]
    fn test_wire_error_from_protocol_error() {
        let wire: WireError = ProtocolError::MissingFields(vec!["handle".into()]).into();
        assert_eq!(wire.code, ErrorCode::MessageMalformed);
        assert_eq!(wire.details["missing"], serde_json::json!(["handle"]));
    }
}
