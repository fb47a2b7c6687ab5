//! Frame types exchanged on a ricochet connection.
//!
//! Two shapes travel on the wire. Before authentication the client sends a
//! bare credential record and the server answers with an [`AuthReply`].
//! Afterwards every frame is a [`Frame`]:
//!
//! ```text
//! {
//!   "headers": {"id", "to", "from", "type", "handle", "encrypted",
//!               "groups", "timeout"?, "status"?},
//!   "body": <json | hex ciphertext>
//! }
//! ```

use crate::crypto::Envelope;
use crate::error::ProtocolError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Header fields the server requires on an inbound frame.
pub const SERVER_REQUIRED_HEADERS: &[&str] = &["id", "type", "handle", "to"];

/// Header fields a client requires on an inbound frame.
pub const CLIENT_REQUIRED_HEADERS: &[&str] = &["to", "from", "id", "type"];

/// Fields of a credential frame.
pub const AUTH_REQUIRED_FIELDS: &[&str] = &["publicKey", "authKey", "authStamp"];

/// Frame pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Fire-and-forget.
    Message,
    /// Expects one or more replies with the same id.
    Request,
    /// Answers a request.
    Reply,
}

/// Status carried by a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Response,
    Update,
    Error,
    Timeout,
}

impl ReplyStatus {
    /// Returns whether a reply with this status ends the request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyStatus::Update)
    }
}

/// Authorization groups of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Groups {
    /// Member of every group.
    All,
    /// Member of the listed groups.
    Named(Vec<String>),
}

impl Default for Groups {
    fn default() -> Self {
        Groups::Named(Vec::new())
    }
}

impl Groups {
    pub fn named<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Groups::Named(groups.into_iter().map(Into::into).collect())
    }

    /// Returns whether the set grants nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Groups::Named(groups) if groups.is_empty())
    }

    /// Returns whether a frame from `sender` may be delivered to a holder of
    /// these groups.
    ///
    /// A holder of `All` admits every sender, and a sender holding `All`
    /// reaches any holder with at least one named group.
    pub fn admits(&self, sender: &Groups) -> bool {
        match (self, sender) {
            (Groups::All, _) => true,
            (Groups::Named(mine), Groups::All) => !mine.is_empty(),
            (Groups::Named(mine), Groups::Named(theirs)) => {
                mine.iter().any(|group| theirs.contains(group))
            }
        }
    }
}

impl Serialize for Groups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Groups::All => serializer.serialize_str("all"),
            Groups::Named(groups) => groups.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Groups {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Literal(String),
            List(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Groups::All),
            Raw::Flag(false) => Ok(Groups::default()),
            Raw::Literal(s) if s == "all" => Ok(Groups::All),
            Raw::Literal(s) => Err(serde::de::Error::custom(format!(
                "invalid groups literal '{}'",
                s
            ))),
            Raw::List(groups) => Ok(Groups::Named(groups)),
        }
    }
}

/// Frame headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Correlation id.
    pub id: String,

    /// Target channel.
    #[serde(default)]
    pub to: String,

    /// Sender channel, stamped by the server.
    #[serde(default)]
    pub from: String,

    /// Frame pattern.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Endpoint name within the target channel.
    #[serde(default)]
    pub handle: String,

    /// Whether `body` is sealed.
    #[serde(default)]
    pub encrypted: bool,

    /// Sender groups, stamped by the server.
    #[serde(default)]
    pub groups: Groups,

    /// Request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Reply status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReplyStatus>,
}

impl Headers {
    pub fn new(id: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: id.into(),
            to: String::new(),
            from: String::new(),
            kind,
            handle: String::new(),
            encrypted: false,
            groups: Groups::default(),
            timeout: None,
            status: None,
        }
    }
}

/// A routed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub headers: Headers,
    #[serde(default)]
    pub body: Value,
}

impl Frame {
    pub fn new(headers: Headers, body: Value) -> Self {
        Self { headers, body }
    }

    /// Builds the reply to this frame with `from`/`to` swapped.
    pub fn reply(&self, status: ReplyStatus, body: Value) -> Frame {
        let mut headers = Headers::new(self.headers.id.clone(), MessageType::Reply);
        headers.to = self.headers.from.clone();
        headers.from = self.headers.to.clone();
        headers.handle = self.headers.handle.clone();
        headers.encrypted = self.headers.encrypted;
        headers.status = Some(status);
        Frame::new(headers, body)
    }

    pub fn is_request(&self) -> bool {
        self.headers.kind == MessageType::Request
    }
}

/// Credential frame sent by a client right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub public_key: String,
    pub auth_key: String,
    pub auth_stamp: String,
}

impl AuthFrame {
    /// Builds a credential frame stamped at `now_ms`.
    ///
    /// The stamp is sealed under `private_key`; the auth key is sealed under
    /// the same key with the sealed stamp as its nonce marker.
    pub fn seal(
        envelope: &Envelope,
        public_key: &str,
        private_key: &str,
        auth_key: &str,
        now_ms: i64,
    ) -> Result<Self, ProtocolError> {
        let auth_stamp = envelope.encrypt(private_key, &now_ms.to_string(), None)?;
        let auth_key = envelope.encrypt(private_key, auth_key, Some(&auth_stamp))?;
        Ok(Self {
            public_key: public_key.to_string(),
            auth_key,
            auth_stamp,
        })
    }
}

/// Server answer to a credential frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    pub auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Groups>,
}

impl AuthReply {
    pub fn accepted(channel: impl Into<String>, groups: Groups) -> Self {
        Self {
            auth: true,
            channel: Some(channel.into()),
            groups: Some(groups),
        }
    }

    pub fn rejected() -> Self {
        Self {
            auth: false,
            channel: None,
            groups: None,
        }
    }

    /// Returns whether the value looks like an auth reply.
    pub fn matches(value: &Value) -> bool {
        value.get("auth").map(Value::is_boolean).unwrap_or(false)
    }
}

fn missing_fields(object: &Value, required: &[&str], prefix: &str) -> Vec<String> {
    required
        .iter()
        .filter(|field| object.get(**field).map(Value::is_null).unwrap_or(true))
        .map(|field| format!("{}{}", prefix, field))
        .collect()
}

/// Validates a decoded value against the frame schema and converts it.
///
/// Every missing field is reported at once.
pub fn parse_frame(value: Value, required: &[&str]) -> Result<Frame, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }

    let mut missing = Vec::new();
    if value.get("body").is_none() {
        missing.push("body".to_string());
    }
    match value.get("headers") {
        Some(headers) if headers.is_object() => {
            missing.extend(missing_fields(headers, required, "headers."));
        }
        _ => missing.push("headers".to_string()),
    }
    if !missing.is_empty() {
        return Err(ProtocolError::MissingFields(missing));
    }

    Ok(serde_json::from_value(value)?)
}

/// Validates and converts a credential frame.
pub fn parse_auth_frame(value: Value) -> Result<AuthFrame, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    let missing = missing_fields(&value, AUTH_REQUIRED_FIELDS, "");
    if !missing.is_empty() {
        return Err(ProtocolError::MissingFields(missing));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "headers": {
                "id": "abc",
                "to": "beta",
                "from": "alpha",
                "type": "request",
                "handle": "ping",
                "encrypted": false,
                "groups": ["g1"],
                "timeout": 50
            },
            "body": {"n": 1}
        })
    }

    #[test]
    fn test_parse_frame() {
        let frame = parse_frame(sample(), CLIENT_REQUIRED_HEADERS).unwrap();
        assert_eq!(frame.headers.id, "abc");
        assert_eq!(frame.headers.kind, MessageType::Request);
        assert_eq!(frame.headers.groups, Groups::named(["g1"]));
        assert_eq!(frame.headers.timeout, Some(50));
        assert_eq!(frame.body, json!({"n": 1}));
    }

    #[test]
    fn test_parse_frame_lists_all_missing_fields() {
        let value = json!({"headers": {"id": "x"}, "body": null});
        let err = parse_frame(value, SERVER_REQUIRED_HEADERS).unwrap_err();
        match err {
            ProtocolError::MissingFields(fields) => {
                assert_eq!(
                    fields,
                    vec!["headers.type", "headers.handle", "headers.to"]
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_frame_requires_headers_and_body() {
        let err = parse_frame(json!({"foo": 1}), SERVER_REQUIRED_HEADERS).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingFields(ref f) if f.len() == 2));

        let err = parse_frame(json!([1, 2]), SERVER_REQUIRED_HEADERS).unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject));
    }

    #[test]
    fn test_parse_frame_bad_type() {
        let mut value = sample();
        value["headers"]["type"] = json!("broadcast");
        let err = parse_frame(value, SERVER_REQUIRED_HEADERS).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn test_optional_headers_skipped() {
        let mut headers = Headers::new("id-1", MessageType::Message);
        headers.to = "beta".into();
        let value = serde_json::to_value(Frame::new(headers, json!(null))).unwrap();
        assert!(value["headers"].get("timeout").is_none());
        assert!(value["headers"].get("status").is_none());
        assert_eq!(value["headers"]["type"], "message");
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let frame = parse_frame(sample(), CLIENT_REQUIRED_HEADERS).unwrap();
        let reply = frame.reply(ReplyStatus::Response, json!({"n": 2}));
        assert_eq!(reply.headers.id, "abc");
        assert_eq!(reply.headers.to, "alpha");
        assert_eq!(reply.headers.from, "beta");
        assert_eq!(reply.headers.kind, MessageType::Reply);
        assert_eq!(reply.headers.status, Some(ReplyStatus::Response));
    }

    #[test]
    fn test_groups_serde() {
        assert_eq!(serde_json::to_value(Groups::All).unwrap(), json!("all"));
        assert_eq!(
            serde_json::to_value(Groups::named(["a", "b"])).unwrap(),
            json!(["a", "b"])
        );
        let all: Groups = serde_json::from_value(json!("all")).unwrap();
        assert_eq!(all, Groups::All);
        let legacy: Groups = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(legacy, Groups::All);
        assert!(serde_json::from_value::<Groups>(json!("some")).is_err());
    }

    #[test]
    fn test_groups_admits() {
        let sender = Groups::named(["a", "b"]);
        assert!(!Groups::named(["c", "d"]).admits(&sender));
        assert!(Groups::named(["b", "c"]).admits(&sender));
        assert!(Groups::All.admits(&sender));
        assert!(Groups::All.admits(&Groups::default()));
        assert!(Groups::named(["c"]).admits(&Groups::All));
        assert!(!Groups::default().admits(&Groups::All));
    }

    #[test]
    fn test_reply_status_terminal() {
        assert!(!ReplyStatus::Update.is_terminal());
        assert!(ReplyStatus::Response.is_terminal());
        assert!(ReplyStatus::Error.is_terminal());
        assert!(ReplyStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_auth_frame() {
        let value = json!({"publicKey": "pk", "authKey": "ak", "authStamp": "as"});
        let frame = parse_auth_frame(value).unwrap();
        assert_eq!(frame.public_key, "pk");

        let err = parse_auth_frame(json!({"publicKey": "pk"})).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingFields(ref f) if f.len() == 2));
    }

    #[test]
    fn test_sealed_credentials_open_under_private_key() {
        let envelope = crate::ProtocolConfig::default().envelope();
        let frame = AuthFrame::seal(&envelope, "pub", "priv", "secret", 1_700_000_000_000).unwrap();
        assert_eq!(frame.public_key, "pub");
        assert_eq!(envelope.decrypt("priv", &frame.auth_key).unwrap(), "secret");
        assert_eq!(
            envelope.decrypt("priv", &frame.auth_stamp).unwrap(),
            "1700000000000"
        );
        assert!(envelope.decrypt("other", &frame.auth_key).is_err());

        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("authStamp").is_some());
        assert_eq!(parse_auth_frame(value).unwrap(), frame);
    }

    #[test]
    fn test_auth_reply() {
        let accepted = AuthReply::accepted("alpha", Groups::All);
        let value = serde_json::to_value(&accepted).unwrap();
        assert_eq!(value, json!({"auth": true, "channel": "alpha", "groups": "all"}));
        assert!(AuthReply::matches(&value));

        let rejected = serde_json::to_value(AuthReply::rejected()).unwrap();
        assert_eq!(rejected, json!({"auth": false}));
        assert!(!AuthReply::matches(&json!({"headers": {}})));
    }
}
