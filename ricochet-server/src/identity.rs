//! Identity lookup.
//!
//! The server does not own credentials. Each credential frame is handed to an
//! [`IdentityLookup`] supplied by the embedding application, which answers
//! with the identity the presented public key belongs to.

use async_trait::async_trait;
use ricochet_protocol::{AuthFrame, Groups};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identity a public key resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Address the identity must connect from.
    pub ip: String,
    /// Key sealing this identity's credentials and bodies.
    pub private_key: String,
    /// Key the client presents in its credential frame.
    pub public_key: String,
    /// Shared secret sealed inside the credential frame.
    pub auth_key: String,
    /// Channel the connection binds to.
    pub channel: String,
    /// Groups granted to the connection.
    pub groups: Groups,
}

impl IdentityRecord {
    /// Names the fields left empty by the lookup.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("ip", &self.ip),
            ("privateKey", &self.private_key),
            ("publicKey", &self.public_key),
            ("authKey", &self.auth_key),
            ("channel", &self.channel),
        ] {
            if value.is_empty() {
                missing.push(name);
            }
        }
        missing
    }
}

/// Lookup failure reported by an [`IdentityLookup`].
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct LookupError(pub String);

impl LookupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Resolves a credential frame to an identity.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn lookup(&self, credentials: &AuthFrame) -> Result<IdentityRecord, LookupError>;
}

/// Fixed identity table keyed by public key.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities {
    identities: HashMap<String, IdentityRecord>,
}

impl StaticIdentities {
    pub fn new(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        Self {
            identities: records
                .into_iter()
                .map(|record| (record.public_key.clone(), record))
                .collect(),
        }
    }

    /// Adds or replaces an identity.
    pub fn insert(&mut self, record: IdentityRecord) {
        self.identities.insert(record.public_key.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[async_trait]
impl IdentityLookup for StaticIdentities {
    async fn lookup(&self, credentials: &AuthFrame) -> Result<IdentityRecord, LookupError> {
        self.identities
            .get(&credentials.public_key)
            .cloned()
            .ok_or_else(|| LookupError::new("unknown public key"))
    }
}
