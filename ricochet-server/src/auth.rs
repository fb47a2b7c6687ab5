//! Credential validation.
//!
//! Checks run in a fixed order and the first failure decides the error code:
//! frame shape, lookup, lookup completeness, groups, source address, auth
//! key, stamp freshness. Channel uniqueness is checked by the router when the
//! identity is bound.

use crate::identity::{IdentityLookup, IdentityRecord};
use ricochet_protocol::{
    now_millis, parse_auth_frame, Envelope, ErrorCode, Groups, ProtocolConfig, WireError,
};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Identity established by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub channel: String,
    pub groups: Groups,
    pub private_key: String,
    pub public_key: String,
}

impl From<IdentityRecord> for Identity {
    fn from(record: IdentityRecord) -> Self {
        Self {
            channel: record.channel,
            groups: record.groups,
            private_key: record.private_key,
            public_key: record.public_key,
        }
    }
}

/// Strips the IPv4-mapped IPv6 prefix so `::ffff:10.0.0.1` compares equal
/// to `10.0.0.1`.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Validates credential frames against an [`IdentityLookup`].
#[derive(Clone)]
pub struct Authenticator {
    lookup: Arc<dyn IdentityLookup>,
    envelope: Envelope,
    stamp_window_ms: i64,
    clock_skew_ms: i64,
}

impl Authenticator {
    pub fn new(lookup: Arc<dyn IdentityLookup>, config: &ProtocolConfig) -> Self {
        Self {
            lookup,
            envelope: config.envelope(),
            stamp_window_ms: config.timeouts.auth_stamp_window_ms as i64,
            clock_skew_ms: config.timeouts.clock_skew_ms as i64,
        }
    }

    /// Validates a credential frame received from `remote_ip`.
    pub async fn authenticate(
        &self,
        value: Value,
        remote_ip: IpAddr,
    ) -> Result<Identity, WireError> {
        self.authenticate_at(value, remote_ip, now_millis()).await
    }

    async fn authenticate_at(
        &self,
        value: Value,
        remote_ip: IpAddr,
        now_ms: i64,
    ) -> Result<Identity, WireError> {
        let credentials = parse_auth_frame(value)
            .map_err(|e| WireError::new(ErrorCode::AuthMalformed).with_detail("cause", e.to_string()))?;

        let record = self.lookup.lookup(&credentials).await.map_err(|e| {
            WireError::new(ErrorCode::AuthFailure).with_detail("cause", e.to_string())
        })?;

        let missing = record.missing_fields();
        if !missing.is_empty() {
            return Err(WireError::new(ErrorCode::AuthLookup).with_detail("missing", missing));
        }

        if record.groups.is_empty() {
            return Err(WireError::new(ErrorCode::AuthNoGroups).with_detail("channel", record.channel));
        }

        let remote_ip = normalize_ip(remote_ip);
        let expected_ip = record
            .ip
            .parse::<IpAddr>()
            .map(normalize_ip)
            .map_err(|_| WireError::new(ErrorCode::AuthLookup).with_detail("ip", record.ip.clone()))?;
        if expected_ip != remote_ip {
            return Err(WireError::new(ErrorCode::AuthIp)
                .with_detail("provided", remote_ip.to_string())
                .with_detail("expected", expected_ip.to_string()));
        }

        match self.envelope.decrypt(&record.private_key, &credentials.auth_key) {
            Ok(auth_key) if auth_key == record.auth_key => {}
            _ => return Err(WireError::new(ErrorCode::AuthAuthKey)),
        }

        let stamp = self
            .envelope
            .decrypt(&record.private_key, &credentials.auth_stamp)
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .ok_or_else(|| WireError::new(ErrorCode::AuthExpiredKey))?;
        let ahead = stamp.saturating_sub(now_ms);
        let age = now_ms.saturating_sub(stamp);
        if ahead > self.clock_skew_ms || age > self.stamp_window_ms {
            return Err(WireError::new(ErrorCode::AuthExpiredKey)
                .with_detail("provided", stamp)
                .with_detail("expected", now_ms));
        }

        debug!(channel = %record.channel, "Credentials accepted");
        Ok(record.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentities;
    use ricochet_protocol::AuthFrame;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const NOW: i64 = 1_700_000_000_000;

    fn record() -> IdentityRecord {
        IdentityRecord {
            ip: "127.0.0.1".into(),
            private_key: "alpha-private".into(),
            public_key: "alpha-public".into(),
            auth_key: "alpha-auth".into(),
            channel: "alpha".into(),
            groups: Groups::named(["g1"]),
        }
    }

    fn authenticator(record: IdentityRecord) -> Authenticator {
        Authenticator::new(
            Arc::new(StaticIdentities::new([record])),
            &ProtocolConfig::default(),
        )
    }

    fn credentials(auth_key: &str, stamp: i64) -> Value {
        let envelope = ProtocolConfig::default().envelope();
        let frame = AuthFrame::seal(&envelope, "alpha-public", "alpha-private", auth_key, stamp)
            .unwrap();
        serde_json::to_value(frame).unwrap()
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn code_of(auth: &Authenticator, value: Value, ip: IpAddr) -> ErrorCode {
        auth.authenticate_at(value, ip, NOW).await.unwrap_err().code
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let auth = authenticator(record());
        let identity = auth
            .authenticate_at(credentials("alpha-auth", NOW), localhost(), NOW)
            .await
            .unwrap();
        assert_eq!(identity.channel, "alpha");
        assert_eq!(identity.groups, Groups::named(["g1"]));
        assert_eq!(identity.private_key, "alpha-private");
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let auth = authenticator(record());
        let value = serde_json::json!({"publicKey": "alpha-public"});
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthMalformed);
    }

    #[tokio::test]
    async fn test_unknown_public_key() {
        let auth = authenticator(record());
        let mut value = credentials("alpha-auth", NOW);
        value["publicKey"] = "nobody".into();
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthFailure);
    }

    #[tokio::test]
    async fn test_incomplete_lookup() {
        let mut incomplete = record();
        incomplete.channel.clear();
        let auth = authenticator(incomplete);
        let value = credentials("alpha-auth", NOW);
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthLookup);
    }

    #[tokio::test]
    async fn test_empty_groups() {
        let mut no_groups = record();
        no_groups.groups = Groups::default();
        let auth = authenticator(no_groups);
        let value = credentials("alpha-auth", NOW);
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthNoGroups);
    }

    #[tokio::test]
    async fn test_ip_mismatch() {
        let auth = authenticator(record());
        let value = credentials("alpha-auth", NOW);
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(code_of(&auth, value, other).await, ErrorCode::AuthIp);
    }

    #[tokio::test]
    async fn test_ipv4_mapped_address_accepted() {
        let auth = authenticator(record());
        let mapped = IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped());
        let identity = auth
            .authenticate_at(credentials("alpha-auth", NOW), mapped, NOW)
            .await
            .unwrap();
        assert_eq!(identity.channel, "alpha");
    }

    #[tokio::test]
    async fn test_wrong_auth_key() {
        let auth = authenticator(record());
        let value = credentials("not-the-secret", NOW);
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthAuthKey);
    }

    #[tokio::test]
    async fn test_stale_stamp_rejected() {
        let auth = authenticator(record());
        let stale = NOW - 60_001;
        let value = credentials("alpha-auth", stale);
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthExpiredKey);
    }

    #[tokio::test]
    async fn test_future_stamp_rejected() {
        let auth = authenticator(record());
        let value = credentials("alpha-auth", NOW + 5_001);
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthExpiredKey);

        let within_skew = credentials("alpha-auth", NOW + 4_000);
        assert!(auth.authenticate_at(within_skew, localhost(), NOW).await.is_ok());
    }

    #[tokio::test]
    async fn test_extreme_stamps_rejected() {
        let auth = authenticator(record());
        for stamp in [i64::MIN, i64::MAX] {
            let value = credentials("alpha-auth", stamp);
            assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthExpiredKey);
        }
    }

    #[tokio::test]
    async fn test_unparsable_stamp_rejected() {
        let auth = authenticator(record());
        let envelope = ProtocolConfig::default().envelope();
        let mut value = credentials("alpha-auth", NOW);
        value["authStamp"] = envelope
            .encrypt("alpha-private", "yesterday", None)
            .unwrap()
            .into();
        assert_eq!(code_of(&auth, value, localhost()).await, ErrorCode::AuthExpiredKey);
    }

    #[test]
    fn test_normalize_ip() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped());
        assert_eq!(normalize_ip(mapped), IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));

        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(normalize_ip(v6), v6);
    }
}
