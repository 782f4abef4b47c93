//! Value records held by the store and exchanged with friends.
//!
//! Records are immutable once built: updates construct a replacement.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{FriendId, PublicIdentity};

/// Decimal places kept when no precision limit is configured.
pub const FULL_PRECISION: i32 = 15;

/// Current time truncated to milliseconds, the resolution the wire keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A peer's latest location/status. Only the current value is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// When the status was produced, serialized as ISO-8601 (RFC 3339)
    pub timestamp: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
    /// Precision class: decimal places of the coordinates that are meaningful
    pub precision: i32,
    /// Free-text location label
    pub street_address: String,
}

impl Status {
    pub fn new(
        timestamp: DateTime<Utc>,
        longitude: f64,
        latitude: f64,
        precision: i32,
        street_address: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            longitude,
            latitude,
            precision,
            street_address: street_address.into(),
        }
    }

    /// Round the coordinates to `decimals` places and record that class.
    ///
    /// A limit at or above the current class leaves the status unchanged.
    pub fn limit_precision(self, decimals: i32) -> Self {
        let decimals = decimals.clamp(0, FULL_PRECISION);
        if decimals >= self.precision {
            return self;
        }
        let scale = 10f64.powi(decimals);
        Self {
            longitude: (self.longitude * scale).round() / scale,
            latitude: (self.latitude * scale).round() / scale,
            precision: decimals,
            ..self
        }
    }
}

/// A known remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    /// Fingerprint of `public_identity`; always derived, never chosen
    pub id: FriendId,
    pub public_identity: PublicIdentity,
    /// Last time this node's status reached the friend (push ack or served pull)
    #[serde(default)]
    pub last_sent_status_timestamp: Option<DateTime<Utc>>,
    /// Last time the friend's status reached this node (pull or inbound push)
    #[serde(default)]
    pub last_received_status_timestamp: Option<DateTime<Utc>>,
}

impl Friend {
    /// A newly added friend with no exchange history.
    pub fn new(public_identity: PublicIdentity) -> Self {
        Self {
            id: public_identity.friend_id(),
            public_identity,
            last_sent_status_timestamp: None,
            last_received_status_timestamp: None,
        }
    }

    pub fn certificate(&self) -> &str {
        &self.public_identity.x509_certificate
    }

    /// Whether the stored id still matches the identity it claims to derive from.
    pub fn id_is_consistent(&self) -> bool {
        self.id == self.public_identity.friend_id()
    }

    pub fn with_last_sent(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_sent_status_timestamp: Some(at),
            ..self.clone()
        }
    }

    pub fn with_last_received(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_received_status_timestamp: Some(at),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Status {
        Status::new(now(), -75.697_193_1, 45.421_530_6, FULL_PRECISION, "Ottawa")
    }

    #[test]
    fn test_limit_precision_rounds_coordinates() {
        let limited = sample().limit_precision(2);
        assert_eq!(limited.precision, 2);
        assert_eq!(limited.longitude, -75.70);
        assert_eq!(limited.latitude, 45.42);
        assert_eq!(limited.street_address, "Ottawa");
    }

    #[test]
    fn test_limit_precision_never_increases_precision() {
        let coarse = sample().limit_precision(1);
        let again = coarse.clone().limit_precision(6);
        assert_eq!(coarse, again);
    }

    #[test]
    fn test_status_wire_keys() {
        let json = serde_json::to_value(sample()).unwrap();
        for key in ["timestamp", "longitude", "latitude", "precision", "streetAddress"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        // ISO-8601 text, not an integer epoch
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_new_friend_has_derived_id() {
        let identity = PublicIdentity::new("bob", "cert-bob", "bob.onion");
        let friend = Friend::new(identity.clone());
        assert_eq!(friend.id, identity.friend_id());
        assert!(friend.id_is_consistent());
        assert!(friend.last_sent_status_timestamp.is_none());
    }

    #[test]
    fn test_friend_without_timestamps_deserializes() {
        let identity = PublicIdentity::new("bob", "cert-bob", "bob.onion");
        let mut json = serde_json::to_value(Friend::new(identity)).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("lastSentStatusTimestamp");
        obj.remove("lastReceivedStatusTimestamp");
        let friend: Friend = serde_json::from_value(json).unwrap();
        assert!(friend.last_received_status_timestamp.is_none());
    }
}
