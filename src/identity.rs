//! Peer identity: the public half every friend sees, the private half only
//! Self holds, and the fingerprint that turns a public identity into a
//! stable friend id.
//!
//! Key material is produced elsewhere (certificate and hidden-service key
//! generation are owned by the transport layer). This module treats the
//! certificate and keys as opaque strings.

use serde::{de, Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain separator for fingerprints. Bumping it changes every friend id.
const FINGERPRINT_DOMAIN: &[u8] = b"ploggy-public-identity-v1";

/// Peer-visible identity, shared by Self and every Friend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    /// Display name chosen by the peer (not unique)
    pub nickname: String,

    /// PEM-encoded X.509 certificate; inbound requests authenticate against it
    pub x509_certificate: String,

    /// Hidden service hostname the peer's web server is reachable at
    pub hidden_service_hostname: String,
}

impl PublicIdentity {
    pub fn new(
        nickname: impl Into<String>,
        x509_certificate: impl Into<String>,
        hidden_service_hostname: impl Into<String>,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            x509_certificate: x509_certificate.into(),
            hidden_service_hostname: hidden_service_hostname.into(),
        }
    }

    /// SHA-256 digest over a length-prefixed encoding of every field.
    ///
    /// Length prefixes keep `("ab", "c")` and `("a", "bc")` from colliding.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        for field in [
            &self.nickname,
            &self.x509_certificate,
            &self.hidden_service_hostname,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.finalize().into()
    }

    /// The friend id this identity maps to.
    pub fn friend_id(&self) -> FriendId {
        FriendId(hex::encode(self.fingerprint()))
    }
}

/// Private key material matching a [`PublicIdentity`].
///
/// `Debug` is redacted so keys never reach the logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateIdentity {
    pub x509_private_key: String,
    pub hidden_service_private_key: String,
}

impl PrivateIdentity {
    pub fn new(
        x509_private_key: impl Into<String>,
        hidden_service_private_key: impl Into<String>,
    ) -> Self {
        Self {
            x509_private_key: x509_private_key.into(),
            hidden_service_private_key: hidden_service_private_key.into(),
        }
    }
}

impl fmt::Debug for PrivateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateIdentity(<redacted>)")
    }
}

/// This node's own identity. Exactly one per data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfIdentity {
    pub public_identity: PublicIdentity,
    pub private_identity: PrivateIdentity,
}

impl SelfIdentity {
    pub fn new(public_identity: PublicIdentity, private_identity: PrivateIdentity) -> Self {
        Self {
            public_identity,
            private_identity,
        }
    }

    /// Certificate + private key pair the authenticated client presents.
    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial {
            certificate: self.public_identity.x509_certificate.clone(),
            private_key: self.private_identity.x509_private_key.clone(),
        }
    }
}

/// TLS client credentials handed to the request client.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub certificate: String,
    pub private_key: String,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// Hex-encoded fingerprint of a friend's public identity.
///
/// Never chosen, only derived via [`PublicIdentity::friend_id`] (or parsed
/// back from storage / admin input).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FriendId(String);

impl<'de> Deserialize<'de> for FriendId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid friend id {raw:?}")))
    }
}

impl FriendId {
    /// Parse an id from user or file input. Accepts 64 hex chars, any case.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for logs.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for FriendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}
