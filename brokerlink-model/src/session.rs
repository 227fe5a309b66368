//! Persisted browser sessions and their sealed envelopes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerIdentity;
use crate::error::ModelError;

/// Lifecycle status of a persisted browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Last probe confirmed the session is authenticated.
    Valid,
    /// Stored but not probed since it was written.
    Unknown,
    /// The expiry hint has passed.
    Expired,
    /// A probe or a failed authentication rejected it.
    Invalid,
}

impl SessionStatus {
    /// Lowercase key, as stored and printed.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Unknown => "unknown",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
        }
    }

    /// Whether a record in this status is worth restoring into a browser.
    pub fn is_restorable(&self) -> bool {
        matches!(self, Self::Valid | Self::Unknown)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "valid" => Ok(Self::Valid),
            "unknown" => Ok(Self::Unknown),
            "expired" => Ok(Self::Expired),
            "invalid" => Ok(Self::Invalid),
            _ => Err(ModelError::InvalidStatus(s.to_string())),
        }
    }
}

/// Versioned AEAD envelope. Opaque to everything except the crypto boundary.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// Envelope format version.
    pub version: u32,
    /// Base64 encoded nonce
    pub nonce: String,
    /// Base64 encoded ciphertext (including the authentication tag)
    pub ciphertext: String,
    /// When the envelope was sealed.
    pub sealed_at: DateTime<Utc>,
}

impl fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBlob")
            .field("version", &self.version)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("sealed_at", &self.sealed_at)
            .finish()
    }
}

/// Persisted browser session state for one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Broker the session belongs to.
    pub broker: BrokerIdentity,
    /// Sealed browser storage state (cookies and origin storage).
    pub encrypted_blob: SealedBlob,
    /// When the session was captured after a login.
    pub created_at: DateTime<Utc>,
    /// Last time a probe, or the login itself, confirmed the session.
    pub last_validated_at: DateTime<Utc>,
    /// Brokers rarely declare an expiry, so this is a heuristic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_hint: Option<DateTime<Utc>>,
    /// Outcome of the last check on this session.
    pub status: SessionStatus,
}

impl SessionRecord {
    /// A freshly captured, valid session.
    pub fn new(
        broker: BrokerIdentity,
        encrypted_blob: SealedBlob,
        now: DateTime<Utc>,
        expires_at_hint: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            broker,
            encrypted_blob,
            created_at: now,
            last_validated_at: now,
            expires_at_hint,
            status: SessionStatus::Valid,
        }
    }

    /// `false` when there is no hint.
    pub fn is_past_expiry_hint(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_hint.is_some_and(|expiry| now > expiry)
    }
}
