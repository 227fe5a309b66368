//! Two-factor challenges raised by brokers during login.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerIdentity;

/// How the broker expects the human to answer a two-factor challenge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// One-time code sent by text message.
    SmsCode,
    /// One-time code sent by email.
    EmailCode,
    /// Approve on a phone; the resume call carries no meaningful code.
    PushApproval,
    /// Anything else; the label is shown to the operator.
    Other(String),
}

impl ChallengeKind {
    /// Whether resuming needs a code typed by the human.
    pub fn expects_code(&self) -> bool {
        !matches!(self, Self::PushApproval)
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SmsCode => f.write_str("SMS-code"),
            Self::EmailCode => f.write_str("email-code"),
            Self::PushApproval => f.write_str("push-approval"),
            Self::Other(label) => f.write_str(label),
        }
    }
}

/// A broker-initiated secondary authentication step awaiting a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorChallenge {
    /// Broker that raised the challenge.
    pub broker: BrokerIdentity,
    /// How the human answers.
    pub kind: ChallengeKind,
    /// Text to show the human, built from what the broker page said.
    pub prompt_text: String,
    /// When the flight was parked on this challenge.
    pub awaiting_since: DateTime<Utc>,
    /// Submissions left before the orchestration fails.
    #[serde(default)]
    pub attempts_remaining: u8,
}

impl TwoFactorChallenge {
    /// Challenge raised now. The orchestrator fills in `attempts_remaining`.
    pub fn new(broker: BrokerIdentity, kind: ChallengeKind, prompt_text: impl Into<String>) -> Self {
        Self {
            broker,
            kind,
            prompt_text: prompt_text.into(),
            awaiting_since: Utc::now(),
            attempts_remaining: 0,
        }
    }
}
