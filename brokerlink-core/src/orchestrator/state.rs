use std::fmt;

use brokerlink_model::BrokerIdentity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Why an orchestration ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Network or navigation trouble that outlasted the retry budget.
    TransientNetwork,
    /// The broker refused the credentials.
    AuthRejected,
    /// Nobody answered the challenge in time.
    TwoFactorTimeout,
    /// Every allowed code submission was rejected.
    TwoFactorRejected,
    /// An expected page element is gone. Needs a code change, not a retry.
    BrokerLayoutChanged,
    /// The vault or session store could not be read or written.
    StorageFailure,
    /// The vault holds no credential for the broker.
    NotConfigured,
    /// Another orchestration of the same broker is in flight.
    Busy,
    /// Cancelled, abandoned, or the caller went away.
    Cancelled,
    /// The browser engine failed in a way that is not network related.
    BrowserFailure,
}

impl FailureReason {
    /// Snake case key, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::AuthRejected => "auth_rejected",
            Self::TwoFactorTimeout => "two_factor_timeout",
            Self::TwoFactorRejected => "two_factor_rejected",
            Self::BrokerLayoutChanged => "broker_layout_changed",
            Self::StorageFailure => "storage_failure",
            Self::NotConfigured => "not_configured",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::BrowserFailure => "browser_failure",
        }
    }

    /// Whether running the same orchestration again later may succeed
    /// without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork | Self::Busy | Self::BrowserFailure)
    }

    /// Whether the stored session must not be reused after this failure.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected | Self::TwoFactorTimeout | Self::TwoFactorRejected
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed orchestration, isolated to one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerFailure {
    /// Broker that failed.
    pub broker: BrokerIdentity,
    /// Classification that drives retry and session invalidation.
    pub reason: FailureReason,
    /// Human readable cause. Never contains secrets.
    pub detail: String,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

impl BrokerFailure {
    /// Failure stamped with the current time.
    pub fn new(broker: BrokerIdentity, reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            broker,
            reason,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for BrokerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.broker, self.reason, self.detail)
    }
}

/// Session orchestration state for one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum OrchestrationState {
    /// Never orchestrated.
    Idle,
    /// Opening a context and loading the stored session into it.
    RestoringSession,
    /// Probing whether the broker still accepts the restored session.
    ValidatingSession,
    /// Submitting credentials.
    LoggingIn,
    /// Parked on a challenge until a human answers.
    AwaitingTwoFactor,
    /// The context is logged in.
    Authenticated,
    /// Sealing and storing the new session.
    SessionPersisting,
    /// A handle was handed out.
    Done,
    /// Ended without a session.
    Failed(FailureReason),
}

impl OrchestrationState {
    /// `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Somewhere between `Idle` and a terminal state.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::RestoringSession => f.write_str("restoring_session"),
            Self::ValidatingSession => f.write_str("validating_session"),
            Self::LoggingIn => f.write_str("logging_in"),
            Self::AwaitingTwoFactor => f.write_str("awaiting_two_factor"),
            Self::Authenticated => f.write_str("authenticated"),
            Self::SessionPersisting => f.write_str("session_persisting"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// Broadcast on every state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    /// Broker whose state changed.
    pub broker: BrokerIdentity,
    /// Identifies one orchestration attempt from lock acquisition to release.
    pub flight_id: Uuid,
    /// State before the transition.
    pub from: OrchestrationState,
    /// State after the transition.
    pub to: OrchestrationState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}
