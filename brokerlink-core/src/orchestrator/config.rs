use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// What a request does when another orchestration of the same broker holds
/// the lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Wait for the other orchestration to finish.
    #[default]
    Block,
    /// Fail immediately with `Busy`.
    Reject,
}

/// Tunables for the session orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorPolicy {
    /// Backoff for transient failures within a step.
    pub retry: RetryConfig,
    /// Upper bound for a single browser interaction.
    pub step_timeout_ms: u64,
    /// Upper bound for the whole login sequence.
    pub login_timeout_ms: u64,
    /// How long a two-factor challenge may wait for a human.
    pub two_factor_timeout_ms: u64,
    /// Code submissions allowed before the orchestration fails.
    pub two_factor_max_attempts: u8,
    /// Lifetime hint written into fresh session records.
    pub session_ttl_secs: u64,
    /// Behaviour when the broker is already being orchestrated.
    pub contention: ContentionPolicy,
    /// Open browser contexts without a window.
    pub headless: bool,
    /// Capacity of the state change broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            step_timeout_ms: 30_000,
            login_timeout_ms: 5 * 60 * 1_000,
            two_factor_timeout_ms: 5 * 60 * 1_000,
            two_factor_max_attempts: 3,
            session_ttl_secs: 7 * 24 * 60 * 60,
            contention: ContentionPolicy::Block,
            headless: true,
            event_channel_capacity: 256,
        }
    }
}

impl OrchestratorPolicy {
    /// `step_timeout_ms` as a duration.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// `login_timeout_ms` as a duration.
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    /// `two_factor_timeout_ms` as a duration.
    pub fn two_factor_timeout(&self) -> Duration {
        Duration::from_millis(self.two_factor_timeout_ms)
    }

    /// `session_ttl_secs`, saturating at chrono's maximum.
    pub fn session_ttl(&self) -> chrono::Duration {
        i64::try_from(self.session_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}
