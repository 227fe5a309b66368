//! Retry policy for transient browser failures and the mapping from adapter
//! errors onto the failure taxonomy.

use std::future::Future;
use std::time::Duration;

use brokerlink_model::BrokerIdentity;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::adapter::AdapterError;
use crate::browser::BrowserError;
use crate::orchestrator::FailureReason;

/// Exponential backoff for retrying one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_base_ms: u64,
    /// Cap on any single delay.
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    /// `backoff_base_ms` as a duration.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// `backoff_max_ms` as a duration.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff::exponential(self.backoff_base(), attempt, self.backoff_max())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

/// Backoff curves.
pub mod backoff {
    use std::time::Duration;

    /// `base * 2^(attempt - 1)`, capped at `max`.
    pub fn exponential(base: Duration, attempt: u32, max: Duration) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = base.saturating_mul(multiplier);
        backoff.min(max)
    }
}

/// Map an adapter error onto the failure taxonomy.
pub fn classify(err: &AdapterError) -> FailureReason {
    match err {
        AdapterError::LayoutChanged { .. } | AdapterError::Extraction(_) => {
            FailureReason::BrokerLayoutChanged
        }
        AdapterError::InvalidCredential(_) => FailureReason::AuthRejected,
        AdapterError::Navigation { source, .. } | AdapterError::Browser(source) => {
            classify_browser(source)
        }
    }
}

/// Map a browser error onto the failure taxonomy.
pub fn classify_browser(err: &BrowserError) -> FailureReason {
    match err {
        err if err.is_transient() => FailureReason::TransientNetwork,
        BrowserError::ElementNotFound(_) => FailureReason::BrokerLayoutChanged,
        _ => FailureReason::BrowserFailure,
    }
}

/// Run `op`, retrying transient failures with exponential backoff. Anything
/// non-transient, or the last transient failure, is returned as is.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    broker: BrokerIdentity,
    step: &'static str,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    broker = %broker,
                    step,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if matches!(err, AdapterError::LayoutChanged { .. }) {
                    error!(broker = %broker, step, error = %err, "broker layout changed");
                }
                return Err(err);
            }
        }
    }
}
