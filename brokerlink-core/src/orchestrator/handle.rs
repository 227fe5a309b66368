//! Values handed back to orchestrator callers.

use std::fmt;

use brokerlink_model::{BrokerIdentity, TwoFactorChallenge};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::state::{BrokerFailure, FailureReason};
use crate::browser::BrowserContext;

/// An authenticated browser context, ready for one extraction.
///
/// The handle keeps the broker's orchestration lock until it is released, so
/// no second context for the same broker is opened while this one is in use.
/// Call [`AuthSessionHandle::release`] when done. Dropping an unreleased
/// handle schedules the close on the current runtime.
pub struct AuthSessionHandle {
    broker: BrokerIdentity,
    context: BrowserContext,
    obtained_at: DateTime<Utc>,
    released: bool,
    guard: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for AuthSessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSessionHandle")
            .field("broker", &self.broker)
            .field("context", &self.context.id())
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

impl AuthSessionHandle {
    pub(crate) fn new(
        broker: BrokerIdentity,
        context: BrowserContext,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            broker,
            context,
            obtained_at: Utc::now(),
            released: false,
            guard: Some(guard),
        }
    }

    /// Broker the session belongs to.
    pub fn broker(&self) -> BrokerIdentity {
        self.broker
    }

    /// The authenticated context. Valid until release.
    pub fn context(&self) -> &BrowserContext {
        &self.context
    }

    /// When the handle was handed out.
    pub fn obtained_at(&self) -> DateTime<Utc> {
        self.obtained_at
    }

    /// Close the underlying browser context, then give up the broker lock.
    pub async fn release(mut self) {
        self.released = true;
        self.context.close().await;
        drop(self.guard.take());
        debug!(broker = %self.broker, "session handle released");
    }
}

impl Drop for AuthSessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let context = self.context.clone();
        let guard = self.guard.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    context.close().await;
                    drop(guard);
                });
            }
            Err(_) => {
                tracing::warn!(
                    broker = %self.broker,
                    context = %self.context.id(),
                    "session handle dropped outside a runtime; context left open"
                );
            }
        }
    }
}

/// What `request_authenticated_session` hands back.
#[derive(Debug)]
pub enum SessionGrant {
    /// Authenticated; extract, then release.
    Ready(AuthSessionHandle),
    /// The broker asked for a second factor. Answer with
    /// `resume_two_factor` (or give up with `abandon_two_factor`).
    PendingTwoFactor(TwoFactorChallenge),
}

impl SessionGrant {
    /// The handle, if the session is ready.
    pub fn into_handle(self) -> Option<AuthSessionHandle> {
        match self {
            Self::Ready(handle) => Some(handle),
            Self::PendingTwoFactor(_) => None,
        }
    }

    /// The challenge, if one is pending.
    pub fn challenge(&self) -> Option<&TwoFactorChallenge> {
        match self {
            Self::Ready(_) => None,
            Self::PendingTwoFactor(challenge) => Some(challenge),
        }
    }
}

/// What `resume_two_factor` hands back.
#[derive(Debug)]
pub enum TwoFactorResume {
    /// The code was accepted and the session persisted.
    Ready(AuthSessionHandle),
    /// The code was rejected; the challenge is still open with fewer
    /// attempts remaining.
    StillAwaiting(TwoFactorChallenge),
}

impl TwoFactorResume {
    /// The handle, if the code was accepted.
    pub fn into_handle(self) -> Option<AuthSessionHandle> {
        match self {
            Self::Ready(handle) => Some(handle),
            Self::StillAwaiting(_) => None,
        }
    }
}

/// Errors returned by [`SessionOrchestrator`](super::SessionOrchestrator).
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// No adapter is registered for the broker.
    #[error("no adapter registered for {0}")]
    NoAdapter(BrokerIdentity),
    /// Resume or abandon without a parked flight.
    #[error("no two-factor challenge pending for {0}")]
    NoPendingChallenge(BrokerIdentity),
    /// The orchestration ended in `Failed`.
    #[error("{0}")]
    Failed(BrokerFailure),
}

impl OrchestrationError {
    /// The broker failure, if the orchestration ran and failed.
    pub fn failure(&self) -> Option<&BrokerFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Failure reason, if the orchestration ran and failed.
    pub fn reason(&self) -> Option<FailureReason> {
        self.failure().map(|failure| failure.reason)
    }
}

impl From<BrokerFailure> for OrchestrationError {
    fn from(failure: BrokerFailure) -> Self {
        Self::Failed(failure)
    }
}
