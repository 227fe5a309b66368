//! Session orchestrator.
//!
//! Per broker, decides between reusing a stored session and logging in,
//! drives the adapter through login and two-factor, persists the resulting
//! browser state and hands out an authenticated context.
//!
//! Every orchestration ("flight") holds the broker's lock from the first
//! store lookup until it reaches `Failed`, or until the caller releases the
//! handle it got on `Done`. That includes the time it is parked in
//! `AwaitingTwoFactor` waiting for a human.

mod config;
mod handle;
mod state;

pub use config::{ContentionPolicy, OrchestratorPolicy};
pub use handle::{AuthSessionHandle, OrchestrationError, SessionGrant, TwoFactorResume};
pub use state::{BrokerFailure, FailureReason, OrchestrationState, StateChange};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use brokerlink_model::{BrokerIdentity, SessionRecord, TwoFactorChallenge};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::adapter::{
    AdapterError, AdapterRegistry, BrokerAdapter, LoginOutcome, SessionProbe, TwoFactorOutcome,
};
use crate::browser::{BrowserCapability, BrowserContext, ContextOptions, StorageSnapshot};
use crate::crypto::{KeyMaterial, KeyPurpose};
use crate::retry::{classify, with_retry};
use crate::store::{SessionStore, SessionStoreError};
use crate::vault::{CredentialVault, VaultError};

/// A flight parked in `AwaitingTwoFactor`. Owns the broker lock and the open
/// browser context until it is resumed, abandoned, cancelled or times out.
struct SuspendedFlight {
    flight_id: Uuid,
    context: BrowserContext,
    challenge: TwoFactorChallenge,
    attempts_used: u8,
    original: Option<SessionRecord>,
    deadline: Instant,
    timer: CancellationToken,
    guard: OwnedMutexGuard<()>,
}

enum Flight {
    Running {
        flight_id: Uuid,
        cancel: CancellationToken,
    },
    Suspended(SuspendedFlight),
}

impl Flight {
    fn id(&self) -> Uuid {
        match self {
            Self::Running { flight_id, .. } => *flight_id,
            Self::Suspended(flight) => flight.flight_id,
        }
    }
}

/// Where a flight hands control back to the caller.
enum Checkpoint {
    Authenticated(BrowserContext),
    Suspended {
        context: BrowserContext,
        challenge: TwoFactorChallenge,
    },
}

/// Mutable bookkeeping for one flight while it runs.
struct Attempt {
    broker: BrokerIdentity,
    flight_id: Uuid,
    adapter: Arc<dyn BrokerAdapter>,
    original: Option<SessionRecord>,
    context: Option<BrowserContext>,
}

struct Inner {
    browser: Arc<dyn BrowserCapability>,
    adapters: AdapterRegistry,
    vault: Arc<CredentialVault>,
    sessions: Arc<SessionStore>,
    keys: Arc<KeyMaterial>,
    policy: OrchestratorPolicy,
    locks: DashMap<BrokerIdentity, Arc<AsyncMutex<()>>>,
    flights: Mutex<HashMap<BrokerIdentity, Flight>>,
    states: DashMap<BrokerIdentity, OrchestrationState>,
    events: broadcast::Sender<StateChange>,
}

/// Entry point for obtaining authenticated broker sessions. Cheap to clone;
/// clones share locks, flights and the event channel.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flights = self.inner.flights.lock().len();
        f.debug_struct("SessionOrchestrator")
            .field("brokers", &self.inner.adapters.brokers())
            .field("active_flights", &flights)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

fn storage_failure(broker: BrokerIdentity) -> impl Fn(SessionStoreError) -> BrokerFailure {
    move |err| BrokerFailure::new(broker, FailureReason::StorageFailure, err.to_string())
}

fn adapter_failure(broker: BrokerIdentity, err: &AdapterError) -> BrokerFailure {
    BrokerFailure::new(broker, classify(err), err.to_string())
}

fn cancelled(broker: BrokerIdentity) -> BrokerFailure {
    BrokerFailure::new(broker, FailureReason::Cancelled, "cancelled by caller")
}

impl SessionOrchestrator {
    /// Orchestrator over the given browser, adapters and stores.
    pub fn new(
        browser: Arc<dyn BrowserCapability>,
        adapters: AdapterRegistry,
        vault: Arc<CredentialVault>,
        sessions: Arc<SessionStore>,
        keys: Arc<KeyMaterial>,
        policy: OrchestratorPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(policy.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                browser,
                adapters,
                vault,
                sessions,
                keys,
                policy,
                locks: DashMap::new(),
                flights: Mutex::new(HashMap::new()),
                states: DashMap::new(),
                events,
            }),
        }
    }

    /// Policy the orchestrator was built with.
    pub fn policy(&self) -> &OrchestratorPolicy {
        &self.inner.policy
    }

    /// Adapter registered for `broker`.
    pub fn adapter(&self, broker: BrokerIdentity) -> Option<Arc<dyn BrokerAdapter>> {
        self.inner.adapters.get(broker)
    }

    /// Brokers with a registered adapter, sorted.
    pub fn brokers(&self) -> Vec<BrokerIdentity> {
        self.inner.adapters.brokers()
    }

    /// Latest state of `broker`; `Idle` if it was never orchestrated.
    pub fn state(&self, broker: BrokerIdentity) -> OrchestrationState {
        self.inner.state(broker)
    }

    /// Receiver for every state transition of every broker from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    /// The open challenge for `broker`, if its flight is parked.
    pub fn pending_challenge(&self, broker: BrokerIdentity) -> Option<TwoFactorChallenge> {
        match self.inner.flights.lock().get(&broker) {
            Some(Flight::Suspended(flight)) => Some(flight.challenge.clone()),
            _ => None,
        }
    }

    /// Obtain an authenticated session for `broker`, reusing the stored one
    /// when it still works.
    pub async fn request_authenticated_session(
        &self,
        broker: BrokerIdentity,
    ) -> Result<SessionGrant, OrchestrationError> {
        let adapter = self
            .inner
            .adapters
            .get(broker)
            .ok_or(OrchestrationError::NoAdapter(broker))?;

        let guard = self.inner.acquire(broker).await?;
        let flight_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        self.inner.flights.lock().insert(
            broker,
            Flight::Running {
                flight_id,
                cancel: cancel.clone(),
            },
        );
        self.inner.states.insert(broker, OrchestrationState::Idle);

        let span = info_span!("orchestration", broker = %broker, flight_id = %flight_id);
        let flight = self
            .inner
            .clone()
            .run_flight(adapter, guard, flight_id, cancel.clone())
            .instrument(span);
        self.inner.detach(broker, flight_id, cancel, flight).await
    }

    /// Answer the pending two-factor challenge for `broker`.
    pub async fn resume_two_factor(
        &self,
        broker: BrokerIdentity,
        code: &str,
    ) -> Result<TwoFactorResume, OrchestrationError> {
        let (flight, cancel) = {
            let mut flights = self.inner.flights.lock();
            match flights.remove(&broker) {
                Some(Flight::Suspended(flight)) => {
                    let cancel = CancellationToken::new();
                    flights.insert(
                        broker,
                        Flight::Running {
                            flight_id: flight.flight_id,
                            cancel: cancel.clone(),
                        },
                    );
                    (flight, cancel)
                }
                Some(other) => {
                    flights.insert(broker, other);
                    return Err(OrchestrationError::NoPendingChallenge(broker));
                }
                None => return Err(OrchestrationError::NoPendingChallenge(broker)),
            }
        };
        flight.timer.cancel();

        let flight_id = flight.flight_id;
        let span = info_span!("two_factor", broker = %broker, flight_id = %flight_id);
        let resume = self
            .inner
            .clone()
            .resume_flight(broker, flight, code.to_owned(), cancel.clone())
            .instrument(span);
        self.inner.detach(broker, flight_id, cancel, resume).await
    }

    /// Give up on the pending challenge. The stored session is restored to
    /// its value before the flight started.
    pub async fn abandon_two_factor(
        &self,
        broker: BrokerIdentity,
    ) -> Result<(), OrchestrationError> {
        let flight = {
            let mut flights = self.inner.flights.lock();
            match flights.remove(&broker) {
                Some(Flight::Suspended(flight)) => flight,
                Some(other) => {
                    flights.insert(broker, other);
                    return Err(OrchestrationError::NoPendingChallenge(broker));
                }
                None => return Err(OrchestrationError::NoPendingChallenge(broker)),
            }
        };
        info!(broker = %broker, flight_id = %flight.flight_id, "two-factor challenge abandoned");
        self.inner
            .end_suspended(
                broker,
                flight,
                FailureReason::Cancelled,
                "two-factor challenge abandoned",
            )
            .await;
        Ok(())
    }

    /// Cancel whatever is in flight for `broker`. Returns whether there was
    /// anything to cancel.
    pub async fn cancel(&self, broker: BrokerIdentity) -> bool {
        let suspended = {
            let mut flights = self.inner.flights.lock();
            let running = match flights.get(&broker) {
                Some(Flight::Running { cancel, .. }) => {
                    cancel.cancel();
                    true
                }
                Some(Flight::Suspended(_)) => false,
                None => return false,
            };
            if running {
                info!(broker = %broker, "cancellation requested");
                return true;
            }
            match flights.remove(&broker) {
                Some(Flight::Suspended(flight)) => flight,
                _ => return false,
            }
        };

        info!(broker = %broker, flight_id = %suspended.flight_id, "cancelling suspended orchestration");
        self.inner
            .end_suspended(
                broker,
                suspended,
                FailureReason::Cancelled,
                "cancelled while awaiting two-factor",
            )
            .await;
        true
    }
}

impl Inner {
    fn state(&self, broker: BrokerIdentity) -> OrchestrationState {
        self.states
            .get(&broker)
            .map(|state| *state)
            .unwrap_or(OrchestrationState::Idle)
    }

    fn transition(&self, broker: BrokerIdentity, flight_id: Uuid, to: OrchestrationState) {
        let from = self
            .states
            .insert(broker, to)
            .unwrap_or(OrchestrationState::Idle);
        debug!(broker = %broker, %from, %to, "state transition");
        let _ = self.events.send(StateChange {
            broker,
            flight_id,
            from,
            to,
            at: Utc::now(),
        });
    }

    async fn acquire(
        &self,
        broker: BrokerIdentity,
    ) -> Result<OwnedMutexGuard<()>, OrchestrationError> {
        let lock = self.locks.entry(broker).or_default().clone();
        match self.policy.contention {
            ContentionPolicy::Block => {
                if let Ok(guard) = lock.clone().try_lock_owned() {
                    return Ok(guard);
                }
                debug!(broker = %broker, "waiting for in-flight orchestration");
                Ok(lock.lock_owned().await)
            }
            ContentionPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                info!(broker = %broker, "request rejected: orchestration already in flight");
                BrokerFailure::new(
                    broker,
                    FailureReason::Busy,
                    "another orchestration is in flight",
                )
                .into()
            }),
        }
    }

    /// Remove the flight entry if it still belongs to `flight_id`.
    fn clear_flight(&self, broker: BrokerIdentity, flight_id: Uuid) {
        let mut flights = self.flights.lock();
        if flights.get(&broker).is_some_and(|flight| flight.id() == flight_id) {
            flights.remove(&broker);
        }
    }

    /// Atomically check for cancellation and drop the running entry.
    fn settle(&self, broker: BrokerIdentity, flight_id: Uuid, cancel: &CancellationToken) -> bool {
        let mut flights = self.flights.lock();
        if cancel.is_cancelled() {
            return false;
        }
        if flights.get(&broker).is_some_and(|flight| flight.id() == flight_id) {
            flights.remove(&broker);
        }
        true
    }

    /// Drive a flight on its own task. Dropping the returned future cancels
    /// the flight, which then closes its context and releases the lock like
    /// any other cancellation.
    async fn detach<T>(
        &self,
        broker: BrokerIdentity,
        flight_id: Uuid,
        cancel: CancellationToken,
        flight: impl Future<Output = Result<T, OrchestrationError>> + Send + 'static,
    ) -> Result<T, OrchestrationError>
    where
        T: Send + 'static,
    {
        let on_drop = cancel.drop_guard();
        let joined = tokio::spawn(flight).await;
        on_drop.disarm();

        joined.unwrap_or_else(|err| {
            error!(broker = %broker, error = %err, "orchestration task aborted");
            self.clear_flight(broker, flight_id);
            let failure = BrokerFailure::new(
                broker,
                FailureReason::BrowserFailure,
                format!("orchestration task aborted: {err}"),
            );
            self.transition(broker, flight_id, OrchestrationState::Failed(failure.reason));
            Err(failure.into())
        })
    }

    async fn cancellable<T>(
        broker: BrokerIdentity,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, BrokerFailure>>,
    ) -> Result<T, BrokerFailure> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(broker)),
            result = fut => result,
        }
    }

    async fn run_flight(
        self: Arc<Self>,
        adapter: Arc<dyn BrokerAdapter>,
        guard: OwnedMutexGuard<()>,
        flight_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<SessionGrant, OrchestrationError> {
        let broker = adapter.broker();
        let original = match self.sessions.get(broker).await {
            Ok(record) => record,
            Err(SessionStoreError::Corrupt { source, .. }) => {
                warn!(broker = %broker, error = %source, "stored session record is unreadable; ignoring it");
                None
            }
            Err(err) => {
                let failure = storage_failure(broker)(err);
                self.fail(flight_id, &failure, None, None).await;
                return Err(failure.into());
            }
        };

        let mut attempt = Attempt {
            broker,
            flight_id,
            adapter,
            original,
            context: None,
        };

        let outcome = Self::cancellable(broker, &cancel, self.drive(&mut attempt)).await;

        match outcome {
            Ok(Checkpoint::Authenticated(context)) => {
                if !self.settle(broker, flight_id, &cancel) {
                    let failure = cancelled(broker);
                    self.fail(flight_id, &failure, Some(context), attempt.original.as_ref())
                        .await;
                    return Err(failure.into());
                }
                self.transition(broker, flight_id, OrchestrationState::Done);
                info!(broker = %broker, "authenticated session ready");
                Ok(SessionGrant::Ready(AuthSessionHandle::new(broker, context, guard)))
            }
            Ok(Checkpoint::Suspended { context, mut challenge }) => {
                let max = self.policy.two_factor_max_attempts;
                challenge.attempts_remaining = max;
                let suspended = SuspendedFlight {
                    flight_id,
                    context,
                    challenge: challenge.clone(),
                    attempts_used: 0,
                    original: attempt.original.take(),
                    deadline: Instant::now() + self.policy.two_factor_timeout(),
                    timer: CancellationToken::new(),
                    guard,
                };
                match self.park(broker, suspended, &cancel) {
                    Ok(()) => Ok(SessionGrant::PendingTwoFactor(challenge)),
                    Err(flight) => {
                        let failure = cancelled(broker);
                        self.end_suspended(broker, flight, failure.reason, &failure.detail)
                            .await;
                        Err(failure.into())
                    }
                }
            }
            Err(failure) => {
                let context = attempt.context.take();
                self.fail(flight_id, &failure, context, attempt.original.as_ref())
                    .await;
                drop(guard);
                Err(failure.into())
            }
        }
    }

    /// Store a suspended flight and arm its abandonment timer. Hands the
    /// flight back if it was cancelled in the meantime.
    fn park(
        self: &Arc<Self>,
        broker: BrokerIdentity,
        flight: SuspendedFlight,
        cancel: &CancellationToken,
    ) -> Result<(), SuspendedFlight> {
        let mut flights = self.flights.lock();
        if cancel.is_cancelled() {
            return Err(flight);
        }

        let flight_id = flight.flight_id;
        let deadline = flight.deadline;
        let timer = flight.timer.clone();
        flights.insert(broker, Flight::Suspended(flight));
        drop(flights);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    inner.expire_two_factor(broker, flight_id).await;
                }
            }
        });
        debug!(broker = %broker, "flight parked awaiting two-factor");
        Ok(())
    }

    async fn expire_two_factor(&self, broker: BrokerIdentity, flight_id: Uuid) {
        let flight = {
            let mut flights = self.flights.lock();
            match flights.get(&broker) {
                Some(Flight::Suspended(flight)) if flight.flight_id == flight_id => {}
                _ => return,
            }
            match flights.remove(&broker) {
                Some(Flight::Suspended(flight)) => flight,
                _ => return,
            }
        };
        warn!(broker = %broker, "two-factor challenge timed out");
        self.end_suspended(
            broker,
            flight,
            FailureReason::TwoFactorTimeout,
            "no two-factor response before the deadline",
        )
        .await;
    }

    async fn end_suspended(
        &self,
        broker: BrokerIdentity,
        flight: SuspendedFlight,
        reason: FailureReason,
        detail: &str,
    ) {
        flight.timer.cancel();
        let failure = BrokerFailure::new(broker, reason, detail);
        self.fail(
            flight.flight_id,
            &failure,
            Some(flight.context.clone()),
            flight.original.as_ref(),
        )
        .await;
        // Lock is released when the flight (and its guard) drops here.
        drop(flight);
    }

    /// Close the context, apply the failure's effect on the stored record
    /// and publish `Failed`.
    async fn fail(
        &self,
        flight_id: Uuid,
        failure: &BrokerFailure,
        context: Option<BrowserContext>,
        original: Option<&SessionRecord>,
    ) {
        let broker = failure.broker;
        if let Some(context) = context {
            context.close().await;
        }

        if failure.reason == FailureReason::Cancelled {
            self.restore_original(broker, original).await;
        } else if failure.reason.invalidates_session()
            && let Err(err) = self.sessions.invalidate(broker).await
        {
            error!(broker = %broker, error = %err, "failed to invalidate session record");
        }

        self.clear_flight(broker, flight_id);

        match failure.reason {
            FailureReason::BrokerLayoutChanged => error!(
                broker = %broker,
                detail = %failure.detail,
                "broker page layout changed; adapter needs updating"
            ),
            FailureReason::Cancelled => info!(broker = %broker, "orchestration cancelled"),
            reason => warn!(
                broker = %broker,
                %reason,
                detail = %failure.detail,
                "orchestration failed"
            ),
        }
        self.transition(broker, flight_id, OrchestrationState::Failed(failure.reason));
    }

    async fn restore_original(&self, broker: BrokerIdentity, original: Option<&SessionRecord>) {
        let result = match original {
            Some(record) => self.sessions.put(record).await,
            None => self.sessions.remove(broker).await.map(|_| ()),
        };
        if let Err(err) = result {
            error!(broker = %broker, error = %err, "failed to roll back session record");
        }
    }

    async fn step<T, F, Fut>(
        &self,
        broker: BrokerIdentity,
        name: &'static str,
        op: F,
    ) -> Result<T, BrokerFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        with_retry(&self.policy.retry, broker, name, op)
            .await
            .map_err(|err| adapter_failure(broker, &err))
    }

    async fn open_context(&self, attempt: &mut Attempt) -> Result<BrowserContext, BrokerFailure> {
        let options = ContextOptions {
            headless: self.policy.headless,
            ..ContextOptions::for_broker(attempt.broker)
        };
        let step_timeout = self.policy.step_timeout();
        let context = self
            .step(attempt.broker, "open context", || {
                let browser = Arc::clone(&self.browser);
                let options = &options;
                async move {
                    BrowserContext::open(browser, options, step_timeout)
                        .await
                        .map_err(AdapterError::from)
                }
            })
            .await?;
        attempt.context = Some(context.clone());
        Ok(context)
    }

    async fn drive(&self, attempt: &mut Attempt) -> Result<Checkpoint, BrokerFailure> {
        let broker = attempt.broker;
        let now = Utc::now();
        let reusable = match &attempt.original {
            None => None,
            Some(record) if !record.status.is_restorable() => {
                debug!(broker = %broker, status = %record.status, "stored session is not restorable");
                None
            }
            Some(record) if record.is_past_expiry_hint(now) => {
                info!(broker = %broker, "stored session is past its expiry hint");
                self.sessions
                    .mark_expired(broker)
                    .await
                    .map_err(storage_failure(broker))?;
                None
            }
            Some(record) => Some(record.clone()),
        };

        if let Some(record) = reusable
            && let Some(context) = self.restore(attempt, &record).await?
        {
            return Ok(Checkpoint::Authenticated(context));
        }

        self.login(attempt).await
    }

    /// `RestoringSession -> ValidatingSession`. `Ok(None)` means the stored
    /// session is unusable and the flight should log in.
    async fn restore(
        &self,
        attempt: &mut Attempt,
        record: &SessionRecord,
    ) -> Result<Option<BrowserContext>, BrokerFailure> {
        let broker = attempt.broker;
        let flight_id = attempt.flight_id;
        self.transition(broker, flight_id, OrchestrationState::RestoringSession);

        let snapshot: StorageSnapshot = match self.keys.open_json(
            KeyPurpose::Session,
            broker.as_str(),
            &record.encrypted_blob,
        ) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(broker = %broker, error = %err, "stored session could not be opened; invalidating");
                self.sessions
                    .invalidate(broker)
                    .await
                    .map_err(storage_failure(broker))?;
                return Ok(None);
            }
        };

        let context = self.open_context(attempt).await?;
        self.step(broker, "restore session", || async {
            context
                .restore_state(&snapshot)
                .await
                .map_err(AdapterError::from)
        })
        .await?;
        drop(snapshot);

        self.transition(broker, flight_id, OrchestrationState::ValidatingSession);
        let adapter = Arc::clone(&attempt.adapter);
        let probe = self
            .step(broker, "probe session", || adapter.probe_validity(&context))
            .await?;

        match probe {
            SessionProbe::Valid => {
                self.sessions
                    .touch(broker, Utc::now())
                    .await
                    .map_err(storage_failure(broker))?;
                self.transition(broker, flight_id, OrchestrationState::Authenticated);
                info!(broker = %broker, "stored session reused");
                Ok(Some(context))
            }
            SessionProbe::Invalid | SessionProbe::Unknown => {
                info!(broker = %broker, ?probe, "stored session rejected by probe");
                self.sessions
                    .invalidate(broker)
                    .await
                    .map_err(storage_failure(broker))?;
                if let Some(context) = attempt.context.take() {
                    context.close().await;
                }
                Ok(None)
            }
        }
    }

    async fn login(&self, attempt: &mut Attempt) -> Result<Checkpoint, BrokerFailure> {
        let broker = attempt.broker;
        let flight_id = attempt.flight_id;
        self.transition(broker, flight_id, OrchestrationState::LoggingIn);

        let credential = self.vault.get(broker).await.map_err(|err| match err {
            VaultError::NotConfigured(_) => {
                BrokerFailure::new(broker, FailureReason::NotConfigured, err.to_string())
            }
            other => BrokerFailure::new(broker, FailureReason::StorageFailure, other.to_string()),
        })?;

        let context = self.open_context(attempt).await?;
        let adapter = Arc::clone(&attempt.adapter);
        let login = with_retry(&self.policy.retry, broker, "login", || {
            adapter.login(&context, &credential)
        });
        let outcome = match tokio::time::timeout(self.policy.login_timeout(), login).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return Err(adapter_failure(broker, &err)),
            Err(_) => {
                return Err(BrokerFailure::new(
                    broker,
                    FailureReason::TransientNetwork,
                    format!(
                        "login did not finish within {}s",
                        self.policy.login_timeout().as_secs()
                    ),
                ));
            }
        };
        drop(credential);

        match outcome {
            LoginOutcome::Success => {
                self.transition(broker, flight_id, OrchestrationState::Authenticated);
                self.persist(broker, flight_id, &context).await?;
                Ok(Checkpoint::Authenticated(context))
            }
            LoginOutcome::TwoFactorRequired(challenge) => {
                info!(broker = %broker, kind = %challenge.kind, "awaiting two-factor response");
                self.transition(broker, flight_id, OrchestrationState::AwaitingTwoFactor);
                Ok(Checkpoint::Suspended { context, challenge })
            }
            LoginOutcome::Rejected(reason) => {
                Err(BrokerFailure::new(broker, FailureReason::AuthRejected, reason))
            }
        }
    }

    /// `Authenticated -> SessionPersisting`: seal the exported state and
    /// replace the stored record.
    async fn persist(
        &self,
        broker: BrokerIdentity,
        flight_id: Uuid,
        context: &BrowserContext,
    ) -> Result<(), BrokerFailure> {
        self.transition(broker, flight_id, OrchestrationState::SessionPersisting);

        let snapshot = self
            .step(broker, "export session", || async {
                context.export_state().await.map_err(AdapterError::from)
            })
            .await?;
        let sealed = self
            .keys
            .seal_json(KeyPurpose::Session, broker.as_str(), &snapshot)
            .map_err(|err| {
                BrokerFailure::new(broker, FailureReason::StorageFailure, err.to_string())
            })?;
        drop(snapshot);

        let now = Utc::now();
        let expiry = now.checked_add_signed(self.policy.session_ttl());
        let record = SessionRecord::new(broker, sealed, now, expiry);
        self.sessions
            .put(&record)
            .await
            .map_err(storage_failure(broker))?;
        info!(broker = %broker, expires_at_hint = ?record.expires_at_hint, "session persisted");
        Ok(())
    }

    async fn resume_flight(
        self: Arc<Self>,
        broker: BrokerIdentity,
        mut flight: SuspendedFlight,
        code: String,
        cancel: CancellationToken,
    ) -> Result<TwoFactorResume, OrchestrationError> {
        let Some(adapter) = self.adapters.get(broker) else {
            self.end_suspended(broker, flight, FailureReason::BrowserFailure, "adapter missing")
                .await;
            return Err(OrchestrationError::NoAdapter(broker));
        };
        let flight_id = flight.flight_id;

        let submit = async {
            match tokio::time::timeout_at(
                flight.deadline,
                adapter.submit_two_factor(&flight.context, &code),
            )
            .await
            {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(err)) => Err(adapter_failure(broker, &err)),
                Err(_) => Err(BrokerFailure::new(
                    broker,
                    FailureReason::TwoFactorTimeout,
                    "two-factor deadline passed during submission",
                )),
            }
        };
        let outcome = Self::cancellable(broker, &cancel, submit).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(failure) => {
                self.end_suspended(broker, flight, failure.reason, &failure.detail)
                    .await;
                return Err(failure.into());
            }
        };

        match outcome {
            TwoFactorOutcome::Accepted => {
                info!(broker = %broker, "two-factor accepted");
                self.transition(broker, flight_id, OrchestrationState::Authenticated);
                let persisted = Self::cancellable(
                    broker,
                    &cancel,
                    self.persist(broker, flight_id, &flight.context),
                )
                .await;
                if let Err(failure) = persisted {
                    self.end_suspended(broker, flight, failure.reason, &failure.detail)
                        .await;
                    return Err(failure.into());
                }
                if !self.settle(broker, flight_id, &cancel) {
                    let failure = cancelled(broker);
                    self.end_suspended(broker, flight, failure.reason, &failure.detail)
                        .await;
                    return Err(failure.into());
                }
                self.transition(broker, flight_id, OrchestrationState::Done);
                info!(broker = %broker, "authenticated session ready");
                let SuspendedFlight { context, guard, .. } = flight;
                Ok(TwoFactorResume::Ready(AuthSessionHandle::new(broker, context, guard)))
            }
            TwoFactorOutcome::Rejected(reason) => {
                flight.attempts_used = flight.attempts_used.saturating_add(1);
                let max = self.policy.two_factor_max_attempts;
                if flight.attempts_used >= max {
                    let detail = format!("{reason} ({max} attempts used)");
                    self.end_suspended(broker, flight, FailureReason::TwoFactorRejected, &detail)
                        .await;
                    return Err(BrokerFailure::new(
                        broker,
                        FailureReason::TwoFactorRejected,
                        detail,
                    )
                    .into());
                }

                flight.challenge.attempts_remaining = max - flight.attempts_used;
                warn!(
                    broker = %broker,
                    attempts_remaining = flight.challenge.attempts_remaining,
                    %reason,
                    "two-factor code rejected"
                );
                let challenge = flight.challenge.clone();
                flight.timer = CancellationToken::new();
                match self.park(broker, flight, &cancel) {
                    Ok(()) => Ok(TwoFactorResume::StillAwaiting(challenge)),
                    Err(flight) => {
                        let failure = cancelled(broker);
                        self.end_suspended(broker, flight, failure.reason, &failure.detail)
                            .await;
                        Err(failure.into())
                    }
                }
            }
        }
    }
}
