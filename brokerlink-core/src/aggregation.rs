//! Aggregation driver: requests a session per broker concurrently, runs the
//! adapter's extraction on every handle it gets and combines the results.
//!
//! Brokers never affect each other. A broker that fails or stops at a
//! two-factor challenge shows up in the report next to the ones that
//! produced a snapshot.

use brokerlink_model::{BrokerIdentity, Portfolio, PortfolioSnapshot, TwoFactorChallenge};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use crate::orchestrator::{
    AuthSessionHandle, BrokerFailure, FailureReason, OrchestrationError, SessionGrant,
    SessionOrchestrator, TwoFactorResume,
};
use crate::retry::{classify, with_retry};

/// How one broker ended in an aggregation run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum BrokerOutcome {
    /// Holdings were read.
    Extracted(PortfolioSnapshot),
    /// Waiting on a human; answer through `resume_and_collect`.
    PendingTwoFactor(TwoFactorChallenge),
    /// Orchestration or extraction failed.
    Failed(BrokerFailure),
}

/// Outcome for one broker.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerReport {
    /// Broker the report is for.
    pub broker: BrokerIdentity,
    /// What happened.
    pub outcome: BrokerOutcome,
    /// When the broker's work ended.
    pub finished_at: DateTime<Utc>,
}

impl BrokerReport {
    fn new(broker: BrokerIdentity, outcome: BrokerOutcome) -> Self {
        Self {
            broker,
            outcome,
            finished_at: Utc::now(),
        }
    }

    fn failed(failure: BrokerFailure) -> Self {
        Self::new(failure.broker, BrokerOutcome::Failed(failure))
    }
}

/// One report per requested broker, in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationReport {
    /// Reports in the order the brokers were requested.
    pub reports: Vec<BrokerReport>,
}

impl AggregationReport {
    /// Snapshots of the brokers that extracted.
    pub fn snapshots(&self) -> impl Iterator<Item = &PortfolioSnapshot> {
        self.reports.iter().filter_map(|report| match &report.outcome {
            BrokerOutcome::Extracted(snapshot) => Some(snapshot),
            _ => None,
        })
    }

    /// Challenges waiting on a human.
    pub fn pending(&self) -> impl Iterator<Item = &TwoFactorChallenge> {
        self.reports.iter().filter_map(|report| match &report.outcome {
            BrokerOutcome::PendingTwoFactor(challenge) => Some(challenge),
            _ => None,
        })
    }

    /// Failures, one per failed broker.
    pub fn failures(&self) -> impl Iterator<Item = &BrokerFailure> {
        self.reports.iter().filter_map(|report| match &report.outcome {
            BrokerOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    /// Report for `broker`, if it was part of the run.
    pub fn get(&self, broker: BrokerIdentity) -> Option<&BrokerReport> {
        self.reports.iter().find(|report| report.broker == broker)
    }

    /// Merge every extracted snapshot into one portfolio.
    pub fn portfolio(&self) -> Portfolio {
        Portfolio::combine(self.snapshots())
    }
}

/// Collects holdings from every broker through one orchestrator.
#[derive(Debug, Clone)]
pub struct AggregationDriver {
    orchestrator: SessionOrchestrator,
}

impl AggregationDriver {
    /// Driver on top of `orchestrator`.
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Orchestrator the driver requests sessions from.
    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    /// Every broker with a registered adapter.
    pub async fn run_all(&self) -> AggregationReport {
        let brokers = self.orchestrator.brokers();
        self.run(&brokers).await
    }

    /// Collect `brokers` concurrently, one task per broker.
    pub async fn run(&self, brokers: &[BrokerIdentity]) -> AggregationReport {
        info!(count = brokers.len(), "aggregating brokers in parallel");

        let tasks = brokers.iter().copied().map(|broker| {
            let driver = self.clone();
            tokio::spawn(async move { driver.collect(broker).await })
        });
        let results = futures::future::join_all(tasks).await;

        let reports: Vec<BrokerReport> = brokers
            .iter()
            .zip(results)
            .map(|(broker, result)| match result {
                Ok(report) => report,
                Err(err) => {
                    warn!(broker = %broker, error = %err, "aggregation task did not finish");
                    BrokerReport::failed(BrokerFailure::new(
                        *broker,
                        FailureReason::BrowserFailure,
                        format!("aggregation task aborted: {err}"),
                    ))
                }
            })
            .collect();

        let report = AggregationReport { reports };
        info!(
            extracted = report.snapshots().count(),
            pending = report.pending().count(),
            failed = report.failures().count(),
            "aggregation complete"
        );
        report
    }

    /// Orchestrate and extract a single broker.
    pub async fn collect(&self, broker: BrokerIdentity) -> BrokerReport {
        let span = info_span!("collect", broker = %broker);
        async {
            match self.orchestrator.request_authenticated_session(broker).await {
                Ok(SessionGrant::Ready(handle)) => self.extract(handle).await,
                Ok(SessionGrant::PendingTwoFactor(challenge)) => {
                    BrokerReport::new(broker, BrokerOutcome::PendingTwoFactor(challenge))
                }
                Err(err) => BrokerReport::failed(Self::failure_of(broker, err)),
            }
        }
        .instrument(span)
        .await
    }

    /// Answer a pending challenge and, once authenticated, extract. Fails
    /// only when there is nothing to resume.
    pub async fn resume_and_collect(
        &self,
        broker: BrokerIdentity,
        code: &str,
    ) -> Result<BrokerReport, OrchestrationError> {
        match self.orchestrator.resume_two_factor(broker, code).await {
            Ok(TwoFactorResume::Ready(handle)) => Ok(self.extract(handle).await),
            Ok(TwoFactorResume::StillAwaiting(challenge)) => Ok(BrokerReport::new(
                broker,
                BrokerOutcome::PendingTwoFactor(challenge),
            )),
            Err(OrchestrationError::Failed(failure)) => Ok(BrokerReport::failed(failure)),
            Err(err) => Err(err),
        }
    }

    /// The handle is released whatever the extraction outcome.
    async fn extract(&self, handle: AuthSessionHandle) -> BrokerReport {
        let broker = handle.broker();
        let Some(adapter) = self.orchestrator.adapter(broker) else {
            handle.release().await;
            return BrokerReport::failed(BrokerFailure::new(
                broker,
                FailureReason::NotConfigured,
                "no adapter registered",
            ));
        };

        let result = with_retry(&self.orchestrator.policy().retry, broker, "extract", || {
            adapter.extract(handle.context())
        })
        .await;
        handle.release().await;

        match result {
            Ok(snapshot) => {
                info!(broker = %broker, holdings = snapshot.holdings.len(), "portfolio extracted");
                BrokerReport::new(broker, BrokerOutcome::Extracted(snapshot))
            }
            Err(err) => {
                warn!(broker = %broker, error = %err, "extraction failed");
                BrokerReport::failed(BrokerFailure::new(broker, classify(&err), err.to_string()))
            }
        }
    }

    fn failure_of(broker: BrokerIdentity, err: OrchestrationError) -> BrokerFailure {
        match err {
            OrchestrationError::Failed(failure) => failure,
            OrchestrationError::NoAdapter(_) => BrokerFailure::new(
                broker,
                FailureReason::NotConfigured,
                "no adapter registered",
            ),
            other => BrokerFailure::new(broker, FailureReason::BrowserFailure, other.to_string()),
        }
    }
}
