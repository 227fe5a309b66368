//! Suspending on a two-factor challenge and resuming, abandoning or timing
//! out of it.

use std::time::Duration;

use anyhow::{Context, Result};
use brokerlink_core::model::{BrokerIdentity, ChallengeKind, SessionStatus};
use brokerlink_core::{
    ContentionPolicy, FailureReason, OrchestrationError, OrchestrationState, OrchestratorPolicy,
    TwoFactorResume,
};
use chrono::TimeDelta;

#[path = "support/mod.rs"]
mod support;

use support::{Harness, LoginStep, TEST_CODE, drain_states, fast_policy, wait_for_state};

use OrchestrationState::*;

fn sms_harness(policy: OrchestratorPolicy, broker: BrokerIdentity) -> Harness {
    let harness = Harness::new(policy);
    harness
        .adapter(broker)
        .script_login([LoginStep::TwoFactor(ChallengeKind::SmsCode)]);
    harness
}

#[tokio::test]
async fn etrade_sms_challenge_resumes_into_a_persisted_session() -> Result<()> {
    let broker = BrokerIdentity::ETrade;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;
    let mut events = harness.orchestrator.subscribe();

    let grant = harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    let challenge = grant
        .challenge()
        .cloned()
        .context("expected a two-factor challenge")?;

    assert_eq!(challenge.broker, broker);
    assert_eq!(challenge.kind, ChallengeKind::SmsCode);
    assert_eq!(challenge.attempts_remaining, 3);
    assert_eq!(drain_states(&mut events), vec![LoggingIn, AwaitingTwoFactor]);
    assert_eq!(harness.orchestrator.state(broker), AwaitingTwoFactor);
    assert_eq!(harness.orchestrator.pending_challenge(broker), Some(challenge));
    // The context stays open while the human looks for the code.
    assert_eq!(harness.browser.open_contexts(broker), 1);
    assert!(harness.sessions.get(broker).await?.is_none());

    let handle = harness
        .orchestrator
        .resume_two_factor(broker, TEST_CODE)
        .await?
        .into_handle()
        .context("expected a ready session")?;

    assert_eq!(
        drain_states(&mut events),
        vec![Authenticated, SessionPersisting, Done]
    );
    let record = harness.record(broker).await?;
    assert_eq!(record.status, SessionStatus::Valid);
    assert_eq!(
        Some(harness.stored_token(broker).await?),
        harness.adapter(broker).accepted_token()
    );
    assert!(harness.orchestrator.pending_challenge(broker).is_none());
    assert_eq!(harness.browser.opened(broker), 1);

    handle.release().await;
    assert_eq!(harness.browser.total_open(), 0);
    Ok(())
}

#[tokio::test]
async fn wrong_codes_count_down_then_fail() -> Result<()> {
    let broker = BrokerIdentity::MerrillEdge;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;
    harness.seed_session(broker, TimeDelta::hours(1)).await?;
    harness.adapter(broker).revoke_sessions();

    let grant = harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    assert!(grant.challenge().is_some());

    for (code, remaining) in [("000000", 2), ("111111", 1)] {
        match harness.orchestrator.resume_two_factor(broker, code).await? {
            TwoFactorResume::StillAwaiting(challenge) => {
                assert_eq!(challenge.attempts_remaining, remaining);
            }
            TwoFactorResume::Ready(_) => panic!("wrong code {code} was accepted"),
        }
        assert_eq!(harness.orchestrator.state(broker), AwaitingTwoFactor);
    }

    let err = harness
        .orchestrator
        .resume_two_factor(broker, "222222")
        .await
        .expect_err("retry bound exhausted");
    assert_eq!(err.reason(), Some(FailureReason::TwoFactorRejected));
    assert_eq!(
        harness.orchestrator.state(broker),
        Failed(FailureReason::TwoFactorRejected)
    );
    assert_eq!(harness.adapter(broker).submissions(), 3);
    assert_eq!(harness.record(broker).await?.status, SessionStatus::Invalid);
    assert_eq!(harness.browser.total_open(), 0);

    let again = harness.orchestrator.resume_two_factor(broker, TEST_CODE).await;
    assert!(matches!(again, Err(OrchestrationError::NoPendingChallenge(b)) if b == broker));
    Ok(())
}

#[tokio::test]
async fn correct_code_after_a_typo_is_accepted() -> Result<()> {
    let broker = BrokerIdentity::ETrade;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    let first = harness.orchestrator.resume_two_factor(broker, "482931").await?;
    assert!(matches!(first, TwoFactorResume::StillAwaiting(_)));

    let handle = harness
        .orchestrator
        .resume_two_factor(broker, TEST_CODE)
        .await?
        .into_handle()
        .context("expected a ready session")?;
    assert_eq!(handle.broker(), broker);
    handle.release().await;
    assert_eq!(harness.orchestrator.state(broker), Done);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unanswered_challenge_times_out_and_releases_the_lock() -> Result<()> {
    let broker = BrokerIdentity::Chase;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;
    harness.seed_session(broker, TimeDelta::hours(1)).await?;
    harness.adapter(broker).revoke_sessions();

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    tokio::time::sleep(Duration::from_secs(121)).await;

    assert_eq!(
        harness.orchestrator.state(broker),
        Failed(FailureReason::TwoFactorTimeout)
    );
    assert_eq!(harness.browser.total_open(), 0);
    assert_eq!(harness.record(broker).await?.status, SessionStatus::Invalid);
    assert!(matches!(
        harness.orchestrator.resume_two_factor(broker, TEST_CODE).await,
        Err(OrchestrationError::NoPendingChallenge(_))
    ));

    let grant = harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    assert!(grant.into_handle().is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_codes_do_not_extend_the_deadline() -> Result<()> {
    let broker = BrokerIdentity::ETrade;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    tokio::time::sleep(Duration::from_secs(100)).await;
    let resumed = harness.orchestrator.resume_two_factor(broker, "999999").await?;
    assert!(matches!(resumed, TwoFactorResume::StillAwaiting(_)));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        harness.orchestrator.state(broker),
        Failed(FailureReason::TwoFactorTimeout)
    );
    Ok(())
}

#[tokio::test]
async fn a_parked_broker_does_not_hold_up_the_others() -> Result<()> {
    let harness = sms_harness(fast_policy(), BrokerIdentity::ETrade);
    harness.store_all_credentials().await?;

    let pending = harness
        .orchestrator
        .request_authenticated_session(BrokerIdentity::ETrade)
        .await?;
    assert!(pending.challenge().is_some());

    let chase = harness
        .orchestrator
        .request_authenticated_session(BrokerIdentity::Chase)
        .await?
        .into_handle()
        .context("chase should authenticate")?;
    assert_eq!(
        harness.orchestrator.state(BrokerIdentity::ETrade),
        AwaitingTwoFactor
    );
    chase.release().await;
    Ok(())
}

#[tokio::test]
async fn suspension_keeps_the_broker_locked_under_reject_policy() -> Result<()> {
    let broker = BrokerIdentity::ETrade;
    let policy = OrchestratorPolicy {
        contention: ContentionPolicy::Reject,
        ..fast_policy()
    };
    let harness = sms_harness(policy, broker);
    harness.store_credential(broker).await?;

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    let err = harness
        .orchestrator
        .request_authenticated_session(broker)
        .await
        .expect_err("broker is parked in two-factor");

    assert_eq!(err.reason(), Some(FailureReason::Busy));
    assert_eq!(harness.orchestrator.state(broker), AwaitingTwoFactor);
    assert_eq!(harness.browser.opened(broker), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn blocked_requests_proceed_once_the_challenge_is_abandoned() -> Result<()> {
    let broker = BrokerIdentity::MerrillEdge;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;

    let orchestrator = harness.orchestrator.clone();
    let waiting = tokio::spawn(async move { orchestrator.request_authenticated_session(broker).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiting.is_finished());

    harness.orchestrator.abandon_two_factor(broker).await?;
    let handle = waiting
        .await??
        .into_handle()
        .context("second request logs in")?;
    assert_eq!(harness.adapter(broker).logins(), 2);
    handle.release().await;
    Ok(())
}

#[tokio::test]
async fn abandoning_restores_the_record_from_before_the_attempt() -> Result<()> {
    let broker = BrokerIdentity::Chase;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;
    let original = harness.seed_session(broker, TimeDelta::hours(5)).await?;
    harness.adapter(broker).revoke_sessions();

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    assert_eq!(harness.record(broker).await?.status, SessionStatus::Invalid);

    harness.orchestrator.abandon_two_factor(broker).await?;

    assert_eq!(harness.record(broker).await?, original);
    assert_eq!(
        harness.orchestrator.state(broker),
        Failed(FailureReason::Cancelled)
    );
    assert!(harness.orchestrator.pending_challenge(broker).is_none());
    assert_eq!(harness.browser.total_open(), 0);
    Ok(())
}

#[tokio::test]
async fn cancel_reaches_a_suspended_flight() -> Result<()> {
    let broker = BrokerIdentity::ETrade;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;

    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    assert!(harness.orchestrator.cancel(broker).await);

    assert_eq!(
        harness.orchestrator.state(broker),
        Failed(FailureReason::Cancelled)
    );
    assert!(harness.sessions.get(broker).await?.is_none());
    assert_eq!(harness.browser.total_open(), 0);
    assert!(!harness.orchestrator.cancel(broker).await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropping_a_resume_mid_submission_ends_the_challenge() -> Result<()> {
    let broker = BrokerIdentity::ETrade;
    let harness = sms_harness(fast_policy(), broker);
    harness.store_credential(broker).await?;
    harness
        .orchestrator
        .request_authenticated_session(broker)
        .await?;
    harness
        .adapter(broker)
        .set_submit_delay(Duration::from_secs(30));

    let resume = harness.orchestrator.resume_two_factor(broker, TEST_CODE);
    assert!(tokio::time::timeout(Duration::from_secs(1), resume).await.is_err());

    wait_for_state(&harness.orchestrator, broker, Failed(FailureReason::Cancelled)).await;
    assert!(harness.orchestrator.pending_challenge(broker).is_none());
    assert!(harness.sessions.get(broker).await?.is_none());
    assert_eq!(harness.browser.total_open(), 0);
    assert!(!harness.orchestrator.cancel(broker).await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resume_only_applies_to_parked_flights() -> Result<()> {
    let broker = BrokerIdentity::Chase;
    let harness = Harness::new(fast_policy());
    harness.store_credential(broker).await?;

    assert!(matches!(
        harness.orchestrator.abandon_two_factor(broker).await,
        Err(OrchestrationError::NoPendingChallenge(_))
    ));

    harness
        .adapter(broker)
        .set_login_delay(Duration::from_secs(5));
    let orchestrator = harness.orchestrator.clone();
    let flight = tokio::spawn(async move { orchestrator.request_authenticated_session(broker).await });
    wait_for_state(&harness.orchestrator, broker, LoggingIn).await;

    assert!(matches!(
        harness.orchestrator.resume_two_factor(broker, TEST_CODE).await,
        Err(OrchestrationError::NoPendingChallenge(_))
    ));
    let handle = flight.await??.into_handle().context("login unaffected")?;
    handle.release().await;
    Ok(())
}
