//! Shared fakes and wiring for the orchestrator integration tests.
#![allow(dead_code)]

pub mod adapter;
pub mod browser;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use brokerlink_core::crypto::{KeyMaterial, KeyPurpose};
use brokerlink_core::model::{BrokerIdentity, Holding, SessionRecord};
use brokerlink_core::{
    AdapterRegistry, Credential, CredentialVault, MemoryKeyValueStore, OrchestrationState,
    OrchestratorPolicy, RetryConfig, SessionOrchestrator, SessionStore, StateChange, StorageSnapshot,
};
use chrono::{TimeDelta, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

pub use adapter::{LoginStep, ScriptedAdapter};
pub use browser::FakeBrowser;

pub const TEST_CODE: &str = "482913";
pub const TEST_USERNAME: &str = "investor";
pub const TEST_PASSWORD: &str = "correct horse battery staple";

/// Millisecond backoff so retry paths finish quickly on the paused clock.
pub fn fast_policy() -> OrchestratorPolicy {
    OrchestratorPolicy {
        retry: RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
        },
        step_timeout_ms: 5_000,
        login_timeout_ms: 60_000,
        two_factor_timeout_ms: 120_000,
        ..OrchestratorPolicy::default()
    }
}

pub fn test_keys() -> Arc<KeyMaterial> {
    Arc::new(KeyMaterial::from_root_key(&[7u8; 32]).expect("test root key"))
}

pub fn holding(symbol: &str, quantity: i64, value: i64, cost: i64) -> Holding {
    let quantity = Decimal::from(quantity);
    let value = Decimal::from(value);
    let cost = Decimal::from(cost);
    Holding {
        symbol: symbol.to_string(),
        description: format!("{symbol} fund"),
        quantity,
        price: value / quantity,
        unit_cost: cost / quantity,
        cost_basis: cost,
        current_value: value,
        day_change_percent: Decimal::ZERO,
        day_change_dollars: Decimal::ZERO,
        unrealized_gain_loss: value - cost,
        unrealized_gain_loss_percent: (value - cost) / cost,
        portfolio_percentage: None,
        brokers: BTreeMap::new(),
    }
}

/// Orchestrator over in-memory storage, the fake browser and one scripted
/// adapter per broker.
pub struct Harness {
    pub browser: Arc<FakeBrowser>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub keys: Arc<KeyMaterial>,
    pub vault: Arc<CredentialVault>,
    pub sessions: Arc<SessionStore>,
    pub orchestrator: SessionOrchestrator,
    adapters: HashMap<BrokerIdentity, Arc<ScriptedAdapter>>,
}

impl Harness {
    pub fn new(policy: OrchestratorPolicy) -> Self {
        let browser = FakeBrowser::new();
        let kv = Arc::new(MemoryKeyValueStore::new());
        let keys = test_keys();
        let vault = Arc::new(CredentialVault::new(kv.clone(), keys.clone()));
        let sessions = Arc::new(SessionStore::new(kv.clone()));

        let mut registry = AdapterRegistry::new();
        let mut adapters = HashMap::new();
        for broker in BrokerIdentity::ALL {
            let adapter = ScriptedAdapter::new(broker, browser.clone());
            registry.register(adapter.clone());
            adapters.insert(broker, adapter);
        }

        let orchestrator = SessionOrchestrator::new(
            browser.clone(),
            registry,
            vault.clone(),
            sessions.clone(),
            keys.clone(),
            policy,
        );

        Self {
            browser,
            kv,
            keys,
            vault,
            sessions,
            orchestrator,
            adapters,
        }
    }

    pub fn adapter(&self, broker: BrokerIdentity) -> &Arc<ScriptedAdapter> {
        &self.adapters[&broker]
    }

    pub async fn store_credential(&self, broker: BrokerIdentity) -> Result<()> {
        let credential = Credential::new(broker, TEST_USERNAME, TEST_PASSWORD);
        self.vault.put(&credential).await?;
        Ok(())
    }

    pub async fn store_all_credentials(&self) -> Result<()> {
        for broker in BrokerIdentity::ALL {
            self.store_credential(broker).await?;
        }
        Ok(())
    }

    /// Write a `Valid` record whose snapshot the broker currently accepts,
    /// created `age` ago.
    pub async fn seed_session(
        &self,
        broker: BrokerIdentity,
        age: TimeDelta,
    ) -> Result<SessionRecord> {
        let token = self.adapter(broker).issue_token();
        let snapshot = FakeBrowser::session_snapshot(broker, &token);
        let sealed = self
            .keys
            .seal_json(KeyPurpose::Session, broker.as_str(), &snapshot)?;
        let created = Utc::now() - age;
        let expires = created + TimeDelta::days(7);
        let record = SessionRecord::new(broker, sealed, created, Some(expires));
        self.sessions.put(&record).await?;
        Ok(record)
    }

    pub async fn record(&self, broker: BrokerIdentity) -> Result<SessionRecord> {
        self.sessions
            .get(broker)
            .await?
            .with_context(|| format!("no session record for {broker}"))
    }

    /// Token held by the stored snapshot for `broker`.
    pub async fn stored_token(&self, broker: BrokerIdentity) -> Result<String> {
        let record = self.record(broker).await?;
        let snapshot: StorageSnapshot =
            self.keys
                .open_json(KeyPurpose::Session, broker.as_str(), &record.encrypted_blob)?;
        FakeBrowser::session_token(&snapshot)
            .map(str::to_string)
            .context("stored snapshot has no session cookie")
    }
}

/// States broadcast since the last drain, in order.
pub fn drain_states(events: &mut broadcast::Receiver<StateChange>) -> Vec<OrchestrationState> {
    let mut states = Vec::new();
    while let Ok(change) = events.try_recv() {
        states.push(change.to);
    }
    states
}

/// Poll until `broker` reaches `state`. Works on a paused clock.
pub async fn wait_for_state(
    orchestrator: &SessionOrchestrator,
    broker: BrokerIdentity,
    state: OrchestrationState,
) {
    for _ in 0..10_000 {
        if orchestrator.state(broker) == state {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("{broker} never reached {state}; stuck in {}", orchestrator.state(broker));
}
