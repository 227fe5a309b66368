//! brokerlink core: the multi-broker session orchestrator.
//!
//! - [`vault`] holds per-broker credentials, sealed at rest.
//! - [`store`] holds per-broker browser session snapshots, sealed at rest.
//! - [`browser`] is the capability boundary to the browser engine.
//! - [`adapter`] drives each broker's login, two-factor and probe steps.
//! - [`orchestrator`] runs the authentication state machine per broker.
//! - [`aggregation`] fans orchestration out across brokers.

pub mod adapter;
pub mod aggregation;
pub mod browser;
pub mod crypto;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod store;
pub mod vault;

pub use adapter::{
    AdapterError, AdapterRegistry, BrokerAdapter, BrokerProfile, LoginOutcome,
    PortfolioExtractor, ProfileAdapter, SessionProbe, TwoFactorOutcome,
};
pub use aggregation::{AggregationDriver, AggregationReport, BrokerOutcome, BrokerReport};
pub use browser::{BrowserCapability, BrowserContext, BrowserError, StorageSnapshot};
pub use crypto::{CryptoError, KeyDerivationSettings, KeyMaterial, KeyPurpose};
pub use orchestrator::{
    AuthSessionHandle, BrokerFailure, ContentionPolicy, FailureReason, OrchestrationError,
    OrchestrationState, OrchestratorPolicy, SessionGrant, SessionOrchestrator, StateChange,
    TwoFactorResume,
};
pub use persistence::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, PersistenceError, StorageKey,
};
pub use retry::RetryConfig;
pub use store::{SessionStore, SessionStoreError};
pub use vault::{Credential, CredentialSummary, CredentialVault, SecretBytes, VaultError};

pub use brokerlink_model as model;
