//! Broker adapters: the per-broker login, two-factor, probe and extraction
//! steps, behind one trait.

mod brokers;
mod profile;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use brokerlink_model::{BrokerIdentity, Holding, PortfolioSnapshot, TwoFactorChallenge};
use thiserror::Error;

use crate::browser::{BrowserContext, BrowserError};
use crate::vault::Credential;

pub use brokers::{chase_profile, etrade_profile, merrill_edge_profile};
pub use profile::{BrokerProfile, ProfileAdapter, TwoFactorProfile};

/// Result of checking whether a restored context is still logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProbe {
    /// The broker served an authenticated page.
    Valid,
    /// The broker bounced to its sign-in page.
    Invalid,
    /// The page gave no clear signal either way.
    Unknown,
}

/// What the broker did with submitted credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Logged in; the context is authenticated.
    Success,
    /// The broker wants a second factor before letting the context in.
    TwoFactorRequired(TwoFactorChallenge),
    /// Wrong credentials or a locked account, with the broker's wording.
    Rejected(String),
}

/// What the broker did with a submitted two-factor code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoFactorOutcome {
    /// Logged in; the context is authenticated.
    Accepted,
    /// The code was wrong or expired. The challenge may still be answered.
    Rejected(String),
}

/// Errors raised by adapters and extractors.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Loading a broker page failed.
    #[error("navigation to {url} failed: {source}")]
    Navigation {
        /// Page that was requested.
        url: String,
        /// Engine failure.
        #[source]
        source: BrowserError,
    },
    /// An element every known variant of the page should contain is missing.
    #[error("page layout changed: {selector} not found on {url}")]
    LayoutChanged {
        /// Selector that matched nothing.
        selector: String,
        /// Page it was looked for on.
        url: String,
    },
    /// The stored password cannot be typed into a form.
    #[error("credential secret for {0} is not valid UTF-8")]
    InvalidCredential(BrokerIdentity),
    /// The portfolio page loaded but could not be turned into holdings.
    #[error("extraction failed: {0}")]
    Extraction(String),
    /// Any other browser primitive failure.
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl AdapterError {
    /// Whether retrying the same step may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Navigation { source, .. } | Self::Browser(source) => source.is_transient(),
            Self::LayoutChanged { .. } | Self::InvalidCredential(_) | Self::Extraction(_) => false,
        }
    }
}

/// Uniform surface over every broker's authentication flow.
#[async_trait]
pub trait BrokerAdapter: Send + Sync + fmt::Debug {
    /// Broker this adapter drives.
    fn broker(&self) -> BrokerIdentity;

    /// Navigate to an authenticated-only page and report whether the restored
    /// session is still accepted.
    async fn probe_validity(&self, ctx: &BrowserContext) -> Result<SessionProbe, AdapterError>;

    /// Fill and submit the login form, then wait for the page to settle.
    async fn login(
        &self,
        ctx: &BrowserContext,
        credential: &Credential,
    ) -> Result<LoginOutcome, AdapterError>;

    /// Answer the challenge the login raised, in the same context.
    async fn submit_two_factor(
        &self,
        ctx: &BrowserContext,
        code: &str,
    ) -> Result<TwoFactorOutcome, AdapterError>;

    /// Read the holdings from the portfolio page of an authenticated context.
    async fn extract(&self, ctx: &BrowserContext) -> Result<PortfolioSnapshot, AdapterError>;
}

/// Turns the broker's portfolio page into holdings. Page markup parsing is
/// supplied by the embedding application.
#[async_trait]
pub trait PortfolioExtractor: Send + Sync + fmt::Debug {
    /// Parse the portfolio page the context is currently showing.
    async fn extract_holdings(
        &self,
        broker: BrokerIdentity,
        ctx: &BrowserContext,
    ) -> Result<Vec<Holding>, AdapterError>;
}

/// Maps each broker to its adapter.
#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<BrokerIdentity, Arc<dyn BrokerAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Merrill Edge, Chase and E*TRADE adapters.
    pub fn with_builtin(extractor: Arc<dyn PortfolioExtractor>) -> Self {
        let mut registry = Self::new();
        for profile in [merrill_edge_profile(), chase_profile(), etrade_profile()] {
            registry.register(Arc::new(ProfileAdapter::new(profile, extractor.clone())));
        }
        registry
    }

    /// Replaces any adapter already registered for the same broker.
    pub fn register(&mut self, adapter: Arc<dyn BrokerAdapter>) -> &mut Self {
        self.adapters.insert(adapter.broker(), adapter);
        self
    }

    /// Adapter for `broker`, if one is registered.
    pub fn get(&self, broker: BrokerIdentity) -> Option<Arc<dyn BrokerAdapter>> {
        self.adapters.get(&broker).cloned()
    }

    /// Registered brokers, sorted.
    pub fn brokers(&self) -> Vec<BrokerIdentity> {
        let mut brokers: Vec<_> = self.adapters.keys().copied().collect();
        brokers.sort();
        brokers
    }
}
