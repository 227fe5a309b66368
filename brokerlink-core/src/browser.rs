//! Browser capability boundary.
//!
//! The automation engine itself lives outside this crate. Everything the
//! orchestrator and the broker adapters need from it is expressed by
//! [`BrowserCapability`]; [`BrowserContext`] binds one open context to the
//! capability and applies the per-step timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brokerlink_model::BrokerIdentity;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

/// Handle to one isolated browser context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextRef(Uuid);

impl ContextRef {
    /// Fresh, unique reference.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying id, for engines that key contexts by UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0.simple())
    }
}

/// Settings for a new context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Broker the context is opened for. Used for logging and isolation.
    pub broker: BrokerIdentity,
    /// Run without a visible window.
    pub headless: bool,
    /// Override of the engine's default user agent.
    pub user_agent: Option<String>,
    /// Width and height in pixels.
    pub viewport: Option<(u32, u32)>,
}

impl ContextOptions {
    /// Headless at 1920x1080 with the engine's user agent.
    pub fn for_broker(broker: BrokerIdentity) -> Self {
        Self {
            broker,
            headless: true,
            user_agent: None,
            viewport: Some((1920, 1080)),
        }
    }
}

/// CSS selector, optionally scoped to an iframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    /// Selector of the iframe to search in, if any.
    pub frame: Option<String>,
    /// Selector of the element itself.
    pub css: String,
}

impl Selector {
    /// Selector on the top-level document.
    pub fn css(css: impl Into<String>) -> Self {
        Self {
            frame: None,
            css: css.into(),
        }
    }

    /// Scope the selector to the iframe matched by `frame`.
    pub fn in_frame(mut self, frame: impl Into<String>) -> Self {
        self.frame = Some(frame.into());
        self
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.frame {
            Some(frame) => write!(f, "{frame} >> {}", self.css),
            None => f.write_str(&self.css),
        }
    }
}

/// One cookie, in the shape automation engines export them.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value. Never logged.
    pub value: String,
    /// Domain, with a leading dot for domain cookies.
    pub domain: String,
    /// Path scope; `/` when the engine omits it.
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Unix timestamp in seconds, -1 for session cookies
    #[serde(default = "session_cookie_expiry")]
    pub expires: f64,
    /// Hidden from page scripts.
    #[serde(default)]
    pub http_only: bool,
    /// Only sent over HTTPS.
    #[serde(default)]
    pub secure: bool,
    /// `Strict`, `Lax` or `None`, as the engine reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn session_cookie_expiry() -> f64 {
    -1.0
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("expires", &self.expires)
            .finish()
    }
}

/// One key/value pair of an origin's local storage.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Storage key.
    pub name: String,
    /// Stored value. Never logged.
    pub value: String,
}

impl fmt::Debug for StorageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Local storage of one origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    /// Scheme, host and port, e.g. `https://us.etrade.com`.
    pub origin: String,
    /// Entries in insertion order.
    #[serde(default)]
    pub local_storage: Vec<StorageEntry>,
}

/// Cookies and local storage of one context: everything needed to resume an
/// authenticated session in a fresh context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Cookies across every domain the context visited.
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    /// Local storage per origin.
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

impl StorageSnapshot {
    /// Nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.is_empty()
    }
}

/// Failures reported by the automation engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrowserError {
    /// The page did not load.
    #[error("navigation to {url} failed: {reason}")]
    Navigation {
        /// Page that was requested.
        url: String,
        /// Engine message.
        reason: String,
    },
    /// A step did not finish in time. Names the step.
    #[error("browser step timed out: {0}")]
    Timeout(String),
    /// An element needed for an action is not on the page.
    #[error("element not found: {0}")]
    ElementNotFound(String),
    /// The context was closed, or never opened.
    #[error("browser context {0} is closed")]
    ContextClosed(ContextRef),
    /// The engine itself went away.
    #[error("browser disconnected: {0}")]
    Disconnected(String),
    /// Anything the engine reports that fits no other variant.
    #[error("browser error: {0}")]
    Other(String),
}

impl BrowserError {
    /// Network-ish failures that are worth retrying in place.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Navigation { .. } | Self::Timeout(_) | Self::Disconnected(_)
        )
    }
}

/// Browser automation primitives. Implementations must isolate contexts from
/// each other (separate cookie jars and storage).
#[async_trait]
pub trait BrowserCapability: Send + Sync + fmt::Debug {
    /// Open a new isolated context with empty storage.
    async fn open(&self, options: &ContextOptions) -> Result<ContextRef, BrowserError>;

    /// Load cookies and local storage into a context before its first navigation.
    async fn restore_state(
        &self,
        ctx: ContextRef,
        snapshot: &StorageSnapshot,
    ) -> Result<(), BrowserError>;

    /// Cookies and local storage of a context, as they are now.
    async fn export_state(&self, ctx: ContextRef) -> Result<StorageSnapshot, BrowserError>;

    /// Load `url` and wait for the page to finish loading.
    async fn navigate(&self, ctx: ContextRef, url: &str) -> Result<(), BrowserError>;

    /// URL after any redirects.
    async fn current_url(&self, ctx: ContextRef) -> Result<String, BrowserError>;

    /// Type `value` into the element matched by `selector`.
    async fn fill(
        &self,
        ctx: ContextRef,
        selector: &Selector,
        value: &str,
    ) -> Result<(), BrowserError>;

    /// Click the element matched by `selector`.
    async fn click(&self, ctx: ContextRef, selector: &Selector) -> Result<(), BrowserError>;

    /// `Ok(false)` when the element did not appear within `timeout`.
    async fn wait_for_element(
        &self,
        ctx: ContextRef,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<bool, BrowserError>;

    /// Case-insensitive search of the page text, iframes included.
    async fn page_contains_text(&self, ctx: ContextRef, needle: &str)
    -> Result<bool, BrowserError>;

    /// Close a context and discard its storage.
    async fn close(&self, ctx: ContextRef) -> Result<(), BrowserError>;
}

/// One open context bound to the capability that owns it.
#[derive(Clone)]
pub struct BrowserContext {
    browser: Arc<dyn BrowserCapability>,
    id: ContextRef,
    broker: BrokerIdentity,
    step_timeout: Duration,
}

impl fmt::Debug for BrowserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserContext")
            .field("id", &self.id)
            .field("broker", &self.broker)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

impl BrowserContext {
    /// Open a context on `browser`, bounded by `step_timeout`.
    pub async fn open(
        browser: Arc<dyn BrowserCapability>,
        options: &ContextOptions,
        step_timeout: Duration,
    ) -> Result<Self, BrowserError> {
        let id = bounded(step_timeout, "open context", browser.open(options)).await?;
        trace!(broker = %options.broker, context = %id, "browser context opened");
        Ok(Self {
            browser,
            id,
            broker: options.broker,
            step_timeout,
        })
    }

    /// Reference the capability knows this context by.
    pub fn id(&self) -> ContextRef {
        self.id
    }

    /// Broker the context was opened for.
    pub fn broker(&self) -> BrokerIdentity {
        self.broker
    }

    /// Timeout applied to every primitive on this context.
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// See [`BrowserCapability::restore_state`].
    pub async fn restore_state(&self, snapshot: &StorageSnapshot) -> Result<(), BrowserError> {
        bounded(
            self.step_timeout,
            "restore state",
            self.browser.restore_state(self.id, snapshot),
        )
        .await
    }

    /// See [`BrowserCapability::export_state`].
    pub async fn export_state(&self) -> Result<StorageSnapshot, BrowserError> {
        bounded(self.step_timeout, "export state", self.browser.export_state(self.id)).await
    }

    /// See [`BrowserCapability::navigate`].
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        trace!(broker = %self.broker, context = %self.id, url, "navigate");
        bounded(self.step_timeout, url, self.browser.navigate(self.id, url)).await
    }

    /// See [`BrowserCapability::current_url`].
    pub async fn current_url(&self) -> Result<String, BrowserError> {
        bounded(self.step_timeout, "current url", self.browser.current_url(self.id)).await
    }

    /// See [`BrowserCapability::fill`].
    pub async fn fill(&self, selector: &Selector, value: &str) -> Result<(), BrowserError> {
        bounded(
            self.step_timeout,
            "fill",
            self.browser.fill(self.id, selector, value),
        )
        .await
    }

    /// See [`BrowserCapability::click`].
    pub async fn click(&self, selector: &Selector) -> Result<(), BrowserError> {
        bounded(self.step_timeout, "click", self.browser.click(self.id, selector)).await
    }

    /// Waits at most `timeout`, never longer than the step timeout.
    pub async fn wait_for_element(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<bool, BrowserError> {
        let timeout = timeout.min(self.step_timeout);
        let outer = timeout + Duration::from_secs(1);
        bounded(
            outer,
            "wait for element",
            self.browser.wait_for_element(self.id, selector, timeout),
        )
        .await
    }

    /// See [`BrowserCapability::page_contains_text`].
    pub async fn page_contains_text(&self, needle: &str) -> Result<bool, BrowserError> {
        bounded(
            self.step_timeout,
            "page text",
            self.browser.page_contains_text(self.id, needle),
        )
        .await
    }

    /// Close the context. Errors are logged, not returned; a context that
    /// failed to close is not retried.
    pub async fn close(&self) {
        match bounded(self.step_timeout, "close", self.browser.close(self.id)).await {
            Ok(()) => trace!(broker = %self.broker, context = %self.id, "browser context closed"),
            Err(err) => {
                warn!(broker = %self.broker, context = %self.id, error = %err, "failed to close browser context")
            }
        }
    }
}

async fn bounded<T, F>(limit: Duration, step: &str, fut: F) -> Result<T, BrowserError>
where
    F: std::future::Future<Output = Result<T, BrowserError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrowserError::Timeout(format!(
            "{step} exceeded {}ms",
            limit.as_millis()
        ))),
    }
}
