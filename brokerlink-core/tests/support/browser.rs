use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use brokerlink_core::browser::{
    BrowserCapability, BrowserError, ContextOptions, ContextRef, Cookie, Selector,
    StorageSnapshot,
};
use brokerlink_core::model::BrokerIdentity;
use parking_lot::Mutex;

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug)]
struct FakeContext {
    broker: BrokerIdentity,
    snapshot: StorageSnapshot,
    url: String,
}

#[derive(Debug, Default)]
struct BrowserState {
    contexts: HashMap<ContextRef, FakeContext>,
    open_now: HashMap<BrokerIdentity, usize>,
    peak: HashMap<BrokerIdentity, usize>,
    opened: HashMap<BrokerIdentity, usize>,
}

/// In-memory browser. Contexts only hold a storage snapshot and a URL; the
/// counters let tests check for leaked or overlapping contexts.
#[derive(Debug, Default)]
pub struct FakeBrowser {
    state: Mutex<BrowserState>,
    open_failures: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` opens fail with a transient disconnect.
    pub fn fail_next_opens(&self, count: usize) {
        self.open_failures.store(count, Ordering::SeqCst);
    }

    pub fn open_contexts(&self, broker: BrokerIdentity) -> usize {
        self.state.lock().open_now.get(&broker).copied().unwrap_or(0)
    }

    pub fn total_open(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Highest number of simultaneously open contexts seen for `broker`.
    pub fn peak_contexts(&self, broker: BrokerIdentity) -> usize {
        self.state.lock().peak.get(&broker).copied().unwrap_or(0)
    }

    pub fn opened(&self, broker: BrokerIdentity) -> usize {
        self.state.lock().opened.get(&broker).copied().unwrap_or(0)
    }

    pub fn set_session_cookie(&self, ctx: ContextRef, token: &str) {
        if let Some(context) = self.state.lock().contexts.get_mut(&ctx) {
            context.snapshot = Self::session_snapshot(context.broker, token);
        }
    }

    pub fn session_snapshot(broker: BrokerIdentity, token: &str) -> StorageSnapshot {
        StorageSnapshot {
            cookies: vec![Cookie {
                name: SESSION_COOKIE.to_string(),
                value: token.to_string(),
                domain: format!(".{}.example", broker.as_str()),
                path: "/".to_string(),
                expires: -1.0,
                http_only: true,
                secure: true,
                same_site: None,
            }],
            origins: Vec::new(),
        }
    }

    pub fn session_token(snapshot: &StorageSnapshot) -> Option<&str> {
        snapshot
            .cookies
            .iter()
            .find(|cookie| cookie.name == SESSION_COOKIE)
            .map(|cookie| cookie.value.as_str())
    }

    fn with_context<T>(
        &self,
        ctx: ContextRef,
        f: impl FnOnce(&mut FakeContext) -> T,
    ) -> Result<T, BrowserError> {
        let mut state = self.state.lock();
        let context = state
            .contexts
            .get_mut(&ctx)
            .ok_or(BrowserError::ContextClosed(ctx))?;
        Ok(f(context))
    }
}

#[async_trait]
impl BrowserCapability for FakeBrowser {
    async fn open(&self, options: &ContextOptions) -> Result<ContextRef, BrowserError> {
        let pending = self.open_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.open_failures.store(pending - 1, Ordering::SeqCst);
            return Err(BrowserError::Disconnected("browser restarting".into()));
        }

        let id = ContextRef::new();
        let mut state = self.state.lock();
        state.contexts.insert(
            id,
            FakeContext {
                broker: options.broker,
                snapshot: StorageSnapshot::default(),
                url: "about:blank".to_string(),
            },
        );
        let open_now = {
            let open = state.open_now.entry(options.broker).or_default();
            *open += 1;
            *open
        };
        let peak = state.peak.entry(options.broker).or_default();
        *peak = (*peak).max(open_now);
        *state.opened.entry(options.broker).or_default() += 1;
        Ok(id)
    }

    async fn restore_state(
        &self,
        ctx: ContextRef,
        snapshot: &StorageSnapshot,
    ) -> Result<(), BrowserError> {
        self.with_context(ctx, |context| context.snapshot = snapshot.clone())
    }

    async fn export_state(&self, ctx: ContextRef) -> Result<StorageSnapshot, BrowserError> {
        self.with_context(ctx, |context| context.snapshot.clone())
    }

    async fn navigate(&self, ctx: ContextRef, url: &str) -> Result<(), BrowserError> {
        self.with_context(ctx, |context| context.url = url.to_string())
    }

    async fn current_url(&self, ctx: ContextRef) -> Result<String, BrowserError> {
        self.with_context(ctx, |context| context.url.clone())
    }

    async fn fill(
        &self,
        ctx: ContextRef,
        _selector: &Selector,
        _value: &str,
    ) -> Result<(), BrowserError> {
        self.with_context(ctx, |_| ())
    }

    async fn click(&self, ctx: ContextRef, _selector: &Selector) -> Result<(), BrowserError> {
        self.with_context(ctx, |_| ())
    }

    async fn wait_for_element(
        &self,
        ctx: ContextRef,
        _selector: &Selector,
        _timeout: Duration,
    ) -> Result<bool, BrowserError> {
        self.with_context(ctx, |_| true)
    }

    async fn page_contains_text(
        &self,
        ctx: ContextRef,
        _needle: &str,
    ) -> Result<bool, BrowserError> {
        self.with_context(ctx, |_| false)
    }

    async fn close(&self, ctx: ContextRef) -> Result<(), BrowserError> {
        let mut state = self.state.lock();
        let context = state
            .contexts
            .remove(&ctx)
            .ok_or(BrowserError::ContextClosed(ctx))?;
        if let Some(open) = state.open_now.get_mut(&context.broker) {
            *open = open.saturating_sub(1);
        }
        Ok(())
    }
}
