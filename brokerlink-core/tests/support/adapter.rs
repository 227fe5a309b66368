use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use brokerlink_core::adapter::{
    AdapterError, BrokerAdapter, LoginOutcome, SessionProbe, TwoFactorOutcome,
};
use brokerlink_core::browser::{BrowserContext, BrowserError};
use brokerlink_core::model::{
    BrokerIdentity, ChallengeKind, Holding, PortfolioSnapshot, TwoFactorChallenge,
};
use brokerlink_core::vault::Credential;
use parking_lot::Mutex;
use uuid::Uuid;

use super::browser::FakeBrowser;

/// What the next `login` call does.
#[derive(Debug, Clone)]
pub enum LoginStep {
    Success,
    TwoFactor(ChallengeKind),
    Reject(&'static str),
    Error(BrowserError),
    LayoutChanged,
}

/// Adapter whose broker side is a single accepted session token. Login and
/// two-factor success hand the context a fresh token; the probe checks the
/// context's cookie against it.
#[derive(Debug)]
pub struct ScriptedAdapter {
    broker: BrokerIdentity,
    browser: Arc<FakeBrowser>,
    accepted_token: Mutex<Option<String>>,
    login_script: Mutex<VecDeque<LoginStep>>,
    probe_override: Mutex<Option<SessionProbe>>,
    expected_code: Mutex<String>,
    login_delay: Mutex<Duration>,
    submit_delay: Mutex<Duration>,
    holdings: Mutex<Vec<Holding>>,
    fail_extraction: AtomicBool,
    last_username: Mutex<Option<String>>,
    logins: AtomicUsize,
    probes: AtomicUsize,
    submissions: AtomicUsize,
    extractions: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(broker: BrokerIdentity, browser: Arc<FakeBrowser>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            browser,
            accepted_token: Mutex::new(None),
            login_script: Mutex::new(VecDeque::new()),
            probe_override: Mutex::new(None),
            expected_code: Mutex::new(super::TEST_CODE.to_string()),
            login_delay: Mutex::new(Duration::ZERO),
            submit_delay: Mutex::new(Duration::ZERO),
            holdings: Mutex::new(Vec::new()),
            fail_extraction: AtomicBool::new(false),
            last_username: Mutex::new(None),
            logins: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            extractions: AtomicUsize::new(0),
        })
    }

    /// Start a broker-side session and return its token.
    pub fn issue_token(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        *self.accepted_token.lock() = Some(token.clone());
        token
    }

    /// The broker forgets every session.
    pub fn revoke_sessions(&self) {
        *self.accepted_token.lock() = None;
    }

    pub fn accepted_token(&self) -> Option<String> {
        self.accepted_token.lock().clone()
    }

    pub fn script_login(&self, steps: impl IntoIterator<Item = LoginStep>) {
        self.login_script.lock().extend(steps);
    }

    pub fn set_probe_override(&self, probe: Option<SessionProbe>) {
        *self.probe_override.lock() = probe;
    }

    pub fn set_expected_code(&self, code: &str) {
        *self.expected_code.lock() = code.to_string();
    }

    pub fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock() = delay;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock() = delay;
    }

    pub fn set_holdings(&self, holdings: Vec<Holding>) {
        *self.holdings.lock() = holdings;
    }

    pub fn fail_extraction(&self, fail: bool) {
        self.fail_extraction.store(fail, Ordering::SeqCst);
    }

    pub fn last_username(&self) -> Option<String> {
        self.last_username.lock().clone()
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }

    fn grant(&self, ctx: &BrowserContext) {
        let token = self.issue_token();
        self.browser.set_session_cookie(ctx.id(), &token);
    }

    fn login_url(&self) -> String {
        format!("https://{}.example/login", self.broker.as_str())
    }
}

#[async_trait]
impl BrokerAdapter for ScriptedAdapter {
    fn broker(&self) -> BrokerIdentity {
        self.broker
    }

    async fn probe_validity(&self, ctx: &BrowserContext) -> Result<SessionProbe, AdapterError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(probe) = *self.probe_override.lock() {
            return Ok(probe);
        }

        let snapshot = ctx.export_state().await?;
        let accepted = self.accepted_token.lock().clone();
        match (FakeBrowser::session_token(&snapshot), accepted) {
            (Some(token), Some(accepted)) if token == accepted => Ok(SessionProbe::Valid),
            _ => Ok(SessionProbe::Invalid),
        }
    }

    async fn login(
        &self,
        ctx: &BrowserContext,
        credential: &Credential,
    ) -> Result<LoginOutcome, AdapterError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        *self.last_username.lock() = Some(credential.username.clone());

        let delay = *self.login_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ctx.navigate(&self.login_url()).await?;

        let step = self
            .login_script
            .lock()
            .pop_front()
            .unwrap_or(LoginStep::Success);
        match step {
            LoginStep::Success => {
                self.grant(ctx);
                Ok(LoginOutcome::Success)
            }
            LoginStep::TwoFactor(kind) => Ok(LoginOutcome::TwoFactorRequired(
                TwoFactorChallenge::new(self.broker, kind, "Enter the code sent to your phone"),
            )),
            LoginStep::Reject(reason) => Ok(LoginOutcome::Rejected(reason.to_string())),
            LoginStep::Error(err) => Err(err.into()),
            LoginStep::LayoutChanged => Err(AdapterError::LayoutChanged {
                selector: "#USER".to_string(),
                url: self.login_url(),
            }),
        }
    }

    async fn submit_two_factor(
        &self,
        ctx: &BrowserContext,
        code: &str,
    ) -> Result<TwoFactorOutcome, AdapterError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let delay = *self.submit_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if code == self.expected_code.lock().as_str() {
            self.grant(ctx);
            Ok(TwoFactorOutcome::Accepted)
        } else {
            Ok(TwoFactorOutcome::Rejected(
                "code you entered is incorrect".to_string(),
            ))
        }
    }

    async fn extract(&self, _ctx: &BrowserContext) -> Result<PortfolioSnapshot, AdapterError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        if self.fail_extraction.load(Ordering::SeqCst) {
            return Err(AdapterError::Extraction("positions table missing".into()));
        }
        Ok(PortfolioSnapshot::new(self.broker, self.holdings.lock().clone()))
    }
}
