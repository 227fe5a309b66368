//! Table-driven adapter: one [`BrokerProfile`] per broker, one driver for all.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brokerlink_model::{BrokerIdentity, ChallengeKind, PortfolioSnapshot, TwoFactorChallenge};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    AdapterError, BrokerAdapter, LoginOutcome, PortfolioExtractor, SessionProbe, TwoFactorOutcome,
};
use crate::browser::{BrowserContext, BrowserError, Selector};
use crate::vault::Credential;

const FORM_WAIT: Duration = Duration::from_secs(15);
const FALLBACK_WAIT: Duration = Duration::from_secs(1);
const MARKER_WAIT: Duration = Duration::from_millis(250);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a broker asks for and accepts a second factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoFactorProfile {
    /// Kind of challenge this broker raises.
    pub kind: ChallengeKind,
    /// Page text (lowercase) that means a challenge is showing.
    pub markers: &'static [&'static str],
    /// Candidate selectors for the code field, tried in order.
    pub code_inputs: &'static [&'static str],
    /// Candidate selectors for the button that submits the code.
    pub code_submits: &'static [&'static str],
    /// Page text shown after a wrong code.
    pub rejection_markers: &'static [&'static str],
}

/// Static description of one broker's login pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerProfile {
    /// Broker the profile describes.
    pub broker: BrokerIdentity,
    /// Sign-in page.
    pub login_url: &'static str,
    /// Holdings page. Also used as the session probe target.
    pub portfolio_url: &'static str,
    /// Iframe hosting the login form, if any.
    pub login_frame: Option<&'static str>,
    /// Candidate selectors, tried in order.
    pub username_selectors: &'static [&'static str],
    /// Candidate selectors for the password field.
    pub password_selectors: &'static [&'static str],
    /// Candidate selectors for the sign-in button.
    pub submit_selectors: &'static [&'static str],
    /// URL fragments (matched against the lowercase URL without its query)
    /// only reachable when logged in.
    pub authenticated_url_markers: &'static [&'static str],
    /// Element only present when logged in, for brokers whose URLs do not tell.
    pub authenticated_element: Option<&'static str>,
    /// URL fragments of the sign-in pages.
    pub login_url_markers: &'static [&'static str],
    /// Page text shown when the broker refuses the credentials.
    pub rejection_markers: &'static [&'static str],
    /// How the broker asks for a second factor.
    pub two_factor: TwoFactorProfile,
}

/// Drives a [`BrokerProfile`] through the browser primitives.
pub struct ProfileAdapter {
    profile: BrokerProfile,
    extractor: Arc<dyn PortfolioExtractor>,
}

impl fmt::Debug for ProfileAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileAdapter")
            .field("broker", &self.profile.broker)
            .field("extractor", &self.extractor)
            .finish()
    }
}

fn url_path(url: &str) -> String {
    let without_query = match url.split_once('?') {
        Some((head, _)) => head,
        None => url,
    };
    without_query.to_ascii_lowercase()
}

impl ProfileAdapter {
    /// Adapter for `profile` that hands the holdings page to `extractor`.
    pub fn new(profile: BrokerProfile, extractor: Arc<dyn PortfolioExtractor>) -> Self {
        Self { profile, extractor }
    }

    /// The profile this adapter drives.
    pub fn profile(&self) -> &BrokerProfile {
        &self.profile
    }

    fn selector(&self, css: &str) -> Selector {
        let selector = Selector::css(css);
        match self.profile.login_frame {
            Some(frame) => selector.in_frame(frame),
            None => selector,
        }
    }

    async fn navigate(&self, ctx: &BrowserContext, url: &str) -> Result<(), AdapterError> {
        ctx.navigate(url)
            .await
            .map_err(|source| AdapterError::Navigation {
                url: url.to_string(),
                source,
            })
    }

    /// First candidate selector present on the page.
    async fn first_present(
        &self,
        ctx: &BrowserContext,
        candidates: &[&str],
        what: &str,
    ) -> Result<Selector, AdapterError> {
        for (idx, css) in candidates.iter().enumerate() {
            let selector = self.selector(css);
            let wait = if idx == 0 { FORM_WAIT } else { FALLBACK_WAIT };
            if ctx.wait_for_element(&selector, wait).await? {
                if idx > 0 {
                    debug!(broker = %self.profile.broker, %selector, "{what} found via fallback selector");
                }
                return Ok(selector);
            }
        }

        let url = ctx.current_url().await.unwrap_or_default();
        let selector = candidates.join(", ");
        error!(
            broker = %self.profile.broker,
            field = what,
            %selector,
            %url,
            "broker layout changed: no candidate selector matched"
        );
        Err(AdapterError::LayoutChanged { selector, url })
    }

    async fn is_authenticated(&self, ctx: &BrowserContext) -> Result<bool, AdapterError> {
        let path = url_path(&ctx.current_url().await?);
        if self
            .profile
            .authenticated_url_markers
            .iter()
            .any(|marker| path.contains(marker))
        {
            return Ok(true);
        }
        if let Some(css) = self.profile.authenticated_element {
            return Ok(ctx.wait_for_element(&Selector::css(css), MARKER_WAIT).await?);
        }
        Ok(false)
    }

    async fn first_text_match(
        &self,
        ctx: &BrowserContext,
        markers: &[&'static str],
    ) -> Result<Option<&'static str>, AdapterError> {
        for marker in markers {
            if ctx.page_contains_text(marker).await? {
                return Ok(Some(*marker));
            }
        }
        Ok(None)
    }

    async fn detect_challenge(
        &self,
        ctx: &BrowserContext,
    ) -> Result<Option<TwoFactorChallenge>, AdapterError> {
        let two_factor = &self.profile.two_factor;
        let Some(marker) = self.first_text_match(ctx, two_factor.markers).await? else {
            return Ok(None);
        };
        let prompt = match two_factor.kind {
            ChallengeKind::PushApproval => format!(
                "{}: {marker}. Approve the sign-in on your device, then resume.",
                self.profile.broker.display_name()
            ),
            _ => format!(
                "{}: {marker}. Enter the {} sent by the broker.",
                self.profile.broker.display_name(),
                two_factor.kind
            ),
        };
        Ok(Some(TwoFactorChallenge::new(
            self.profile.broker,
            two_factor.kind.clone(),
            prompt,
        )))
    }

    /// Error for a page that showed no known marker within the step timeout.
    async fn unsettled(&self, ctx: &BrowserContext, after: &str) -> AdapterError {
        let url = ctx.current_url().await.unwrap_or_default();
        warn!(broker = %self.profile.broker, %url, "page did not settle after {after}");
        BrowserError::Timeout(format!(
            "no recognisable page after {after} within {}s (stopped at {url})",
            ctx.step_timeout().as_secs()
        ))
        .into()
    }

    /// Poll after submitting the login form until the page settles.
    async fn await_login_result(&self, ctx: &BrowserContext) -> Result<LoginOutcome, AdapterError> {
        let deadline = Instant::now() + ctx.step_timeout();
        loop {
            if let Some(challenge) = self.detect_challenge(ctx).await? {
                info!(broker = %self.profile.broker, kind = %challenge.kind, "two-factor challenge detected");
                return Ok(LoginOutcome::TwoFactorRequired(challenge));
            }
            if self.is_authenticated(ctx).await? {
                return Ok(LoginOutcome::Success);
            }
            if let Some(marker) = self
                .first_text_match(ctx, self.profile.rejection_markers)
                .await?
            {
                return Ok(LoginOutcome::Rejected(format!("broker reported: {marker}")));
            }
            if Instant::now() >= deadline {
                return Err(self.unsettled(ctx, "login").await);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn await_code_result(
        &self,
        ctx: &BrowserContext,
    ) -> Result<TwoFactorOutcome, AdapterError> {
        let deadline = Instant::now() + ctx.step_timeout();
        loop {
            if self.is_authenticated(ctx).await? {
                return Ok(TwoFactorOutcome::Accepted);
            }
            if let Some(marker) = self
                .first_text_match(ctx, self.profile.two_factor.rejection_markers)
                .await?
            {
                return Ok(TwoFactorOutcome::Rejected(format!("broker reported: {marker}")));
            }
            if Instant::now() >= deadline {
                return Err(self.unsettled(ctx, "two-factor submission").await);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BrokerAdapter for ProfileAdapter {
    fn broker(&self) -> BrokerIdentity {
        self.profile.broker
    }

    async fn probe_validity(&self, ctx: &BrowserContext) -> Result<SessionProbe, AdapterError> {
        self.navigate(ctx, self.profile.portfolio_url).await?;

        if self.is_authenticated(ctx).await? {
            return Ok(SessionProbe::Valid);
        }
        let path = url_path(&ctx.current_url().await?);
        if self
            .profile
            .login_url_markers
            .iter()
            .any(|marker| path.contains(marker))
        {
            return Ok(SessionProbe::Invalid);
        }
        Ok(SessionProbe::Unknown)
    }

    async fn login(
        &self,
        ctx: &BrowserContext,
        credential: &Credential,
    ) -> Result<LoginOutcome, AdapterError> {
        let profile = &self.profile;
        self.navigate(ctx, profile.login_url).await?;

        if self.is_authenticated(ctx).await? {
            debug!(broker = %profile.broker, "login page redirected to an authenticated page");
            return Ok(LoginOutcome::Success);
        }

        if let Some(frame) = profile.login_frame
            && !ctx.wait_for_element(&Selector::css(frame), FORM_WAIT).await?
        {
            let url = ctx.current_url().await.unwrap_or_default();
            error!(broker = %profile.broker, selector = frame, %url, "broker layout changed: login frame missing");
            return Err(AdapterError::LayoutChanged {
                selector: frame.to_string(),
                url,
            });
        }

        let username = self
            .first_present(ctx, profile.username_selectors, "username field")
            .await?;
        let password = self
            .first_present(ctx, profile.password_selectors, "password field")
            .await?;
        let secret = credential
            .secret
            .expose_str()
            .ok_or(AdapterError::InvalidCredential(profile.broker))?;

        ctx.fill(&username, &credential.username).await?;
        ctx.fill(&password, secret).await?;

        let submit = self
            .first_present(ctx, profile.submit_selectors, "login button")
            .await?;
        ctx.click(&submit).await?;
        debug!(broker = %profile.broker, "login form submitted");

        self.await_login_result(ctx).await
    }

    async fn submit_two_factor(
        &self,
        ctx: &BrowserContext,
        code: &str,
    ) -> Result<TwoFactorOutcome, AdapterError> {
        let two_factor = &self.profile.two_factor;
        if !two_factor.kind.expects_code() {
            // Approval happens out of band; resuming just re-checks the page.
            if self.is_authenticated(ctx).await? {
                return Ok(TwoFactorOutcome::Accepted);
            }
            return Ok(TwoFactorOutcome::Rejected("approval not yet confirmed".into()));
        }

        let input = self
            .first_present(ctx, two_factor.code_inputs, "two-factor code field")
            .await?;
        ctx.fill(&input, code).await?;
        let submit = self
            .first_present(ctx, two_factor.code_submits, "two-factor submit button")
            .await?;
        ctx.click(&submit).await?;

        self.await_code_result(ctx).await
    }

    async fn extract(&self, ctx: &BrowserContext) -> Result<PortfolioSnapshot, AdapterError> {
        self.navigate(ctx, self.profile.portfolio_url).await?;
        let holdings = self
            .extractor
            .extract_holdings(self.profile.broker, ctx)
            .await?;
        info!(broker = %self.profile.broker, holdings = holdings.len(), "portfolio extracted");
        Ok(PortfolioSnapshot::new(self.profile.broker, holdings))
    }
}
