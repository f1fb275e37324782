use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, Credentials, Settings, TargetConfig, TimingConfig};
use crate::error::{ExtractError, ExtractResult, Phase, PhaseContext};
use crate::extract::pacer::Pacer;
use crate::scrapers::{Located, Locator, PageDriver, StrategyChain};

/// Sidebar landmark that must exist on a dashboard page
pub const NAV_LANDMARK: &str = "nav, [role='navigation']";

const SUBMIT_PATTERN: &str =
    r"^\s*(sign in|log in|login|iniciar sesi[oó]n|entrar)\s*$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Submitting,
    Redirected,
    Blocked,
    TimedOut,
}

/// How authentication concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub state: AuthState,
    /// The login URL redirected straight past the form
    pub already_authenticated: bool,
    /// A bot-protection retry was needed
    pub retried: bool,
}

enum Attempt {
    Reached { already_authenticated: bool },
    Blocked(String),
}

/// Drives the login flow up to a confirmed dashboard page
pub struct Authenticator {
    target: TargetConfig,
    auth: AuthConfig,
    timing: TimingConfig,
    credentials: Credentials,
    pacer: Pacer,
}

impl Authenticator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            target: settings.target.clone(),
            auth: settings.auth.clone(),
            timing: settings.timing.clone(),
            credentials: settings.credentials(),
            pacer: Pacer::new(settings.timing.step_wait()),
        }
    }

    pub async fn authenticate(&self, page: &dyn PageDriver) -> ExtractResult<AuthOutcome> {
        let mut retried = false;
        loop {
            match self.attempt(page).await? {
                Attempt::Reached {
                    already_authenticated,
                } => {
                    return Ok(AuthOutcome {
                        state: AuthState::Redirected,
                        already_authenticated,
                        retried,
                    })
                }
                Attempt::Blocked(reason) => {
                    if retried || !self.auth.retry_on_block {
                        return Err(ExtractError::AuthenticationBlocked { reason });
                    }
                    warn!("Bot protection detected ({}), retrying once with adjusted headers", reason);
                    retried = true;
                    page.set_request_headers(&self.auth.retry_user_agent, &self.auth.retry_headers)
                        .await
                        .in_phase(Phase::Authentication)?;
                    tokio::time::sleep(self.auth.retry_delay()).await;
                }
            }
        }
    }

    async fn attempt(&self, page: &dyn PageDriver) -> ExtractResult<Attempt> {
        let mut state = AuthState::Unauthenticated;
        info!("Opening {}", self.target.login_url);
        page.goto(&self.target.login_url)
            .await
            .in_phase(Phase::Authentication)?;
        self.pacer.settle("after goto /login").await;

        if let Some(reason) = self.block_signal(page).await? {
            advance(&mut state, AuthState::Blocked);
            return Ok(Attempt::Blocked(reason));
        }

        let url = page.current_url().await.in_phase(Phase::Authentication)?;
        let already_authenticated = !url
            .to_lowercase()
            .contains(&self.target.login_marker.to_lowercase());

        if already_authenticated {
            info!("Session still valid, redirected to {}", url);
        } else {
            advance(&mut state, AuthState::Submitting);
            self.submit_credentials(page).await?;
            if let Some(reason) = self.block_signal(page).await? {
                advance(&mut state, AuthState::Blocked);
                return Ok(Attempt::Blocked(reason));
            }
        }

        match self.wait_for_dashboard(page).await {
            Ok(()) => {
                advance(&mut state, AuthState::Redirected);
                self.pacer.settle("post-login dashboard settle").await;
                Ok(Attempt::Reached {
                    already_authenticated,
                })
            }
            Err(e) => {
                advance(&mut state, AuthState::TimedOut);
                Err(e)
            }
        }
    }

    /// Poll until the URL carries the dashboard marker and the sidebar exists.
    /// Gives up after exactly `dashboard_poll_budget` polls.
    pub async fn wait_for_dashboard(&self, page: &dyn PageDriver) -> ExtractResult<()> {
        let landmark = Locator::css(NAV_LANDMARK);
        let budget = self.timing.dashboard_poll_budget;
        let mut last_url = String::new();

        for _ in 0..budget {
            last_url = page.current_url().await.in_phase(Phase::Authentication)?;
            if last_url.contains(&self.target.dashboard_marker)
                && page
                    .locate(&landmark)
                    .await
                    .in_phase(Phase::Authentication)?
                    .is_some()
            {
                page.wait_for_network_idle(self.timing.network_idle_timeout())
                    .await
                    .in_phase(Phase::Authentication)?;
                info!("Dashboard reached at {}", last_url);
                return Ok(());
            }
            tokio::time::sleep(self.timing.dashboard_poll()).await;
        }

        Err(ExtractError::DashboardNotReached {
            attempts: budget,
            url: last_url,
        })
    }

    async fn submit_credentials(&self, page: &dyn PageDriver) -> ExtractResult<()> {
        let email = self
            .wait_for_field(page, &email_chain())
            .await?;
        let password = password_chain()
            .resolve(page)
            .await
            .in_phase(Phase::Authentication)?;

        let (Some(email), Some(password)) = (email, password) else {
            warn!("Login page has no credential form, waiting for redirect");
            return Ok(());
        };

        debug!("Filling email field");
        page.fill(&email.element, &self.credentials.email)
            .await
            .in_phase(Phase::Authentication)?;
        debug!("Filling password field");
        page.fill(&password.element, self.credentials.password.expose_secret())
            .await
            .in_phase(Phase::Authentication)?;
        self.pacer.settle("after filling credentials").await;

        let button = submit_chain()
            .resolve(page)
            .await
            .in_phase(Phase::Authentication)?;
        let submitted = match button {
            Some(button) => page.click(&button.element).await,
            None => {
                debug!("No sign-in button, submitting with Enter");
                page.focus(&password.element).await.in_phase(Phase::Authentication)?;
                page.press_key("Enter").await
            }
        };
        submitted.in_phase(Phase::Authentication)?;

        page.wait_for_network_idle(self.timing.network_idle_timeout())
            .await
            .in_phase(Phase::Authentication)?;
        Ok(())
    }

    /// The form renders late on a cold profile; poll for it within the dashboard budget
    async fn wait_for_field(
        &self,
        page: &dyn PageDriver,
        chain: &StrategyChain,
    ) -> ExtractResult<Option<Located>> {
        for _ in 0..self.timing.dashboard_poll_budget {
            if let Some(found) = chain.resolve(page).await.in_phase(Phase::Authentication)? {
                return Ok(Some(found));
            }
            tokio::time::sleep(self.timing.dashboard_poll()).await;
        }
        Ok(None)
    }

    async fn block_signal(&self, page: &dyn PageDriver) -> ExtractResult<Option<String>> {
        if let Some(status) = page
            .response_status()
            .await
            .in_phase(Phase::Authentication)?
        {
            if self.auth.block_statuses.contains(&status) {
                return Ok(Some(format!("HTTP {}", status)));
            }
        }

        let html = page
            .content()
            .await
            .in_phase(Phase::Authentication)?
            .to_lowercase();
        Ok(self
            .auth
            .block_markers
            .iter()
            .find(|marker| html.contains(&marker.to_lowercase()))
            .map(|marker| format!("protection marker '{}'", marker)))
    }
}

fn advance(state: &mut AuthState, next: AuthState) {
    debug!("auth: {:?} -> {:?}", state, next);
    *state = next;
}

fn email_chain() -> StrategyChain {
    StrategyChain::new("email field")
        .with(Locator::css("input[placeholder='Email']"))
        .with(Locator::css("input[type='email']"))
        .with(Locator::css("input[name*='email' i], input[autocomplete='username']"))
}

fn password_chain() -> StrategyChain {
    StrategyChain::new("password field")
        .with(Locator::css("input[placeholder='Password']"))
        .with(Locator::css("input[type='password']"))
}

fn submit_chain() -> StrategyChain {
    StrategyChain::new("sign-in button")
        .with(Locator::role("button", "Sign in"))
        .with(Locator::pattern("button, input[type='submit']", SUBMIT_PATTERN))
        .with(Locator::css("button[type='submit'], input[type='submit']"))
}
