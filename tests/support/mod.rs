#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use polaroo_scout::config::{BrowserConfig, Settings};
use polaroo_scout::scrapers::{
    BoundingBox, BrowserLauncher, DomQuery, ElementHandle, Locator, PageDriver, RawDownload,
};

pub const LOGIN_URL: &str = "https://app.polaroo.com/login";
pub const DASHBOARD_URL: &str = "https://app.polaroo.com/dashboard";

pub type Matcher = Arc<dyn Fn(&DomQuery) -> bool + Send + Sync>;

/// Something the engine did to the page
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Goto(String),
    Click(String),
    ClickAt(f64, f64),
    Focus(String),
    Key(String),
    Fill(String, String),
    Headers(String),
    ArmDownload,
    ScrollTop,
    Close,
}

/// What the page looks like after a `goto`
#[derive(Debug, Clone)]
pub struct Landing {
    pub url: String,
    pub status: Option<u16>,
    pub html: String,
}

impl Landing {
    pub fn at(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: Some(200),
            html: "<html><body></body></html>".to_string(),
        }
    }

    pub fn blocked(url: &str, status: u16) -> Self {
        Self {
            url: url.to_string(),
            status: Some(status),
            html: "<html><title>Just a moment...</title></html>".to_string(),
        }
    }
}

#[derive(Clone)]
struct Rule {
    matcher: Matcher,
    ids: Vec<String>,
}

enum Effect {
    SetUrl(String),
    Reveal(Rule),
    Download(RawDownload),
    Fail(String),
}

#[derive(Default)]
struct State {
    url: String,
    status: Option<u16>,
    html: String,
    landings: VecDeque<Landing>,
    rules: Vec<Rule>,
    texts: HashMap<String, String>,
    attributes: HashMap<(String, String), String>,
    outer: HashMap<String, String>,
    boxes: HashMap<String, BoundingBox>,
    on_click: HashMap<String, Vec<Effect>>,
    pending_download: Option<RawDownload>,
    actions: Vec<Action>,
    queries: Vec<DomQuery>,
    goto_delay: Duration,
    crashed: Option<String>,
}

/// Scripted page: elements exist when a registered rule matches the query
pub struct FakePage {
    state: Mutex<State>,
}

impl FakePage {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                url: url.to_string(),
                status: Some(200),
                html: "<html><body></body></html>".to_string(),
                ..Default::default()
            }),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Elements returned for every query accepted by `matcher`
    pub fn on<F>(&self, matcher: F, ids: &[&str])
    where
        F: Fn(&DomQuery) -> bool + Send + Sync + 'static,
    {
        let rule = Rule {
            matcher: Arc::new(matcher),
            ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        self.with_state(|s| s.rules.push(rule));
    }

    /// Elements that only appear once `clicked` has been clicked
    pub fn reveal_on_click<F>(&self, clicked: &str, matcher: F, ids: &[&str])
    where
        F: Fn(&DomQuery) -> bool + Send + Sync + 'static,
    {
        let rule = Rule {
            matcher: Arc::new(matcher),
            ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        self.with_state(|s| {
            s.on_click
                .entry(clicked.to_string())
                .or_default()
                .push(Effect::Reveal(rule))
        });
    }

    pub fn url_on_click(&self, clicked: &str, url: &str) {
        self.with_state(|s| {
            s.on_click
                .entry(clicked.to_string())
                .or_default()
                .push(Effect::SetUrl(url.to_string()))
        });
    }

    /// Clicking `clicked` starts a download of `name`
    pub fn download_on_click(&self, clicked: &str, name: &str, bytes: &[u8]) {
        let raw = RawDownload {
            suggested_name: name.to_string(),
            bytes: bytes.to_vec(),
        };
        self.with_state(|s| {
            s.on_click
                .entry(clicked.to_string())
                .or_default()
                .push(Effect::Download(raw))
        });
    }

    pub fn fail_on_click(&self, clicked: &str, reason: &str) {
        self.with_state(|s| {
            s.on_click
                .entry(clicked.to_string())
                .or_default()
                .push(Effect::Fail(reason.to_string()))
        });
    }

    /// Queue the result of the next `goto`; with no queued landing the URL is kept as requested
    pub fn land(&self, landing: Landing) {
        self.with_state(|s| s.landings.push_back(landing));
    }

    /// Every `goto` takes this long to settle, keeping the session busy
    pub fn set_goto_delay(&self, delay: Duration) {
        self.with_state(|s| s.goto_delay = delay);
    }

    /// Element queries fail from now on, as if the tab had gone away
    pub fn crash(&self, reason: &str) {
        self.with_state(|s| s.crashed = Some(reason.to_string()));
    }

    pub fn set_url(&self, url: &str) {
        self.with_state(|s| s.url = url.to_string());
    }

    pub fn set_text(&self, id: &str, text: &str) {
        self.with_state(|s| {
            s.texts.insert(id.to_string(), text.to_string());
        });
    }

    pub fn set_attribute(&self, id: &str, name: &str, value: &str) {
        self.with_state(|s| {
            s.attributes
                .insert((id.to_string(), name.to_string()), value.to_string());
        });
    }

    pub fn set_outer_html(&self, id: &str, html: &str) {
        self.with_state(|s| {
            s.outer.insert(id.to_string(), html.to_string());
        });
    }

    pub fn set_box(&self, id: &str, bbox: BoundingBox) {
        self.with_state(|s| {
            s.boxes.insert(id.to_string(), bbox);
        });
    }

    pub fn actions(&self) -> Vec<Action> {
        self.with_state(|s| s.actions.clone())
    }

    pub fn queries(&self) -> Vec<DomQuery> {
        self.with_state(|s| s.queries.clone())
    }

    pub fn clicks(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Click(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Fill(id, text) => Some((id, text)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, action: Action) {
        self.with_state(|s| s.actions.push(action));
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str) -> Result<()> {
        let delay = self.with_state(|s| {
            s.actions.push(Action::Goto(url.to_string()));
            match s.landings.pop_front() {
                Some(landing) => {
                    s.url = landing.url;
                    s.status = landing.status;
                    s.html = landing.html;
                }
                None => s.url = url.to_string(),
            }
            s.goto_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.with_state(|s| s.url.clone()))
    }

    async fn response_status(&self) -> Result<Option<u16>> {
        Ok(self.with_state(|s| s.status))
    }

    async fn content(&self) -> Result<String> {
        Ok(self.with_state(|s| s.html.clone()))
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>> {
        let query = locator.to_query();
        if let Some(reason) = self.with_state(|s| s.crashed.clone()) {
            bail!("{}", reason);
        }
        Ok(self.with_state(|s| {
            s.queries.push(query.clone());
            s.rules
                .iter()
                .find(|rule| (rule.matcher)(&query))
                .map(|rule| rule.ids.iter().map(ElementHandle::new).collect())
                .unwrap_or_default()
        }))
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        let id = element.id().to_string();
        let effects = self.with_state(|s| {
            s.actions.push(Action::Click(id.clone()));
            s.on_click.get(&id).map(|effects| {
                effects
                    .iter()
                    .map(|e| match e {
                        Effect::SetUrl(url) => Effect::SetUrl(url.clone()),
                        Effect::Reveal(rule) => Effect::Reveal(rule.clone()),
                        Effect::Download(raw) => Effect::Download(raw.clone()),
                        Effect::Fail(reason) => Effect::Fail(reason.clone()),
                    })
                    .collect::<Vec<_>>()
            })
        });

        for effect in effects.unwrap_or_default() {
            match effect {
                Effect::SetUrl(url) => self.with_state(|s| s.url = url),
                Effect::Reveal(rule) => self.with_state(|s| s.rules.insert(0, rule)),
                Effect::Download(raw) => self.with_state(|s| s.pending_download = Some(raw)),
                Effect::Fail(reason) => bail!("{}", reason),
            }
        }
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        self.record(Action::ClickAt(x, y));
        Ok(())
    }

    async fn focus(&self, element: &ElementHandle) -> Result<()> {
        self.record(Action::Focus(element.id().to_string()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(Action::Key(key.to_string()));
        Ok(())
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<()> {
        self.record(Action::Fill(element.id().to_string(), text.to_string()));
        Ok(())
    }

    async fn text(&self, element: &ElementHandle) -> Result<String> {
        Ok(self.with_state(|s| s.texts.get(element.id()).cloned().unwrap_or_default()))
    }

    async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        Ok(self.with_state(|s| {
            s.attributes
                .get(&(element.id().to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn outer_html(&self, element: &ElementHandle) -> Result<String> {
        Ok(self.with_state(|s| s.outer.get(element.id()).cloned().unwrap_or_default()))
    }

    async fn bounding_box(&self, element: &ElementHandle) -> Result<Option<BoundingBox>> {
        Ok(self.with_state(|s| s.boxes.get(element.id()).copied()))
    }

    async fn scroll_to_top(&self) -> Result<()> {
        self.record(Action::ScrollTop);
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn set_request_headers(
        &self,
        user_agent: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<()> {
        self.record(Action::Headers(user_agent.to_string()));
        Ok(())
    }

    async fn arm_download(&self) -> Result<()> {
        self.with_state(|s| {
            s.actions.push(Action::ArmDownload);
            s.pending_download = None;
        });
        Ok(())
    }

    async fn wait_for_download(&self, timeout: Duration) -> Result<Option<RawDownload>> {
        if let Some(raw) = self.with_state(|s| s.pending_download.take()) {
            return Ok(Some(raw));
        }
        tokio::time::sleep(timeout).await;
        Ok(None)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG".to_vec())
    }

    async fn close(&self) -> Result<()> {
        self.record(Action::Close);
        Ok(())
    }
}

/// Hands out the same scripted page on every launch
pub struct FakeLauncher {
    page: Arc<FakePage>,
    launches: AtomicUsize,
    profiles: Mutex<Vec<PathBuf>>,
}

impl FakeLauncher {
    pub fn new(page: Arc<FakePage>) -> Arc<Self> {
        Arc::new(Self {
            page,
            launches: AtomicUsize::new(0),
            profiles: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, profile_dir: &Path, _config: &BrowserConfig) -> Result<Arc<dyn PageDriver>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.profiles.lock().unwrap().push(profile_dir.to_path_buf());
        let page: Arc<dyn PageDriver> = self.page.clone();
        Ok(page)
    }
}

/// Settings with no dwell so tests only wait where the engine polls
pub fn fast_settings(profile_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.browser.profile_dir = profile_dir.to_path_buf();
    settings.credentials.email = "ops@example.com".to_string();
    settings.credentials.password = "hunter2".to_string();
    settings.timing.step_wait_ms = 0;
    settings.timing.dropdown_wait_ms = 0;
    settings.timing.download_timeout_secs = 5;
    settings.archive.enabled = false;
    settings
}

pub fn plain(selector: &'static str) -> impl Fn(&DomQuery) -> bool + Send + Sync {
    move |q: &DomQuery| {
        q.selector == selector
            && q.parent.is_none()
            && q.scope.is_none()
            && q.exact.is_none()
            && q.contains.is_none()
            && q.pattern.is_none()
    }
}

pub fn exact(text: &'static str) -> impl Fn(&DomQuery) -> bool + Send + Sync {
    move |q: &DomQuery| q.exact.as_deref() == Some(text)
}

/// Dashboard page with the sidebar landmark present
pub fn logged_in_page() -> Arc<FakePage> {
    let page = FakePage::new(DASHBOARD_URL);
    page.land(Landing::at(DASHBOARD_URL));
    page.on(plain("nav, [role='navigation']"), &["sidebar"]);
    page
}
