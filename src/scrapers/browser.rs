use crate::config::BrowserConfig;
use crate::scrapers::traits::{BrowserLauncher, PageDriver};
use crate::scrapers::types::{BoundingBox, ElementHandle, Locator, RawDownload};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Browser as BrowserProtocol;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const LAUNCH_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--no-first-run",
    "--no-default-browser-check",
];

const PARTIAL_SUFFIXES: &[&str] = &[".crdownload", ".tmp", ".part"];

/// Tags every visible match with `data-scout-id` and returns the ids in document order
const LOCATE_JS: &str = r#"
(() => {
    const q = __QUERY__;
    const visible = (el) => {
        const r = el.getBoundingClientRect();
        const s = window.getComputedStyle(el);
        return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
    };
    const text = (el) => (el.innerText || el.value || el.getAttribute('aria-label') || el.textContent || '').trim();
    let roots = [document];
    if (q.parent !== null) {
        roots = [document.querySelector('[data-scout-id="' + q.parent + '"]')].filter(Boolean);
    } else if (q.scope !== null) {
        roots = Array.from(document.querySelectorAll(q.scope));
    }
    const seen = new Set();
    let nodes = [];
    for (const root of roots) {
        for (const el of root.querySelectorAll(q.selector)) {
            if (!seen.has(el)) { seen.add(el); nodes.push(el); }
        }
    }
    if (q.exact !== null) nodes = nodes.filter((el) => text(el) === q.exact);
    if (q.contains !== null) {
        const needle = q.contains.toLowerCase();
        nodes = nodes.filter((el) => text(el).toLowerCase().includes(needle));
    }
    if (q.pattern !== null) {
        const re = new RegExp(q.pattern, 'i');
        nodes = nodes.filter((el) => re.test(text(el)));
    }
    nodes = nodes.filter(visible);
    window.__scoutSeq = window.__scoutSeq || 0;
    return JSON.stringify(nodes.map((el) => {
        if (!el.dataset.scoutId) el.dataset.scoutId = String(++window.__scoutSeq);
        return el.dataset.scoutId;
    }));
})()
"#;

/// Launches Chrome with a persistent profile directory
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher;

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(
        &self,
        profile_dir: &Path,
        config: &BrowserConfig,
    ) -> Result<Arc<dyn PageDriver>> {
        let profile_dir = profile_dir.to_path_buf();
        let config = config.clone();
        let page = tokio::task::spawn_blocking(move || ChromePage::launch(&profile_dir, &config))
            .await
            .context("Browser launch task panicked")??;
        Ok(Arc::new(page))
    }
}

/// `PageDriver` over a headless_chrome tab
pub struct ChromePage {
    // Dropping the browser kills the Chrome process
    _browser: Browser,
    tab: Arc<Tab>,
    downloads: Mutex<DownloadSlots>,
}

/// One fresh directory per armed capture. Chrome fixes the target directory when a
/// download starts, so a download that outlives its capture window finishes in its
/// own slot and is never picked up by a later capture.
pub struct DownloadSlots {
    root: TempDir,
    seq: usize,
    current: Option<PathBuf>,
}

impl DownloadSlots {
    pub fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("polaroo-downloads-")
            .tempdir()
            .context("Failed to create download directory")?;
        Ok(Self {
            root,
            seq: 0,
            current: None,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Create and select the directory for the next capture
    pub fn advance(&mut self) -> Result<PathBuf> {
        self.seq += 1;
        let dir = self.root.path().join(format!("capture-{}", self.seq));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        self.current = Some(dir.clone());
        Ok(dir)
    }

    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }
}

/// First fully written file in `dir`, skipping browser partials
pub fn finished_download(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.is_file() && !is_partial(path))
        .collect();
    entries.sort();
    Ok(entries.into_iter().next())
}

impl ChromePage {
    fn launch(profile_dir: &Path, config: &BrowserConfig) -> Result<Self> {
        info!(
            "Launching Chrome (profile: {}, headless: {})...",
            profile_dir.display(),
            config.headless
        );

        std::fs::create_dir_all(profile_dir).with_context(|| {
            format!("Failed to create profile dir: {}", profile_dir.display())
        })?;

        let args: Vec<&OsStr> = LAUNCH_ARGS.iter().map(OsStr::new).collect();
        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(false)
            .window_size(Some((config.window_width, config.window_height)))
            .user_data_dir(Some(profile_dir.to_path_buf()))
            .idle_browser_timeout(Duration::from_secs(600))
            .args(args)
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;
        let tab = browser.new_tab().context("Failed to open tab")?;
        tab.set_default_timeout(Duration::from_secs(60));

        // Unarmed downloads land in the root and are never read
        let downloads = DownloadSlots::new()?;
        set_download_dir(&tab, downloads.root())?;

        Ok(Self {
            _browser: browser,
            tab,
            downloads: Mutex::new(downloads),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(tab.as_ref()))
            .await
            .context("Browser task panicked")?
    }

    async fn eval(&self, script: String) -> Result<Value> {
        self.blocking(move |tab| eval_json(tab, &script)).await
    }

    /// Run `body` with `el` bound to the tagged element; yields `null` when it is gone
    async fn eval_on(&self, element: &ElementHandle, body: &str) -> Result<Value> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return JSON.stringify(null); {} }})()",
            serde_json::to_string(&handle_selector(element))?,
            body
        );
        self.eval(script).await
    }

    fn capture_dir(&self) -> Result<PathBuf> {
        let slots = self
            .downloads
            .lock()
            .map_err(|_| anyhow!("Download slot lock poisoned"))?;
        slots
            .current()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("wait_for_download called before arm_download"))
    }
}

fn set_download_dir(tab: &Tab, dir: &Path) -> Result<()> {
    tab.call_method(BrowserProtocol::SetDownloadBehavior {
        behavior: BrowserProtocol::SetDownloadBehaviorBehaviorOption::Allow,
        browser_context_id: None,
        download_path: Some(dir.display().to_string()),
        events_enabled: Some(false),
    })
    .context("Failed to set download directory")?;
    Ok(())
}

fn handle_selector(element: &ElementHandle) -> String {
    format!("[data-scout-id=\"{}\"]", element.id())
}

fn eval_json(tab: &Tab, script: &str) -> Result<Value> {
    let result = tab.evaluate(script, false)?;
    let raw = match result.value {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => return Ok(Value::Null),
    };
    serde_json::from_str(&raw).context("Page script returned invalid JSON")
}

fn is_partial(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn current_url(&self) -> Result<String> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn response_status(&self) -> Result<Option<u16>> {
        let value = self
            .eval(
                "JSON.stringify((performance.getEntriesByType('navigation')[0] || {}).responseStatus || 0)"
                    .to_string(),
            )
            .await?;
        Ok(value
            .as_u64()
            .filter(|status| *status > 0)
            .and_then(|status| u16::try_from(status).ok()))
    }

    async fn content(&self) -> Result<String> {
        let value = self
            .eval("JSON.stringify(document.documentElement.outerHTML)".to_string())
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>> {
        let query = serde_json::to_string(&locator.to_query())?;
        let value = self.eval(LOCATE_JS.replace("__QUERY__", &query)).await?;
        let ids: Vec<String> = serde_json::from_value(value).unwrap_or_default();
        debug!("{} -> {} visible match(es)", locator, ids.len());
        Ok(ids.into_iter().map(ElementHandle).collect())
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        let selector = handle_selector(element);
        self.blocking(move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        let script = format!(
            "(() => {{ const el = document.elementFromPoint({}, {}); if (el) el.click(); return JSON.stringify(!!el); }})()",
            x, y
        );
        let clicked = self.eval(script).await?;
        if clicked.as_bool() != Some(true) {
            anyhow::bail!("Nothing to click at ({:.0}, {:.0})", x, y);
        }
        Ok(())
    }

    async fn focus(&self, element: &ElementHandle) -> Result<()> {
        self.eval_on(element, "el.focus(); return JSON.stringify(true);")
            .await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<()> {
        self.eval_on(
            element,
            "el.value = ''; el.dispatchEvent(new Event('input', { bubbles: true })); return JSON.stringify(true);",
        )
        .await?;
        let selector = handle_selector(element);
        let text = text.to_string();
        self.blocking(move |tab| {
            tab.find_element(&selector)?.click()?;
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn text(&self, element: &ElementHandle) -> Result<String> {
        let value = self
            .eval_on(
                element,
                "return JSON.stringify((el.innerText || el.value || el.textContent || '').trim());",
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let body = format!(
            "return JSON.stringify(el.getAttribute({}));",
            serde_json::to_string(name)?
        );
        let value = self.eval_on(element, &body).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn outer_html(&self, element: &ElementHandle) -> Result<String> {
        let value = self
            .eval_on(element, "return JSON.stringify(el.outerHTML);")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn bounding_box(&self, element: &ElementHandle) -> Result<Option<BoundingBox>> {
        let value = self
            .eval_on(
                element,
                "el.scrollIntoView({ block: 'center' }); const r = el.getBoundingClientRect(); \
                 return JSON.stringify({ x: r.x, y: r.y, width: r.width, height: r.height });",
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn scroll_to_top(&self) -> Result<()> {
        self.eval("(() => { window.scrollTo(0, 0); return JSON.stringify(true); })()".to_string())
            .await?;
        Ok(())
    }

    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()> {
        self.blocking(move |tab| {
            let start = Instant::now();
            let mut last_count = None;
            let mut stable = 0;
            while start.elapsed() < timeout {
                let state = eval_json(
                    tab,
                    "JSON.stringify([document.readyState, performance.getEntriesByType('resource').length])",
                )?;
                let ready = state.get(0).and_then(Value::as_str) == Some("complete");
                let count = state.get(1).and_then(Value::as_u64);
                if ready && count.is_some() && count == last_count {
                    stable += 1;
                    if stable >= 2 {
                        return Ok(());
                    }
                } else {
                    stable = 0;
                }
                last_count = count;
                thread::sleep(Duration::from_millis(250));
            }
            warn!("Network still busy after {:?}, continuing", timeout);
            Ok(())
        })
        .await
    }

    async fn set_request_headers(
        &self,
        user_agent: &str,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        let user_agent = user_agent.to_string();
        let headers = headers.clone();
        self.blocking(move |tab| {
            let accept_language = headers.get("Accept-Language").map(String::as_str);
            tab.set_user_agent(&user_agent, accept_language, None)?;
            let extra: HashMap<&str, &str> = headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            tab.set_extra_http_headers(extra)?;
            Ok(())
        })
        .await
    }

    async fn arm_download(&self) -> Result<()> {
        let dir = self
            .downloads
            .lock()
            .map_err(|_| anyhow!("Download slot lock poisoned"))?
            .advance()?;
        debug!("Downloads now go to {}", dir.display());
        self.blocking(move |tab| set_download_dir(tab, &dir)).await
    }

    async fn wait_for_download(&self, timeout: Duration) -> Result<Option<RawDownload>> {
        let dir = self.capture_dir()?;
        let poll = Duration::from_millis(250);
        let deadline = Instant::now().checked_add(timeout);
        let mut pending: Option<(PathBuf, u64)> = None;

        while deadline.map_or(true, |deadline| Instant::now() < deadline) {
            tokio::time::sleep(poll).await;

            let Some(path) = finished_download(&dir)? else {
                continue;
            };

            // Wait for the size to settle before reading
            let size = tokio::fs::metadata(&path).await?.len();
            match &pending {
                Some((seen, seen_size)) if *seen == path && *seen_size == size => {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Failed to remove {}: {}", path.display(), e);
                    }
                    let suggested_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    info!("Captured download {} ({} bytes)", suggested_name, bytes.len());
                    return Ok(Some(RawDownload {
                        suggested_name,
                        bytes,
                    }));
                }
                _ => pending = Some((path, size)),
            }
        }
        Ok(None)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.blocking(|tab| {
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.blocking(|tab| {
            tab.close(true)?;
            Ok(())
        })
        .await
    }
}
