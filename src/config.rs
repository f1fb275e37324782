use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

pub const DEFAULT_CONFIG_PATH: &str = "polaroo-scout.toml";

const MAX_LOOKBACK_DAYS: u32 = 3_650;
const MAX_BUSY_WAIT_SECS: u64 = 3_600;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Target dashboard endpoints and URL markers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub login_url: String,
    /// Substring identifying the login page
    pub login_marker: String,
    /// Substring identifying any dashboard page
    pub dashboard_marker: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            login_url: "https://app.polaroo.com/login".to_string(),
            login_marker: "login".to_string(),
            dashboard_marker: "/dashboard".to_string(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// What a second caller does when the profile is held by another session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    #[default]
    Fail,
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub busy_policy: BusyPolicy,
    pub busy_wait_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from(".chrome-profile"),
            headless: false,
            window_width: 1366,
            window_height: 900,
            busy_policy: BusyPolicy::Fail,
            busy_wait_secs: 30,
        }
    }
}

/// Waits and poll budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Minimum dwell after each interaction
    pub step_wait_ms: u64,
    pub dashboard_poll_ms: u64,
    pub dashboard_poll_budget: u32,
    pub network_idle_timeout_ms: u64,
    pub dropdown_wait_ms: u64,
    pub download_timeout_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            step_wait_ms: 5_000,
            dashboard_poll_ms: 500,
            dashboard_poll_budget: 20,
            network_idle_timeout_ms: 15_000,
            dropdown_wait_ms: 600,
            download_timeout_secs: 60,
            run_timeout_secs: 150,
        }
    }
}

impl TimingConfig {
    pub fn step_wait(&self) -> Duration {
        Duration::from_millis(self.step_wait_ms)
    }

    pub fn dashboard_poll(&self) -> Duration {
        Duration::from_millis(self.dashboard_poll_ms)
    }

    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    pub fn dropdown_wait(&self) -> Duration {
        Duration::from_millis(self.dropdown_wait_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Bot-protection detection and the single retry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub retry_on_block: bool,
    pub retry_delay_ms: u64,
    pub block_statuses: Vec<u16>,
    /// Case-insensitive substrings of the rendered page that signal a challenge
    pub block_markers: Vec<String>,
    pub retry_user_agent: String,
    pub retry_headers: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut retry_headers = HashMap::new();
        retry_headers.insert("Accept-Language".to_string(), "en-US,en;q=0.9,es;q=0.8".to_string());
        retry_headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        );
        Self {
            retry_on_block: true,
            retry_delay_ms: 10_000,
            block_statuses: vec![401, 403],
            block_markers: vec![
                "cf-challenge".to_string(),
                "cf-chl-".to_string(),
                "just a moment...".to_string(),
                "attention required".to_string(),
                "access denied".to_string(),
            ],
            retry_user_agent: DEFAULT_USER_AGENT.to_string(),
            retry_headers,
        }
    }
}

impl AuthConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub preset: String,
    pub lookback_days: u32,
    /// Export menu labels in order of preference
    pub formats: Vec<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            preset: "Last month".to_string(),
            lookback_days: 60,
            formats: [
                "Download Excel",
                "Download XLSX",
                "Download XLS",
                "Descargar Excel",
                "Descargar XLSX",
                "Download CSV",
                "Descargar CSV",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceConfig {
    pub electricity_quota: usize,
    pub water_quota: usize,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            electricity_quota: 2,
            water_quota: 1,
        }
    }
}

/// Remote storage. Reports and invoice PDFs go to separate buckets.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub service_key: Option<String>,
    pub bucket: String,
    pub namespace: String,
    pub invoice_bucket: String,
    pub invoice_namespace: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            service_key: None,
            bucket: "polaroo".to_string(),
            namespace: report_namespace("raw"),
            invoice_bucket: "polaroo_pdfs".to_string(),
            invoice_namespace: "invoices".to_string(),
        }
    }
}

fn report_namespace(prefix: &str) -> String {
    format!("polaroo/{}", prefix.trim_matches('/'))
}

impl std::fmt::Debug for ArchiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveConfig")
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("service_key", &self.service_key.as_ref().map(|_| "[REDACTED]"))
            .field("bucket", &self.bucket)
            .field("namespace", &self.namespace)
            .field("invoice_bucket", &self.invoice_bucket)
            .field("invoice_namespace", &self.invoice_namespace)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Where to write screenshots and HTML on fatal failures
    pub dir: Option<PathBuf>,
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub target: TargetConfig,
    pub credentials: CredentialsConfig,
    pub browser: BrowserConfig,
    pub timing: TimingConfig,
    pub auth: AuthConfig,
    pub report: ReportConfig,
    pub invoices: InvoiceConfig,
    pub archive: ArchiveConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Login credentials; the password never appears in `Debug` output
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Settings {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(email) = lookup("POLAROO_EMAIL") {
            self.credentials.email = email;
        }
        if let Some(password) = lookup("POLAROO_PASSWORD") {
            self.credentials.password = password;
        }
        if let Some(dir) = lookup("POLAROO_PROFILE_DIR") {
            self.browser.profile_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("SUPABASE_URL") {
            self.archive.url = Some(url);
        }
        if let Some(key) = lookup("SUPABASE_SERVICE_KEY") {
            self.archive.service_key = Some(key);
        }
        if let Some(bucket) = lookup("STORAGE_BUCKET") {
            self.archive.bucket = bucket;
        }
        if let Some(prefix) = lookup("STORAGE_PREFIX") {
            self.archive.namespace = report_namespace(&prefix);
        }
        if let Some(bucket) = lookup("PDF_BUCKET") {
            self.archive.invoice_bucket = bucket;
        }
        if let Some(prefix) = lookup("PDF_PREFIX") {
            self.archive.invoice_namespace = prefix;
        }
    }

    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.timing.dashboard_poll_budget == 0 {
            return Err(ExtractError::Config(
                "timing.dashboard_poll_budget must be at least 1".to_string(),
            ));
        }
        if self.timing.dashboard_poll_ms == 0 {
            return Err(ExtractError::Config(
                "timing.dashboard_poll_ms must be positive".to_string(),
            ));
        }
        if self.report.lookback_days == 0 || self.report.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(ExtractError::Config(format!(
                "report.lookback_days must be between 1 and {}",
                MAX_LOOKBACK_DAYS
            )));
        }
        if self.browser.busy_wait_secs > MAX_BUSY_WAIT_SECS {
            return Err(ExtractError::Config(format!(
                "browser.busy_wait_secs must be at most {}",
                MAX_BUSY_WAIT_SECS
            )));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.credentials.email.clone(),
            password: SecretString::from(self.credentials.password.clone()),
        }
    }
}
