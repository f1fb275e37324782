use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BrowserConfig, BusyPolicy};
use crate::error::{ExtractError, ExtractResult, Phase, PhaseContext};
use crate::scrapers::{BrowserLauncher, PageDriver};

const BUSY_POLL: Duration = Duration::from_millis(250);

type Registry = Arc<Mutex<HashSet<PathBuf>>>;

/// Exclusive claim on a profile directory; dropping it frees the directory on
/// every exit path, including panics and cancelled futures
struct ProfileLease {
    path: PathBuf,
    registry: Registry,
}

impl Drop for ProfileLease {
    fn drop(&mut self) {
        let mut active = match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.path);
        debug!("Released profile {}", self.path.display());
    }
}

/// Live browser bound to one profile directory
pub struct Session {
    page: Arc<dyn PageDriver>,
    lease: ProfileLease,
}

impl Session {
    pub fn page(&self) -> &dyn PageDriver {
        self.page.as_ref()
    }

    pub fn profile_dir(&self) -> &Path {
        &self.lease.path
    }
}

/// Hands out at most one live session per profile directory
#[derive(Clone)]
pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    config: BrowserConfig,
    active: Registry,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: BrowserConfig) -> Self {
        Self {
            launcher,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_busy(&self, profile_dir: &Path) -> bool {
        let key = profile_key(profile_dir);
        match self.active.lock() {
            Ok(active) => active.contains(&key),
            Err(poisoned) => poisoned.into_inner().contains(&key),
        }
    }

    /// Claim `profile_dir` and launch a browser on it
    pub async fn acquire(&self, profile_dir: &Path) -> ExtractResult<Session> {
        std::fs::create_dir_all(profile_dir)
            .map_err(anyhow::Error::from)
            .in_phase(Phase::Session)?;

        let lease = self.claim(profile_key(profile_dir)).await?;
        info!("Acquired profile {}", lease.path.display());

        // On launch failure the lease drops here and frees the profile
        let page = self
            .launcher
            .launch(&lease.path, &self.config)
            .await
            .in_phase(Phase::Session)?;

        Ok(Session { page, lease })
    }

    /// Close the browser and free the profile
    pub async fn release(&self, session: Session) {
        if let Err(e) = session.page.close().await {
            warn!("Failed to close browser cleanly: {:#}", e);
        }
        let Session { page, lease } = session;
        drop(page);
        drop(lease);
    }

    async fn claim(&self, key: PathBuf) -> ExtractResult<ProfileLease> {
        let deadline = match self.config.busy_policy {
            BusyPolicy::Fail => None,
            BusyPolicy::Wait => {
                let budget = Duration::from_secs(self.config.busy_wait_secs);
                let deadline = Instant::now().checked_add(budget).ok_or_else(|| {
                    ExtractError::Config(format!(
                        "browser.busy_wait_secs {} is out of range",
                        self.config.busy_wait_secs
                    ))
                })?;
                Some(deadline)
            }
        };

        loop {
            if let Some(lease) = self.try_claim(&key) {
                return Ok(lease);
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    debug!("Profile {} busy, waiting", key.display());
                    tokio::time::sleep(BUSY_POLL).await;
                }
                _ => return Err(ExtractError::SessionBusy { profile: key }),
            }
        }
    }

    fn try_claim(&self, key: &Path) -> Option<ProfileLease> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !active.insert(key.to_path_buf()) {
            return None;
        }
        Some(ProfileLease {
            path: key.to_path_buf(),
            registry: Arc::clone(&self.active),
        })
    }
}

fn profile_key(profile_dir: &Path) -> PathBuf {
    profile_dir
        .canonicalize()
        .unwrap_or_else(|_| profile_dir.to_path_buf())
}
