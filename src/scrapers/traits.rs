use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::BrowserConfig;
use crate::scrapers::types::{BoundingBox, ElementHandle, Locator, RawDownload};

/// One live browser page. Every method is a suspension point; implementations must
/// only return elements that are currently visible.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// HTTP status of the last main-document response, when the browser exposes it
    async fn response_status(&self) -> Result<Option<u16>>;

    /// Rendered HTML of the whole document
    async fn content(&self) -> Result<String>;

    /// Visible matches in document order
    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>>;

    async fn locate(&self, locator: &Locator) -> Result<Option<ElementHandle>> {
        Ok(self.locate_all(locator).await?.into_iter().next())
    }

    async fn click(&self, element: &ElementHandle) -> Result<()>;

    async fn click_at(&self, x: f64, y: f64) -> Result<()>;

    async fn focus(&self, element: &ElementHandle) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;

    /// Clear the field, then type `text` into it
    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<()>;

    async fn text(&self, element: &ElementHandle) -> Result<String>;

    async fn attribute(&self, element: &ElementHandle, name: &str) -> Result<Option<String>>;

    async fn outer_html(&self, element: &ElementHandle) -> Result<String>;

    async fn bounding_box(&self, element: &ElementHandle) -> Result<Option<BoundingBox>>;

    async fn scroll_to_top(&self) -> Result<()>;

    /// Wait until no network activity is pending, bounded by `timeout`
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<()>;

    /// Adjust request identity for subsequent navigations
    async fn set_request_headers(
        &self,
        user_agent: &str,
        headers: &HashMap<String, String>,
    ) -> Result<()>;

    /// Start watching for a download before the triggering click
    async fn arm_download(&self) -> Result<()>;

    /// Next completed download since the last `arm_download`, or `None` on timeout
    async fn wait_for_download(&self, timeout: Duration) -> Result<Option<RawDownload>>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;
}

/// Starts a browser bound to a persistent profile directory
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, profile_dir: &Path, config: &BrowserConfig)
        -> Result<Arc<dyn PageDriver>>;
}

/// One named way of finding an element
#[async_trait]
pub trait LocateStrategy: Send + Sync {
    fn name(&self) -> String;

    async fn locate(&self, page: &dyn PageDriver) -> Result<Option<ElementHandle>>;
}

#[async_trait]
impl LocateStrategy for Locator {
    fn name(&self) -> String {
        self.to_string()
    }

    async fn locate(&self, page: &dyn PageDriver) -> Result<Option<ElementHandle>> {
        page.locate(self).await
    }
}
