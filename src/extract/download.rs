use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{ExtractError, ExtractResult, Phase, PhaseContext};
use crate::extract::pacer::Pacer;
use crate::models::DownloadArtifact;
use crate::scrapers::{ElementHandle, Locator, PageDriver, StrategyChain};

const MENU_OPEN_WAIT: Duration = Duration::from_millis(500);
const MENU_ITEM_SELECTOR: &str = "[role='menuitem'], button, a, li, span, div";

/// Click `clickable` and capture the file it starts.
///
/// The watch is armed before the click so a fast download is never missed.
pub async fn capture(
    page: &dyn PageDriver,
    clickable: &ElementHandle,
    clock: &dyn Clock,
    timeout: Duration,
) -> ExtractResult<DownloadArtifact> {
    page.arm_download().await.in_phase(Phase::Download)?;
    page.click(clickable).await.in_phase(Phase::Download)?;

    let raw = match tokio::time::timeout(timeout, page.wait_for_download(timeout)).await {
        Ok(result) => result.in_phase(Phase::Download)?,
        Err(_) => None,
    };
    let raw = raw.ok_or(ExtractError::DownloadTimeout { waited: timeout })?;

    let artifact = DownloadArtifact::new(raw.bytes, raw.suggested_name, clock.now());
    info!(
        "Downloaded {} as {} ({} bytes)",
        artifact.suggested_name,
        artifact.filename,
        artifact.bytes.len()
    );
    Ok(artifact)
}

/// Scroll to the top and click the visible `Download` control
pub async fn open_download_menu(page: &dyn PageDriver, pacer: &Pacer) -> ExtractResult<()> {
    page.scroll_to_top().await.in_phase(Phase::Download)?;

    let control = StrategyChain::new("download menu")
        .with(Locator::exact_text("button, a, [role='button'], span, div", "Download"))
        .with(Locator::pattern("button, a, [role='button']", r"\bdownload\b"))
        .resolve(page)
        .await
        .in_phase(Phase::Download)?
        .ok_or_else(|| ExtractError::NavigationTargetNotFound {
            target: "Download".to_string(),
        })?;

    pacer.settle("before opening Download menu").await;
    page.click(&control.element)
        .await
        .in_phase(Phase::Download)?;
    tokio::time::sleep(MENU_OPEN_WAIT).await;
    pacer.settle("after opening Download menu").await;
    Ok(())
}

/// First export entry present in the open menu, following `formats` order
pub async fn pick_export_format(
    page: &dyn PageDriver,
    formats: &[String],
) -> ExtractResult<(String, ElementHandle)> {
    for label in formats {
        let locator = Locator::exact_text(MENU_ITEM_SELECTOR, label.as_str());
        if let Some(element) = page.locate(&locator).await.in_phase(Phase::Download)? {
            debug!("Export format '{}' available", label);
            return Ok((label.clone(), element));
        }
    }
    Err(ExtractError::NavigationTargetNotFound {
        target: format!("export menu ({})", formats.join(", ")),
    })
}
