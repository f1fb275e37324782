use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{self, ArchiveSink};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{ExtractError, ExtractResult, Phase};
use crate::extract::auth::Authenticator;
use crate::extract::date_range::DateRangeConfigurator;
use crate::extract::download;
use crate::extract::invoices::InvoiceExtractor;
use crate::extract::navigator::Navigator;
use crate::extract::pacer::Pacer;
use crate::extract::session::SessionManager;
use crate::models::{DateRange, DownloadArtifact, ExtractionResult, InvoiceBatch, NavigationTarget};
use crate::scrapers::PageDriver;

const DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(10);

/// What a run should extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Report { range: DateRange },
    Invoices { properties: Vec<String> },
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Report { range } => match range {
                DateRange::Preset(label) => write!(f, "report ({})", label),
                DateRange::Explicit { start, end } => write!(f, "report ({} .. {})", start, end),
            },
            Job::Invoices { properties } => {
                write!(f, "invoices for {} propert(ies)", properties.len())
            }
        }
    }
}

/// Step currently in progress, read when the run deadline fires
#[derive(Debug)]
struct PhaseTracker(Mutex<Phase>);

impl PhaseTracker {
    fn new() -> Self {
        Self(Mutex::new(Phase::Session))
    }

    fn set(&self, phase: Phase) {
        match self.0.lock() {
            Ok(mut current) => *current = phase,
            Err(poisoned) => *poisoned.into_inner() = phase,
        }
    }

    fn get(&self) -> Phase {
        match self.0.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Runs extraction jobs against one persistent profile
pub struct Extractor {
    sessions: SessionManager,
    settings: Settings,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn ArchiveSink>>,
    invoice_sink: Option<Arc<dyn ArchiveSink>>,
}

impl Extractor {
    pub fn new(sessions: SessionManager, settings: Settings, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            settings,
            clock,
            sink: None,
            invoice_sink: None,
        }
    }

    /// Destination for report exports
    pub fn with_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Destination for invoice PDFs; without one, invoices stay local
    pub fn with_invoice_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.invoice_sink = Some(sink);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run `job` to completion, timeout or cancellation. The session is released
    /// on every path and the first fatal error lands in `result.error`.
    pub async fn run(&self, job: Job, cancel: CancellationToken) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        if let Err(e) = self.settings.validate() {
            result.error = Some(e);
            return result;
        }

        info!("▶ Starting {}", job);
        let session = match self.sessions.acquire(&self.settings.browser.profile_dir).await {
            Ok(session) => session,
            Err(e) => {
                error!("Could not start session: {}", e);
                result.error = Some(e);
                return result;
            }
        };

        let tracker = PhaseTracker::new();
        let limit = self.settings.timing.run_timeout();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExtractError::Cancelled { phase: tracker.get() }),
            finished = tokio::time::timeout(
                limit,
                self.drive(session.page(), &job, &tracker, &mut result),
            ) => match finished {
                Ok(outcome) => outcome,
                Err(_) => Err(ExtractError::RunTimedOut {
                    phase: tracker.get(),
                    limit,
                }),
            },
        };

        if let Err(e) = outcome {
            error!("✖ Run failed during {}: {}", e.phase(), e);
            if !matches!(e, ExtractError::Cancelled { .. }) {
                self.capture_diagnostics(session.page(), e.phase()).await;
            }
            result.error = Some(e);
        }
        self.sessions.release(session).await;

        self.archive(&mut result).await;
        if result.is_success() {
            info!(
                "✔ Finished {}: {}/{} captured, {} archived",
                job,
                result.succeeded,
                result.attempted,
                result.archived.len()
            );
        }
        result
    }

    async fn drive(
        &self,
        page: &dyn PageDriver,
        job: &Job,
        tracker: &PhaseTracker,
        result: &mut ExtractionResult,
    ) -> ExtractResult<()> {
        tracker.set(Phase::Authentication);
        let auth = Authenticator::new(&self.settings).authenticate(page).await?;
        info!(
            "Authenticated (reused session: {}, retried: {})",
            auth.already_authenticated, auth.retried
        );

        match job {
            Job::Report { range } => {
                let artifact = self.report_steps(page, range, tracker).await?;
                result.absorb_artifact(artifact);
            }
            Job::Invoices { properties } => {
                for property in properties {
                    let batch = self.invoice_steps(page, property, tracker).await?;
                    result.absorb_batch(batch);
                }
            }
        }
        Ok(())
    }

    /// Report page, date range, export menu, capture. Expects an authenticated page.
    pub async fn download_report(
        &self,
        page: &dyn PageDriver,
        range: &DateRange,
    ) -> ExtractResult<DownloadArtifact> {
        self.report_steps(page, range, &PhaseTracker::new()).await
    }

    /// Invoice search and bounded download for one property. Expects an authenticated page.
    pub async fn extract_invoices(
        &self,
        page: &dyn PageDriver,
        property: &str,
    ) -> ExtractResult<InvoiceBatch> {
        self.invoice_steps(page, property, &PhaseTracker::new()).await
    }

    async fn report_steps(
        &self,
        page: &dyn PageDriver,
        range: &DateRange,
        tracker: &PhaseTracker,
    ) -> ExtractResult<DownloadArtifact> {
        let pacer = self.pacer();

        tracker.set(Phase::Navigation);
        self.navigator()
            .go_to(page, NavigationTarget::Report)
            .await?;

        tracker.set(Phase::DateRange);
        let applied = DateRangeConfigurator::new(&self.settings)
            .apply(page, range, self.clock.as_ref())
            .await?;
        info!("Date range applied: {:?}", applied);

        tracker.set(Phase::Download);
        download::open_download_menu(page, &pacer).await?;
        let (label, control) =
            download::pick_export_format(page, &self.settings.report.formats).await?;
        info!("Exporting via '{}'", label);
        pacer.settle(&format!("before clicking '{}'", label)).await;
        download::capture(
            page,
            &control,
            self.clock.as_ref(),
            self.settings.timing.download_timeout(),
        )
        .await
    }

    async fn invoice_steps(
        &self,
        page: &dyn PageDriver,
        property: &str,
        tracker: &PhaseTracker,
    ) -> ExtractResult<InvoiceBatch> {
        tracker.set(Phase::Invoices);
        InvoiceExtractor::new(&self.settings, self.navigator())
            .extract(page, property, self.clock.as_ref())
            .await
    }

    fn pacer(&self) -> Pacer {
        Pacer::new(self.settings.timing.step_wait())
    }

    fn navigator(&self) -> Navigator {
        Navigator::new(self.settings.timing.network_idle_timeout(), self.pacer())
    }

    /// Hand every captured file to its sink; failures are recorded, never fatal
    async fn archive(&self, result: &mut ExtractionResult) {
        let mut archived = Vec::new();
        let mut failures = Vec::new();

        if let Some(sink) = &self.sink {
            for artifact in &result.artifacts {
                let month = artifact.month_slug();
                let stored =
                    archive::archive_file(sink.as_ref(), &month, &artifact.filename, &artifact.bytes)
                        .await;
                record_upload(&artifact.filename, stored, &mut archived, &mut failures);
            }
        }

        match &self.invoice_sink {
            Some(sink) => {
                for record in &result.invoices {
                    let month = record.month_slug();
                    let stored = archive::archive_file(
                        sink.as_ref(),
                        &month,
                        &record.local_reference,
                        &record.bytes,
                    )
                    .await;
                    record_upload(&record.local_reference, stored, &mut archived, &mut failures);
                }
            }
            None if !result.invoices.is_empty() => {
                debug!("No invoice sink configured, keeping {} invoice(s) local", result.invoices.len());
            }
            None => {}
        }

        result.archived.extend(archived);
        result.archive_failures.extend(failures);
    }

    /// Best-effort screenshot and HTML dump named `{phase}_{timestamp}`
    async fn capture_diagnostics(&self, page: &dyn PageDriver, phase: Phase) {
        let Some(dir) = &self.settings.diagnostics.dir else {
            return;
        };
        let stem = format!("{}_{}", phase, self.clock.now().format("%Y%m%dT%H%M%SZ"));
        match tokio::time::timeout(DIAGNOSTICS_TIMEOUT, write_diagnostics(page, dir, &stem)).await {
            Ok(Ok(())) => info!("Diagnostics saved to {}/{}.*", dir.display(), stem),
            Ok(Err(e)) => warn!("Failed to save diagnostics: {:#}", e),
            Err(_) => warn!("Diagnostics capture timed out"),
        }
    }
}

fn record_upload(
    filename: &str,
    stored: anyhow::Result<String>,
    archived: &mut Vec<String>,
    failures: &mut Vec<(String, ExtractError)>,
) {
    match stored {
        Ok(key) => archived.push(key),
        Err(e) => {
            let err = ExtractError::Archive(e);
            warn!("Archive of {} failed: {}", filename, err);
            failures.push((filename.to_string(), err));
        }
    }
}

async fn write_diagnostics(page: &dyn PageDriver, dir: &Path, stem: &str) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let png = page.screenshot().await.context("Screenshot failed")?;
    tokio::fs::write(dir.join(format!("{}.png", stem)), png).await?;

    let html = page.content().await.context("Failed to read page HTML")?;
    tokio::fs::write(dir.join(format!("{}.html", stem)), html).await?;
    Ok(())
}
