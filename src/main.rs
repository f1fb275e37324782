use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use polaroo_scout::archive::SupabaseStorage;
use polaroo_scout::clock::SystemClock;
use polaroo_scout::config::{Settings, DEFAULT_CONFIG_PATH};
use polaroo_scout::extract::{Extractor, Job, SessionManager};
use polaroo_scout::models::{DateRange, ExtractionResult};
use polaroo_scout::scrapers::ChromeLauncher;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polaroo-scout")]
#[command(about = "Download the Polaroo usage report and property invoices")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Keep captured files local instead of uploading them
    #[arg(long)]
    no_archive: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the usage report
    Report {
        /// Named range offered by the report page (defaults to report.preset)
        #[arg(long, conflicts_with_all = ["from", "to"])]
        preset: Option<String>,

        /// Start of an explicit range (YYYY-MM-DD)
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,

        /// End of an explicit range (YYYY-MM-DD)
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Download invoices for one or more properties
    Invoices {
        #[arg(required = true)]
        properties: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polaroo_scout=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load_or_default(&cli.config)?;
    settings.apply_env();
    if cli.no_archive {
        settings.archive.enabled = false;
    }

    info!("🔌 Polaroo Scout");
    info!("Config: {}", cli.config.display());
    info!("Profile: {}", settings.browser.profile_dir.display());

    let job = match cli.command {
        Command::Report { preset, from, to } => match (from, to) {
            (Some(start), Some(end)) => {
                if start > end {
                    bail!("--from {} is after --to {}", start, end);
                }
                Job::Report {
                    range: DateRange::Explicit { start, end },
                }
            }
            _ => Job::Report {
                range: DateRange::preset(preset.unwrap_or_else(|| settings.report.preset.clone())),
            },
        },
        Command::Invoices { properties } => Job::Invoices { properties },
    };

    let sessions = SessionManager::new(Arc::new(ChromeLauncher), settings.browser.clone());
    let reports = SupabaseStorage::from_config(&settings.archive)?;
    let invoices = SupabaseStorage::invoices_from_config(&settings.archive)?;
    let mut extractor = Extractor::new(sessions, settings, Arc::new(SystemClock));
    if let Some(reports) = reports {
        extractor = extractor.with_sink(Arc::new(reports));
    }
    if let Some(invoices) = invoices {
        extractor = extractor.with_invoice_sink(Arc::new(invoices));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, closing the browser");
            on_signal.cancel();
        }
    });

    let result = extractor.run(job, cancel).await;
    save_outputs(&result).await?;

    for (filename, error) in &result.archive_failures {
        warn!("Not archived: {} ({})", filename, error);
    }
    match result.error {
        Some(e) => Err(e).context("Extraction failed"),
        None => Ok(()),
    }
}

/// Write captured files to the working directory and a JSON summary next to them
async fn save_outputs(result: &ExtractionResult) -> Result<()> {
    for artifact in &result.artifacts {
        tokio::fs::write(&artifact.filename, &artifact.bytes)
            .await
            .with_context(|| format!("Failed to write {}", artifact.filename))?;
        println!("{}", artifact.filename);
    }

    for record in &result.invoices {
        tokio::fs::write(&record.local_reference, &record.bytes)
            .await
            .with_context(|| format!("Failed to write {}", record.local_reference))?;
        println!(
            "{}\t{}\t{}",
            record.property_name, record.service_type, record.local_reference
        );
    }

    if !result.invoices.is_empty() || !result.row_failures.is_empty() {
        let summary = serde_json::json!({
            "attempted": result.attempted,
            "succeeded": result.succeeded,
            "skipped": result.skipped,
            "records": result.invoices,
            "failures": result.row_failures,
            "archived": result.archived,
        });
        tokio::fs::write("invoices_summary.json", serde_json::to_string_pretty(&summary)?).await?;
        info!("💾 Saved invoices_summary.json");
    }
    Ok(())
}
