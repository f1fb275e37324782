use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::ExtractError;

const DEFAULT_STEM: &str = "polaroo_report";
const DEFAULT_EXT: &str = ".xlsx";

/// Logical sidebar destination, resolved to a concrete element at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NavigationTarget {
    Report,
    Invoices,
}

impl NavigationTarget {
    /// Visible label the sidebar uses for this destination
    pub fn label(&self) -> &'static str {
        match self {
            NavigationTarget::Report => "Report",
            NavigationTarget::Invoices => "Invoices",
        }
    }

    /// Labels accepted by the pattern-based strategies
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            NavigationTarget::Report => &["Report", "Reports", "Informe"],
            NavigationTarget::Invoices => &["Invoices", "Invoice", "Facturas"],
        }
    }
}

impl fmt::Display for NavigationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reporting window requested from the date-range control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateRange {
    /// Named option such as "Last month"
    Preset(String),
    /// Explicit inclusive window
    Explicit { start: NaiveDate, end: NaiveDate },
}

impl DateRange {
    pub fn preset(label: impl Into<String>) -> Self {
        DateRange::Preset(label.into())
    }

    /// Window ending today and starting `days` before it, clamped at the earliest
    /// representable date
    pub fn lookback(today: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
        let start = today
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        (start, today)
    }

    pub fn preset_label(&self) -> Option<&str> {
        match self {
            DateRange::Preset(label) => Some(label),
            DateRange::Explicit { .. } => None,
        }
    }

    /// Explicit bounds, falling back to the lookback window for presets
    pub fn bounds_or_lookback(&self, today: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
        match self {
            DateRange::Explicit { start, end } => (*start, *end),
            DateRange::Preset(_) => Self::lookback(today, days),
        }
    }
}

/// Utility the invoice belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Electricity,
    Water,
    Unknown,
}

impl ServiceType {
    /// Classify a table cell by substring match
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        if ["electric", "luz", "energ", "power"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            ServiceType::Electricity
        } else if ["water", "agua"].iter().any(|needle| lower.contains(needle)) {
            ServiceType::Water
        } else {
            ServiceType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Electricity => "electricity",
            ServiceType::Water => "water",
            ServiceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured download awaiting handoff to the archive sink
#[derive(Debug, Clone, Serialize)]
pub struct DownloadArtifact {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub suggested_name: String,
    pub filename: String,
    pub captured_at: DateTime<Utc>,
}

impl DownloadArtifact {
    pub fn new(bytes: Vec<u8>, suggested_name: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        let suggested_name = suggested_name.into();
        let filename = persisted_filename(&suggested_name, captured_at);
        Self {
            bytes,
            suggested_name,
            filename,
            captured_at,
        }
    }

    /// `YYYY-MM` bucket used by the archive
    pub fn month_slug(&self) -> String {
        self.captured_at.format("%Y-%m").to_string()
    }
}

/// `{stem}_{YYYYMMDDThhmmssZ}{ext}` for a browser-suggested name
pub fn persisted_filename(suggested: &str, captured_at: DateTime<Utc>) -> String {
    let path = Path::new(suggested);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_STEM);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e))
        .unwrap_or_else(|| DEFAULT_EXT.to_string());
    let ts = captured_at.format("%Y%m%dT%H%M%SZ");
    format!("{}_{}{}", stem, ts, ext)
}

/// One invoice document captured for a property
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceRecord {
    pub property_name: String,
    pub service_type: ServiceType,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Persisted filename of the captured document
    pub local_reference: String,
    pub captured_at: DateTime<Utc>,
}

impl InvoiceRecord {
    pub fn from_artifact(
        property_name: impl Into<String>,
        service_type: ServiceType,
        artifact: DownloadArtifact,
    ) -> Self {
        Self {
            property_name: property_name.into(),
            service_type,
            bytes: artifact.bytes,
            local_reference: artifact.filename,
            captured_at: artifact.captured_at,
        }
    }

    pub fn month_slug(&self) -> String {
        self.captured_at.format("%Y-%m").to_string()
    }
}

/// A row whose download was attempted and failed
#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub property_name: String,
    pub row: usize,
    pub service_type: ServiceType,
    pub reason: String,
}

/// Outcome of the invoice extraction for one property
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvoiceBatch {
    pub property_name: String,
    pub records: Vec<InvoiceRecord>,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failures: Vec<RowFailure>,
}

impl InvoiceBatch {
    pub fn new(property_name: impl Into<String>) -> Self {
        Self {
            property_name: property_name.into(),
            ..Default::default()
        }
    }

    pub fn count(&self, service_type: ServiceType) -> usize {
        self.records
            .iter()
            .filter(|r| r.service_type == service_type)
            .count()
    }
}

/// Aggregate outcome of one extraction run
#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub artifacts: Vec<DownloadArtifact>,
    pub invoices: Vec<InvoiceRecord>,
    pub attempted: usize,
    pub succeeded: usize,
    /// Invoice rows left out because of quotas or a missing download control
    pub skipped: usize,
    /// Invoice rows whose download failed without aborting the run
    pub row_failures: Vec<RowFailure>,
    /// Object keys returned by the archive sink
    pub archived: Vec<String>,
    /// Archive handoffs that failed, as `(filename, ExtractError::Archive)`
    pub archive_failures: Vec<(String, ExtractError)>,
    /// First fatal error if the run aborted
    pub error: Option<ExtractError>,
}

impl ExtractionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn absorb_batch(&mut self, batch: InvoiceBatch) {
        self.attempted += batch.attempted;
        self.succeeded += batch.succeeded;
        self.skipped += batch.skipped;
        self.invoices.extend(batch.records);
        self.row_failures.extend(batch.failures);
    }

    pub fn absorb_artifact(&mut self, artifact: DownloadArtifact) {
        self.attempted += 1;
        self.succeeded += 1;
        self.artifacts.push(artifact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_persisted_filename_is_timestamped() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(persisted_filename("export.csv", at), "export_20240501T100000Z.csv");
    }

    #[test]
    fn test_persisted_filename_defaults() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 7).unwrap();
        assert_eq!(persisted_filename("", at), "polaroo_report_20241231T235907Z.xlsx");
        assert_eq!(persisted_filename("invoice", at), "invoice_20241231T235907Z.xlsx");
        assert_eq!(
            persisted_filename("factura.2024.pdf", at),
            "factura.2024_20241231T235907Z.pdf"
        );
    }

    #[test]
    fn test_classify_service_type() {
        assert_eq!(ServiceType::classify("Electricity"), ServiceType::Electricity);
        assert_eq!(ServiceType::classify("  Electricidad  "), ServiceType::Electricity);
        assert_eq!(ServiceType::classify("Luz"), ServiceType::Electricity);
        assert_eq!(ServiceType::classify("AGUA"), ServiceType::Water);
        assert_eq!(ServiceType::classify("Water supply"), ServiceType::Water);
        assert_eq!(ServiceType::classify("Gas"), ServiceType::Unknown);
        assert_eq!(ServiceType::classify(""), ServiceType::Unknown);
    }

    #[test]
    fn test_lookback_window() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let (start, end) = DateRange::lookback(today, 60);
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(end, today);
    }

    #[test]
    fn test_lookback_saturates_instead_of_overflowing() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let (start, end) = DateRange::lookback(today, u32::MAX);
        assert_eq!(start, NaiveDate::MIN);
        assert_eq!(end, today);
    }

    #[test]
    fn test_month_slug() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let artifact = DownloadArtifact::new(vec![1, 2], "export.csv", at);
        assert_eq!(artifact.month_slug(), "2024-05");
        assert_eq!(artifact.filename, "export_20240501T100000Z.csv");
    }
}
