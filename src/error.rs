use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Step of an extraction run, reported with every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Session,
    Authentication,
    Navigation,
    DateRange,
    Download,
    Invoices,
    Archive,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Session => "session",
            Phase::Authentication => "authentication",
            Phase::Navigation => "navigation",
            Phase::DateRange => "date_range",
            Phase::Download => "download",
            Phase::Invoices => "invoices",
            Phase::Archive => "archive",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal failure of an extraction run
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("profile directory {} is already in use by a live session", .profile.display())]
    SessionBusy { profile: PathBuf },

    #[error("authentication blocked by bot protection: {reason}")]
    AuthenticationBlocked { reason: String },

    #[error("dashboard not reached after {attempts} checks (last url: {url})")]
    DashboardNotReached { attempts: u32, url: String },

    #[error("could not locate navigation target '{target}'")]
    NavigationTargetNotFound { target: String },

    #[error("could not configure date range: {reason}")]
    DateRangeConfiguration { reason: String },

    #[error("no download started within {waited:?}")]
    DownloadTimeout { waited: Duration },

    #[error("run exceeded {limit:?} during {phase}")]
    RunTimedOut { phase: Phase, limit: Duration },

    #[error("run cancelled during {phase}")]
    Cancelled { phase: Phase },

    #[error("browser failure during {phase}: {source:#}")]
    Browser {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("archive upload failed: {0:#}")]
    Archive(#[source] anyhow::Error),
}

impl ExtractError {
    pub fn browser(phase: Phase, source: anyhow::Error) -> Self {
        ExtractError::Browser { phase, source }
    }

    /// Step the failure belongs to
    pub fn phase(&self) -> Phase {
        match self {
            ExtractError::SessionBusy { .. } => Phase::Session,
            ExtractError::AuthenticationBlocked { .. } => Phase::Authentication,
            ExtractError::DashboardNotReached { .. } => Phase::Authentication,
            ExtractError::NavigationTargetNotFound { .. } => Phase::Navigation,
            ExtractError::DateRangeConfiguration { .. } => Phase::DateRange,
            ExtractError::DownloadTimeout { .. } => Phase::Download,
            ExtractError::RunTimedOut { phase, .. } => *phase,
            ExtractError::Cancelled { phase } => *phase,
            ExtractError::Browser { phase, .. } => *phase,
            ExtractError::Config(_) => Phase::Session,
            ExtractError::Archive(_) => Phase::Archive,
        }
    }
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

/// Attach a phase to driver-level `anyhow` failures
pub trait PhaseContext<T> {
    fn in_phase(self, phase: Phase) -> ExtractResult<T>;
}

impl<T> PhaseContext<T> for anyhow::Result<T> {
    fn in_phase(self, phase: Phase) -> ExtractResult<T> {
        self.map_err(|e| ExtractError::browser(phase, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reports_phase() {
        let err = ExtractError::DownloadTimeout {
            waited: Duration::from_secs(5),
        };
        assert_eq!(err.phase(), Phase::Download);

        let err = ExtractError::RunTimedOut {
            phase: Phase::DateRange,
            limit: Duration::from_secs(150),
        };
        assert_eq!(err.phase(), Phase::DateRange);
        assert!(err.to_string().contains("date_range"));
    }

    #[test]
    fn test_in_phase_wraps_driver_errors() {
        let failed: anyhow::Result<()> = Err(anyhow::anyhow!("tab crashed"));
        let err = failed.in_phase(Phase::Navigation).unwrap_err();
        assert_eq!(err.phase(), Phase::Navigation);
        assert!(err.to_string().contains("tab crashed"));
    }
}
