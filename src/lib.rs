//! Browser-driven extraction of the Polaroo usage report and per-property invoices.

pub mod archive;
pub mod clock;
pub mod config;
pub mod error;
pub mod extract;
pub mod models;
pub mod scrapers;

pub use error::{ExtractError, ExtractResult, Phase};
