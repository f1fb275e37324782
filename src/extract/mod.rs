pub mod auth;
pub mod date_range;
pub mod download;
pub mod invoices;
pub mod navigator;
pub mod pacer;
pub mod run;
pub mod session;

pub use auth::{AuthOutcome, AuthState, Authenticator};
pub use date_range::{AppliedRange, DateRangeConfigurator};
pub use invoices::InvoiceExtractor;
pub use navigator::Navigator;
pub use pacer::Pacer;
pub use run::{Extractor, Job};
pub use session::{Session, SessionManager};
