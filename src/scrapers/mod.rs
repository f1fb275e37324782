pub mod browser;
pub mod chain;
pub mod traits;
pub mod types;

pub use browser::{ChromeLauncher, ChromePage};
pub use chain::{AttributeScan, Located, StrategyChain};
pub use traits::{BrowserLauncher, LocateStrategy, PageDriver};
pub use types::{BoundingBox, DomQuery, ElementHandle, Locator, RawDownload};
