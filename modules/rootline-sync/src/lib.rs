pub mod browser;
pub mod crawler;
pub mod credentials;
pub mod deps;
pub mod hints;
pub mod identity;
pub mod operations;
pub mod pacing;
pub mod providers;
pub mod reconcile;
pub mod run_log;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use crawler::{AncestorCrawler, CrawlStep};
pub use deps::SyncDeps;
pub use hints::{HintDisposition, HintOutcome, HintProcessor};
pub use identity::IdentityResolver;
pub use operations::{OperationController, OperationRegistry, ProgressStream, StartedOperation};
pub use providers::{ProviderScraper, ScraperRegistry};
pub use reconcile::{ApplyOutcome, FieldChange, ReconciliationEngine};
