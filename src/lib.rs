//! pubcrawl - Resumable full-text crawler for scientific articles
//!
//! Given a dataset of article identifiers (DOIs, PMIDs, PMCIDs), pubcrawl
//! resolves candidate publisher URLs, fetches them politely through a chain of
//! strategies and records every article's outcome in a durable ledger so an
//! interrupted crawl resumes where it stopped.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`crawler`] - Fetcher, per-host throttle, strategies and the crawl engine
//! - [`cache`] - Durable request cache keyed by normalized URL
//! - [`storage`] - Crawl ledger, dataset lock, file store and seed loading
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pubcrawl::config::Config;
//! use pubcrawl::crawler::{
//!     CrawlEngine, EngineConfig, Fetcher, HeuristicClassifier, ResolverRegistry, RunLimits,
//!     ShutdownSignal,
//! };
//! use pubcrawl::storage::open_ledger;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let ledger = open_ledger("dataset/ledger.db")?;
//!     let fetcher = Arc::new(Fetcher::from_config(&config, None)?);
//!     let engine = CrawlEngine::new(
//!         ledger,
//!         fetcher,
//!         Arc::new(ResolverRegistry::from_config(&config.resolver)),
//!         Arc::new(HeuristicClassifier::new()),
//!         EngineConfig::from(&config),
//!     );
//!     let summary = engine.run(RunLimits::default(), ShutdownSignal::new()).await?;
//!     println!("{} articles done", summary.done);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod crawler;
pub mod error;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{CacheEntry, CacheKey, RequestCache, SqliteRequestCache};
    pub use crate::config::Config;
    pub use crate::crawler::{
        ArticleResolver, CrawlEngine, EngineConfig, Fetcher, FileClassifier, HostThrottle,
        RunLimits, RunSummary, ShutdownSignal,
    };
    pub use crate::error::{Error, ErrorCategory, ErrorExt, Result};
    pub use crate::models::{ArticleSeed, ArticleTask, FailureReason, FetchOutcome, TaskStatus};
    pub use crate::storage::{CrawlLedger, DatasetLock, SqliteLedger, TaskOutcome};
}

// Direct re-exports for convenience
pub use models::{ArticleSeed, ArticleTask, FetchOutcome, TaskStatus};
