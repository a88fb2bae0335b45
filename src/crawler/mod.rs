//! Crawl machinery: fetch strategies, host throttling and the engine
//!
//! - [`strategy`] - single network attempts (direct, proxy, headless browser)
//! - [`fetcher`] - cache, throttle and strategy escalation for one URL
//! - [`throttle`] - adaptive per-host delays and cooldown
//! - [`challenge`] - bot-challenge page detection
//! - [`resolver`] / [`classifier`] - article-to-URL and file-role collaborators
//! - [`engine`] - worker loops over the ledger

pub mod challenge;
pub mod classifier;
pub mod engine;
pub mod fetcher;
pub mod headers;
pub mod resolver;
pub mod shutdown;
pub mod strategy;
pub mod throttle;

pub use classifier::{FileClassifier, HeuristicClassifier, SharedClassifier};
pub use engine::{CrawlEngine, EngineConfig, RunLimits, RunSummary, StopReason};
pub use fetcher::{Fetched, Fetcher};
pub use resolver::{ArticleResolver, ResolverRegistry, SharedResolver, TemplateResolver};
pub use shutdown::ShutdownSignal;
pub use strategy::{build_strategies, BrowserStrategy, FetchStrategy, HttpStrategy, RawResponse, SharedStrategy};
pub use throttle::{HostSnapshot, HostThrottle, ThrottlePolicy};
