pub mod crawl;
pub mod export;
pub mod maintenance;
pub mod seed;

// Re-export command functions for convenience
pub use crawl::{crawl, stats, CrawlParams};
pub use export::export;
pub use maintenance::{requeue_stale, unlock};
pub use seed::seed;
