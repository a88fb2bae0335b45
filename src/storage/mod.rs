//! Dataset storage: crawl ledger, dataset lock, file store and seed loading
//!
//! A dataset directory holds everything a crawl needs to resume:
//!
//! ```text
//! <dataset>/
//!   ledger.db    task states (SQLite)
//!   cache.db     request cache (SQLite, path overridable)
//!   files/       downloaded files
//!   crawl.lock   advisory lock while a crawl runs
//! ```

pub mod files;
pub mod ledger;
pub mod lock;
pub mod seeds;

pub use files::FileStore;
pub use ledger::{open_ledger, CrawlLedger, SharedLedger, SqliteLedger, TaskOutcome};
pub use lock::{DatasetLock, LockInfo};
pub use seeds::{load_seeds, parse_seeds, SeedFormat};

use std::path::{Path, PathBuf};

/// Well-known paths inside a dataset directory
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub root: PathBuf,
}

impl DatasetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn ledger(&self) -> PathBuf {
        self.root.join("ledger.db")
    }

    /// Cache database, unless overridden in configuration
    pub fn cache(&self, configured: Option<&Path>) -> PathBuf {
        configured
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("cache.db"))
    }

    pub fn files(&self) -> PathBuf {
        self.root.join("files")
    }
}
