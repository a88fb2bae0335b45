//! Error types for the pubcrawl stores and fetch layer
//!
//! Per-URL failures never surface as these errors; they are classified into
//! [`crate::models::FetchOutcome`] by the fetcher. The types here describe
//! store, lock and transport failures.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a single fetch strategy attempt
#[derive(Error, Debug)]
pub enum StrategyError {
    /// HTTP client error (connection reset, DNS, TLS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Request exceeded its timeout
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// Response body exceeded the configured size cap
    #[error("Response body larger than {0} bytes")]
    BodyTooLarge(usize),

    /// Browser process could not be started or exited abnormally
    #[error("Browser command failed: {0}")]
    Browser(String),

    /// Strategy could not be built from its configuration
    #[error("Invalid strategy configuration: {0}")]
    Config(String),
}

impl StrategyError {
    /// Whether the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Errors from the crawl ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Underlying SQLite failure
    #[error("Ledger database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Metadata or file list could not be (de)serialized
    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ledger file or directory could not be prepared
    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Task identifier is not present in the ledger
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Task already reached Done, Failed or Skipped
    #[error("Task {identifier} is already terminal ({status})")]
    AlreadyTerminal { identifier: String, status: String },

    /// Requested status change is not allowed
    #[error("Invalid transition for {identifier}: {reason}")]
    InvalidTransition { identifier: String, reason: String },

    /// Caller no longer holds the claim (requeued and claimed elsewhere)
    #[error("Task {identifier} is not claimed by {worker}")]
    LostClaim { identifier: String, worker: String },

    /// Stored status string could not be parsed
    #[error("Corrupt ledger row for {identifier}: {reason}")]
    Corrupt { identifier: String, reason: String },
}

impl LedgerError {
    /// Another claimant owns or already finished the task
    pub fn is_lost_claim(&self) -> bool {
        matches!(self, Self::LostClaim { .. } | Self::AlreadyTerminal { .. })
    }
}

/// Errors from the request cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying SQLite failure
    #[error("Cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Header map could not be (de)serialized
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache file or directory could not be prepared
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Same key written twice with different content
    #[error("Cache integrity violation for {key}: stored {existing}, new {incoming}")]
    IntegrityViolation {
        key: String,
        existing: String,
        incoming: String,
    },

    /// URL could not be normalized into a cache key
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

/// Errors from the per-host throttle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    /// Host is quarantined after repeated failures
    #[error("Host {host} cooling down for another {remaining:?}")]
    CoolingDown { host: String, remaining: Duration },

    /// Wait was cancelled by the stop signal
    #[error("Throttle wait interrupted for {0}")]
    Interrupted(String),
}

/// Errors from the dataset lock file
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the lock
    #[error("Dataset is locked by another crawl ({holder}); lock file: {path}")]
    Held { path: PathBuf, holder: String },

    /// Lock file could not be created or removed
    #[error("Lock file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
