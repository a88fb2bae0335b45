//! Unified error handling for the pubcrawl crate
//!
//! Domain errors live next to the stores that raise them (see
//! [`crate::utils::error`]); this module wraps them into a single `Error` so
//! the engine and the binary can propagate dataset-level failures with `?`.
//!
//! # Architecture
//!
//! - [`ErrorExt`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! Per-article failures are not errors: they are recorded in the ledger as
//! [`crate::models::FailureReason`] and never abort a crawl.

use std::io;
use thiserror::Error;

pub use crate::utils::error::{CacheError, LedgerError, LockError, StrategyError, ThrottleError};

/// Common trait for all pubcrawl error types
pub trait ErrorExt: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, rate limit)
    Network,
    /// Ledger, cache and file storage errors
    Storage,
    /// Logic errors that must stop the run (cache integrity)
    Integrity,
    /// Process-level coordination (lock file)
    Coordination,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Integrity => "integrity",
            Self::Coordination => "coordination",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the pubcrawl crate
#[derive(Error, Debug)]
pub enum Error {
    /// Crawl ledger errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Request cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Fetch strategy errors
    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// Dataset lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ErrorExt for LedgerError {
    fn is_recoverable(&self) -> bool {
        match self {
            // SQLITE_BUSY / SQLITE_LOCKED under contention from other workers
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}

impl ErrorExt for CacheError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::IntegrityViolation { .. } => ErrorCategory::Integrity,
            _ => ErrorCategory::Storage,
        }
    }
}

impl ErrorExt for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Ledger(e) => e.is_recoverable(),
            Self::Cache(e) => e.is_recoverable(),
            Self::Strategy(e) => !matches!(e, StrategyError::Config(_)),
            Self::Lock(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Ledger(e) => e.category(),
            Self::Cache(e) => e.category(),
            Self::Strategy(StrategyError::Config(_)) => ErrorCategory::Config,
            Self::Strategy(_) => ErrorCategory::Network,
            Self::Lock(_) => ErrorCategory::Coordination,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_category() {
        let integrity = Error::Cache(CacheError::IntegrityViolation {
            key: "k".to_string(),
            existing: "a".to_string(),
            incoming: "b".to_string(),
        });
        assert_eq!(integrity.category(), ErrorCategory::Integrity);
        assert!(!integrity.is_recoverable());

        let lock = Error::Lock(LockError::Held {
            path: PathBuf::from("/tmp/crawl.lock"),
            holder: "pid 1".to_string(),
        });
        assert_eq!(lock.category(), ErrorCategory::Coordination);
    }

    #[test]
    fn test_busy_ledger_is_recoverable() {
        let busy = LedgerError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_recoverable());
        assert!(!LedgerError::UnknownTask("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let ledger_err = LedgerError::UnknownTask("10.1/x".to_string());
        let unified: Error = ledger_err.into();
        assert!(matches!(unified, Error::Ledger(_)));
        assert_eq!(unified.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("workers must be greater than 0");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }
}
