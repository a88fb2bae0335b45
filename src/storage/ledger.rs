//! Resumable crawl ledger
//!
//! The ledger is the only owner of [`ArticleTask`] lifecycle state. Tasks move
//! `Pending -> InProgress -> {Done, Failed, Skipped, Pending}`; terminal rows
//! are never rewritten. Claims are compare-and-swap updates on a single row, so
//! two workers (or two processes sharing the file) can never hold the same task.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::models::{
    ArticleSeed, ArticleTask, CandidateFailure, FailureReason, FileDescriptor, StatusCounts,
    TaskStatus,
};
use crate::utils::error::LedgerError;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Rows examined per claim round
const CLAIM_BATCH: i64 = 16;

/// State written back for a claimed task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    /// Target status; `InProgress` is rejected
    pub status: TaskStatus,
    /// Files retrieved; replaces the stored list when non-empty
    pub files: Vec<FileDescriptor>,
    /// Per-candidate failure notes, appended to the task history
    pub failures: Vec<CandidateFailure>,
    pub last_error: Option<FailureReason>,
    /// Network attempts made while the task was claimed
    pub attempts_made: u32,
}

impl TaskOutcome {
    pub fn done(files: Vec<FileDescriptor>) -> Self {
        Self {
            status: TaskStatus::Done,
            files,
            failures: Vec::new(),
            last_error: None,
            attempts_made: 0,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            status: TaskStatus::Failed,
            files: Vec::new(),
            failures: Vec::new(),
            last_error: Some(reason),
            attempts_made: 0,
        }
    }

    pub fn skipped(reason: FailureReason) -> Self {
        Self {
            status: TaskStatus::Skipped,
            last_error: Some(reason),
            ..Self::failed(FailureReason::ResolutionEmpty)
        }
    }

    /// Back to the queue, optionally noting why
    pub fn pending(reason: Option<FailureReason>) -> Self {
        Self {
            status: TaskStatus::Pending,
            files: Vec::new(),
            failures: Vec::new(),
            last_error: reason,
            attempts_made: 0,
        }
    }

    pub fn with_files(mut self, files: Vec<FileDescriptor>) -> Self {
        self.files = files;
        self
    }

    pub fn with_failures(mut self, failures: Vec<CandidateFailure>) -> Self {
        self.failures = failures;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts_made = attempts;
        self
    }
}

/// Durable task ledger
pub trait CrawlLedger: Send + Sync {
    /// Insert seeds as Pending; existing identifiers are left untouched
    fn seed(&self, seeds: &[ArticleSeed]) -> Result<usize>;

    /// Atomically claim one Pending task for `worker_id`
    fn next_pending(&self, worker_id: &str) -> Result<Option<ArticleTask>>;

    /// Persist the result of processing a task claimed by `worker_id`
    ///
    /// Fails with [`LedgerError::LostClaim`] when the claim was requeued and
    /// is now held by someone else.
    fn record_outcome(&self, identifier: &str, worker_id: &str, outcome: &TaskOutcome)
        -> Result<()>;

    /// Move InProgress tasks not updated for `older_than` back to Pending
    fn requeue_stale(&self, older_than: Duration) -> Result<usize>;

    fn stats(&self) -> Result<StatusCounts>;

    fn get(&self, identifier: &str) -> Result<Option<ArticleTask>>;

    fn list_by_status(&self, status: TaskStatus, limit: Option<usize>)
        -> Result<Vec<ArticleTask>>;
}

/// Thread-safe shared ledger
pub type SharedLedger = Arc<dyn CrawlLedger>;

/// SQLite implementation of [`CrawlLedger`]
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets `stats` read while a worker writes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.create_schema()?;

        tracing::info!(path = %path.display(), "Crawl ledger opened");
        Ok(ledger)
    }

    /// Create in-memory ledger (for testing)
    pub fn in_memory() -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        ledger.create_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    identifier TEXT PRIMARY KEY,
                    metadata TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    files TEXT NOT NULL DEFAULT '[]',
                    failures TEXT NOT NULL DEFAULT '[]',
                    claimed_by TEXT,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status
                    ON tasks(status, updated_at_ms);
                "#,
        )?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Raw column values of a `tasks` row
struct TaskRow {
    identifier: String,
    metadata: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    files: String,
    failures: String,
    claimed_by: Option<String>,
    updated_at_ms: i64,
}

const TASK_COLUMNS: &str =
    "identifier, metadata, status, attempts, last_error, files, failures, claimed_by, updated_at_ms";

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identifier: row.get(0)?,
            metadata: row.get(1)?,
            status: row.get(2)?,
            attempts: row.get(3)?,
            last_error: row.get(4)?,
            files: row.get(5)?,
            failures: row.get(6)?,
            claimed_by: row.get(7)?,
            updated_at_ms: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<ArticleTask> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|reason| LedgerError::Corrupt {
                identifier: self.identifier.clone(),
                reason,
            })?;

        let updated_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(self.updated_at_ms)
            .single()
            .unwrap_or_default();

        Ok(ArticleTask {
            metadata: serde_json::from_str(&self.metadata)?,
            status,
            attempts: self.attempts,
            last_error: self
                .last_error
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            files: serde_json::from_str(&self.files)?,
            failures: serde_json::from_str(&self.failures)?,
            claimed_by: self.claimed_by,
            updated_at,
            identifier: self.identifier,
        })
    }
}

fn load_task(conn: &Connection, identifier: &str) -> Result<Option<ArticleTask>> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE identifier = ?1"),
            params![identifier],
            TaskRow::from_row,
        )
        .optional()?;

    row.map(TaskRow::into_task).transpose()
}

impl CrawlLedger for SqliteLedger {
    fn seed(&self, seeds: &[ArticleSeed]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_ms();
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO tasks (identifier, metadata, status, updated_at_ms)
                 VALUES (?1, ?2, 'pending', ?3)",
            )?;
            for seed in seeds {
                let identifier = seed.identifier.trim();
                if identifier.is_empty() {
                    continue;
                }
                let metadata = serde_json::to_string(seed)?;
                inserted += stmt.execute(params![identifier, metadata, now])?;
            }
        }

        tx.commit()?;
        tracing::info!(offered = seeds.len(), inserted, "Seeded ledger");
        Ok(inserted)
    }

    fn next_pending(&self, worker_id: &str) -> Result<Option<ArticleTask>> {
        let conn = self.conn();

        loop {
            let candidates: Vec<String> = {
                let mut stmt = conn.prepare_cached(
                    "SELECT identifier FROM tasks WHERE status = 'pending'
                     ORDER BY attempts ASC, updated_at_ms ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![CLAIM_BATCH], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            if candidates.is_empty() {
                return Ok(None);
            }

            for identifier in candidates {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'in_progress', claimed_by = ?2, updated_at_ms = ?3
                     WHERE identifier = ?1 AND status = 'pending'",
                    params![identifier, worker_id, now_ms()],
                )?;

                if changed == 1 {
                    tracing::debug!(identifier = %identifier, worker = worker_id, "Claimed task");
                    return load_task(&conn, &identifier);
                }

                // Lost the race to another claimant
                tracing::debug!(identifier = %identifier, worker = worker_id, "Claim contention");
            }
        }
    }

    fn record_outcome(
        &self,
        identifier: &str,
        worker_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<()> {
        if outcome.status == TaskStatus::InProgress {
            return Err(LedgerError::InvalidTransition {
                identifier: identifier.to_string(),
                reason: "outcome cannot be in_progress".to_string(),
            });
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let Some(current) = load_task(&tx, identifier)? else {
            return Err(LedgerError::UnknownTask(identifier.to_string()));
        };
        if current.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                identifier: identifier.to_string(),
                status: current.status.to_string(),
            });
        }
        let lost_claim = || LedgerError::LostClaim {
            identifier: identifier.to_string(),
            worker: worker_id.to_string(),
        };
        if current.status != TaskStatus::InProgress || current.claimed_by.as_deref() != Some(worker_id) {
            return Err(lost_claim());
        }

        let files = if outcome.files.is_empty() {
            current.files
        } else {
            outcome.files.clone()
        };
        let mut failures = current.failures;
        failures.extend(outcome.failures.iter().cloned());
        let last_error = outcome
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let changed = tx.execute(
            "UPDATE tasks
             SET status = ?2, attempts = attempts + ?3, last_error = ?4, files = ?5,
                 failures = ?6, claimed_by = NULL, updated_at_ms = ?7
             WHERE identifier = ?1 AND status = 'in_progress' AND claimed_by = ?8",
            params![
                identifier,
                outcome.status.as_str(),
                outcome.attempts_made,
                last_error,
                serde_json::to_string(&files)?,
                serde_json::to_string(&failures)?,
                now_ms(),
                worker_id,
            ],
        )?;

        if changed == 0 {
            return Err(lost_claim());
        }

        tx.commit()?;
        tracing::debug!(
            identifier = identifier,
            status = %outcome.status,
            attempts = outcome.attempts_made,
            "Recorded outcome"
        );
        Ok(())
    }

    fn requeue_stale(&self, older_than: Duration) -> Result<usize> {
        let now = now_ms();
        let cutoff = now.saturating_sub(older_than.as_millis().min(i64::MAX as u128) as i64);

        let requeued = self.conn().execute(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, updated_at_ms = ?2
             WHERE status = 'in_progress' AND updated_at_ms <= ?1",
            params![cutoff, now],
        )?;

        if requeued > 0 {
            tracing::info!(requeued, older_than_secs = older_than.as_secs(), "Requeued stale tasks");
        }
        Ok(requeued)
    }

    fn stats(&self) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let status = status
                .parse::<TaskStatus>()
                .map_err(|reason| LedgerError::Corrupt {
                    identifier: "<stats>".to_string(),
                    reason,
                })?;
            counts.add(status, count as u64);
        }
        Ok(counts)
    }

    fn get(&self, identifier: &str) -> Result<Option<ArticleTask>> {
        load_task(&self.conn(), identifier)
    }

    fn list_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> Result<Vec<ArticleTask>> {
        let conn = self.conn();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
             ORDER BY updated_at_ms ASC, identifier ASC LIMIT ?2"
        ))?;

        let rows = stmt
            .query_map(params![status.as_str(), limit], TaskRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

/// Open a shared SQLite ledger
pub fn open_ledger(path: impl AsRef<Path>) -> Result<SharedLedger> {
    Ok(Arc::new(SqliteLedger::open(path)?))
}
