//! Crawl engine: worker loops over the ledger
//!
//! # Architecture
//!
//! ```text
//!   ledger ──claim──▶ worker ──resolve──▶ candidates ──fetch──▶ classifier
//!     ▲                 │                                          │
//!     └──────record─────┴──────────────── files ◀──────────────────┘
//! ```
//!
//! `run` requeues stale claims once, then drives `workers` loops concurrently
//! until the ledger has nothing left, a limit is reached or shutdown is
//! signalled. Per-article failures are recorded in the ledger; only
//! dataset-level errors (cache integrity, file store, ledger) end the run with
//! `Err`, after triggering shutdown for the other workers.

use futures::future::join_all;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::crawler::classifier::SharedClassifier;
use crate::crawler::fetcher::Fetcher;
use crate::crawler::resolver::SharedResolver;
use crate::crawler::shutdown::ShutdownSignal;
use crate::error::{Error, ErrorExt, LedgerError, Result};
use crate::metrics;
use crate::models::{
    ArticleTask, CandidateFailure, FailureReason, FetchOutcome, FileDescriptor, FileRole,
    TaskStatus,
};
use crate::storage::{FileStore, SharedLedger, TaskOutcome};
use crate::utils::format_bytes;
use crate::utils::retry::{with_retry_if, RetryConfig};
use crate::utils::sha256_hex;

// ============================================================================
// Configuration
// ============================================================================

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent worker loops
    pub workers: usize,

    /// Network attempts allowed per article, across candidates and runs
    pub max_fetch_attempts: u32,

    /// Claims older than this are requeued when a run starts
    pub stale_after: Duration,

    pub progress_interval: Duration,

    /// Poll interval while other workers may still requeue tasks
    pub idle_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.crawler.workers.max(1),
            max_fetch_attempts: config.crawler.max_fetch_attempts,
            stale_after: config.stale_after(),
            progress_interval: config.progress_interval(),
            idle_poll: Duration::from_millis(config.crawler.idle_poll_ms.max(1)),
        }
    }
}

/// Bounds for one run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLimits {
    pub max_duration: Option<Duration>,
    /// Articles to claim before stopping
    pub max_articles: Option<u64>,
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing left to claim
    Exhausted,
    Shutdown,
    Deadline,
    ArticleLimit,
    /// A dataset-level error ended the run
    Fatal,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Shutdown => "shutdown",
            Self::Deadline => "deadline",
            Self::ArticleLimit => "article_limit",
            Self::Fatal => "fatal",
        }
    }
}

/// Totals for one run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub requeued_stale: usize,
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Tasks handed back to the queue
    pub requeued: u64,
    pub network_attempts: u64,
    pub bytes_fetched: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

impl RunSummary {
    pub fn log(&self) {
        tracing::info!(
            processed = self.processed,
            done = self.done,
            failed = self.failed,
            skipped = self.skipped,
            requeued = self.requeued,
            requeued_stale = self.requeued_stale,
            network_attempts = self.network_attempts,
            fetched = %format_bytes(self.bytes_fetched),
            elapsed_secs = self.elapsed.as_secs(),
            stop_reason = self.stop_reason.as_str(),
            "Crawl run finished"
        );
    }
}

// ============================================================================
// Run State
// ============================================================================

#[derive(Debug, Default)]
struct RunStats {
    processed: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    requeued: AtomicU64,
    network_attempts: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl RunStats {
    fn record(&self, status: TaskStatus) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            TaskStatus::Done => &self.done,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Skipped => &self.skipped,
            TaskStatus::Pending | TaskStatus::InProgress => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct RunContext {
    shutdown: ShutdownSignal,
    deadline: Option<Instant>,
    /// Claims left before the article limit is reached
    remaining: Option<AtomicU64>,
    /// Workers between claim and record
    busy: AtomicUsize,
    stop_reason: Mutex<Option<StopReason>>,
    stats: RunStats,
}

impl RunContext {
    fn new(limits: RunLimits, shutdown: ShutdownSignal) -> Self {
        Self {
            shutdown,
            deadline: limits.max_duration.map(|d| Instant::now() + d),
            remaining: limits.max_articles.map(AtomicU64::new),
            busy: AtomicUsize::new(0),
            stop_reason: Mutex::new(None),
            stats: RunStats::default(),
        }
    }

    fn stop(&self, reason: StopReason) {
        let mut current = self.stop_reason.lock().unwrap_or_else(|p| p.into_inner());
        current.get_or_insert(reason);
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop conditions checked before each claim
    fn check_stop(&self) -> Option<StopReason> {
        if self.shutdown.is_triggered() {
            self.stop(StopReason::Shutdown);
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.stop(StopReason::Deadline);
        }
        self.stop_reason()
    }

    fn reserve_article(&self) -> bool {
        match &self.remaining {
            None => true,
            Some(remaining) => remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    fn release_article(&self) {
        if let Some(remaining) = &self.remaining {
            remaining.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Drives workers over the ledger
pub struct CrawlEngine {
    ledger: SharedLedger,
    fetcher: Arc<Fetcher>,
    resolver: SharedResolver,
    classifier: SharedClassifier,
    files: Option<FileStore>,
    config: EngineConfig,
    run_id: String,
}

impl CrawlEngine {
    pub fn new(
        ledger: SharedLedger,
        fetcher: Arc<Fetcher>,
        resolver: SharedResolver,
        classifier: SharedClassifier,
        config: EngineConfig,
    ) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            ledger,
            fetcher,
            resolver,
            classifier,
            files: None,
            config,
            run_id: run_id[..8].to_string(),
        }
    }

    /// Write downloaded files to disk
    pub fn with_file_store(mut self, files: FileStore) -> Self {
        self.files = Some(files);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run until exhaustion, a limit or shutdown
    pub async fn run(&self, limits: RunLimits, shutdown: ShutdownSignal) -> Result<RunSummary> {
        let started = Instant::now();
        let requeued_stale = self.ledger.requeue_stale(self.config.stale_after)?;
        if requeued_stale > 0 {
            tracing::warn!(count = requeued_stale, "Requeued stale in-progress tasks");
        }

        let ctx = RunContext::new(limits, shutdown);

        tracing::info!(
            run_id = %self.run_id,
            workers = self.config.workers,
            max_articles = ?limits.max_articles,
            max_duration_secs = limits.max_duration.map(|d| d.as_secs()),
            strategies = ?self.fetcher.strategy_names(),
            "Starting crawl run"
        );

        let work = join_all((0..self.config.workers).map(|index| self.worker(index, &ctx)));
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        let results = loop {
            tokio::select! {
                results = &mut work => break results,
                _ = ticker.tick() => self.log_progress(&ctx, started),
            }
        };

        let first_error = results.into_iter().find_map(|r| r.err());
        if first_error.is_some() {
            ctx.stop(StopReason::Fatal);
        }

        let stats = &ctx.stats;
        let summary = RunSummary {
            requeued_stale,
            processed: stats.processed.load(Ordering::Relaxed),
            done: stats.done.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            skipped: stats.skipped.load(Ordering::Relaxed),
            requeued: stats.requeued.load(Ordering::Relaxed),
            network_attempts: stats.network_attempts.load(Ordering::Relaxed),
            bytes_fetched: stats.bytes_fetched.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
            stop_reason: ctx.stop_reason().unwrap_or(StopReason::Exhausted),
        };

        match first_error {
            Some(e) => {
                tracing::error!(error = %e, "Crawl run aborted");
                Err(e)
            }
            None => {
                summary.log();
                Ok(summary)
            }
        }
    }

    fn log_progress(&self, ctx: &RunContext, started: Instant) {
        match self.ledger.stats() {
            Ok(counts) => {
                let elapsed = started.elapsed().as_secs_f64().max(1.0);
                let processed = ctx.stats.processed.load(Ordering::Relaxed);
                tracing::info!(
                    pending = counts.pending,
                    in_progress = counts.in_progress,
                    done = counts.done,
                    failed = counts.failed,
                    skipped = counts.skipped,
                    completion_pct = counts.completion_percentage(),
                    articles_per_min = processed as f64 * 60.0 / elapsed,
                    "Crawl progress"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read ledger stats"),
        }

        for host in self.fetcher.throttle().hosts() {
            if host.cooldown_remaining.is_none() && host.consecutive_failures == 0 {
                continue;
            }
            tracing::info!(
                host = %host.host,
                delay_ms = host.current_delay.as_millis() as u64,
                consecutive_failures = host.consecutive_failures,
                cooldown_secs = host.cooldown_remaining.map(|d| d.as_secs()),
                requests = host.total_requests,
                failures = host.total_failures,
                "Host struggling"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------------

    async fn worker(&self, index: usize, ctx: &RunContext) -> Result<()> {
        let worker_id = format!("{}/w{index}", self.run_id);
        tracing::debug!(worker = %worker_id, "Worker started");

        loop {
            if ctx.check_stop().is_some() {
                break;
            }
            if !ctx.reserve_article() {
                ctx.stop(StopReason::ArticleLimit);
                break;
            }

            ctx.busy.fetch_add(1, Ordering::SeqCst);
            match self.ledger.next_pending(&worker_id) {
                Ok(Some(task)) => {
                    let result = self.process(task, &worker_id, ctx).await;
                    ctx.busy.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = result {
                        ctx.shutdown.trigger();
                        return Err(e);
                    }
                }
                Ok(None) => {
                    ctx.release_article();
                    if ctx.busy.fetch_sub(1, Ordering::SeqCst) == 1 {
                        // Nobody else can requeue work
                        break;
                    }
                    self.idle(ctx).await;
                }
                Err(e) if e.is_recoverable() => {
                    ctx.release_article();
                    ctx.busy.fetch_sub(1, Ordering::SeqCst);
                    tracing::debug!(worker = %worker_id, error = %e, "Ledger busy, retrying claim");
                    self.idle(ctx).await;
                }
                Err(e) => {
                    ctx.busy.fetch_sub(1, Ordering::SeqCst);
                    ctx.shutdown.trigger();
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(worker = %worker_id, "Worker stopped");
        Ok(())
    }

    async fn idle(&self, ctx: &RunContext) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_poll) => {}
            _ = ctx.shutdown.triggered() => {}
        }
    }

    // ------------------------------------------------------------------------
    // Article processing
    // ------------------------------------------------------------------------

    async fn process(&self, task: ArticleTask, worker_id: &str, ctx: &RunContext) -> Result<()> {
        let _in_flight = metrics::task_started();
        let identifier = task.identifier.clone();

        let candidates = self.resolver.resolve(&task.metadata).await;
        if candidates.is_empty() {
            tracing::info!(identifier = %identifier, "No candidate URLs");
            return self
                .record(
                    &identifier,
                    worker_id,
                    TaskOutcome::skipped(FailureReason::ResolutionEmpty),
                    ctx,
                )
                .await;
        }

        let budget = self.config.max_fetch_attempts.saturating_sub(task.attempts);
        let mut attempts_made = 0u32;
        let mut main: Option<FileDescriptor> = None;
        let mut supplementals = Vec::new();
        let mut unknown = Vec::new();
        let mut failures = Vec::new();
        let mut last_reason: Option<FailureReason> = None;
        let mut retryable_seen = false;
        let mut interrupted = false;

        for url in &candidates {
            if ctx.shutdown.is_triggered() {
                interrupted = true;
                break;
            }
            if attempts_made >= budget {
                tracing::debug!(identifier = %identifier, "Fetch budget exhausted");
                break;
            }

            let fetched = match self
                .fetcher
                .fetch_limited(url, budget - attempts_made, &ctx.shutdown)
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.requeue_after_error(&identifier, worker_id, attempts_made).await;
                    return Err(Error::Cache(e));
                }
            };
            attempts_made += fetched.attempts;
            ctx.stats
                .network_attempts
                .fetch_add(u64::from(fetched.attempts), Ordering::Relaxed);

            match fetched.outcome {
                FetchOutcome::Success {
                    body,
                    content_type,
                    final_url,
                    ..
                } => {
                    let role = self.classifier.classify(&final_url, &content_type, &body);
                    ctx.stats
                        .bytes_fetched
                        .fetch_add(body.len() as u64, Ordering::Relaxed);

                    let descriptor = match self
                        .describe_file(&identifier, &final_url, &content_type, role, &body)
                        .await
                    {
                        Ok(descriptor) => descriptor,
                        Err(e) => {
                            self.requeue_after_error(&identifier, worker_id, attempts_made).await;
                            return Err(e);
                        }
                    };

                    tracing::debug!(
                        identifier = %identifier,
                        url = %final_url,
                        role = role.as_str(),
                        from_cache = fetched.from_cache,
                        "Retrieved file"
                    );

                    match role {
                        FileRole::Main => {
                            main = Some(descriptor);
                            break;
                        }
                        FileRole::Supplemental => supplementals.push(descriptor),
                        FileRole::Unknown => unknown.push(descriptor),
                    }
                }
                outcome => {
                    let reason = outcome
                        .failure_reason()
                        .unwrap_or(FailureReason::Network("unclassified outcome".to_string()));
                    if reason == FailureReason::Interrupted {
                        interrupted = true;
                        break;
                    }

                    tracing::debug!(identifier = %identifier, url = %url, reason = %reason, "Candidate failed");
                    retryable_seen |= reason.is_retryable();
                    failures.push(CandidateFailure {
                        url: url.clone(),
                        reason: reason.clone(),
                        strategy: fetched.strategy,
                    });
                    last_reason = Some(reason);
                }
            }
        }

        let budget_left = task.attempts.saturating_add(attempts_made) < self.config.max_fetch_attempts;

        let outcome = if let Some(main) = main {
            let mut files = vec![main];
            files.extend(supplementals);
            TaskOutcome::done(files)
        } else if !unknown.is_empty() {
            unknown.extend(supplementals);
            TaskOutcome::done(unknown)
        } else if interrupted {
            TaskOutcome::pending(Some(FailureReason::Interrupted)).with_files(supplementals)
        } else if retryable_seen && budget_left {
            TaskOutcome::pending(last_reason).with_files(supplementals)
        } else if !supplementals.is_empty() {
            TaskOutcome::failed(FailureReason::NoFulltext).with_files(supplementals)
        } else {
            let reason = last_reason
                .or_else(|| task.last_error.clone())
                .unwrap_or(FailureReason::NoFulltext);
            TaskOutcome::failed(reason)
        };

        let outcome = outcome.with_failures(failures).with_attempts(attempts_made);
        self.record(&identifier, worker_id, outcome, ctx).await
    }

    async fn describe_file(
        &self,
        identifier: &str,
        url: &str,
        content_type: &str,
        role: FileRole,
        body: &[u8],
    ) -> Result<FileDescriptor> {
        let content_hash = sha256_hex(body);
        let mime_type = content_type
            .split(';')
            .next()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("application/octet-stream")
            .to_ascii_lowercase();

        let path = match &self.files {
            Some(files) => Some(
                files
                    .save(identifier, &content_hash, &mime_type, url, body)
                    .await?,
            ),
            None => None,
        };

        Ok(FileDescriptor {
            url: url.to_string(),
            content_hash,
            mime_type,
            role,
            size: body.len() as u64,
            path,
        })
    }

    /// Write the outcome; a task requeued and claimed by another worker keeps that claim
    async fn record(
        &self,
        identifier: &str,
        worker_id: &str,
        outcome: TaskOutcome,
        ctx: &RunContext,
    ) -> Result<()> {
        let status = outcome.status;
        let retry = RetryConfig::with_delays(5, 50, 1_000);
        let pending = &outcome;
        let written = with_retry_if(
            &retry,
            || async move { self.ledger.record_outcome(identifier, worker_id, pending) },
            |e: &LedgerError| e.is_recoverable(),
        )
        .await;

        match written {
            Ok(()) => {}
            Err(e) if e.is_lost_claim() => {
                tracing::warn!(
                    identifier = identifier,
                    worker = worker_id,
                    status = %status,
                    error = %e,
                    "Outcome discarded, task claimed elsewhere"
                );
                metrics::record_task_outcome("lost_claim");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        ctx.stats.record(status);
        metrics::record_task_outcome(status.as_str());

        match &outcome.last_error {
            Some(reason) if status != TaskStatus::Done => tracing::info!(
                identifier = identifier,
                status = %status,
                reason = %reason,
                attempts = outcome.attempts_made,
                "Article finished without fulltext"
            ),
            _ => tracing::info!(
                identifier = identifier,
                status = %status,
                files = outcome.files.len(),
                "Article recorded"
            ),
        }
        Ok(())
    }

    /// Hand a task back after a dataset-level error
    async fn requeue_after_error(&self, identifier: &str, worker_id: &str, attempts_made: u32) {
        let outcome = TaskOutcome::pending(None).with_attempts(attempts_made);
        if let Err(e) = self.ledger.record_outcome(identifier, worker_id, &outcome) {
            tracing::error!(identifier = identifier, error = %e, "Failed to requeue task");
        }
    }
}
