use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pubcrawl::cache::{RequestCache, SqliteRequestCache};
use pubcrawl::config::Config;
use pubcrawl::crawler::{
    CrawlEngine, EngineConfig, Fetcher, HeuristicClassifier, ResolverRegistry, RunLimits,
    ShutdownSignal,
};
use pubcrawl::models::TaskStatus;
use pubcrawl::storage::{open_ledger, DatasetLock, DatasetPaths, FileStore};

/// Options of the `crawl` command
#[derive(Debug, Clone)]
pub struct CrawlParams {
    pub dataset: PathBuf,
    pub max_articles: Option<u64>,
    pub max_duration_secs: Option<u64>,
    pub workers: Option<usize>,
    pub no_cache: bool,
}

pub async fn crawl(config: Config, params: CrawlParams) -> Result<()> {
    let paths = DatasetPaths::new(&params.dataset);
    if !paths.ledger().exists() {
        anyhow::bail!(
            "No ledger in {}. Run 'pubcrawl seed' first.",
            paths.root.display()
        );
    }

    // Held until the end of this function
    let lock = DatasetLock::acquire_with_ttl(&paths.root, config.crawler.lock_ttl())
        .context("Dataset is locked by another crawl")?;
    tracing::info!(lock = %lock.path().display(), "Acquired dataset lock");

    let ledger = open_ledger(paths.ledger())
        .with_context(|| format!("Failed to open ledger: {}", paths.ledger().display()))?;

    let cache: Option<Arc<dyn RequestCache>> = if config.cache.enabled && !params.no_cache {
        let cache_path = paths.cache(config.cache.path.as_deref());
        let cache = SqliteRequestCache::new(&cache_path, config.cache.max_age())
            .with_context(|| format!("Failed to open cache: {}", cache_path.display()))?;
        Some(Arc::new(cache))
    } else {
        None
    };

    let fetcher = Arc::new(Fetcher::from_config(&config, cache).context("Failed to build fetch strategies")?);

    let mut engine_config = EngineConfig::from(&config);
    if let Some(workers) = params.workers {
        engine_config.workers = workers.max(1);
    }

    let mut engine = CrawlEngine::new(
        Arc::clone(&ledger),
        fetcher,
        Arc::new(ResolverRegistry::from_config(&config.resolver)),
        Arc::new(HeuristicClassifier::new()),
        engine_config,
    );
    if config.crawler.store_files {
        engine = engine.with_file_store(FileStore::new(&paths.files())?);
    }

    let shutdown = ShutdownSignal::new();
    let lock_path = lock.path().to_path_buf();
    shutdown.install_signal_handler_with(move || {
        if let Err(e) = std::fs::remove_file(&lock_path) {
            tracing::warn!(path = %lock_path.display(), error = %e, "Failed to remove lock file");
        }
    });

    let limits = RunLimits {
        max_duration: params.max_duration_secs.map(Duration::from_secs),
        max_articles: params.max_articles,
    };

    println!("Starting crawl of {}", paths.root.display());
    println!("==================={}", "=".repeat(paths.root.display().to_string().len()));

    let summary = engine.run(limits, shutdown).await.context("Crawl aborted")?;

    println!("\nCrawl Summary");
    println!("=============");
    println!("Processed:      {}", summary.processed);
    println!("  Done:         {}", summary.done);
    println!("  Failed:       {}", summary.failed);
    println!("  Skipped:      {}", summary.skipped);
    println!("  Requeued:     {}", summary.requeued);
    println!("Stale requeued: {}", summary.requeued_stale);
    println!("Network calls:  {}", summary.network_attempts);
    println!("Elapsed:        {:.1}s", summary.elapsed.as_secs_f64());
    println!("Stopped by:     {}", summary.stop_reason.as_str());

    let counts = ledger.stats()?;
    println!(
        "\nLedger: {} pending, {} done, {} failed, {} skipped ({:.1}% complete)",
        counts.pending,
        counts.done,
        counts.failed,
        counts.skipped,
        counts.completion_percentage()
    );

    drop(lock);
    Ok(())
}

pub fn stats(dataset: PathBuf) -> Result<()> {
    let paths = DatasetPaths::new(&dataset);
    if !paths.ledger().exists() {
        println!("Ledger not found: {}", paths.ledger().display());
        println!("Run 'pubcrawl seed' first to create the dataset.");
        return Ok(());
    }

    let ledger = open_ledger(paths.ledger())?;
    let counts = ledger.stats()?;
    let total = counts.total();

    println!("Crawl Statistics");
    println!("================");
    println!("Dataset: {}", dataset.display());
    if let Some(holder) = DatasetLock::read_holder(&dataset) {
        println!("Locked by: {}", holder.describe());
    }
    println!();
    println!("Total tasks: {total}");
    for status in TaskStatus::ALL {
        let count = counts.get(status);
        let share = if total > 0 {
            count as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        println!("  {:<12} {count} ({share:.1}%)", format!("{status}:"));
    }
    println!("Completion: {:.1}%", counts.completion_percentage());

    Ok(())
}
