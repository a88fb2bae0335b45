use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pubcrawl::config::Config;
use pubcrawl::models::TaskStatus;
use pubcrawl::storage::SeedFormat;

mod commands;

#[derive(Parser)]
#[command(
    name = "pubcrawl",
    version,
    about = "Resumable, polite full-text crawler for scientific articles",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Write Prometheus metrics to this file on exit
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add article seeds to a dataset
    Seed {
        /// Dataset directory
        dataset: PathBuf,

        /// Seed file
        input: PathBuf,

        /// Input format (auto, jsonl, lines)
        #[arg(short, long, default_value = "auto")]
        format: SeedFormat,
    },

    /// Crawl pending articles of a dataset
    Crawl {
        /// Dataset directory
        dataset: PathBuf,

        /// Stop after claiming this many articles
        #[arg(long)]
        max_articles: Option<u64>,

        /// Stop claiming new articles after this many seconds
        #[arg(long)]
        max_duration: Option<u64>,

        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Bypass the request cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Show task counts per status
    Stats {
        /// Dataset directory
        dataset: PathBuf,
    },

    /// Export tasks as JSON lines
    Export {
        /// Dataset directory
        dataset: PathBuf,

        /// Status to export (pending, in_progress, done, failed, skipped)
        #[arg(short, long, default_value = "failed")]
        status: TaskStatus,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of tasks
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Requeue in-progress tasks left behind by a crashed crawl
    RequeueStale {
        /// Dataset directory
        dataset: PathBuf,

        /// Only tasks not updated for this many seconds
        #[arg(long, default_value = "3600")]
        older_than: u64,
    },

    /// Remove a stale dataset lock
    Unlock {
        /// Dataset directory
        dataset: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    if cli.metrics_out.is_some() {
        if let Err(e) = pubcrawl::metrics::init_metrics() {
            tracing::warn!(error = %e, "Metrics initialization failed");
        }
    }

    tracing::debug!(config = ?cli.config, "pubcrawl starting");

    let result = run(cli.command, config).await;

    if let Some(path) = &cli.metrics_out {
        write_metrics(path)?;
    }

    result
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Seed {
            dataset,
            input,
            format,
        } => commands::seed(dataset, &input, format),

        Commands::Crawl {
            dataset,
            max_articles,
            max_duration,
            workers,
            no_cache,
        } => {
            tracing::info!(
                dataset = %dataset.display(),
                max_articles = ?max_articles,
                max_duration = ?max_duration,
                workers = ?workers,
                "Starting crawl command"
            );
            commands::crawl(
                config,
                commands::CrawlParams {
                    dataset,
                    max_articles,
                    max_duration_secs: max_duration,
                    workers,
                    no_cache,
                },
            )
            .await
        }

        Commands::Stats { dataset } => commands::stats(dataset),

        Commands::Export {
            dataset,
            status,
            output,
            limit,
        } => commands::export(dataset, status, output, limit),

        Commands::RequeueStale {
            dataset,
            older_than,
        } => commands::requeue_stale(dataset, older_than),

        Commands::Unlock { dataset } => commands::unlock(dataset),
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(filter) if !filter.is_empty() => tracing_subscriber::EnvFilter::new(filter),
        _ if verbose => tracing_subscriber::EnvFilter::new("pubcrawl=debug,info"),
        _ => tracing_subscriber::EnvFilter::new(format!("pubcrawl={level},warn")),
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("Failed to initialize logging")?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("Failed to initialize logging")?;
        }
    }

    Ok(())
}

fn write_metrics(path: &Path) -> Result<()> {
    let text = pubcrawl::metrics::encode_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {e}"))?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics: {}", path.display()))?;
    Ok(())
}
