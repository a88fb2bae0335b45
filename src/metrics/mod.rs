//! Prometheus metrics for the crawl engine
//!
//! This module tracks:
//! - Fetcher: outcomes per strategy, network latency, cache hits and misses
//! - Throttle: hosts entering cooldown
//! - Engine: task outcomes, articles in flight
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, or is never called, metrics operations are no-ops.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all crawl metrics
struct CrawlMetrics {
    fetch_outcomes: CounterVec,
    fetch_duration: HistogramVec,
    cache_lookups: CounterVec,
    host_cooldowns: CounterVec,
    task_outcomes: CounterVec,
    tasks_in_flight: Gauge,
}

/// Global storage for crawl metrics
static CRAWL_METRICS: OnceLock<CrawlMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = pubcrawl::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = CrawlMetrics {
        fetch_outcomes: register_counter_vec!(
            "pubcrawl_fetch_outcomes_total",
            "Network fetch attempts by strategy and outcome",
            &["strategy", "outcome"]
        )?,
        fetch_duration: register_histogram_vec!(
            "pubcrawl_fetch_duration_seconds",
            "Network fetch attempt duration in seconds",
            &["strategy"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
        cache_lookups: register_counter_vec!(
            "pubcrawl_cache_lookups_total",
            "Request cache lookups by result",
            &["result"]
        )?,
        host_cooldowns: register_counter_vec!(
            "pubcrawl_host_cooldowns_total",
            "Hosts that entered cooldown",
            &["host"]
        )?,
        task_outcomes: register_counter_vec!(
            "pubcrawl_task_outcomes_total",
            "Article tasks processed by resulting status",
            &["status"]
        )?,
        tasks_in_flight: register_gauge!(
            "pubcrawl_tasks_in_flight",
            "Article tasks currently claimed by a worker"
        )?,
    };

    CRAWL_METRICS
        .set(metrics)
        .map_err(|_| "Crawl metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    CRAWL_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one network attempt
pub fn record_fetch(strategy: &str, outcome: &str, duration_secs: f64) {
    let Some(m) = CRAWL_METRICS.get() else {
        return;
    };

    m.fetch_outcomes
        .with_label_values(&[strategy, outcome])
        .inc();
    m.fetch_duration
        .with_label_values(&[strategy])
        .observe(duration_secs);
}

/// Record a cache lookup
pub fn record_cache_lookup(hit: bool) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.cache_lookups
            .with_label_values(&[if hit { "hit" } else { "miss" }])
            .inc();
    }
}

/// Record a host entering cooldown
pub fn record_cooldown(host: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.host_cooldowns.with_label_values(&[host]).inc();
    }
}

/// Record the status a task was written back with
pub fn record_task_outcome(status: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.task_outcomes.with_label_values(&[status]).inc();
    }
}

/// Guard counting a claimed task as in flight until dropped
pub struct InFlightGuard {
    active: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.active {
            if let Some(m) = CRAWL_METRICS.get() {
                m.tasks_in_flight.dec();
            }
        }
    }
}

/// Mark a task as in flight
pub fn task_started() -> InFlightGuard {
    match CRAWL_METRICS.get() {
        Some(m) => {
            m.tasks_in_flight.inc();
            InFlightGuard { active: true }
        }
        None => InFlightGuard { active: false },
    }
}

// ============================================================================
// Tests
// ============================================================================
