//! Configuration management for the pubcrawl crawler
//!
//! This module handles loading and validating configuration from TOML files
//! and `PUBCRAWL_*` environment variables. Every section has defaults so an
//! empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine loop configuration
    pub crawler: CrawlerConfig,

    /// Per-host throttle configuration
    pub throttle: ThrottleConfig,

    /// Fetch strategy chain configuration
    pub fetch: FetchConfig,

    /// Request cache configuration
    pub cache: CacheConfig,

    /// Publisher resolution rules
    pub resolver: ResolverConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Crawl engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Number of concurrent worker loops
    pub workers: usize,

    /// Network attempts allowed per article across all candidates and runs
    pub max_fetch_attempts: u32,

    /// InProgress tasks older than this are requeued at startup
    pub stale_after_secs: u64,

    /// Interval between progress reports
    pub progress_interval_secs: u64,

    /// Poll interval while other workers may still requeue tasks
    pub idle_poll_ms: u64,

    /// Write downloaded files under `<dataset>/files`
    pub store_files: bool,

    /// Dataset locks older than this are treated as abandoned
    pub lock_ttl_secs: Option<u64>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_fetch_attempts: 10,
            stale_after_secs: 3600,
            progress_interval_secs: 30,
            idle_poll_ms: 250,
            store_files: true,
            lock_ttl_secs: None,
        }
    }
}

impl CrawlerConfig {
    pub fn lock_ttl(&self) -> Option<Duration> {
        self.lock_ttl_secs.filter(|&secs| secs > 0).map(Duration::from_secs)
    }
}

/// Per-host throttle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum spacing between two requests to one host
    pub min_delay_ms: u64,

    /// Upper bound for the adaptive delay
    pub max_delay_ms: u64,

    /// Delay multiplier applied on failure (> 1)
    pub backoff_factor: f64,

    /// Delay multiplier applied on success (0 < decay <= 1)
    pub decay_factor: f64,

    /// Consecutive failures before the host is quarantined
    pub cooldown_threshold: u32,

    /// Quarantine duration
    pub cooldown_secs: u64,

    /// Random extra spacing per request, up to this many milliseconds
    pub jitter_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2000,
            max_delay_ms: 120_000,
            backoff_factor: 2.0,
            decay_factor: 0.9,
            cooldown_threshold: 5,
            cooldown_secs: 900,
            jitter_ms: 500,
        }
    }
}

impl ThrottleConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

/// Kind of fetch strategy in the chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Plain HTTP client
    Direct,

    /// HTTP client through a proxy (http://, https:// or socks5://)
    Proxy { url: String },

    /// Headless browser command; `{url}` in `args` is replaced by the target
    Browser {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxy { .. } => "proxy",
            Self::Browser { .. } => "browser",
        }
    }
}

/// Fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Attempts per strategy before escalating (first try included)
    pub attempts_per_strategy: u32,

    /// Base delay between retries of one strategy
    pub retry_base_delay_ms: u64,

    /// Maximum delay between retries of one strategy
    pub retry_max_delay_ms: u64,

    /// Fixed user agent; a browser-like pool is rotated when unset
    pub user_agent: Option<String>,

    /// Process-wide request cap across all hosts
    pub global_requests_per_second: Option<u32>,

    /// Largest accepted response body
    pub max_body_bytes: usize,

    /// Ordered strategy chain
    pub strategies: Vec<StrategyConfig>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            attempts_per_strategy: 2,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            user_agent: None,
            global_requests_per_second: None,
            max_body_bytes: 64 * 1024 * 1024,
            strategies: vec![StrategyConfig::Direct],
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Retry policy applied within one strategy
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.attempts_per_strategy,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }
}

/// Request cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Cache database; defaults to `<dataset>/cache.db`
    pub path: Option<PathBuf>,

    /// Entries older than this are treated as stale
    pub max_age_secs: Option<u64>,

    /// Appended to every cache key, so responses fetched under different
    /// credentials or headers never share entries
    pub signature: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_age_secs: None,
            signature: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// URL templates for one publisher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublisherRule {
    /// Publisher key matched against `ArticleSeed::publisher`
    pub name: String,

    /// DOI prefixes (e.g. "10.1371") mapped to this publisher
    #[serde(default)]
    pub doi_prefixes: Vec<String>,

    /// Candidate URL templates, tried in order
    pub templates: Vec<String>,
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Templates used when no publisher rule matches
    pub default_templates: Vec<String>,

    pub publishers: Vec<PublisherRule>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_templates: vec![
                "https://doi.org/{doi}".to_string(),
                "https://www.ncbi.nlm.nih.gov/pmc/articles/{pmcid}/".to_string(),
            ],
            publishers: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Apply `PUBCRAWL_*` overrides using the given variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| anyhow::anyhow!("Invalid value for {key}: {value}"))
        }

        let mut vars = BTreeMap::new();
        for key in [
            "PUBCRAWL_WORKERS",
            "PUBCRAWL_MAX_FETCH_ATTEMPTS",
            "PUBCRAWL_STALE_AFTER_SECS",
            "PUBCRAWL_MIN_DELAY_MS",
            "PUBCRAWL_MAX_DELAY_MS",
            "PUBCRAWL_COOLDOWN_THRESHOLD",
            "PUBCRAWL_COOLDOWN_SECS",
            "PUBCRAWL_REQUEST_TIMEOUT",
            "PUBCRAWL_USER_AGENT",
            "PUBCRAWL_PROXY",
            "PUBCRAWL_CACHE_PATH",
            "PUBCRAWL_LOG_LEVEL",
            "PUBCRAWL_LOG_FORMAT",
        ] {
            if let Some(value) = lookup(key) {
                vars.insert(key, value);
            }
        }

        for (key, value) in vars {
            match key {
                "PUBCRAWL_WORKERS" => self.crawler.workers = parse(key, value)?,
                "PUBCRAWL_MAX_FETCH_ATTEMPTS" => {
                    self.crawler.max_fetch_attempts = parse(key, value)?
                }
                "PUBCRAWL_STALE_AFTER_SECS" => self.crawler.stale_after_secs = parse(key, value)?,
                "PUBCRAWL_MIN_DELAY_MS" => self.throttle.min_delay_ms = parse(key, value)?,
                "PUBCRAWL_MAX_DELAY_MS" => self.throttle.max_delay_ms = parse(key, value)?,
                "PUBCRAWL_COOLDOWN_THRESHOLD" => {
                    self.throttle.cooldown_threshold = parse(key, value)?
                }
                "PUBCRAWL_COOLDOWN_SECS" => self.throttle.cooldown_secs = parse(key, value)?,
                "PUBCRAWL_REQUEST_TIMEOUT" => self.fetch.request_timeout_secs = parse(key, value)?,
                "PUBCRAWL_USER_AGENT" => self.fetch.user_agent = Some(value),
                "PUBCRAWL_PROXY" => {
                    let proxy = StrategyConfig::Proxy { url: value };
                    if !self.fetch.strategies.contains(&proxy) {
                        self.fetch.strategies.push(proxy);
                    }
                }
                "PUBCRAWL_CACHE_PATH" => self.cache.path = Some(PathBuf::from(value)),
                "PUBCRAWL_LOG_LEVEL" => self.logging.level = value,
                "PUBCRAWL_LOG_FORMAT" => self.logging.format = value,
                _ => {}
            }
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.crawler.workers == 0 {
            anyhow::bail!("crawler.workers must be greater than 0");
        }

        if self.crawler.max_fetch_attempts == 0 {
            anyhow::bail!("crawler.max_fetch_attempts must be greater than 0");
        }

        let t = &self.throttle;
        if t.min_delay_ms == 0 {
            anyhow::bail!("throttle.min_delay_ms must be greater than 0");
        }
        if t.min_delay_ms > t.max_delay_ms {
            anyhow::bail!("throttle.min_delay_ms must not exceed throttle.max_delay_ms");
        }
        if !(t.backoff_factor > 1.0) {
            anyhow::bail!("throttle.backoff_factor must be greater than 1");
        }
        if !(t.decay_factor > 0.0 && t.decay_factor <= 1.0) {
            anyhow::bail!("throttle.decay_factor must be in (0, 1]");
        }
        if t.cooldown_threshold == 0 {
            anyhow::bail!("throttle.cooldown_threshold must be greater than 0");
        }

        if self.fetch.strategies.is_empty() {
            anyhow::bail!("fetch.strategies must contain at least one strategy");
        }
        if self.fetch.attempts_per_strategy == 0 {
            anyhow::bail!("fetch.attempts_per_strategy must be greater than 0");
        }
        if self.fetch.request_timeout_secs == 0 {
            anyhow::bail!("fetch.request_timeout_secs must be greater than 0");
        }
        if self.fetch.global_requests_per_second == Some(0) {
            anyhow::bail!("fetch.global_requests_per_second must be greater than 0");
        }

        for rule in &self.resolver.publishers {
            if rule.templates.is_empty() {
                anyhow::bail!("resolver publisher '{}' has no templates", rule.name);
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.crawler.stale_after_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.crawler.progress_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetch.strategies, vec![StrategyConfig::Direct]);
    }

    #[test]
    fn test_invalid_throttle_factors() {
        let mut config = Config::default();
        config.throttle.backoff_factor = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.throttle.decay_factor = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.throttle.min_delay_ms = 10_000;
        config.throttle.max_delay_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_strategy_chain() {
        let config: Config = toml::from_str(
            r#"
            [crawler]
            workers = 2

            [[fetch.strategies]]
            kind = "direct"

            [[fetch.strategies]]
            kind = "proxy"
            url = "socks5://127.0.0.1:9050"

            [[fetch.strategies]]
            kind = "browser"
            program = "chromium"
            args = ["--headless", "--dump-dom", "{url}"]

            [[resolver.publishers]]
            name = "plos"
            doi_prefixes = ["10.1371"]
            templates = ["https://journals.plos.org/plosone/article/file?id={doi}&type=printable"]
            "#,
        )
        .unwrap();

        assert_eq!(config.crawler.workers, 2);
        assert_eq!(config.crawler.max_fetch_attempts, 10);
        assert_eq!(config.fetch.strategies.len(), 3);
        assert_eq!(config.fetch.strategies[2].name(), "browser");
        assert_eq!(config.resolver.publishers[0].doi_prefixes, vec!["10.1371"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "PUBCRAWL_WORKERS" => Some("8".to_string()),
                "PUBCRAWL_PROXY" => Some("http://proxy:3128".to_string()),
                "PUBCRAWL_LOG_FORMAT" => Some("json".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.crawler.workers, 8);
        assert_eq!(config.fetch.strategies.len(), 2);
        assert_eq!(config.logging.format, "json");

        let err = config.apply_env(|key| (key == "PUBCRAWL_WORKERS").then(|| "many".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.fetch.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.throttle.min_delay(), Duration::from_secs(2));
        assert_eq!(config.stale_after(), Duration::from_secs(3600));
        assert_eq!(config.crawler.lock_ttl(), None);

        let mut crawler = CrawlerConfig {
            lock_ttl_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(crawler.lock_ttl(), None);
        crawler.lock_ttl_secs = Some(86400);
        assert_eq!(crawler.lock_ttl(), Some(Duration::from_secs(86400)));
    }
}
