//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use pubcrawl::cache::{RequestCache, SqliteRequestCache};
use pubcrawl::config::Config;
use pubcrawl::crawler::{ArticleResolver, Fetcher};
use pubcrawl::models::ArticleSeed;

/// Configuration with millisecond delays so tests run against a real clock
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.throttle.min_delay_ms = 1;
    config.throttle.max_delay_ms = 20;
    config.throttle.jitter_ms = 0;
    config.throttle.cooldown_secs = 600;
    config.fetch.request_timeout_secs = 5;
    config.fetch.attempts_per_strategy = 2;
    config.fetch.retry_base_delay_ms = 1;
    config.fetch.retry_max_delay_ms = 5;
    config.fetch.user_agent = Some("pubcrawl-test".to_string());
    config.crawler.workers = 1;
    config.crawler.idle_poll_ms = 5;
    config
}

pub fn memory_cache() -> Arc<dyn RequestCache> {
    Arc::new(SqliteRequestCache::in_memory().unwrap())
}

/// Fetcher over `config` with an in-memory cache
pub fn cached_fetcher(config: &Config) -> (Fetcher, Arc<dyn RequestCache>) {
    let cache = memory_cache();
    let fetcher = Fetcher::from_config(config, Some(Arc::clone(&cache))).unwrap();
    (fetcher, cache)
}

/// Resolver returning fixed candidates per identifier
#[derive(Default)]
pub struct FixedResolver {
    urls: HashMap<String, Vec<String>>,
}

impl FixedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, identifier: &str, urls: &[String]) -> Self {
        self.urls.insert(identifier.to_string(), urls.to_vec());
        self
    }
}

#[async_trait]
impl ArticleResolver for FixedResolver {
    async fn resolve(&self, seed: &ArticleSeed) -> Vec<String> {
        self.urls.get(&seed.identifier).cloned().unwrap_or_default()
    }
}

pub fn seed(identifier: &str) -> ArticleSeed {
    ArticleSeed {
        identifier: identifier.to_string(),
        ..Default::default()
    }
}

pub const PDF_BODY: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\ntrailer\n%%EOF";

pub const CHALLENGE_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Just a moment...</title></head>
<body><script src="/cdn-cgi/challenge-platform/h/b/orchestrate/jsch/v1"></script></body></html>"#;

pub const ARTICLE_HTML: &str = r#"<!DOCTYPE html>
<html><head>
<meta name="citation_title" content="Protein folding in yeast">
<title>Protein folding in yeast</title>
</head><body><article><h1>Protein folding in yeast</h1><p>Results.</p></article></body></html>"#;

/// Engine over `ledger` with a fresh in-memory cache
pub fn build_engine(
    config: &Config,
    ledger: pubcrawl::storage::SharedLedger,
    resolver: FixedResolver,
) -> pubcrawl::crawler::CrawlEngine {
    let fetcher = Fetcher::from_config(config, Some(memory_cache())).unwrap();
    pubcrawl::crawler::CrawlEngine::new(
        ledger,
        Arc::new(fetcher),
        Arc::new(resolver),
        Arc::new(pubcrawl::crawler::HeuristicClassifier::new()),
        pubcrawl::crawler::EngineConfig::from(config),
    )
}
