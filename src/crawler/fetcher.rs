//! Fetcher: cache, throttle and strategy escalation for one URL
//!
//! For every URL the fetcher:
//! - Holds the URL's in-flight slot, so two workers never fetch the same
//!   cache key at once (the second one is served by the first one's entry)
//! - Serves a usable cached response without touching the network
//! - Waits on the per-host throttle (failing fast while the host cools down)
//! - Waits on the optional process-wide quota
//! - Runs the strategy chain: `Blocked` escalates at once, `Retryable` retries
//!   the same strategy with jittered backoff before escalating, `Permanent`
//!   ends the fetch
//! - Caches every 2xx response before returning its classification
//!
//! Per-URL failures are reported as [`FetchOutcome`]s. Only cache failures,
//! which concern the whole dataset, are returned as `Err`.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cache::{CacheEntry, CacheKey, RequestCache};
use crate::config::Config;
use crate::crawler::challenge::detect_challenge;
use crate::crawler::shutdown::ShutdownSignal;
use crate::crawler::strategy::{build_strategies, RawResponse, SharedStrategy};
use crate::crawler::throttle::{HostThrottle, ThrottlePolicy};
use crate::metrics;
use crate::models::{ChallengeType, FailureReason, FetchOutcome};
use crate::utils::error::{CacheError, StrategyError, ThrottleError};
use crate::utils::origin_of;
use crate::utils::retry::RetryConfig;

/// Result of [`Fetcher::fetch`]
#[derive(Debug, Clone)]
pub struct Fetched {
    pub outcome: FetchOutcome,
    /// Network attempts made (0 for cache hits and fail-fast outcomes)
    pub attempts: u32,
    /// Strategy that produced the outcome
    pub strategy: Option<String>,
    pub from_cache: bool,
}

impl Fetched {
    fn without_network(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            attempts: 0,
            strategy: None,
            from_cache: false,
        }
    }
}

type FlightSlot = Arc<tokio::sync::Mutex<()>>;

/// URL fetcher shared by all workers
pub struct Fetcher {
    strategies: Vec<SharedStrategy>,
    throttle: Arc<HostThrottle>,
    cache: Option<Arc<dyn RequestCache>>,
    /// Appended to every cache key
    key_signature: Option<String>,
    global_limiter: Option<DefaultDirectRateLimiter>,
    retry: RetryConfig,
    /// One slot per cache key currently being fetched
    in_flight: Mutex<HashMap<String, FlightSlot>>,
}

impl Fetcher {
    /// Create a fetcher over an ordered strategy chain
    ///
    /// `retry.max_attempts` is the number of attempts per strategy.
    pub fn new(strategies: Vec<SharedStrategy>, throttle: Arc<HostThrottle>, retry: RetryConfig) -> Self {
        Self {
            strategies,
            throttle,
            cache: None,
            key_signature: None,
            global_limiter: None,
            retry,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Build the fetcher described by `config`
    pub fn from_config(
        config: &Config,
        cache: Option<Arc<dyn RequestCache>>,
    ) -> Result<Self, StrategyError> {
        let strategies = build_strategies(&config.fetch)?;
        let throttle = Arc::new(HostThrottle::new(ThrottlePolicy::from(&config.throttle)));

        let mut fetcher = Self::new(strategies, throttle, config.fetch.retry_config());
        fetcher.cache = cache;
        if let Some(signature) = &config.cache.signature {
            fetcher = fetcher.with_key_signature(signature);
        }
        if let Some(rps) = config.fetch.global_requests_per_second {
            fetcher = fetcher.with_global_rate(rps);
        }
        Ok(fetcher)
    }

    pub fn with_cache(mut self, cache: Arc<dyn RequestCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Keep cache entries apart from those written under another signature
    pub fn with_key_signature(mut self, signature: &str) -> Self {
        self.key_signature = Some(signature.to_string()).filter(|s| !s.is_empty());
        self
    }

    /// Cap requests across all hosts
    pub fn with_global_rate(mut self, requests_per_second: u32) -> Self {
        self.global_limiter = NonZeroU32::new(requests_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));
        self
    }

    pub fn throttle(&self) -> &Arc<HostThrottle> {
        &self.throttle
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    /// Fetch `url` through cache, throttle and the strategy chain
    pub async fn fetch(&self, url: &str, shutdown: &ShutdownSignal) -> Result<Fetched, CacheError> {
        self.fetch_limited(url, u32::MAX, shutdown).await
    }

    /// Like [`Fetcher::fetch`], making at most `max_attempts` network attempts
    pub async fn fetch_limited(
        &self,
        url: &str,
        max_attempts: u32,
        shutdown: &ShutdownSignal,
    ) -> Result<Fetched, CacheError> {
        let (key, origin) = match (CacheKey::from_url(url), origin_of(url)) {
            (Ok(key), Ok(origin)) => (key, origin),
            (Err(e), _) => {
                return Ok(Fetched::without_network(FetchOutcome::PermanentFailure(
                    FailureReason::InvalidUrl(e.to_string()),
                )))
            }
            (_, Err(e)) => {
                return Ok(Fetched::without_network(FetchOutcome::PermanentFailure(
                    FailureReason::InvalidUrl(e.to_string()),
                )))
            }
        };
        let key = match &self.key_signature {
            Some(signature) => key.with_signature(signature),
            None => key,
        };

        let slot = self.flight_slot(&key);
        let result = {
            let guard = tokio::select! {
                guard = slot.lock() => Some(guard),
                _ = shutdown.triggered() => None,
            };

            match guard {
                Some(_flight) => self.fetch_key(url, &key, &origin, max_attempts, shutdown).await,
                None => Ok(Fetched::without_network(FetchOutcome::RetryableFailure(
                    FailureReason::Interrupted,
                ))),
            }
        };

        self.release_flight_slot(&key, slot);
        result
    }

    fn flight_slot(&self, key: &CacheKey) -> FlightSlot {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(in_flight.entry(key.as_str().to_string()).or_default())
    }

    fn release_flight_slot(&self, key: &CacheKey, slot: FlightSlot) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this caller hold it: nobody is waiting
        if Arc::strong_count(&slot) == 2 {
            in_flight.remove(key.as_str());
        }
    }

    /// Number of cache keys with a fetch in progress or queued
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Serve from cache, or run the strategy chain; caller holds the key's slot
    async fn fetch_key(
        &self,
        url: &str,
        key: &CacheKey,
        origin: &str,
        max_attempts: u32,
        shutdown: &ShutdownSignal,
    ) -> Result<Fetched, CacheError> {
        if let Some(hit) = self.cached(url, key)? {
            return Ok(hit);
        }

        let per_strategy = self.retry.max_attempts.max(1);
        let mut attempts = 0;
        let mut last = Fetched::without_network(FetchOutcome::RetryableFailure(
            FailureReason::Network("no fetch attempt made".to_string()),
        ));

        'chain: for strategy in &self.strategies {
            let name = strategy.name().to_string();

            for try_no in 0..per_strategy {
                if attempts >= max_attempts {
                    tracing::debug!(url = url, attempts, "Attempt budget spent");
                    break 'chain;
                }
                if try_no > 0 {
                    let delay = self.retry.delay_for(try_no);
                    tracing::debug!(url = url, strategy = %name, delay_ms = delay.as_millis() as u64, "Retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.triggered() => {
                            return Ok(self.interrupted(attempts, &name));
                        }
                    }
                }

                match self.throttle.acquire(origin, shutdown).await {
                    Ok(()) => {}
                    Err(ThrottleError::CoolingDown { remaining, .. }) => {
                        tracing::debug!(
                            url = url,
                            remaining_secs = remaining.as_secs(),
                            "Host cooling down, skipping"
                        );
                        return Ok(Fetched {
                            outcome: FetchOutcome::Blocked(ChallengeType::HostCoolingDown),
                            attempts,
                            strategy: Some(name),
                            from_cache: false,
                        });
                    }
                    Err(ThrottleError::Interrupted(_)) => {
                        return Ok(self.interrupted(attempts, &name));
                    }
                }

                if let Some(limiter) = &self.global_limiter {
                    tokio::select! {
                        _ = limiter.until_ready() => {}
                        _ = shutdown.triggered() => {
                            return Ok(self.interrupted(attempts, &name));
                        }
                    }
                }

                let started = Instant::now();
                let result = strategy.attempt(url).await;
                attempts += 1;

                let outcome = match result {
                    Ok(response) => self.store_and_classify(key, response)?,
                    Err(e) => classify_error(&e),
                };

                metrics::record_fetch(&name, outcome.label(), started.elapsed().as_secs_f64());
                self.report(origin, &outcome);

                tracing::debug!(
                    url = url,
                    strategy = %name,
                    attempt = try_no + 1,
                    outcome = outcome.label(),
                    "Fetch attempt finished"
                );

                let done = matches!(
                    outcome,
                    FetchOutcome::Success { .. } | FetchOutcome::PermanentFailure(_)
                );
                let escalate = matches!(outcome, FetchOutcome::Blocked(_));
                last = Fetched {
                    outcome,
                    attempts,
                    strategy: Some(name.clone()),
                    from_cache: false,
                };

                if done {
                    return Ok(last);
                }
                if escalate {
                    break;
                }
            }
        }

        last.attempts = attempts;
        Ok(last)
    }

    /// Usable cached response for `key`
    ///
    /// Hits are classified again; an entry that no longer passes (a challenge
    /// page cached before it was recognized) is marked stale and refetched.
    fn cached(&self, url: &str, key: &CacheKey) -> Result<Option<Fetched>, CacheError> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let hit = cache.lookup(key)?;
        metrics::record_cache_lookup(hit.is_some());
        let Some(entry) = hit else {
            return Ok(None);
        };

        let response = RawResponse {
            status: entry.status_code,
            headers: entry.headers,
            content_type: entry.content_type,
            body: entry.body,
            final_url: entry.url,
        };
        match classify_response(&response) {
            outcome @ FetchOutcome::Success { .. } => {
                tracing::debug!(url = url, "Cache hit");
                Ok(Some(Fetched {
                    outcome,
                    attempts: 0,
                    strategy: None,
                    from_cache: true,
                }))
            }
            outcome => {
                tracing::info!(url = url, outcome = outcome.label(), "Cached response unusable, refetching");
                cache.mark_stale(key)?;
                Ok(None)
            }
        }
    }

    fn interrupted(&self, attempts: u32, strategy: &str) -> Fetched {
        Fetched {
            outcome: FetchOutcome::RetryableFailure(FailureReason::Interrupted),
            attempts,
            strategy: Some(strategy.to_string()),
            from_cache: false,
        }
    }

    fn report(&self, origin: &str, outcome: &FetchOutcome) {
        let success = match outcome {
            FetchOutcome::Success { .. } => true,
            FetchOutcome::RetryableFailure(_) | FetchOutcome::Blocked(_) => false,
            // A missing article says nothing about the host's mood
            FetchOutcome::PermanentFailure(_) => return,
        };
        if self.throttle.report_result(origin, success) {
            metrics::record_cooldown(origin);
        }
    }

    /// Cache a 2xx response, then classify it
    fn store_and_classify(&self, key: &CacheKey, response: RawResponse) -> Result<FetchOutcome, CacheError> {
        let outcome = classify_response(&response);

        if let (Some(cache), true) = (&self.cache, (200..300).contains(&response.status)) {
            let mut entry = CacheEntry::new(
                key.clone(),
                response.final_url.clone(),
                response.status,
                response.content_type.clone(),
                response.body.clone(),
            )
            .with_headers(response.headers.clone());

            // Challenge pages and empty bodies are kept for inspection but never served
            if !outcome.is_success() {
                entry = entry.into_stale();
            }
            cache.put(&entry)?;
        }

        Ok(outcome)
    }
}

/// Classify a strategy error
pub fn classify_error(error: &StrategyError) -> FetchOutcome {
    match error {
        e if e.is_timeout() => FetchOutcome::RetryableFailure(FailureReason::Timeout),
        StrategyError::BodyTooLarge(_) | StrategyError::Config(_) => {
            FetchOutcome::PermanentFailure(FailureReason::Network(error.to_string()))
        }
        e => FetchOutcome::RetryableFailure(FailureReason::Network(e.to_string())),
    }
}

/// Classify a raw response
pub fn classify_response(response: &RawResponse) -> FetchOutcome {
    if let Some(kind) = detect_challenge(
        response.status,
        &response.headers,
        &response.content_type,
        &response.body,
    ) {
        return FetchOutcome::Blocked(kind);
    }

    match response.status {
        200..=299 if response.body.is_empty() => {
            FetchOutcome::RetryableFailure(FailureReason::EmptyBody)
        }
        200..=299 => FetchOutcome::Success {
            body: response.body.clone(),
            content_type: response.content_type.clone(),
            status_code: response.status,
            final_url: response.final_url.clone(),
        },
        408 => FetchOutcome::RetryableFailure(FailureReason::HttpStatus(408)),
        400..=499 => FetchOutcome::PermanentFailure(FailureReason::HttpStatus(response.status)),
        status => FetchOutcome::RetryableFailure(FailureReason::HttpStatus(status)),
    }
}
