//! Per-host adaptive throttle
//!
//! Each origin (`scheme://host[:port]`) gets its own spacing between request
//! starts. Failures multiply the spacing by `backoff_factor` up to
//! `max_delay`; successes decay it back towards `min_delay`. After
//! `cooldown_threshold` consecutive failures the host is quarantined for
//! `cooldown` and every acquire fails fast until it expires. After expiry the
//! host is half-open: the failure counter is reset but the learned delay is
//! kept.
//!
//! Requests to one host are serialized through a per-host async gate held
//! across the wait. Different hosts never contend.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ThrottleConfig;
use crate::crawler::shutdown::ShutdownSignal;
use crate::utils::error::ThrottleError;

/// Throttle parameters, validated by [`crate::config::Config::validate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub decay_factor: f64,
    pub cooldown_threshold: u32,
    pub cooldown: Duration,
    pub jitter: Duration,
}

impl From<&ThrottleConfig> for ThrottlePolicy {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            min_delay: config.min_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            decay_factor: config.decay_factor,
            cooldown_threshold: config.cooldown_threshold,
            cooldown: config.cooldown(),
            jitter: config.jitter(),
        }
    }
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::from(&ThrottleConfig::default())
    }
}

/// Throttle state of one host
#[derive(Debug, Clone)]
pub struct HostState {
    pub current_delay: Duration,
    pub last_request: Option<Instant>,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<Instant>,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl HostState {
    pub fn new(policy: &ThrottlePolicy) -> Self {
        Self {
            current_delay: policy.min_delay,
            last_request: None,
            consecutive_failures: 0,
            cooldown_until: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    /// Apply a failure; returns true when this failure starts a cooldown
    pub fn on_failure(&mut self, policy: &ThrottlePolicy, now: Instant) -> bool {
        self.current_delay = self
            .current_delay
            .mul_f64(policy.backoff_factor)
            .max(self.current_delay + Duration::from_millis(1))
            .min(policy.max_delay);
        self.consecutive_failures += 1;
        self.total_failures += 1;

        if self.consecutive_failures >= policy.cooldown_threshold && self.cooldown_until.is_none() {
            self.cooldown_until = Some(now + policy.cooldown);
            return true;
        }
        false
    }

    pub fn on_success(&mut self, policy: &ThrottlePolicy) {
        self.current_delay = self
            .current_delay
            .mul_f64(policy.decay_factor)
            .max(policy.min_delay);
        self.consecutive_failures = 0;
    }

    /// Remaining cooldown at `now`; clears an expired cooldown (half-open)
    fn check_cooldown(&mut self, now: Instant) -> Option<Duration> {
        match self.cooldown_until {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                self.cooldown_until = None;
                self.consecutive_failures = 0;
                None
            }
            None => None,
        }
    }
}

/// Point-in-time view of a host for progress reporting
#[derive(Debug, Clone, PartialEq)]
pub struct HostSnapshot {
    pub host: String,
    pub current_delay: Duration,
    pub consecutive_failures: u32,
    pub cooldown_remaining: Option<Duration>,
    pub total_requests: u64,
    pub total_failures: u64,
}

struct HostSlot {
    /// Serializes acquires for the host; held across the wait
    gate: tokio::sync::Mutex<()>,
    state: Mutex<HostState>,
}

impl HostSlot {
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-host throttle shared by all workers
pub struct HostThrottle {
    policy: ThrottlePolicy,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
}

impl HostThrottle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    fn slot(&self, origin: &str) -> Arc<HostSlot> {
        let mut hosts = self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(hosts.entry(origin.to_string()).or_insert_with(|| {
            Arc::new(HostSlot {
                gate: tokio::sync::Mutex::new(()),
                state: Mutex::new(HostState::new(&self.policy)),
            })
        }))
    }

    fn jitter(&self) -> Duration {
        let max = self.policy.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Wait until a request to `origin` may start
    ///
    /// Fails fast with [`ThrottleError::CoolingDown`] while the host is
    /// quarantined and with [`ThrottleError::Interrupted`] when `shutdown`
    /// fires during the wait.
    pub async fn acquire(&self, origin: &str, shutdown: &ShutdownSignal) -> Result<(), ThrottleError> {
        if shutdown.is_triggered() {
            return Err(ThrottleError::Interrupted(origin.to_string()));
        }

        let slot = self.slot(origin);
        let _gate = tokio::select! {
            guard = slot.gate.lock() => guard,
            _ = shutdown.triggered() => return Err(ThrottleError::Interrupted(origin.to_string())),
        };

        let jitter = self.jitter();
        loop {
            let now = Instant::now();
            let ready_at = {
                let mut state = slot.state();
                if let Some(remaining) = state.check_cooldown(now) {
                    return Err(ThrottleError::CoolingDown {
                        host: origin.to_string(),
                        remaining,
                    });
                }
                state.last_request.map(|last| last + state.current_delay + jitter)
            };

            match ready_at {
                Some(at) if at > now => {
                    tracing::trace!(
                        host = origin,
                        wait_ms = (at - now).as_millis() as u64,
                        "Throttling request"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = shutdown.triggered() => {
                            return Err(ThrottleError::Interrupted(origin.to_string()));
                        }
                    }
                    // Delay may have grown while waiting; re-check
                }
                _ => {
                    let mut state = slot.state();
                    state.last_request = Some(Instant::now());
                    state.total_requests += 1;
                    return Ok(());
                }
            }
        }
    }

    /// Feed a request result back into the host's delay
    ///
    /// Returns true when this result put the host into cooldown.
    pub fn report_result(&self, origin: &str, success: bool) -> bool {
        let slot = self.slot(origin);
        let mut state = slot.state();

        if success {
            state.on_success(&self.policy);
            return false;
        }

        let entered = state.on_failure(&self.policy, Instant::now());
        if entered {
            tracing::warn!(
                host = origin,
                failures = state.consecutive_failures,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "Host entered cooldown"
            );
        } else {
            tracing::debug!(
                host = origin,
                failures = state.consecutive_failures,
                delay_ms = state.current_delay.as_millis() as u64,
                "Backing off host"
            );
        }
        entered
    }

    pub fn snapshot(&self, origin: &str) -> Option<HostSnapshot> {
        let slot = {
            let hosts = self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(hosts.get(origin)?)
        };
        let state = slot.state();
        let now = Instant::now();

        Some(HostSnapshot {
            host: origin.to_string(),
            current_delay: state.current_delay,
            consecutive_failures: state.consecutive_failures,
            cooldown_remaining: state
                .cooldown_until
                .filter(|until| *until > now)
                .map(|until| until - now),
            total_requests: state.total_requests,
            total_failures: state.total_failures,
        })
    }

    /// Snapshots of every host seen so far, sorted by host
    pub fn hosts(&self) -> Vec<HostSnapshot> {
        let origins: Vec<String> = {
            let hosts = self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            hosts.keys().cloned().collect()
        };
        let mut snapshots: Vec<_> = origins.iter().filter_map(|o| self.snapshot(o)).collect();
        snapshots.sort_by(|a, b| a.host.cmp(&b.host));
        snapshots
    }
}
