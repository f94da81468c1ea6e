//! Circuit breaker for unreliable dependencies.
//!
//! Wraps calls to a named dependency and stops calling it once it has failed
//! `failure_threshold` times in a row, failing fast (or serving a fallback)
//! until `reset_timeout` has elapsed since the last failure.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open | <---------------+
//! +--------+                               +------+                 |
//!     ^                                        |                    |
//!     |  half_open_requests successes          | reset timeout      | any failure
//!     |                                        v                    |
//!     +--------------------------------  +-----------+ -------------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! # Concurrency
//!
//! Each breaker owns one mutex guarding its counters. The mutex is never held
//! while the wrapped operation runs, so admission and result recording are two
//! separate critical sections. The half-open quota is enforced at admission;
//! results of trials that were admitted concurrently may still be recorded
//! after the breaker has already reopened or closed. Slight over-admission
//! under heavy concurrency is accepted behavior.
//!
//! A half-open trial whose future is dropped before it completes (for
//! example by an enclosing `tokio::time::timeout`) counts as a failed trial
//! and reopens the circuit, so the reset timeout always leads to a new trial.
//!
//! # Usage
//!
//! ```rust,ignore
//! use concierge_cache::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("cms"));
//! let events = breaker.execute(|| client.fetch_events_strict()).await?;
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without running.
    Open,
    /// A limited number of trial calls are admitted.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a numeric value for metrics.
    ///
    /// - 0: Closed
    /// - 1: Open
    /// - 2: Half-Open
    #[must_use]
    pub const fn as_gauge(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the protected dependency.
    pub name: String,
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to keep the circuit open before half-open, in milliseconds.
    pub reset_timeout_ms: u64,
    /// Trial calls admitted while half-open; the same number of successes closes it.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration with default thresholds for the named dependency.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reset_timeout_ms = timeout_ms;
        self
    }

    /// Sets the number of half-open trial requests.
    #[must_use]
    pub const fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests;
        self
    }
}

/// Point-in-time snapshot of a breaker.
///
/// `failures` and `successes` describe the current window (reset on
/// transitions); `total_requests` and `total_failures` are lifetime counters
/// and are never reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures in the current window.
    pub failures: u32,
    /// Successes in the current window.
    pub successes: u32,
    /// Time of the most recent failure.
    pub last_failure: Option<DateTime<Utc>>,
    /// Time of the most recent success.
    pub last_success: Option<DateTime<Utc>>,
    /// Earliest time an open circuit will admit a trial call.
    pub next_attempt: Option<DateTime<Utc>>,
    /// Calls seen over the breaker's lifetime.
    pub total_requests: u64,
    /// Failures seen over the breaker's lifetime.
    pub total_failures: u64,
}

/// Callback fired on every state transition with `(from, to, name)`.
pub type StateChangeHook = Arc<dyn Fn(CircuitState, CircuitState, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Stamp {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Stamp {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_attempts: u32,
    half_open_epoch: u64,
    last_failure: Option<Stamp>,
    last_success: Option<DateTime<Utc>>,
    total_requests: u64,
    total_failures: u64,
}

impl Counters {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            half_open_attempts: 0,
            half_open_epoch: 0,
            last_failure: None,
            last_success: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some((from, to))
    }

    fn reset(&mut self) -> Option<(CircuitState, CircuitState)> {
        let change = self.transition(CircuitState::Closed);
        self.failures = 0;
        self.successes = 0;
        self.half_open_attempts = 0;
        change
    }
}

enum Admission {
    /// Admitted; `Some(epoch)` for a half-open trial.
    Run(Option<u64>),
    Reject,
}

/// Settles a half-open trial that never reported a result.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    epoch: Option<u64>,
}

impl TrialGuard<'_> {
    fn complete(mut self) {
        self.epoch = None;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.epoch.take() {
            self.breaker.on_abandoned_trial(epoch);
        }
    }
}

/// Three-state circuit breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_requests: u32,
    counters: Mutex<Counters>,
    on_state_change: Option<StateChangeHook>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("half_open_requests", &self.half_open_requests)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a new circuit breaker. Thresholds of zero are clamped to one.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            name: config.name,
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            half_open_requests: config.half_open_requests.max(1),
            counters: Mutex::new(Counters::new()),
            on_state_change: None,
        }
    }

    /// Registers a callback fired on every state transition.
    #[must_use]
    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns `true` if the circuit is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Returns `true` if the circuit is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Runs `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without running `operation` when the
    /// circuit rejects the call, otherwise the operation's own error.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None::<fn() -> std::future::Ready<Result<T>>>)
            .await
    }

    /// Runs `operation` through the breaker, serving `fallback` when the
    /// circuit rejects the call or opens because of this call's failure.
    ///
    /// # Errors
    ///
    /// Returns the operation's error if it failed without opening the
    /// circuit, or the fallback's error.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(fallback)).await
    }

    async fn run<T, F, Fut, G, GFut>(&self, operation: F, fallback: Option<G>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        let Admission::Run(epoch) = self.admit() else {
            self.record_metrics("circuit_open");
            if let Some(fallback) = fallback {
                tracing::debug!(breaker = %self.name, state = %self.state(), "Circuit rejected call, using fallback");
                return fallback().await;
            }
            return Err(Error::CircuitOpen {
                name: self.name.clone(),
            });
        };

        let trial = TrialGuard {
            breaker: self,
            epoch,
        };
        let outcome = operation().await;
        trial.complete();

        match outcome {
            Ok(value) => {
                self.on_success();
                self.record_metrics("success");
                Ok(value)
            },
            Err(err) => {
                self.on_failure(&err);
                self.record_metrics("error");
                match fallback {
                    Some(fallback) if self.is_open() => {
                        tracing::debug!(breaker = %self.name, "Circuit opened, using fallback after failure");
                        fallback().await
                    },
                    _ => Err(err),
                }
            },
        }
    }

    fn admit(&self) -> Admission {
        let mut counters = self.lock();
        counters.total_requests += 1;

        let mut change = None;
        if counters.state == CircuitState::Open {
            let elapsed_enough = counters
                .last_failure
                .is_some_and(|stamp| stamp.at.elapsed() >= self.reset_timeout);
            if !elapsed_enough {
                return Admission::Reject;
            }
            change = counters.transition(CircuitState::HalfOpen);
            counters.half_open_attempts = 0;
            counters.successes = 0;
            counters.half_open_epoch = counters.half_open_epoch.wrapping_add(1);
            tracing::info!(breaker = %self.name, "Circuit breaker transitioning to half-open");
        }

        let admission = if counters.state == CircuitState::HalfOpen {
            if counters.half_open_attempts >= self.half_open_requests {
                Admission::Reject
            } else {
                counters.half_open_attempts += 1;
                Admission::Run(Some(counters.half_open_epoch))
            }
        } else {
            Admission::Run(None)
        };
        drop(counters);

        self.notify(change);
        admission
    }

    fn on_success(&self) {
        let mut counters = self.lock();
        counters.last_success = Some(Utc::now());

        let mut change = None;
        match counters.state {
            CircuitState::HalfOpen => {
                counters.successes += 1;
                if counters.successes >= self.half_open_requests {
                    change = counters.reset();
                    tracing::info!(breaker = %self.name, "Circuit breaker closed (recovered)");
                }
            },
            CircuitState::Closed => {
                counters.successes = counters.successes.saturating_add(1);
                counters.failures = 0;
            },
            // A trial admitted before the circuit reopened; the failure wins.
            CircuitState::Open => {},
        }
        drop(counters);

        self.notify(change);
    }

    fn on_failure(&self, err: &Error) {
        let mut counters = self.lock();
        counters.total_failures += 1;
        counters.failures = counters.failures.saturating_add(1);
        counters.last_failure = Some(Stamp::now());

        tracing::warn!(
            breaker = %self.name,
            failures = counters.failures,
            threshold = self.failure_threshold,
            error = %err,
            "Circuit breaker failure recorded"
        );

        let mut change = None;
        match counters.state {
            CircuitState::Closed if counters.failures >= self.failure_threshold => {
                change = counters.transition(CircuitState::Open);
                tracing::error!(
                    breaker = %self.name,
                    failures = counters.failures,
                    "Circuit breaker opened after consecutive failures"
                );
            },
            CircuitState::HalfOpen => {
                change = counters.transition(CircuitState::Open);
                counters.half_open_attempts = 0;
                counters.successes = 0;
                tracing::error!(breaker = %self.name, "Circuit breaker re-opened after half-open failure");
            },
            CircuitState::Closed | CircuitState::Open => {},
        }
        drop(counters);

        if change.is_some() {
            metrics::counter!("circuit_breaker_trips_total", "breaker" => self.name.clone())
                .increment(1);
        }
        self.notify(change);
    }

    /// Reopens the circuit when a trial of the current half-open window is
    /// dropped before reporting a result.
    fn on_abandoned_trial(&self, epoch: u64) {
        let mut counters = self.lock();
        if counters.state != CircuitState::HalfOpen || counters.half_open_epoch != epoch {
            return;
        }
        counters.total_failures += 1;
        counters.failures = counters.failures.saturating_add(1);
        counters.last_failure = Some(Stamp::now());
        let change = counters.transition(CircuitState::Open);
        counters.half_open_attempts = 0;
        counters.successes = 0;
        drop(counters);

        tracing::warn!(breaker = %self.name, "Half-open trial cancelled, circuit re-opened");
        self.record_metrics("cancelled");
        metrics::counter!("circuit_breaker_trips_total", "breaker" => self.name.clone()).increment(1);
        self.notify(change);
    }

    /// Forces the circuit open, as if a failure had just been recorded.
    pub fn force_open(&self) {
        let mut counters = self.lock();
        let change = counters.transition(CircuitState::Open);
        counters.last_failure = Some(Stamp::now());
        counters.half_open_attempts = 0;
        drop(counters);

        tracing::warn!(breaker = %self.name, "Circuit breaker forced open");
        self.notify(change);
    }

    /// Forces the circuit closed and clears the window counters.
    pub fn force_close(&self) {
        let change = self.lock().reset();
        tracing::info!(breaker = %self.name, "Circuit breaker forced closed");
        self.notify(change);
    }

    /// Returns a consistent snapshot of the breaker's counters.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let counters = self.lock();
        let last_failure = counters.last_failure.map(|stamp| stamp.wall);
        let next_attempt = last_failure.and_then(|at| {
            chrono::Duration::from_std(self.reset_timeout)
                .ok()
                .map(|timeout| at + timeout)
        });

        CircuitStats {
            name: self.name.clone(),
            state: counters.state,
            failures: counters.failures,
            successes: counters.successes,
            last_failure,
            last_success: counters.last_success,
            next_attempt,
            total_requests: counters.total_requests,
            total_failures: counters.total_failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };
        metrics::gauge!("circuit_breaker_state", "breaker" => self.name.clone())
            .set(f64::from(to.as_gauge()));
        if let Some(hook) = &self.on_state_change {
            hook(from, to, &self.name);
        }
    }

    fn record_metrics(&self, status: &'static str) {
        metrics::counter!(
            "circuit_breaker_requests_total",
            "breaker" => self.name.clone(),
            "status" => status
        )
        .increment(1);
    }
}

/// Hands out one breaker per dependency name.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers share `defaults` (except the name).
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            let config = CircuitBreakerConfig {
                name: name.to_string(),
                ..self.defaults.clone()
            };
            Arc::new(CircuitBreaker::new(config))
        }))
    }

    /// Returns stats for every registered breaker, sorted by name.
    #[must_use]
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<CircuitStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
