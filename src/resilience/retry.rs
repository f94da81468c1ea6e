//! Bounded retry with exponential backoff and jitter.
//!
//! # Backoff Schedule (defaults: base 1s, max 30s)
//!
//! | Attempt | Deterministic delay | With up to +30% jitter |
//! |---------|---------------------|------------------------|
//! | 0       | 1000ms              | 1000–1300ms            |
//! | 1       | 2000ms              | 2000–2600ms            |
//! | 2       | 4000ms              | 4000–5200ms            |
//! | 3       | 8000ms              | 8000–10400ms           |
//! | 4       | 16000ms             | 16000–20800ms          |
//! | 5       | 32000ms             | capped at 30000ms      |
//!
//! No overall deadline is enforced. Worst-case wall time is roughly
//! `max_retries × max_delay`; callers that need a bound wrap the call in
//! `tokio::time::timeout`.

use crate::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Errors that know whether retrying them can help.
pub trait Retryable {
    /// Returns `true` if the failure looks transient.
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. }
            | Self::Unauthorized(_)
            | Self::NotConfigured(_)
            | Self::InvalidInput(_) => false,
            Self::Timeout { .. } => true,
            Self::OperationFailed { cause, .. } => is_retryable_message(cause),
        }
    }
}

/// Classifies an error message as transient.
///
/// Matches rate limiting, quota exhaustion, service unavailability, timeouts,
/// connection resets and generic network failures.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "429",
        "rate limit",
        "quota",
        "too many requests",
        "503",
        "service unavailable",
        "timeout",
        "timed out",
        "econnreset",
        "connection reset",
        "network",
    ];
    let lower = message.to_lowercase();
    TRANSIENT.iter().any(|needle| lower.contains(needle))
}

/// Deterministic part of the backoff: `base_delay_ms * 2^attempt`, saturating.
#[must_use]
pub fn exponential_delay(attempt: u32, config: &RetryConfig) -> u64 {
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    config.base_delay_ms.saturating_mul(factor)
}

/// Computes the delay before retry number `attempt` (0-based).
///
/// `min(base * 2^attempt + jitter, max)` with jitter drawn uniformly from
/// `[0, 0.3 * base * 2^attempt)`.
#[must_use]
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exponential = exponential_delay(attempt, config);
    #[allow(clippy::cast_precision_loss)]
    let jitter_cap = exponential as f64 * 0.3;
    let jitter = if jitter_cap >= 1.0 {
        rand::thread_rng().gen_range(0.0..jitter_cap)
    } else {
        0.0
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jitter_ms = jitter as u64;
    Duration::from_millis(exponential.saturating_add(jitter_ms).min(config.max_delay_ms))
}

/// Callback invoked before each retry with `(attempt_number, delay, error)`.
pub type OnRetry<'a, E> = Box<dyn Fn(u32, Duration, &E) + Send + Sync + 'a>;

/// Predicate deciding whether an error should be retried.
pub type ShouldRetry<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;

/// Optional hooks for [`with_retry`].
pub struct RetryOptions<'a, E> {
    /// Called before sleeping for each retry; `attempt_number` starts at 1.
    pub on_retry: Option<OnRetry<'a, E>>,
    /// Overrides [`Retryable::is_retryable`].
    pub should_retry: Option<ShouldRetry<'a, E>>,
}

impl<E> Default for RetryOptions<'_, E> {
    fn default() -> Self {
        Self {
            on_retry: None,
            should_retry: None,
        }
    }
}

impl<'a, E> RetryOptions<'a, E> {
    /// Sets the retry callback.
    #[must_use]
    pub fn on_retry(mut self, hook: impl Fn(u32, Duration, &E) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Sets the retry predicate.
    #[must_use]
    pub fn should_retry(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.should_retry = Some(Box::new(predicate));
        self
    }
}

/// Runs `f` up to `max_retries + 1` times, sleeping with backoff in between.
///
/// # Errors
///
/// Returns the original error of the last attempt, unmodified, when retries
/// are exhausted or the predicate rejects the error.
pub async fn with_retry<T, E, F, Fut>(
    mut f: F,
    config: &RetryConfig,
    options: RetryOptions<'_, E>,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = options
                    .should_retry
                    .as_ref()
                    .map_or_else(|| err.is_retryable(), |predicate| predicate(&err));
                if attempt >= config.max_retries || !retryable {
                    return Err(err);
                }

                let delay = calculate_backoff(attempt, config);
                attempt += 1;
                metrics::counter!("retry_attempts_total").increment(1);
                tracing::debug!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retrying after transient failure"
                );
                if let Some(hook) = &options.on_retry {
                    hook(attempt, delay, &err);
                }
                tokio::time::sleep(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[test]
    fn test_backoff_capped_at_attempt_five() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        };
        assert_eq!(calculate_backoff(5, &config), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_jitter_range() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = calculate_backoff(1, &config).as_millis();
            assert!((2_000..2_600).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_exponential_delay_saturates() {
        let config = RetryConfig {
            max_retries: 0,
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: 10,
        };
        assert_eq!(exponential_delay(70, &config), u64::MAX);
        assert_eq!(calculate_backoff(70, &config), Duration::from_millis(10));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_max(
            attempt in 0u32..64,
            base in 1u64..10_000,
            max in 1u64..120_000,
        ) {
            let config = RetryConfig { max_retries: 5, base_delay_ms: base, max_delay_ms: max };
            let delay = calculate_backoff(attempt, &config);
            prop_assert!(delay <= Duration::from_millis(max));
        }

        #[test]
        fn prop_deterministic_part_increases_until_cap(attempt in 0u32..40, base in 1u64..10_000) {
            let config = RetryConfig { max_retries: 5, base_delay_ms: base, max_delay_ms: 30_000 };
            let current = exponential_delay(attempt, &config);
            let next = exponential_delay(attempt + 1, &config);
            if current < config.max_delay_ms {
                prop_assert!(next > current);
            }
        }
    }

    #[test_case("HTTP 429 Too Many Requests", true ; "rate limited")]
    #[test_case("quota exceeded", true ; "quota")]
    #[test_case("503 Service Unavailable", true ; "unavailable")]
    #[test_case("request timed out", true ; "timed out")]
    #[test_case("read ECONNRESET", true ; "connection reset")]
    #[test_case("network unreachable", true ; "network")]
    #[test_case("HTTP 404 Not Found", false ; "not found")]
    #[test_case("invalid json", false ; "decode")]
    fn test_retryable_messages(message: &str, expected: bool) {
        assert_eq!(is_retryable_message(message), expected);
    }

    #[test]
    fn test_circuit_open_is_never_retryable() {
        let err = Error::CircuitOpen {
            name: "network-timeout".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(
            Error::Timeout {
                operation: "fetch".to_string(),
                elapsed_ms: 5
            }
            .is_retryable()
        );
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_returns_original_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::operation("fetch", format!("503 attempt {n}"))) }
            },
            &fast(),
            RetryOptions::default(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(Error::OperationFailed { operation, cause }) => {
                assert_eq!(operation, "fetch");
                assert_eq!(cause, "503 attempt 3");
            },
            other => unreachable!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::InvalidInput("bad".to_string())) }
            },
            &fast(),
            RetryOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let retries = Mutex::new(Vec::new());
        let result = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::operation("fetch", "network error"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &fast(),
            RetryOptions::default().on_retry(|attempt, delay, _err: &Error| {
                retries
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((attempt, delay));
            }),
        )
        .await;

        assert_eq!(result.ok(), Some(2));
        let retries = retries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(retries.len(), 2);
        assert_eq!(retries[0].0, 1);
        assert_eq!(retries[1].0, 2);
        assert!(retries.iter().all(|(_, d)| *d <= Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_classifier() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::InvalidInput("retry me anyway".to_string())) }
            },
            &RetryConfig {
                max_retries: 2,
                ..fast()
            },
            RetryOptions::default().should_retry(|_err: &Error| true),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::operation("fetch", "timeout")) }
            },
            &RetryConfig {
                max_retries: 0,
                ..fast()
            },
            RetryOptions::default(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
