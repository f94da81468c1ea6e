//! Fault isolation for calls to unreliable dependencies.
//!
//! Two independent building blocks:
//!
//! - [`CircuitBreaker`] stops calling a dependency that keeps failing.
//! - [`with_retry`] re-runs transient failures with exponential backoff.
//!
//! When both are used the breaker is the outer layer:
//!
//! ```rust,ignore
//! let value = breaker
//!     .execute(|| with_retry(|| source.fetch(), &retry, RetryOptions::default()))
//!     .await?;
//! ```
//!
//! An exhausted retry sequence therefore counts as a single breaker failure,
//! and a breaker rejection ([`crate::Error::CircuitOpen`]) is never retried.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats,
    StateChangeHook,
};
pub use retry::{
    OnRetry, RetryConfig, RetryOptions, Retryable, ShouldRetry, calculate_backoff,
    exponential_delay, is_retryable_message, with_retry,
};
