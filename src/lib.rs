//! # Concierge Cache
//!
//! Resilience and caching layer between a concierge chat bot and the CMS that
//! feeds it.
//!
//! The CMS is treated as unreliable. Everything the bot needs from it is
//! aggregated into a single knowledge string that is cached in memory, backed
//! by on-disk snapshots, and invalidated by a signed push webhook whenever the
//! content changes upstream.
//!
//! ## Components
//!
//! - [`resilience::CircuitBreaker`] - three-state fault isolator per dependency
//! - [`resilience::with_retry`] - bounded retry with exponential backoff and jitter
//! - [`storage::SnapshotStore`] - atomic on-disk JSON snapshots, stale-while-revalidate
//! - [`knowledge::KnowledgeCache`] - coalesced, TTL-guarded knowledge aggregation
//! - [`webhooks::WebhookInvalidator`] - HMAC-authenticated cache invalidation
//! - [`session::SessionStore`] - sliding-TTL conversational session store
//!
//! ## Example
//!
//! ```rust,ignore
//! use concierge_cache::{AppContext, ConciergeConfig};
//!
//! let context = AppContext::build(ConciergeConfig::load_default())?;
//! let knowledge = context.knowledge().get().await;
//! let session = context.sessions().create(serde_json::json!({ "knowledge": knowledge }));
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod cms;
pub mod config;
pub mod context;
pub mod http;
pub mod knowledge;
pub mod observability;
pub mod resilience;
pub mod session;
pub mod storage;
pub mod webhooks;

// Re-exports for convenience
pub use cms::{CmsClient, ContentSource};
pub use config::ConciergeConfig;
pub use context::AppContext;
pub use knowledge::{Freshness, Knowledge, KnowledgeCache};
pub use resilience::{CircuitBreaker, CircuitState, CircuitStats, RetryConfig, with_retry};
pub use session::{Message, Role, Session, SessionStore};
pub use storage::SnapshotStore;
pub use webhooks::{SignatureVerifier, WebhookInvalidator};

/// Error type for concierge-cache operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Malformed keys, roles, or request payloads |
/// | `OperationFailed` | HTTP, I/O, or serialization failures talking to a dependency |
/// | `CircuitOpen` | A circuit breaker rejected the call without running it |
/// | `Timeout` | An upstream call exceeded its deadline |
/// | `Unauthorized` | Webhook signature or timestamp verification failed |
/// | `NotConfigured` | A required secret or endpoint is missing |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    ///
    /// Raised when:
    /// - The CMS answers with a non-success status or an undecodable body
    /// - Filesystem I/O fails
    /// - The HTTP server cannot bind or serve
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The circuit breaker for a dependency is open.
    ///
    /// Never retryable: retrying a fast-fail rejection only burns attempts.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call.
        name: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// Elapsed time in milliseconds.
        elapsed_ms: u64,
    },

    /// Authentication failed.
    ///
    /// Raised when:
    /// - Webhook signature headers are missing
    /// - The webhook timestamp is outside the replay window
    /// - The HMAC signature does not match
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A required piece of configuration is absent.
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl Error {
    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for concierge-cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
