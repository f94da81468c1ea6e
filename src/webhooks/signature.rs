//! HMAC-SHA256 authentication of CMS push notifications.
//!
//! The sender signs `"{timestamp}.{raw_body}"` with the shared secret and
//! sends the hex digest in `x-signature` and the Unix timestamp in
//! milliseconds in `x-timestamp`.
//!
//! # Checks (in order)
//!
//! | Check | Failure |
//! |-------|---------|
//! | secret configured | [`Rejection::NotConfigured`] (500) |
//! | both headers present | [`Rejection::MissingHeaders`] (401) |
//! | `|now - timestamp| <= max_age` | [`Rejection::TimestampExpired`] (401) |
//! | digest matches (constant time) | [`Rejection::InvalidSignature`] (401) |
//!
//! A timestamp that does not parse is reported as expired.

use crate::{Error, Result, current_timestamp_ms};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC digest.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Header carrying the signing time in Unix milliseconds.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Default replay window.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Why a push notification was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No shared secret is configured.
    NotConfigured,
    /// `x-signature` or `x-timestamp` is absent or empty.
    MissingHeaders,
    /// The timestamp is unparseable or outside the replay window.
    TimestampExpired,
    /// The digest does not match.
    InvalidSignature,
}

impl Rejection {
    /// HTTP status code for the rejection.
    #[must_use]
    pub const fn status(self) -> u16 {
        match self {
            Self::NotConfigured => 500,
            Self::MissingHeaders | Self::TimestampExpired | Self::InvalidSignature => 401,
        }
    }

    /// Client-facing error message.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotConfigured => "Push not configured",
            Self::MissingHeaders => "Missing signature headers",
            Self::TimestampExpired => "Timestamp expired",
            Self::InvalidSignature => "Invalid signature",
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::MissingHeaders => "missing_headers",
            Self::TimestampExpired => "timestamp_expired",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::NotConfigured => Self::NotConfigured("push secret".to_string()),
            other => Self::Unauthorized(other.message().to_string()),
        }
    }
}

/// Computes the hex HMAC-SHA256 of `"{timestamp}.{body}"`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the key is rejected by the MAC.
pub fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidInput(format!("invalid HMAC key: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies push notification signatures.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<SecretString>,
    max_age: Duration,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("configured", &self.is_configured())
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl SignatureVerifier {
    /// Creates a verifier. `None` or an empty secret disables the webhook.
    #[must_use]
    pub fn new(secret: Option<SecretString>) -> Self {
        Self {
            secret: secret.filter(|s| !s.expose_secret().is_empty()),
            max_age: DEFAULT_MAX_AGE,
        }
    }

    /// Sets the replay window.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Returns `true` if a secret is configured.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Verifies against the current wall clock.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] encountered.
    pub fn verify(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
    ) -> std::result::Result<(), Rejection> {
        self.verify_at(signature, timestamp, body, current_timestamp_ms())
    }

    /// Verifies as if the current time were `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] encountered.
    pub fn verify_at(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
        now_ms: u64,
    ) -> std::result::Result<(), Rejection> {
        let secret = self.secret.as_ref().ok_or(Rejection::NotConfigured)?;

        let signature = signature.map(str::trim).filter(|s| !s.is_empty());
        let timestamp = timestamp.map(str::trim).filter(|t| !t.is_empty());
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            return Err(Rejection::MissingHeaders);
        };

        let sent_ms: i128 = timestamp
            .parse::<i64>()
            .map_err(|_| Rejection::TimestampExpired)?
            .into();
        let age_ms = i128::from(now_ms) - sent_ms;
        if age_ms.abs() > self.max_age.as_millis().try_into().unwrap_or(i128::MAX) {
            return Err(Rejection::TimestampExpired);
        }

        let digest = signature.strip_prefix("sha256=").unwrap_or(signature);
        let provided = hex::decode(digest).map_err(|_| Rejection::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| Rejection::InvalidSignature)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(&provided)
            .map_err(|_| Rejection::InvalidSignature)
    }
}
