//! HTTP client for the CMS content API.
//!
//! Each collection is read with `GET {base}/api/cms/v1/{collection}` and an
//! `x-api-key` header; the response is a `{"data": [...]}` envelope.
//!
//! # Degradation
//!
//! | Outcome | Returned |
//! |---------|----------|
//! | 2xx with a valid envelope | fresh data, snapshot `<collection>` updated |
//! | anything else | snapshot `<collection>` if present |
//! | no snapshot either | empty list |
//!
//! When a [`CircuitBreaker`] and/or [`RetryConfig`] are attached, each request
//! runs as `breaker(retry(request))`.

use super::{CmsBook, CmsEvent, CmsFaq, ContentSource};
use crate::resilience::{CircuitBreaker, RetryConfig, RetryOptions, with_retry};
use crate::storage::SnapshotStore;
use crate::{Error, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection settings for the CMS.
#[derive(Debug, Clone)]
pub struct CmsConfig {
    /// Base URL, e.g. `https://cms.example.com`. `None` disables upstream reads.
    pub base_url: Option<String>,
    /// API key sent as `x-api-key`.
    pub api_key: Option<SecretString>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: Vec<T>,
}

/// CMS client implementing [`ContentSource`].
pub struct CmsClient {
    http: reqwest::Client,
    config: CmsConfig,
    snapshots: SnapshotStore,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryConfig>,
}

impl CmsClient {
    /// Creates a client that falls back to `snapshots` on failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the HTTP client cannot be built,
    /// e.g. when the TLS backend fails to initialize.
    pub fn new(config: CmsConfig, snapshots: SnapshotStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("concierge-cache/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| Error::operation("build_cms_client", e))?;

        Ok(Self {
            http,
            config,
            snapshots,
            breaker: None,
            retry: None,
        })
    }

    /// Routes every request through `breaker`.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Retries transient request failures.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Returns `true` if both base URL and API key are set.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.base_url.as_deref().is_some_and(|u| !u.is_empty())
            && self
                .config
                .api_key
                .as_ref()
                .is_some_and(|k| !k.expose_secret().is_empty())
    }

    /// Reads a collection from upstream without any snapshot fallback.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConfigured`] if the base URL or API key is missing
    /// - [`Error::CircuitOpen`] if the attached breaker rejects the call
    /// - [`Error::Timeout`] or [`Error::OperationFailed`] for request failures
    pub async fn fetch_collection<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        if !self.is_configured() {
            return Err(Error::NotConfigured("CMS base URL or API key".to_string()));
        }

        let retried = || async {
            match &self.retry {
                Some(config) => {
                    with_retry(
                        || self.request::<T>(collection),
                        config,
                        RetryOptions::default(),
                    )
                    .await
                },
                None => self.request::<T>(collection).await,
            }
        };

        match &self.breaker {
            Some(breaker) => breaker.execute(retried).await,
            None => retried().await,
        }
    }

    /// Reads a collection, degrading to its snapshot and then to an empty list.
    pub async fn fetch_or_snapshot<T>(&self, collection: &str) -> Vec<T>
    where
        T: DeserializeOwned + serde::Serialize + Send + Sync + 'static,
    {
        match self.fetch_collection::<T>(collection).await {
            Ok(items) => {
                metrics::counter!("cms_requests_total", "collection" => collection.to_string(), "status" => "success")
                    .increment(1);
                self.snapshots.save_async(collection, &items).await;
                items
            },
            Err(e) => {
                metrics::counter!("cms_requests_total", "collection" => collection.to_string(), "status" => "error")
                    .increment(1);
                match &e {
                    Error::NotConfigured(_) => {
                        tracing::debug!(collection, "CMS not configured, using snapshot");
                    },
                    _ => tracing::warn!(collection, error = %e, "CMS fetch failed, using snapshot"),
                }
                self.snapshots
                    .load_async(collection)
                    .await
                    .unwrap_or_default()
            },
        }
    }

    async fn request<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let operation = format!("cms_fetch_{collection}");
        let (Some(base), Some(key)) = (&self.config.base_url, &self.config.api_key) else {
            return Err(Error::NotConfigured("CMS base URL or API key".to_string()));
        };
        let url = format!("{}/api/cms/v1/{collection}", base.trim_end_matches('/'));

        let started = Instant::now();
        let response = self
            .http
            .get(&url)
            .header("x-api-key", key.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(&operation, &e, started))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::operation(operation, format!("HTTP {status}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| transport_error(&operation, &e, started))?;

        tracing::debug!(
            collection,
            items = envelope.data.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Fetched CMS collection"
        );
        Ok(envelope.data)
    }
}

/// Maps a reqwest error to the crate error so retry classification works.
fn transport_error(operation: &str, err: &reqwest::Error, started: Instant) -> Error {
    if err.is_timeout() {
        return Error::Timeout {
            operation: operation.to_string(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
    }
    if err.is_decode() {
        return Error::operation(operation, format!("invalid response body: {err}"));
    }
    if err.is_connect() || err.is_request() || err.is_body() {
        return Error::operation(operation, format!("network error: {err}"));
    }
    Error::operation(operation, err)
}

#[async_trait]
impl ContentSource for CmsClient {
    async fn fetch_events(&self) -> Vec<CmsEvent> {
        self.fetch_or_snapshot("events").await
    }

    async fn fetch_books(&self) -> Vec<CmsBook> {
        self.fetch_or_snapshot("books").await
    }

    async fn fetch_faqs(&self) -> Vec<CmsFaq> {
        self.fetch_or_snapshot("faqs").await
    }
}
