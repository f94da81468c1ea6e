//! Page cache revalidation after a content push.

use crate::{Error, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Busts a downstream page cache.
#[async_trait]
pub trait PageRevalidator: Send + Sync {
    /// Requests revalidation of `paths`.
    async fn revalidate(&self, paths: &[String]) -> Result<()>;
}

/// Revalidator that POSTs `{"secret": .., "paths": [..]}` to an endpoint.
pub struct HttpPageRevalidator {
    client: reqwest::Client,
    url: String,
    secret: SecretString,
}

impl HttpPageRevalidator {
    /// Creates a revalidator for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, secret: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("concierge-cache/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::operation("build_revalidate_client", e))?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }
}

#[async_trait]
impl PageRevalidator for HttpPageRevalidator {
    async fn revalidate(&self, paths: &[String]) -> Result<()> {
        let body = serde_json::json!({
            "secret": self.secret.expose_secret(),
            "paths": paths,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::operation("page_revalidate", format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::operation("page_revalidate", format!("HTTP {status}")));
        }
        tracing::debug!(paths = ?paths, "Page cache revalidated");
        Ok(())
    }
}
