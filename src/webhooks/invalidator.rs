//! Push webhook handling: authenticate, invalidate, revalidate, pre-warm.

use super::revalidate::PageRevalidator;
use super::signature::{Rejection, SIGNATURE_HEADER, SignatureVerifier, TIMESTAMP_HEADER};
use crate::cms::ContentSource;
use crate::knowledge::KnowledgeCache;
use axum::http::HeaderMap;
use serde_json::json;
use std::sync::Arc;

/// Outcome of a push notification, ready to be sent as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status: u16,
    /// JSON body.
    pub body: serde_json::Value,
}

impl WebhookResponse {
    fn synced() -> Self {
        Self {
            status: 200,
            body: json!({ "success": true, "message": "Content synced" }),
        }
    }

    fn rejected(rejection: Rejection) -> Self {
        Self {
            status: rejection.status(),
            body: json!({ "error": rejection.message() }),
        }
    }
}

/// Invalidates the knowledge cache when the CMS reports a change.
pub struct WebhookInvalidator {
    verifier: SignatureVerifier,
    knowledge: KnowledgeCache,
    revalidator: Option<Arc<dyn PageRevalidator>>,
    revalidate_paths: Vec<String>,
    prewarm: Option<Arc<dyn ContentSource>>,
}

impl WebhookInvalidator {
    /// Creates an invalidator without revalidation or pre-warming.
    #[must_use]
    pub fn new(verifier: SignatureVerifier, knowledge: KnowledgeCache) -> Self {
        Self {
            verifier,
            knowledge,
            revalidator: None,
            revalidate_paths: vec!["/".to_string()],
            prewarm: None,
        }
    }

    /// Revalidates `paths` through `revalidator` after each accepted push.
    #[must_use]
    pub fn with_revalidator(
        mut self,
        revalidator: Arc<dyn PageRevalidator>,
        paths: Vec<String>,
    ) -> Self {
        self.revalidator = Some(revalidator);
        self.revalidate_paths = paths;
        self
    }

    /// Re-fetches all collections from `source` after each accepted push.
    #[must_use]
    pub fn with_prewarm(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.prewarm = Some(source);
        self
    }

    /// Handles a push notification.
    ///
    /// Background work (revalidation, pre-warm) is spawned on the current
    /// tokio runtime and never affects the response.
    pub fn handle(&self, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        if let Err(rejection) =
            self.verifier
                .verify(header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER), body)
        {
            metrics::counter!("webhook_requests_total", "outcome" => rejection.as_label())
                .increment(1);
            if rejection == Rejection::NotConfigured {
                tracing::error!("Push received but no push secret is configured");
            } else {
                tracing::warn!(reason = rejection.as_label(), "Rejected push notification");
            }
            return WebhookResponse::rejected(rejection);
        }

        self.knowledge.invalidate();
        self.spawn_background();

        metrics::counter!("webhook_requests_total", "outcome" => "accepted").increment(1);
        tracing::info!(bytes = body.len(), "Content push accepted");
        WebhookResponse::synced()
    }

    fn spawn_background(&self) {
        if self.revalidator.is_none() && self.prewarm.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime, skipping revalidation and pre-warm");
            return;
        };

        if let Some(revalidator) = &self.revalidator {
            let revalidator = Arc::clone(revalidator);
            let paths = self.revalidate_paths.clone();
            runtime.spawn(async move {
                if let Err(e) = revalidator.revalidate(&paths).await {
                    tracing::warn!(error = %e, "Page revalidation failed");
                }
            });
        }

        if let Some(source) = &self.prewarm {
            let source = Arc::clone(source);
            runtime.spawn(async move {
                let (events, books, faqs) = tokio::join!(
                    source.fetch_events(),
                    source.fetch_books(),
                    source.fetch_faqs()
                );
                tracing::debug!(
                    events = events.len(),
                    books = books.len(),
                    faqs = faqs.len(),
                    "Pre-warmed CMS snapshots"
                );
            });
        }
    }
}
