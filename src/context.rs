//! Shared application state.
//!
//! [`AppContext`] owns every long-lived component. It is built once at
//! startup, handed to the HTTP router as state, and shut down on exit.

use crate::Result;
use crate::cms::{CmsClient, ContentSource};
use crate::config::ConciergeConfig;
use crate::knowledge::KnowledgeCache;
use crate::resilience::CircuitBreakerRegistry;
use crate::session::SessionStore;
use crate::storage::SnapshotStore;
use crate::webhooks::{HttpPageRevalidator, SignatureVerifier, WebhookInvalidator};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Breaker guarding individual CMS requests.
pub const CMS_BREAKER: &str = "cms";

/// Breaker guarding knowledge aggregation.
pub const KNOWLEDGE_BREAKER: &str = "knowledge";

struct Inner {
    config: ConciergeConfig,
    snapshots: SnapshotStore,
    breakers: CircuitBreakerRegistry,
    knowledge: KnowledgeCache,
    sessions: Arc<SessionStore>,
    webhook: WebhookInvalidator,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Application-wide state shared across all routes. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<Inner>,
}

impl AppContext {
    /// Builds the context with the HTTP CMS client as content source.
    ///
    /// The session sweeper is started when called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the CMS HTTP client cannot be built.
    pub fn build(config: ConciergeConfig) -> Result<Self> {
        let snapshots = SnapshotStore::new(&config.snapshot_dir);
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone());
        let cms = CmsClient::new(config.cms.clone(), snapshots.clone())?
            .with_breaker(breakers.get_or_create(CMS_BREAKER))
            .with_retry(config.retry);
        if !cms.is_configured() {
            tracing::warn!("CMS base URL or API key missing, serving snapshots only");
        }
        Ok(Self::assemble(config, snapshots, breakers, Arc::new(cms)))
    }

    /// Builds the context over an arbitrary content source.
    #[must_use]
    pub fn with_source(config: ConciergeConfig, source: Arc<dyn ContentSource>) -> Self {
        let snapshots = SnapshotStore::new(&config.snapshot_dir);
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone());
        Self::assemble(config, snapshots, breakers, source)
    }

    fn assemble(
        config: ConciergeConfig,
        snapshots: SnapshotStore,
        breakers: CircuitBreakerRegistry,
        source: Arc<dyn ContentSource>,
    ) -> Self {
        let knowledge = KnowledgeCache::new(Arc::clone(&source), snapshots.clone(), config.knowledge)
            .with_breaker(breakers.get_or_create(KNOWLEDGE_BREAKER));

        let verifier =
            SignatureVerifier::new(config.webhook.secret.clone()).with_max_age(config.webhook.max_age);
        if !verifier.is_configured() {
            tracing::warn!("Push secret not configured, content pushes will be rejected");
        }
        let mut webhook = WebhookInvalidator::new(verifier, knowledge.clone());
        if let (Some(url), Some(secret)) = (&config.revalidate.url, &config.revalidate.secret) {
            match HttpPageRevalidator::new(url, secret.clone(), config.revalidate.timeout) {
                Ok(revalidator) => {
                    webhook = webhook
                        .with_revalidator(Arc::new(revalidator), config.revalidate.paths.clone());
                },
                Err(e) => {
                    tracing::error!(error = %e, "Page revalidation disabled, client build failed");
                },
            }
        }
        if config.webhook.prewarm {
            webhook = webhook.with_prewarm(source);
        }

        let sessions = Arc::new(SessionStore::new(config.session.ttl));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = if tokio::runtime::Handle::try_current().is_ok() {
            Some(sessions.spawn_sweeper(config.session.sweep_interval, shutdown_rx))
        } else {
            tracing::debug!("No tokio runtime, session sweeper not started");
            None
        };

        tracing::info!(
            snapshot_dir = %snapshots.dir().display(),
            knowledge_ttl_secs = config.knowledge.ttl.as_secs(),
            session_ttl_secs = config.session.ttl.as_secs(),
            "Application context built"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                snapshots,
                breakers,
                knowledge,
                sessions,
                webhook,
                started_at: Instant::now(),
                shutdown,
                sweeper: Mutex::new(sweeper),
            }),
        }
    }

    /// Configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &ConciergeConfig {
        &self.inner.config
    }

    /// Snapshot store.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.inner.snapshots
    }

    /// Circuit breakers by dependency name.
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    /// Knowledge cache.
    #[must_use]
    pub fn knowledge(&self) -> &KnowledgeCache {
        &self.inner.knowledge
    }

    /// Session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.inner.sessions
    }

    /// Push webhook handler.
    #[must_use]
    pub fn webhook(&self) -> &WebhookInvalidator {
        &self.inner.webhook
    }

    /// Time since the context was built.
    #[must_use]
    pub fn uptime(&self) -> std::time::Duration {
        self.inner.started_at.elapsed()
    }

    /// Stops background tasks and waits for the session sweeper to exit.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Session sweeper did not stop cleanly");
            }
        }
        tracing::info!("Application context shut down");
    }
}
