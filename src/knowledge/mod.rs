//! In-memory knowledge cache over the aggregated CMS content.
//!
//! # Read Path
//!
//! ```text
//! get() ──> memory younger than TTL? ──yes──> return (fresh)
//!                 │ no
//!                 v
//!           refresh in flight? ──yes──> await the same refresh
//!                 │ no
//!                 v
//!           start refresh: breaker(retry(timeout(aggregate)))
//!                 │
//!        ok ──────┴────── err
//!        │                  │
//!  update memory +     stale memory ─> disk snapshot ─> placeholder
//!  `knowledge` snapshot
//! ```
//!
//! Concurrent callers on a cold or expired cache all observe the result of a
//! single aggregation. The TTL is a safety net only; the push webhook calls
//! [`KnowledgeCache::invalidate`] whenever content changes upstream.
//!
//! # Generations
//!
//! Every invalidation bumps a generation counter. A refresh only writes back
//! if no invalidation happened since it started, and readers never join a
//! refresh from an older generation, so content fetched before a push cannot
//! outlive it.

mod format;

pub use crate::storage::Freshness;
pub use format::{EMPTY_KNOWLEDGE_PLACEHOLDER, render_knowledge};

use crate::cms::ContentSource;
use crate::resilience::{CircuitBreaker, RetryConfig, RetryOptions, with_retry};
use crate::storage::SnapshotStore;
use crate::{Error, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Snapshot key of the aggregated text.
pub const KNOWLEDGE_SNAPSHOT_KEY: &str = "knowledge";

/// Knowledge cache settings.
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeConfig {
    /// Maximum age of the in-memory value.
    pub ttl: Duration,
    /// Deadline for one aggregation of all collections.
    pub fetch_timeout: Duration,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Knowledge text together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Knowledge {
    /// The text.
    pub text: String,
    /// Provenance.
    pub freshness: Freshness,
}

struct CachedKnowledge {
    text: String,
    fetched_at: Instant,
}

type InFlight = Shared<BoxFuture<'static, Knowledge>>;

struct Inner {
    source: Arc<dyn ContentSource>,
    snapshots: SnapshotStore,
    config: KnowledgeConfig,
    cached: RwLock<Option<CachedKnowledge>>,
    in_flight: Mutex<Option<(u64, InFlight)>>,
    generation: AtomicU64,
    aggregations: AtomicU64,
}

/// Coalescing, TTL-guarded cache of the knowledge text.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct KnowledgeCache {
    inner: Arc<Inner>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryConfig>,
}

impl KnowledgeCache {
    /// Creates an empty cache over `source`.
    pub fn new(
        source: Arc<dyn ContentSource>,
        snapshots: SnapshotStore,
        config: KnowledgeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                snapshots,
                config,
                cached: RwLock::new(None),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
                aggregations: AtomicU64::new(0),
            }),
            breaker: None,
            retry: None,
        }
    }

    /// Wraps each refresh in `breaker` (outermost layer).
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Retries timed-out refreshes inside the breaker.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Returns the knowledge text. Never fails.
    pub async fn get(&self) -> String {
        self.get_with_freshness().await.text
    }

    /// Returns the knowledge text and its provenance.
    pub async fn get_with_freshness(&self) -> Knowledge {
        if let Some(text) = self.inner.fresh_memory() {
            metrics::counter!("knowledge_cache_requests_total", "result" => "hit").increment(1);
            return Knowledge {
                text,
                freshness: Freshness::Fresh,
            };
        }

        let refresh = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let generation = self.inner.generation.load(Ordering::Acquire);
            if let Some((_, existing)) = slot.as_ref().filter(|(g, _)| *g == generation) {
                metrics::counter!("knowledge_cache_requests_total", "result" => "coalesced")
                    .increment(1);
                existing.clone()
            } else if let Some(text) = self.inner.fresh_memory() {
                // A refresh finished between the first check and taking the slot.
                metrics::counter!("knowledge_cache_requests_total", "result" => "hit").increment(1);
                return Knowledge {
                    text,
                    freshness: Freshness::Fresh,
                };
            } else {
                metrics::counter!("knowledge_cache_requests_total", "result" => "miss").increment(1);
                let started = run_refresh(
                    Arc::clone(&self.inner),
                    self.breaker.clone(),
                    self.retry,
                    generation,
                )
                .boxed()
                .shared();
                *slot = Some((generation, started.clone()));
                started
            }
        };

        refresh.await
    }

    /// Drops the in-memory value. The disk snapshot is kept as a fallback.
    ///
    /// A refresh already in flight keeps serving the callers that joined it,
    /// but its result is not cached and later callers start a new refresh.
    pub fn invalidate(&self) {
        let generation = {
            let mut cached = self
                .inner
                .cached
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *cached = None;
            self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.as_ref().is_some_and(|(g, _)| *g != generation) {
                *slot = None;
            }
        }
        metrics::counter!("knowledge_cache_invalidations_total").increment(1);
        tracing::info!("Knowledge cache invalidated");
    }

    /// Returns `true` if a value is held in memory, regardless of age.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.inner
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of upstream aggregations started since construction.
    #[must_use]
    pub fn aggregation_count(&self) -> u64 {
        self.inner.aggregations.load(Ordering::Relaxed)
    }

    /// Returns the content source backing this cache.
    #[must_use]
    pub fn source(&self) -> Arc<dyn ContentSource> {
        Arc::clone(&self.inner.source)
    }
}

impl Inner {
    fn fresh_memory(&self) -> Option<String> {
        let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.config.ttl)
            .map(|c| c.text.clone())
    }

    fn stale_memory(&self) -> Option<String> {
        let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
        cached.as_ref().map(|c| c.text.clone())
    }

    /// Caches `text` unless an invalidation happened after `generation` began.
    /// Returns `false` when the result was discarded.
    fn store(&self, text: &str, generation: u64) -> bool {
        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        *cached = Some(CachedKnowledge {
            text: text.to_string(),
            fetched_at: Instant::now(),
        });
        true
    }

    async fn aggregate(&self) -> Result<String> {
        self.aggregations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let collect = async {
            let (events, books, faqs) = tokio::join!(
                self.source.fetch_events(),
                self.source.fetch_books(),
                self.source.fetch_faqs()
            );
            render_knowledge(&events, &books, &faqs)
        };

        tokio::time::timeout(self.config.fetch_timeout, collect)
            .await
            .map_err(|_| Error::Timeout {
                operation: "knowledge_aggregate".to_string(),
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
    }
}

/// One refresh cycle. Runs at most once at a time per cache.
async fn run_refresh(
    inner: Arc<Inner>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryConfig>,
    generation: u64,
) -> Knowledge {
    let started = Instant::now();

    let attempt = || inner.aggregate();
    let retried = || async {
        match &retry {
            Some(config) => with_retry(attempt, config, RetryOptions::default()).await,
            None => attempt().await,
        }
    };
    let result = match &breaker {
        Some(breaker) => breaker.execute(retried).await,
        None => retried().await,
    };

    let knowledge = match result {
        Ok(text) if text == EMPTY_KNOWLEDGE_PLACEHOLDER => {
            metrics::counter!("knowledge_refresh_total", "outcome" => "empty").increment(1);
            tracing::info!("CMS returned no content; keeping previous knowledge cache");
            Knowledge {
                text,
                freshness: Freshness::Placeholder,
            }
        },
        Ok(text) => {
            if inner.store(&text, generation) {
                inner
                    .snapshots
                    .save_async(KNOWLEDGE_SNAPSHOT_KEY, text.as_str())
                    .await;
                metrics::counter!("knowledge_refresh_total", "outcome" => "success").increment(1);
                tracing::info!(bytes = text.len(), "Knowledge cache refreshed");
            } else {
                metrics::counter!("knowledge_refresh_total", "outcome" => "superseded").increment(1);
                tracing::debug!("Knowledge invalidated during refresh, result not cached");
            }
            Knowledge {
                text,
                freshness: Freshness::Fresh,
            }
        },
        Err(e) => {
            metrics::counter!("knowledge_refresh_total", "outcome" => "fallback").increment(1);
            tracing::error!(error = %e, "Knowledge refresh failed, serving fallback");
            fallback(&inner).await
        },
    };

    #[allow(clippy::cast_precision_loss)]
    metrics::histogram!("knowledge_refresh_duration_ms").record(started.elapsed().as_millis() as f64);

    let mut slot = inner
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
        *slot = None;
    }
    drop(slot);
    knowledge
}

async fn fallback(inner: &Inner) -> Knowledge {
    if let Some(text) = inner.stale_memory() {
        return Knowledge {
            text,
            freshness: Freshness::Stale,
        };
    }
    if let Some(text) = inner
        .snapshots
        .load_async::<String>(KNOWLEDGE_SNAPSHOT_KEY)
        .await
    {
        return Knowledge {
            text,
            freshness: Freshness::Stale,
        };
    }
    Knowledge {
        text: EMPTY_KNOWLEDGE_PLACEHOLDER.to_string(),
        freshness: Freshness::Placeholder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::{CmsBook, CmsEvent, CmsFaq};
    use crate::resilience::CircuitBreakerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct CountingSource {
        calls: AtomicU32,
        delay: Duration,
        faqs: Mutex<Vec<CmsFaq>>,
    }

    impl CountingSource {
        fn new(delay: Duration, questions: &[&str]) -> Arc<Self> {
            let source = Arc::new(Self {
                calls: AtomicU32::new(0),
                delay,
                faqs: Mutex::new(Vec::new()),
            });
            source.set_questions(questions);
            source
        }

        fn set_questions(&self, questions: &[&str]) {
            *self.faqs.lock().unwrap() = questions
                .iter()
                .enumerate()
                .map(|(i, q)| CmsFaq {
                    id: i.to_string(),
                    question: (*q).to_string(),
                    answer: "Yes.".to_string(),
                    category: None,
                    sort_order: i64::try_from(i).unwrap(),
                })
                .collect();
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentSource for CountingSource {
        async fn fetch_events(&self) -> Vec<CmsEvent> {
            Vec::new()
        }

        async fn fetch_books(&self) -> Vec<CmsBook> {
            Vec::new()
        }

        async fn fetch_faqs(&self) -> Vec<CmsFaq> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let faqs = self.faqs.lock().unwrap().clone();
            tokio::time::sleep(self.delay).await;
            faqs
        }
    }

    fn cache(source: Arc<CountingSource>, dir: &TempDir, config: KnowledgeConfig) -> KnowledgeCache {
        KnowledgeCache::new(source, SnapshotStore::new(dir.path()), config)
    }

    fn fast_config() -> KnowledgeConfig {
        KnowledgeConfig {
            ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_concurrent_cold_gets_coalesce_into_one_aggregation() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::from_millis(50), &["Open late?"]);
        let cache = cache(Arc::clone(&source), &dir, fast_config());

        let results =
            futures::future::join_all((0..10).map(|_| cache.get_with_freshness())).await;

        assert_eq!(cache.aggregation_count(), 1);
        assert_eq!(source.calls(), 1);
        assert!(results.iter().all(|k| k.text == results[0].text));
        assert!(results[0].text.contains("Q: Open late?"));
        assert!(results.iter().all(|k| k.freshness == Freshness::Fresh));
    }

    #[tokio::test]
    async fn test_concurrent_gets_across_tasks_coalesce() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::from_millis(50), &["Parking?"]);
        let cache = cache(Arc::clone(&source), &dir, fast_config());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().contains("Parking?"));
        }
        assert_eq!(cache.aggregation_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_hit_within_ttl() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::ZERO, &["Wifi?"]);
        let cache = cache(Arc::clone(&source), &dir, fast_config());

        cache.get().await;
        cache.get().await;
        assert_eq!(cache.aggregation_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reaggregation() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::ZERO, &["Old question"]);
        let cache = cache(Arc::clone(&source), &dir, fast_config());

        assert!(cache.get().await.contains("Old question"));
        source.set_questions(&["New question"]);
        assert!(cache.get().await.contains("Old question"));

        cache.invalidate();
        assert!(!cache.is_cached());
        assert!(cache.get().await.contains("New question"));
        assert_eq!(cache.aggregation_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_during_refresh_discards_its_result() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::from_millis(100), &["version 1"]);
        let cache = cache(Arc::clone(&source), &dir, fast_config());

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.set_questions(&["version 2"]);
        cache.invalidate();

        // Callers that joined before the push still get their answer.
        assert!(pending.await.unwrap().contains("version 1"));
        assert!(!cache.is_cached());

        assert!(cache.get().await.contains("version 2"));
        assert!(cache.get().await.contains("version 2"));
        assert_eq!(cache.aggregation_count(), 2);
    }

    #[tokio::test]
    async fn test_get_after_invalidate_skips_older_refresh() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::from_millis(100), &["version 1"]);
        let cache = cache(Arc::clone(&source), &dir, fast_config());

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.set_questions(&["version 2"]);
        cache.invalidate();

        let after = cache.get().await;
        assert!(after.contains("version 2"));
        assert!(pending.await.unwrap().contains("version 1"));

        let later = cache.get_with_freshness().await;
        assert!(later.text.contains("version 2"));
        assert_eq!(later.freshness, Freshness::Fresh);
        assert_eq!(cache.aggregation_count(), 2);
        assert_eq!(
            SnapshotStore::new(dir.path())
                .load::<String>(KNOWLEDGE_SNAPSHOT_KEY)
                .map(|t| t.contains("version 2")),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_expired_ttl_reaggregates() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::ZERO, &["Hours?"]);
        let cache = cache(
            Arc::clone(&source),
            &dir,
            KnowledgeConfig {
                ttl: Duration::from_millis(20),
                fetch_timeout: Duration::from_millis(500),
            },
        );

        cache.get().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get().await;
        assert_eq!(cache.aggregation_count(), 2);
    }

    #[tokio::test]
    async fn test_success_persists_snapshot() {
        let dir = TempDir::new().unwrap();
        let source = CountingSource::new(Duration::ZERO, &["Gift cards?"]);
        let cache = cache(source, &dir, fast_config());

        let text = cache.get().await;
        let snapshots = SnapshotStore::new(dir.path());
        assert_eq!(snapshots.load::<String>(KNOWLEDGE_SNAPSHOT_KEY), Some(text));
    }

    #[tokio::test]
    async fn test_placeholder_is_not_cached_and_keeps_snapshot() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotStore::new(dir.path());
        snapshots.save(KNOWLEDGE_SNAPSHOT_KEY, "previous good text");

        let source = CountingSource::new(Duration::ZERO, &[]);
        let cache = cache(source, &dir, fast_config());

        let knowledge = cache.get_with_freshness().await;
        assert_eq!(knowledge.text, EMPTY_KNOWLEDGE_PLACEHOLDER);
        assert_eq!(knowledge.freshness, Freshness::Placeholder);
        assert!(!cache.is_cached());
        assert_eq!(
            snapshots.load::<String>(KNOWLEDGE_SNAPSHOT_KEY).as_deref(),
            Some("previous good text")
        );
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_stale_memory() {
        let dir = TempDir::new().unwrap();
        let slow = CountingSource::new(Duration::from_millis(300), &["never"]);
        let cache = cache(
            slow,
            &dir,
            KnowledgeConfig {
                ttl: Duration::from_millis(10),
                fetch_timeout: Duration::from_millis(30),
            },
        );
        *cache.inner.cached.write().unwrap() = Some(CachedKnowledge {
            text: "good text".to_string(),
            fetched_at: Instant::now(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let knowledge = cache.get_with_freshness().await;
        assert_eq!(knowledge.text, "good text");
        assert_eq!(knowledge.freshness, Freshness::Stale);
        assert_eq!(cache.aggregation_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_disk_then_placeholder() {
        let dir = TempDir::new().unwrap();
        let config = KnowledgeConfig {
            ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_millis(20),
        };

        let slow = CountingSource::new(Duration::from_millis(300), &["never"]);
        let cold = cache(Arc::clone(&slow), &dir, config);
        let knowledge = cold.get_with_freshness().await;
        assert_eq!(knowledge.text, EMPTY_KNOWLEDGE_PLACEHOLDER);
        assert_eq!(knowledge.freshness, Freshness::Placeholder);

        SnapshotStore::new(dir.path()).save(KNOWLEDGE_SNAPSHOT_KEY, "from disk");
        let knowledge = cold.get_with_freshness().await;
        assert_eq!(knowledge.text, "from disk");
        assert_eq!(knowledge.freshness, Freshness::Stale);
        assert!(!cold.is_cached());
    }

    #[tokio::test]
    async fn test_open_breaker_serves_fallback_without_aggregating() {
        let dir = TempDir::new().unwrap();
        SnapshotStore::new(dir.path()).save(KNOWLEDGE_SNAPSHOT_KEY, "snapshot text");
        let source = CountingSource::new(Duration::ZERO, &["Q"]);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new("knowledge")));
        breaker.force_open();

        let cache = cache(Arc::clone(&source), &dir, fast_config()).with_breaker(breaker);
        let knowledge = cache.get_with_freshness().await;

        assert_eq!(knowledge.text, "snapshot text");
        assert_eq!(knowledge.freshness, Freshness::Stale);
        assert_eq!(cache.aggregation_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_inside_breaker_counts_one_failure() {
        let dir = TempDir::new().unwrap();
        let slow = CountingSource::new(Duration::from_millis(200), &["never"]);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new("knowledge")));
        let cache = cache(
            Arc::clone(&slow),
            &dir,
            KnowledgeConfig {
                ttl: Duration::from_secs(60),
                fetch_timeout: Duration::from_millis(10),
            },
        )
        .with_breaker(Arc::clone(&breaker))
        .with_retry(RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        });

        cache.get().await;
        assert_eq!(cache.aggregation_count(), 3);
        let stats = breaker.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_requests, 1);
    }
}
