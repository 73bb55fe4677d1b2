// Tiered remedy resolution: cache, then coalesced generation, then fallback
//
// Concurrent resolutions of one key share a single generation. The owner's
// work runs in a detached task, so a caller going away never cancels it.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::core::config::Config;
use crate::core::errors::GenerationResult;
use crate::core::types::{CacheEntry, Remedy, RemedyKey, Resolution, SourceTag};
use crate::services::cache::CacheStore;
use crate::services::fallback::FallbackCatalog;
use crate::services::generation::{build_prompt, parse_remedy, GenerationBackend};
use crate::services::languages::LanguageCatalog;
use crate::utils::Metrics;

/// Time bounds for the resolver's external calls
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub generation_timeout: Duration,
    pub cache_timeout: Duration,
}

impl ResolverConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            generation_timeout: config.generation.timeout,
            cache_timeout: config.cache.timeout,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(8),
            cache_timeout: Duration::from_millis(1500),
        }
    }
}

/// Resolves a (label, language) pair to a remedy. Total: every call yields a
/// remedy, backend failures degrade to the fallback tier.
#[derive(Clone)]
pub struct RecommendationResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    cache: Arc<dyn CacheStore>,
    backend: Arc<dyn GenerationBackend>,
    fallback: FallbackCatalog,
    languages: LanguageCatalog,
    /// One entry per key with a generation in progress
    in_flight: DashMap<RemedyKey, watch::Receiver<Option<Resolution>>>,
    config: ResolverConfig,
    metrics: Option<Metrics>,
}

/// Removes the key's in-flight entry when the owner task ends, panics included
struct InFlightGuard {
    inner: Arc<ResolverInner>,
    key: RemedyKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

impl RecommendationResolver {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        backend: Arc<dyn GenerationBackend>,
        config: ResolverConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                cache,
                backend,
                fallback: FallbackCatalog,
                languages: LanguageCatalog,
                in_flight: DashMap::new(),
                config,
                metrics,
            }),
        }
    }

    pub async fn resolve(&self, key: RemedyKey) -> Resolution {
        let resolution = self.resolve_tiers(key).await;
        if let Some(ref m) = self.inner.metrics {
            m.record_resolution(resolution.source);
        }
        resolution
    }

    /// Keys with a generation currently running
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    async fn resolve_tiers(&self, key: RemedyKey) -> Resolution {
        if let Some(remedy) = self.inner.lookup_cache(&key).await {
            if let Some(ref m) = self.inner.metrics {
                m.record_cache_hit();
            }
            debug!("Cache hit for {}", key);
            return Resolution {
                remedy,
                source: SourceTag::Cache,
            };
        }
        if let Some(ref m) = self.inner.metrics {
            m.record_cache_miss();
        }

        // Check-and-register under the shard lock; the owner task is spawned
        // after the lock is released.
        let (mut rx, owner_tx) = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());
                (rx, Some(tx))
            }
        };

        match owner_tx {
            Some(tx) => {
                let guard = InFlightGuard {
                    inner: Arc::clone(&self.inner),
                    key: key.clone(),
                };
                tokio::spawn(run_owner(guard, tx));
            }
            None => {
                debug!("Joining in-flight generation for {}", key);
                if let Some(ref m) = self.inner.metrics {
                    m.record_coalesced_waiter();
                }
            }
        }

        let published = match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };

        published.unwrap_or_else(|| {
            // Owner ended without publishing
            error!("Generation for {} ended without a result", key);
            self.inner.fallback_resolution(&key)
        })
    }
}

/// Owner side of a coalesced generation. Publishes exactly one resolution;
/// the in-flight entry lives until the backend call itself has finished.
async fn run_owner(guard: InFlightGuard, tx: watch::Sender<Option<Resolution>>) {
    let inner = Arc::clone(&guard.inner);
    let key = guard.key.clone();

    // A resolution that finished between our cache probe and registration
    // has already written the cache.
    if let Some(remedy) = inner.lookup_cache(&key).await {
        tx.send_replace(Some(Resolution {
            remedy,
            source: SourceTag::Cache,
        }));
        return;
    }

    let language = match inner.languages.describe(&key.language_code) {
        Ok(language) => language,
        Err(e) => {
            warn!("Skipping generation for {}: {}", key, e);
            tx.send_replace(Some(inner.fallback_resolution(&key)));
            return;
        }
    };

    let prompt = build_prompt(&key.label, &language);
    let backend = Arc::clone(&inner.backend);
    let mut call = tokio::spawn(async move { backend.generate(&prompt).await });

    let timeout = inner.config.generation_timeout;
    match tokio::time::timeout(timeout, &mut call).await {
        Ok(outcome) => {
            let resolution = inner.complete_generation(&key, outcome).await;
            tx.send_replace(Some(resolution));
        }
        Err(_) => {
            warn!(
                "Generation for {} exceeded {}ms, serving fallback",
                key,
                timeout.as_millis()
            );
            if let Some(ref m) = inner.metrics {
                m.record_generation_timeout();
            }
            tx.send_replace(Some(inner.fallback_resolution(&key)));

            // Late success still lands in the cache
            let outcome = call.await;
            let late = inner.complete_generation(&key, outcome).await;
            if late.source == SourceTag::Generated {
                info!("Late generation for {} cached", key);
            }
        }
    }

    drop(guard);
}

impl ResolverInner {
    /// Cache probe. Errors, timeouts and malformed documents are misses.
    async fn lookup_cache(&self, key: &RemedyKey) -> Option<Remedy> {
        let document_id = key.document_id();
        let document = match tokio::time::timeout(
            self.config.cache_timeout,
            self.cache.get(&document_id),
        )
        .await
        {
            Ok(Ok(document)) => document?,
            Ok(Err(e)) => {
                warn!("Cache lookup for {} failed: {}", document_id, e);
                return None;
            }
            Err(_) => {
                warn!("Cache lookup for {} timed out", document_id);
                return None;
            }
        };

        match CacheEntry::decode(key, document) {
            Ok(remedy) => Some(remedy),
            Err(reason) => {
                warn!("Ignoring malformed cache document {}: {}", document_id, reason);
                if let Some(ref m) = self.metrics {
                    m.record_cache_malformed();
                }
                None
            }
        }
    }

    /// Turn a finished backend call into a resolution, writing successes back
    async fn complete_generation(
        &self,
        key: &RemedyKey,
        outcome: Result<GenerationResult<String>, JoinError>,
    ) -> Resolution {
        let text = match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("Generation for {} failed: {}", key, e);
                return self.fallback_resolution(key);
            }
            Err(e) => {
                error!("Generation task for {} aborted: {}", key, e);
                return self.fallback_resolution(key);
            }
        };

        match parse_remedy(&text, &key.language_code, Utc::now()) {
            Ok(remedy) => {
                self.write_back(key, &remedy).await;
                Resolution {
                    remedy,
                    source: SourceTag::Generated,
                }
            }
            Err(reason) => {
                warn!("Unusable generation output for {}: {}", key, reason);
                self.fallback_resolution(key)
            }
        }
    }

    /// Best-effort cache write; failures are logged and swallowed
    async fn write_back(&self, key: &RemedyKey, remedy: &Remedy) {
        let document_id = key.document_id();
        let entry = CacheEntry::from_remedy(remedy);

        let failure = match tokio::time::timeout(
            self.config.cache_timeout,
            self.cache.put(&document_id, &entry),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("Cached remedy {}", document_id);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };

        warn!("Cache write for {} failed: {}", document_id, failure);
        if let Some(ref m) = self.metrics {
            m.record_cache_write_failure();
        }
    }

    fn fallback_resolution(&self, key: &RemedyKey) -> Resolution {
        Resolution {
            remedy: self.fallback.get(&key.label, &key.language_code),
            source: SourceTag::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{CacheError, CacheResult, GenerationError};
    use crate::services::cache::MemoryCacheStore;
    use crate::services::generation::DisabledBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const REMEDY_JSON: &str = r#"{"diagnosis": "Early blight", "causal_agent": "Alternaria solani", "treatments": ["Remove infected leaves", "Spray mancozeb"]}"#;

    /// Backend that sleeps, counts calls and returns a canned answer
    struct FakeBackend {
        calls: AtomicUsize,
        delay: Duration,
        response: Option<String>,
    }

    impl FakeBackend {
        fn answering(text: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                response: Some(text.to_string()),
            })
        }

        fn failing(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                response: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationBackend for FakeBackend {
        async fn generate(&self, _prompt: &str) -> GenerationResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.response
                .clone()
                .ok_or_else(|| GenerationError::BackendUnavailable("down".to_string()))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    /// Cache whose writes always fail
    #[derive(Default)]
    struct ReadOnlyCache {
        puts: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for ReadOnlyCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<serde_json::Value>> {
            Ok(None)
        }

        async fn put(&self, _key: &str, _entry: &CacheEntry) -> CacheResult<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::BackendUnavailable("read-only".to_string()))
        }

        fn len(&self) -> usize {
            0
        }
    }

    fn resolver(
        cache: Arc<dyn CacheStore>,
        backend: Arc<dyn GenerationBackend>,
        generation_timeout: Duration,
    ) -> RecommendationResolver {
        RecommendationResolver::new(
            cache,
            backend,
            ResolverConfig {
                generation_timeout,
                cache_timeout: Duration::from_millis(500),
            },
            Some(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_every_language_gets_a_remedy() {
        let resolver = resolver(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(DisabledBackend),
            Duration::from_secs(1),
        );

        for language in LanguageCatalog.list_all() {
            let resolution = resolver
                .resolve(RemedyKey::new("Corn___Common_rust", language.code))
                .await;
            assert_eq!(resolution.remedy.language_code, language.code);
            assert!(!resolution.remedy.diagnosis.is_empty());
            assert_eq!(resolution.source, SourceTag::Fallback);
        }
    }

    #[tokio::test]
    async fn test_second_resolution_comes_from_cache() {
        let backend = FakeBackend::answering(REMEDY_JSON, Duration::ZERO);
        let resolver = resolver(
            Arc::new(MemoryCacheStore::new()),
            backend.clone(),
            Duration::from_secs(1),
        );
        let key = RemedyKey::new("Tomato___Early_blight", "en");

        let first = resolver.resolve(key.clone()).await;
        let second = resolver.resolve(key).await;

        assert_eq!(first.source, SourceTag::Generated);
        assert_eq!(second.source, SourceTag::Cache);
        assert_eq!(first.remedy.diagnosis, second.remedy.diagnosis);
        assert_eq!(first.remedy.treatments, second.remedy.treatments);
        assert_eq!(backend.calls(), 1);
        assert_eq!(resolver.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolutions_share_one_generation() {
        let backend = FakeBackend::answering(REMEDY_JSON, Duration::from_millis(150));
        let resolver = resolver(
            Arc::new(MemoryCacheStore::new()),
            backend.clone(),
            Duration::from_secs(2),
        );
        let key = RemedyKey::new("Potato___Late_blight", "hi");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let resolver = resolver.clone();
                let key = key.clone();
                tokio::spawn(async move { resolver.resolve(key).await })
            })
            .collect();

        let results: Vec<Resolution> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(backend.calls(), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(results[0].source, SourceTag::Generated);
        assert_eq!(resolver.in_flight_count(), 0);
    }

    async fn resolve_concurrently(
        resolver: &RecommendationResolver,
        key: &RemedyKey,
        callers: usize,
    ) -> Vec<Resolution> {
        let tasks: Vec<_> = (0..callers)
            .map(|_| {
                let resolver = resolver.clone();
                let key = key.clone();
                tokio::spawn(async move { resolver.resolve(key).await })
            })
            .collect();

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_fallback() {
        let key = RemedyKey::new("Cherry___Powdery_mildew", "mr");

        // Backend error
        let failing = FakeBackend::failing(Duration::from_millis(150));
        let failing_resolver = resolver(
            Arc::new(MemoryCacheStore::new()),
            failing.clone(),
            Duration::from_secs(2),
        );
        let results = resolve_concurrently(&failing_resolver, &key, 20).await;
        assert_eq!(failing.calls(), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(results[0].source, SourceTag::Fallback);
        assert_eq!(results[0].remedy.language_code, "mr");

        // Backend slower than the generation timeout
        let slow = FakeBackend::answering(REMEDY_JSON, Duration::from_millis(400));
        let slow_resolver = resolver(
            Arc::new(MemoryCacheStore::new()),
            slow.clone(),
            Duration::from_millis(50),
        );
        let results = resolve_concurrently(&slow_resolver, &key, 20).await;
        assert_eq!(slow.calls(), 1);
        assert!(results.iter().all(|r| r == &results[0]));
        assert_eq!(results[0].source, SourceTag::Fallback);
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back_without_caching() {
        let cache = Arc::new(MemoryCacheStore::new());
        let backend = FakeBackend::failing(Duration::ZERO);
        let resolver = resolver(cache.clone(), backend.clone(), Duration::from_secs(1));

        let resolution = resolver.resolve(RemedyKey::new("Rice___Blast", "ta")).await;

        assert_eq!(resolution.source, SourceTag::Fallback);
        assert_eq!(resolution.remedy.language_code, "ta");
        assert!(!resolution.remedy.treatments.is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_output_falls_back() {
        let cache = Arc::new(MemoryCacheStore::new());
        let backend = FakeBackend::answering(r#"{"diagnosis": ""}"#, Duration::ZERO);
        let resolver = resolver(cache.clone(), backend, Duration::from_secs(1));

        let resolution = resolver.resolve(RemedyKey::new("Rice___Blast", "en")).await;

        assert_eq!(resolution.source, SourceTag::Fallback);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_serves_fallback_and_late_success_is_cached() {
        let cache = Arc::new(MemoryCacheStore::new());
        let backend = FakeBackend::answering(REMEDY_JSON, Duration::from_millis(300));
        let resolver = resolver(cache.clone(), backend.clone(), Duration::from_millis(50));
        let key = RemedyKey::new("Grape___Black_rot", "en");

        let start = Instant::now();
        let resolution = resolver.resolve(key.clone()).await;
        assert_eq!(resolution.source, SourceTag::Fallback);
        assert!(start.elapsed() < Duration::from_millis(250));

        // The backend call is still registered while it runs
        assert_eq!(resolver.in_flight_count(), 1);
        let waiter = resolver.resolve(key.clone()).await;
        assert_eq!(waiter.source, SourceTag::Fallback);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.contains(&key.document_id()));
        assert_eq!(resolver.in_flight_count(), 0);

        let cached = resolver.resolve(key).await;
        assert_eq!(cached.source, SourceTag::Cache);
        assert_eq!(cached.remedy.diagnosis, "Early blight");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_generation() {
        let cache = Arc::new(MemoryCacheStore::new());
        let backend = FakeBackend::answering(REMEDY_JSON, Duration::from_millis(100));
        let resolver = resolver(cache.clone(), backend.clone(), Duration::from_secs(1));
        let key = RemedyKey::new("Apple___Apple_scab", "kn");

        let caller = {
            let resolver = resolver.clone();
            let key = key.clone();
            tokio::spawn(async move { resolver.resolve(key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(backend.calls(), 1);
        assert!(cache.contains("Apple___Apple_scab::kn"));
    }

    #[tokio::test]
    async fn test_malformed_document_is_a_miss() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache.insert_raw("Tomato___Leaf_Mold::en", json!({"treatments": ["x"]}));
        let backend = FakeBackend::answering(REMEDY_JSON, Duration::ZERO);
        let resolver = resolver(cache.clone(), backend.clone(), Duration::from_secs(1));

        let resolution = resolver
            .resolve(RemedyKey::new("Tomato___Leaf_Mold", "en"))
            .await;

        assert_eq!(resolution.source, SourceTag::Generated);
        assert_eq!(backend.calls(), 1);

        // The rewritten document is well-formed
        let again = resolver
            .resolve(RemedyKey::new("Tomato___Leaf_Mold", "en"))
            .await;
        assert_eq!(again.source, SourceTag::Cache);
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_swallowed() {
        let cache = Arc::new(ReadOnlyCache::default());
        let backend = FakeBackend::answering(REMEDY_JSON, Duration::ZERO);
        let resolver = resolver(cache.clone(), backend, Duration::from_secs(1));

        let resolution = resolver.resolve(RemedyKey::new("Corn___Blight", "en")).await;

        assert_eq!(resolution.source, SourceTag::Generated);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tamil_round_trip_uses_document_id() {
        let cache = Arc::new(MemoryCacheStore::new());
        let tamil = r#"{"diagnosis": "ஆரம்ப கருகல் நோய்", "causal_agent": "Alternaria solani", "treatments": ["பாதிக்கப்பட்ட இலைகளை அகற்றவும்"]}"#;
        let backend = FakeBackend::answering(tamil, Duration::ZERO);
        let resolver = resolver(cache.clone(), backend, Duration::from_secs(1));

        let generated = resolver
            .resolve(RemedyKey::new("Tomato___Early_blight", "ta"))
            .await;
        assert_eq!(generated.source, SourceTag::Generated);
        assert_eq!(generated.remedy.language_code, "ta");
        assert!(cache.contains("Tomato___Early_blight::ta"));

        // An independent resolver over the same cache, as after a restart
        let restarted = resolver_over(cache);
        let cached = restarted
            .resolve(RemedyKey::new("Tomato___Early_blight", "ta"))
            .await;
        assert_eq!(cached.source, SourceTag::Cache);
        assert_eq!(cached.remedy.diagnosis, generated.remedy.diagnosis);
        assert_eq!(cached.remedy.treatments, generated.remedy.treatments);
    }

    fn resolver_over(cache: Arc<MemoryCacheStore>) -> RecommendationResolver {
        resolver(cache, Arc::new(DisabledBackend), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_metrics_count_tiers() {
        let metrics = Metrics::new();
        let resolver = RecommendationResolver::new(
            Arc::new(MemoryCacheStore::new()),
            FakeBackend::answering(REMEDY_JSON, Duration::ZERO),
            ResolverConfig::default(),
            Some(metrics.clone()),
        );
        let key = RemedyKey::new("Peach___Bacterial_spot", "en");

        resolver.resolve(key.clone()).await;
        resolver.resolve(key).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.resolved_generated, 1);
        assert_eq!(snapshot.resolved_cache, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }
}
