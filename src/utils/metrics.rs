use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::SourceTag;

/// Only the most recent samples are kept for latency percentiles
const MAX_LATENCY_SAMPLES: usize = 4096;

/// Process-wide metrics collector.
///
/// Tracks prediction traffic, which tier answered each resolution, cache
/// behaviour and generation backend health. Cheap to clone; all clones share
/// the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Predictions
    predictions_total: AtomicUsize,
    predictions_failed: AtomicUsize,
    classifier_latency_ms: RwLock<Vec<u64>>,

    // Resolutions by tier
    resolved_cache: AtomicUsize,
    resolved_generated: AtomicUsize,
    resolved_fallback: AtomicUsize,
    coalesced_waiters: AtomicUsize,

    // Cache
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_malformed: AtomicUsize,
    cache_write_failures: AtomicUsize,
    cache_size: AtomicUsize,

    // Generation backend
    generation_calls_total: AtomicUsize,
    generation_calls_success: AtomicUsize,
    generation_calls_failed: AtomicUsize,
    generation_timeouts: AtomicUsize,
    generation_tokens_input: AtomicU64,
    generation_tokens_output: AtomicU64,
    generation_latency_ms: RwLock<Vec<u64>>,
    circuit_breaker_trips: AtomicUsize,

    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                predictions_total: AtomicUsize::new(0),
                predictions_failed: AtomicUsize::new(0),
                classifier_latency_ms: RwLock::new(Vec::new()),
                resolved_cache: AtomicUsize::new(0),
                resolved_generated: AtomicUsize::new(0),
                resolved_fallback: AtomicUsize::new(0),
                coalesced_waiters: AtomicUsize::new(0),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_malformed: AtomicUsize::new(0),
                cache_write_failures: AtomicUsize::new(0),
                cache_size: AtomicUsize::new(0),
                generation_calls_total: AtomicUsize::new(0),
                generation_calls_success: AtomicUsize::new(0),
                generation_calls_failed: AtomicUsize::new(0),
                generation_timeouts: AtomicUsize::new(0),
                generation_tokens_input: AtomicU64::new(0),
                generation_tokens_output: AtomicU64::new(0),
                generation_latency_ms: RwLock::new(Vec::new()),
                circuit_breaker_trips: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Prediction metrics
    pub fn record_prediction(&self, success: bool, classifier_time: Option<Duration>) {
        self.inner.predictions_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.predictions_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(duration) = classifier_time {
            push_sample(&self.inner.classifier_latency_ms, duration);
        }
    }

    // Resolver metrics
    pub fn record_resolution(&self, source: SourceTag) {
        let counter = match source {
            SourceTag::Cache => &self.inner.resolved_cache,
            SourceTag::Generated => &self.inner.resolved_generated,
            SourceTag::Fallback => &self.inner.resolved_fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced_waiter(&self) {
        self.inner.coalesced_waiters.fetch_add(1, Ordering::Relaxed);
    }

    // Cache metrics
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_malformed(&self) {
        self.inner.cache_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_failure(&self) {
        self.inner.cache_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_cache_size(&self, size: usize) {
        self.inner.cache_size.store(size, Ordering::Relaxed);
    }

    // Generation metrics
    pub fn record_generation_call(
        &self,
        success: bool,
        duration: Duration,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.inner.generation_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.generation_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.generation_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.generation_tokens_input.fetch_add(input_tokens, Ordering::Relaxed);
        self.inner.generation_tokens_output.fetch_add(output_tokens, Ordering::Relaxed);
        push_sample(&self.inner.generation_latency_ms, duration);
    }

    pub fn record_generation_timeout(&self) {
        self.inner.generation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    // Endpoint metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let generation_latency = self.inner.generation_latency_ms.read();
        let generation_latency_avg_ms = avg(&generation_latency);
        let generation_latency_p50_ms = percentile(&generation_latency, 0.5);
        let generation_latency_p95_ms = percentile(&generation_latency, 0.95);
        drop(generation_latency);

        let classifier_latency = self.inner.classifier_latency_ms.read();
        let classifier_latency_avg_ms = avg(&classifier_latency);
        drop(classifier_latency);

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        let mut endpoint_requests: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        endpoint_requests.sort();

        MetricsSnapshot {
            predictions_total: self.inner.predictions_total.load(Ordering::Relaxed),
            predictions_failed: self.inner.predictions_failed.load(Ordering::Relaxed),
            classifier_latency_avg_ms,
            resolved_cache: self.inner.resolved_cache.load(Ordering::Relaxed),
            resolved_generated: self.inner.resolved_generated.load(Ordering::Relaxed),
            resolved_fallback: self.inner.resolved_fallback.load(Ordering::Relaxed),
            coalesced_waiters: self.inner.coalesced_waiters.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate,
            cache_malformed: self.inner.cache_malformed.load(Ordering::Relaxed),
            cache_write_failures: self.inner.cache_write_failures.load(Ordering::Relaxed),
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
            generation_calls_total: self.inner.generation_calls_total.load(Ordering::Relaxed),
            generation_calls_success: self.inner.generation_calls_success.load(Ordering::Relaxed),
            generation_calls_failed: self.inner.generation_calls_failed.load(Ordering::Relaxed),
            generation_timeouts: self.inner.generation_timeouts.load(Ordering::Relaxed),
            generation_tokens_input: self.inner.generation_tokens_input.load(Ordering::Relaxed),
            generation_tokens_output: self.inner.generation_tokens_output.load(Ordering::Relaxed),
            generation_latency_avg_ms,
            generation_latency_p50_ms,
            generation_latency_p95_ms,
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        let mut metric = |name: &str, kind: &str, help: &str, samples: &[(&str, String)]| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            for (labels, value) in samples {
                let _ = writeln!(out, "{}{{{}}} {}", name, labels, value);
            }
            out.push('\n');
        };

        metric(
            "predictions_total",
            "counter",
            "Prediction requests handled",
            &[
                ("outcome=\"success\"", s.predictions_total.saturating_sub(s.predictions_failed).to_string()),
                ("outcome=\"failed\"", s.predictions_failed.to_string()),
            ],
        );
        metric(
            "classifier_latency_avg_ms",
            "gauge",
            "Average classifier latency in milliseconds",
            &[("", s.classifier_latency_avg_ms.to_string())],
        );
        metric(
            "resolutions_total",
            "counter",
            "Remedy resolutions by the tier that answered",
            &[
                ("source=\"cache\"", s.resolved_cache.to_string()),
                ("source=\"generated\"", s.resolved_generated.to_string()),
                ("source=\"fallback\"", s.resolved_fallback.to_string()),
            ],
        );
        metric(
            "coalesced_waiters_total",
            "counter",
            "Resolutions that attached to an in-flight generation",
            &[("", s.coalesced_waiters.to_string())],
        );
        metric(
            "cache_hit_rate",
            "gauge",
            "Cache hit rate (0.0 to 1.0)",
            &[("", s.cache_hit_rate.to_string())],
        );
        metric(
            "cache_malformed_total",
            "counter",
            "Cache documents rejected as malformed",
            &[("", s.cache_malformed.to_string())],
        );
        metric(
            "cache_write_failures_total",
            "counter",
            "Cache write-backs that failed or timed out",
            &[("", s.cache_write_failures.to_string())],
        );
        metric(
            "cache_size",
            "gauge",
            "Current number of cached remedy documents",
            &[("", s.cache_size.to_string())],
        );
        metric(
            "generation_calls_total",
            "counter",
            "Generation backend calls",
            &[
                ("outcome=\"success\"", s.generation_calls_success.to_string()),
                ("outcome=\"failed\"", s.generation_calls_failed.to_string()),
            ],
        );
        metric(
            "generation_timeouts_total",
            "counter",
            "Generations that exceeded the resolver timeout",
            &[("", s.generation_timeouts.to_string())],
        );
        metric(
            "generation_tokens_total",
            "counter",
            "Tokens exchanged with the generation backend",
            &[
                ("direction=\"input\"", s.generation_tokens_input.to_string()),
                ("direction=\"output\"", s.generation_tokens_output.to_string()),
            ],
        );
        metric(
            "generation_latency_avg_ms",
            "gauge",
            "Average generation latency in milliseconds",
            &[("", s.generation_latency_avg_ms.to_string())],
        );
        metric(
            "circuit_breaker_trips_total",
            "counter",
            "Times the generation circuit breaker opened",
            &[("", s.circuit_breaker_trips.to_string())],
        );
        metric(
            "uptime_seconds",
            "counter",
            "Application uptime in seconds",
            &[("", s.uptime_seconds.to_string())],
        );

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub predictions_total: usize,
    pub predictions_failed: usize,
    pub classifier_latency_avg_ms: u64,
    pub resolved_cache: usize,
    pub resolved_generated: usize,
    pub resolved_fallback: usize,
    pub coalesced_waiters: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub cache_malformed: usize,
    pub cache_write_failures: usize,
    pub cache_size: usize,
    pub generation_calls_total: usize,
    pub generation_calls_success: usize,
    pub generation_calls_failed: usize,
    pub generation_timeouts: usize,
    pub generation_tokens_input: u64,
    pub generation_tokens_output: u64,
    pub generation_latency_avg_ms: u64,
    pub generation_latency_p50_ms: u64,
    pub generation_latency_p95_ms: u64,
    pub circuit_breaker_trips: usize,
    pub endpoint_requests: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn push_sample(samples: &RwLock<Vec<u64>>, duration: Duration) {
    let mut samples = samples.write();
    if samples.len() >= MAX_LATENCY_SAMPLES {
        samples.remove(0);
    }
    samples.push(duration.as_millis() as u64);
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_generation_call(true, Duration::from_millis(100), 500, 200);
        metrics.record_generation_call(false, Duration::from_millis(50), 0, 0);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_resolution(SourceTag::Generated);
        metrics.record_resolution(SourceTag::Fallback);
        metrics.record_resolution(SourceTag::Fallback);
        metrics.record_prediction(true, Some(Duration::from_millis(20)));
        metrics.record_prediction(false, None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.generation_calls_total, 2);
        assert_eq!(snapshot.generation_calls_success, 1);
        assert_eq!(snapshot.generation_calls_failed, 1);
        assert_eq!(snapshot.generation_tokens_input, 500);
        assert_eq!(snapshot.cache_hit_rate, 0.5);
        assert_eq!(snapshot.resolved_generated, 1);
        assert_eq!(snapshot.resolved_fallback, 2);
        assert_eq!(snapshot.predictions_total, 2);
        assert_eq!(snapshot.predictions_failed, 1);
        assert_eq!(snapshot.classifier_latency_avg_ms, 20);
    }

    #[test]
    fn test_endpoint_counters() {
        let metrics = Metrics::new();
        metrics.record_endpoint_request("/languages");
        metrics.record_endpoint_request("/predict");
        metrics.record_endpoint_request("/predict");

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.endpoint_requests,
            vec![("/languages".to_string(), 1), ("/predict".to_string(), 2)]
        );
    }

    #[test]
    fn test_prometheus_tolerates_failed_ahead_of_total() {
        // Counters are loaded independently, so a snapshot can see the
        // failure before the total it belongs to.
        let metrics = Metrics::new();
        metrics.inner.predictions_failed.fetch_add(1, Ordering::Relaxed);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("predictions_total{outcome=\"success\"} 0"));
        assert!(prometheus.contains("predictions_total{outcome=\"failed\"} 1"));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_resolution(SourceTag::Cache);
        metrics.record_generation_call(true, Duration::from_millis(100), 500, 200);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("# TYPE resolutions_total counter"));
        assert!(prometheus.contains("resolutions_total{source=\"cache\"} 1"));
        assert!(prometheus.contains("generation_tokens_total{direction=\"input\"} 500"));
        assert!(prometheus.contains("cache_size{} 0"));
    }
}
