// Main entry point for the pest and disease classification service

use harvest_hub::{
    api::{self, AppState},
    core::Config,
    middleware::{CircuitBreaker, CircuitBreakerConfig},
    services::{
        CacheStore, Classifier, DisabledBackend, FileCacheStore, GeminiBackend,
        GenerationBackend, LanguageCatalog, NoopCacheStore, OnnxClassifier, PredictionPipeline,
        RecommendationResolver, ResolverConfig,
    },
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Process-wide handles, built once in this order:
/// metrics, classifier, cache, generation backend, resolver, pipeline.
/// Any failure aborts startup.
#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    let filter = EnvFilter::new(format!(
        "harvest_hub={},ort=off,tower_http=info",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== HARVEST HUB v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: generation={} cache={} languages={}",
        if config.generation.enabled { "ON" } else { "OFF" },
        if config.cache.enabled { "ON" } else { "OFF" },
        LanguageCatalog.list_all().len()
    );

    let metrics = Metrics::new();

    info!("Loading classifier from {}...", config.model.model_path);
    let classifier: Arc<dyn Classifier> = Arc::new(OnnxClassifier::load(&config.model)?);

    let file_cache = if config.cache.enabled {
        Some(
            FileCacheStore::open(
                &config.cache.cache_dir,
                config.cache.max_entries,
                Some(config.cache.save_interval),
                Some(metrics.clone()),
            )
            .await
            .context("Failed to open remedy cache")?,
        )
    } else {
        None
    };
    let cache: Arc<dyn CacheStore> = match file_cache.clone() {
        Some(store) => Arc::new(store),
        None => Arc::new(NoopCacheStore),
    };

    let (backend, circuit_breaker): (Arc<dyn GenerationBackend>, Option<CircuitBreaker>) =
        if config.generation.enabled {
            let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), Some(metrics.clone()));
            let gemini = GeminiBackend::new(&config.generation, breaker.clone(), Some(metrics.clone()))?;
            info!("Generation backend: gemini ({})", config.generation.model);
            (Arc::new(gemini), Some(breaker))
        } else {
            warn!("Generation disabled, cache misses will be served from fallback");
            (Arc::new(DisabledBackend), None)
        };

    let resolver = RecommendationResolver::new(
        cache,
        backend,
        ResolverConfig::from_config(&config),
        Some(metrics.clone()),
    );
    let pipeline = PredictionPipeline::new(
        classifier,
        resolver,
        config.model.classifier_timeout,
        Some(metrics.clone()),
    );

    let app = api::router(AppState {
        config: config.clone(),
        pipeline,
        metrics,
        circuit_breaker,
    });

    let addr = config.server_addr();
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /               - Service information");
    info!("  GET  /health         - Health check");
    info!("  GET  /status         - Service status");
    info!("  GET  /languages      - Supported languages");
    info!("  GET  /metrics        - Prometheus metrics");
    info!("  GET  /stats          - Detailed statistics");
    info!("  POST /predict/{{lang}} - Classify image (multipart/form-data)");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(store) = file_cache {
        info!("Flushing remedy cache to {}", store.cache_file().display());
        store.save().await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
