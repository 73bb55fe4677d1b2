// HTTP surface: prediction upload, language listing and monitoring endpoints

use axum::{
    extract::{DefaultBodyLimit, Multipart, OriginalUri, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::core::config::Config;
use crate::core::errors::PredictionError;
use crate::core::types::PredictionResult;
use crate::middleware::CircuitBreaker;
use crate::services::languages::{LanguageCatalog, DEFAULT_LANGUAGE};
use crate::services::pipeline::PredictionPipeline;
use crate::utils::{has_allowed_extension, Metrics, ALLOWED_EXTENSIONS};

/// Multipart fields accepted as the uploaded image
const IMAGE_FIELDS: &[&str] = &["file", "image"];

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: PredictionPipeline,
    pub metrics: Metrics,
    /// Present when a real generation backend is configured
    pub circuit_breaker: Option<CircuitBreaker>,
}

pub fn router(state: AppState) -> Router {
    let max_file_size = state.config.server.max_file_size;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/languages", get(languages))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/predict", post(predict_default))
        .route("/predict/:lang", post(predict))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_file_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Error body: `{"status": "error", "message": ..., "path": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    path: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, path: &OriginalUri) -> Self {
        Self {
            status,
            message: message.into(),
            path: path.path().to_string(),
        }
    }

    fn from_prediction(err: PredictionError, path: &OriginalUri) -> Self {
        let status = if err.is_input_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::BAD_GATEWAY
        };
        Self::new(status, err.to_string(), path)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "message": self.message,
            "path": self.path,
        });
        (self.status, Json(body)).into_response()
    }
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/");
    Json(json!({
        "service": "Harvest Hub pest and disease classification",
        "version": env!("CARGO_PKG_VERSION"),
        "features": [
            "Image classification of crop pests and diseases",
            "Localized remedy recommendations in 12 Indian languages",
            "Cached and generated recommendations with static fallback",
        ],
        "endpoints": {
            "predict": "POST /predict/{lang}",
            "languages": "GET /languages",
            "health": "GET /health",
            "status": "GET /status",
            "metrics": "GET /metrics",
            "stats": "GET /stats",
        },
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/health");
    let resolver = state.pipeline.resolver();
    let circuit_state = state
        .circuit_breaker
        .as_ref()
        .map(|cb| cb.state().as_str());

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": true,
        "num_classes": state.pipeline.classifier().labels_count(),
        "supported_languages": LanguageCatalog.list_all().len(),
        "generation": {
            "backend": resolver.backend_name(),
            "circuit_state": circuit_state,
        },
        "cache": {
            "enabled": state.config.cache.enabled,
            "entries": resolver.cache_len(),
        },
        "in_flight_generations": resolver.in_flight_count(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/status");
    let snapshot = state.metrics.snapshot();
    let circuit = state.circuit_breaker.as_ref().map(|cb| cb.stats());

    Json(json!({
        "status": "operational",
        "uptime_seconds": snapshot.uptime_seconds,
        "predictions": {
            "total": snapshot.predictions_total,
            "failed": snapshot.predictions_failed,
        },
        "recommendations": {
            "cache": snapshot.resolved_cache,
            "generated": snapshot.resolved_generated,
            "fallback": snapshot.resolved_fallback,
        },
        "generation_enabled": state.config.generation.enabled,
        "circuit_breaker": circuit,
        "max_file_size": state.config.server.max_file_size,
    }))
}

async fn languages(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/languages");
    let all = LanguageCatalog.list_all();
    let by_code: serde_json::Map<String, serde_json::Value> = all
        .iter()
        .map(|l| (l.code.to_string(), json!(l.display_name)))
        .collect();

    Json(json!({
        "status": "success",
        "languages": all,
        "language_map": by_code,
        "total": all.len(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    Json(json!({
        "metrics": snapshot,
        "circuit_breaker": state.circuit_breaker.as_ref().map(|cb| cb.stats()),
        "in_flight_generations": state.pipeline.resolver().in_flight_count(),
    }))
}

async fn predict_default(
    State(state): State<AppState>,
    uri: OriginalUri,
    multipart: Multipart,
) -> Result<Json<PredictionResult>, ApiError> {
    run_prediction(state, DEFAULT_LANGUAGE.to_string(), uri, multipart).await
}

/// Classify an uploaded image and attach a remedy in `lang`.
///
/// Request: multipart/form-data with the image in field `file` (or `image`).
async fn predict(
    State(state): State<AppState>,
    Path(lang): Path<String>,
    uri: OriginalUri,
    multipart: Multipart,
) -> Result<Json<PredictionResult>, ApiError> {
    run_prediction(state, lang, uri, multipart).await
}

async fn run_prediction(
    state: AppState,
    lang: String,
    uri: OriginalUri,
    multipart: Multipart,
) -> Result<Json<PredictionResult>, ApiError> {
    state.metrics.record_endpoint_request("/predict");
    let start_time = std::time::Instant::now();

    // Language comes before anything in the upload
    if !LanguageCatalog.is_supported(&lang) {
        let err = PredictionError::UnsupportedLanguage {
            code: lang,
            supported: LanguageCatalog.supported_codes(),
        };
        warn!("Rejected prediction request: {}", err);
        state.metrics.record_prediction(false, None);
        return Err(ApiError::from_prediction(err, &uri));
    }

    let image_bytes = read_image_field(multipart, &uri).await?;

    // An absent upload reaches the pipeline as empty bytes
    let result = state
        .pipeline
        .handle(image_bytes.unwrap_or_default(), &lang)
        .await
        .map_err(|e| {
            if e.is_input_error() {
                warn!("Rejected prediction request: {}", e);
            } else {
                error!("Prediction failed: {}", e);
            }
            ApiError::from_prediction(e, &uri)
        })?;

    info!(
        "Request completed in {:.2}s: {} → {}",
        start_time.elapsed().as_secs_f64(),
        result.prediction.label,
        result.source
    );

    Ok(Json(result))
}

async fn read_image_field(
    mut multipart: Multipart,
    uri: &OriginalUri,
) -> Result<Option<Vec<u8>>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), format!("Multipart error: {}", e), uri))?
    {
        let name = field.name().unwrap_or("").to_string();
        if !IMAGE_FIELDS.contains(&name.as_str()) {
            continue;
        }

        if let Some(filename) = field.file_name().filter(|f| !f.is_empty()) {
            if !has_allowed_extension(filename) {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "Invalid file type: {}. Allowed: {}",
                        filename,
                        ALLOWED_EXTENSIONS.join(", ")
                    ),
                    uri,
                ));
            }
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), format!("Read error: {}", e), uri))?;
        return Ok(Some(data.to_vec()));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ClassifierResult;
    use crate::core::types::Classification;
    use crate::services::cache::MemoryCacheStore;
    use crate::services::classifier::Classifier;
    use crate::services::generation::DisabledBackend;
    use crate::services::recommendation::{RecommendationResolver, ResolverConfig};
    use crate::utils::encode_png;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use image::{DynamicImage, RgbImage};
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "harvest-boundary";

    struct FixedClassifier;

    impl Classifier for FixedClassifier {
        fn classify(&self, _image: &DynamicImage) -> ClassifierResult<Classification> {
            Ok(Classification {
                label: "Tomato___Early_blight".to_string(),
                confidence: 0.88,
                index: 2,
            })
        }

        fn labels_count(&self) -> usize {
            38
        }
    }

    fn app() -> Router {
        let metrics = Metrics::new();
        let resolver = RecommendationResolver::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(DisabledBackend),
            ResolverConfig::default(),
            Some(metrics.clone()),
        );
        let pipeline = PredictionPipeline::new(
            Arc::new(FixedClassifier),
            resolver,
            Duration::from_secs(2),
            Some(metrics.clone()),
        );
        router(AppState {
            config: Arc::new(Config::offline()),
            pipeline,
            metrics,
            circuit_breaker: None,
        })
    }

    fn multipart_request(uri: &str, field: &str, filename: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn leaf_png() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, image::Rgb([30, 150, 50])));
        encode_png(&img).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_languages_listing() {
        let response = app()
            .oneshot(Request::get("/languages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["total"], 12);
        assert_eq!(body["languages"][0], json!({"code": "en", "name": "English"}));
        assert_eq!(body["language_map"]["ta"], "Tamil");
    }

    #[tokio::test]
    async fn test_health_reports_components() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["num_classes"], 38);
        assert_eq!(body["generation"]["backend"], "disabled");
        assert_eq!(body["in_flight_generations"], 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_bad_request() {
        let response = app()
            .oneshot(multipart_request("/predict/xx", "file", "leaf.png", &leaf_png()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["path"], "/predict/xx");
        assert!(body["message"].as_str().unwrap().contains("xx"));
    }

    #[tokio::test]
    async fn test_unsupported_language_reported_before_file_type() {
        let response = app()
            .oneshot(multipart_request("/predict/xx", "file", "leaf.tiff", &leaf_png()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        let message = body["message"].as_str().unwrap();
        assert!(message.starts_with("Unsupported language code: xx"), "{}", message);
    }

    #[tokio::test]
    async fn test_disallowed_extension_is_bad_request() {
        let response = app()
            .oneshot(multipart_request("/predict/en", "file", "leaf.tiff", &leaf_png()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_image_is_bad_request() {
        let response = app()
            .oneshot(multipart_request("/predict/en", "notes", "leaf.png", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_predict_returns_fallback_when_generation_disabled() {
        let response = app()
            .oneshot(multipart_request("/predict/hi", "image", "leaf.png", &leaf_png()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["prediction"]["label"], "Tomato___Early_blight");
        assert_eq!(body["language"]["code"], "hi");
        assert_eq!(body["source"], "fallback");
        assert!(!body["recommendation"]["diagnosis"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_predict_without_language_defaults_to_english() {
        let response = app()
            .oneshot(multipart_request("/predict", "file", "leaf.png", &leaf_png()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["language"]["code"], "en");
    }

    #[tokio::test]
    async fn test_metrics_are_prometheus_text() {
        let response = app()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("# TYPE resolutions_total counter"));
    }
}
