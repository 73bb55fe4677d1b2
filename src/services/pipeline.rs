use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{PipelineResult, PredictionError};
use crate::core::types::{PredictionResult, RemedyKey};
use crate::services::classifier::Classifier;
use crate::services::languages::LanguageCatalog;
use crate::services::recommendation::RecommendationResolver;
use crate::utils::{decode_image_async, Metrics};

/// Sequences one prediction: language check, image decode, classification,
/// remedy resolution.
#[derive(Clone)]
pub struct PredictionPipeline {
    classifier: Arc<dyn Classifier>,
    resolver: RecommendationResolver,
    languages: LanguageCatalog,
    classifier_timeout: Duration,
    metrics: Option<Metrics>,
}

impl PredictionPipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        resolver: RecommendationResolver,
        classifier_timeout: Duration,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            classifier,
            resolver,
            languages: LanguageCatalog,
            classifier_timeout,
            metrics,
        }
    }

    pub fn resolver(&self) -> &RecommendationResolver {
        &self.resolver
    }

    pub fn classifier(&self) -> &Arc<dyn Classifier> {
        &self.classifier
    }

    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    pub async fn handle(
        &self,
        image_bytes: Vec<u8>,
        language_code: &str,
    ) -> PipelineResult<PredictionResult> {
        let result = self.run(image_bytes, language_code).await;
        if let (Some(m), Err(_)) = (&self.metrics, &result) {
            m.record_prediction(false, None);
        }
        result
    }

    async fn run(
        &self,
        image_bytes: Vec<u8>,
        language_code: &str,
    ) -> PipelineResult<PredictionResult> {
        // Rejected before any classifier or backend work
        let language = self.languages.describe(language_code).map_err(|_| {
            PredictionError::UnsupportedLanguage {
                code: language_code.to_string(),
                supported: self.languages.supported_codes(),
            }
        })?;

        if image_bytes.is_empty() {
            return Err(PredictionError::InvalidImage("no image data provided".to_string()));
        }
        let image = decode_image_async(image_bytes)
            .await
            .map_err(|e| PredictionError::InvalidImage(e.to_string()))?;

        let classifier = Arc::clone(&self.classifier);
        let classify_start = Instant::now();
        let classification = tokio::time::timeout(
            self.classifier_timeout,
            tokio::task::spawn_blocking(move || classifier.classify(&image)),
        )
        .await
        .map_err(|_| {
            warn!("Classifier exceeded {}ms", self.classifier_timeout.as_millis());
            PredictionError::ClassificationFailed(format!(
                "classifier did not finish within {}ms",
                self.classifier_timeout.as_millis()
            ))
        })?
        .map_err(|e| PredictionError::ClassificationFailed(format!("classifier task failed: {}", e)))?
        .map_err(|e| PredictionError::ClassificationFailed(e.to_string()))?;
        let classify_time = classify_start.elapsed();

        debug!(
            "Classified as {} ({:.3}) in {:.2}ms",
            classification.label,
            classification.confidence,
            classify_time.as_secs_f64() * 1000.0
        );

        let key = RemedyKey::new(classification.label.clone(), language.code);
        let resolution = self.resolver.resolve(key).await;

        info!(
            "Prediction {} [{}] served from {}",
            classification.label, language.code, resolution.source
        );
        if let Some(ref m) = self.metrics {
            m.record_prediction(true, Some(classify_time));
        }

        Ok(PredictionResult {
            prediction: classification,
            recommendation: resolution.remedy,
            language,
            source: resolution.source,
            predicted_at: Utc::now(),
        })
    }
}
