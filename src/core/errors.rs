// Error types for each service boundary
//
// Recommendation-tier errors (cache, generation) never reach a caller: the
// resolver absorbs them. Only PredictionError surfaces as a failed request.

use thiserror::Error;

/// Language lookup errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LanguageError {
    #[error("Unknown language code: {0}")]
    UnknownLanguage(String),
}

/// Classifier errors
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Model produced an empty output tensor")]
    EmptyOutput,

    #[error("Classifier rejected input: {0}")]
    InvalidInput(String),
}

/// Document cache errors (treated as a miss or a no-op by the resolver)
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Cache document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache file I/O failed for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Generation backend errors (all treated uniformly as generation failure)
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation backend rate limited the request")]
    RateLimited,

    #[error("Generation did not finish within {0}ms")]
    Timeout(u64),

    #[error("Invalid generation response: {0}")]
    InvalidResponse(String),

    #[error("Circuit breaker is open, generation backend is failing fast")]
    CircuitOpen,

    #[error("Generation is disabled by configuration")]
    Disabled,
}

/// Request-level errors surfaced by the prediction pipeline
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Unsupported language code: {code}. Supported languages: {supported}")]
    UnsupportedLanguage { code: String, supported: String },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Classification failed: {0}")]
    ClassificationFailed(String),
}

impl PredictionError {
    /// Whether the error was caused by the caller's input
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PredictionError::UnsupportedLanguage { .. } | PredictionError::InvalidImage(_)
        )
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Generation is enabled but no API key is configured (set GEMINI_API_KEY)")]
    MissingApiKey,

    #[error("Invalid timeout for {name}: must be > 0")]
    InvalidTimeout { name: &'static str },

    #[error("Image size must be between 32 and 1024, got {0}")]
    InvalidImageSize(u32),

    #[error("Cache capacity must be > 0")]
    InvalidCacheCapacity,

    #[error("Invalid cache path: {0}")]
    InvalidCachePath(String),

    #[error("Max file size must be > 0")]
    InvalidMaxFileSize,
}

pub type ClassifierResult<T> = Result<T, ClassifierError>;
pub type CacheResult<T> = Result<T, CacheError>;
pub type GenerationResult<T> = Result<T, GenerationError>;
pub type PipelineResult<T> = Result<T, PredictionError>;
