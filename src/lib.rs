// Library exports for the pest and disease classification service

pub mod api;
pub mod core;
pub mod middleware;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{CacheError, ClassifierError, ConfigError, GenerationError, PredictionError},
    types::{Classification, PredictionResult, Remedy, RemedyKey, Resolution, SourceTag},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use services::{PredictionPipeline, RecommendationResolver};

pub use utils::Metrics;
