pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    CacheError, ClassifierError, ConfigError, GenerationError, LanguageError, PredictionError,
};
pub use types::{
    CacheEntry, Classification, LanguageDescriptor, PredictionResult, Remedy, RemedyKey,
    Resolution, SourceTag,
};
