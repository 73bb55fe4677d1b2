pub mod cache;
pub mod classifier;
pub mod fallback;
pub mod generation;
pub mod languages;
pub mod pipeline;
pub mod recommendation;

// Re-export commonly used services
pub use cache::{CacheStore, FileCacheStore, MemoryCacheStore, NoopCacheStore};
pub use classifier::{Classifier, OnnxClassifier};
pub use fallback::FallbackCatalog;
pub use generation::{DisabledBackend, GeminiBackend, GenerationBackend};
pub use languages::{LanguageCatalog, DEFAULT_LANGUAGE};
pub use pipeline::PredictionPipeline;
pub use recommendation::{RecommendationResolver, ResolverConfig};
