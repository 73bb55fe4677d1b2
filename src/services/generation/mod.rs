pub mod gemini;
pub mod prompt;

use async_trait::async_trait;

use crate::core::errors::{GenerationError, GenerationResult};

pub use gemini::GeminiBackend;
pub use prompt::{build_prompt, parse_remedy};

/// Text generation service. Slow and fallible; callers bound it with a timeout.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> GenerationResult<String>;

    /// Short name for health reporting
    fn name(&self) -> &'static str;
}

/// Backend used when generation is turned off; every call fails, so every
/// cache miss is answered by the fallback tier.
#[derive(Debug, Default)]
pub struct DisabledBackend;

#[async_trait]
impl GenerationBackend for DisabledBackend {
    async fn generate(&self, _prompt: &str) -> GenerationResult<String> {
        Err(GenerationError::Disabled)
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
