use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::GenerationBackend;
use crate::core::config::GenerationConfig;
use crate::core::errors::{GenerationError, GenerationResult};
use crate::middleware::CircuitBreaker;
use crate::utils::Metrics;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Retry backoff
const INITIAL_RETRY_DELAY_MS: u64 = 200;
const MAX_RETRY_DELAY_MS: u64 = 2000;

/// Gemini `generateContent` client with circuit breaker, retries and metrics
pub struct GeminiBackend {
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
    request_timeout: Duration,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
}

impl GeminiBackend {
    pub fn new(
        config: &GenerationConfig,
        circuit_breaker: CircuitBreaker,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("Gemini API key is required")?;

        // The resolver enforces its own timeout; this one only bounds
        // calls that keep running in the background after it fires.
        let request_timeout = config.timeout * 4;
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: config.max_retries,
            request_timeout,
            http_client,
            circuit_breaker,
            metrics,
        })
    }

    /// Point the client at another endpoint (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn request_body(prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{
                "parts": [{ "text": prompt }]
            }],
            "generationConfig": {
                "response_mime_type": "application/json",
                "temperature": 0.4
            }
        })
    }

    async fn send_with_retries(&self, body: &serde_json::Value) -> GenerationResult<serde_json::Value> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let mut retry_delay_ms = INITIAL_RETRY_DELAY_MS;
        let mut attempt = 0;

        loop {
            let result = self.send_once(&url, body).await;

            let retryable = matches!(
                result,
                Err(GenerationError::RateLimited) | Err(GenerationError::BackendUnavailable(_))
            );
            if result.is_ok() || !retryable || attempt >= self.max_retries {
                return result;
            }

            attempt += 1;
            let jitter = rand::random::<u64>() % 100;
            debug!(
                "Gemini request failed, retrying in {}ms ({}/{})",
                retry_delay_ms + jitter,
                attempt,
                self.max_retries
            );
            tokio::time::sleep(Duration::from_millis(retry_delay_ms + jitter)).await;
            retry_delay_ms = (retry_delay_ms * 2).min(MAX_RETRY_DELAY_MS);
        }
    }

    async fn send_once(&self, url: &str, body: &serde_json::Value) -> GenerationResult<serde_json::Value> {
        let response = self
            .http_client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GenerationError::BackendUnavailable(format!(
                "{} - {}",
                status,
                truncate(&error_text, 200)
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.transport_error(e)
                } else {
                    GenerationError::InvalidResponse(e.to_string())
                }
            })
    }

    fn transport_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout(self.request_timeout.as_millis() as u64)
        } else {
            GenerationError::BackendUnavailable(err.to_string())
        }
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn generate(&self, prompt: &str) -> GenerationResult<String> {
        if !self.circuit_breaker.allow_request() {
            warn!("Circuit breaker is open, failing fast");
            return Err(GenerationError::CircuitOpen);
        }

        let start = Instant::now();
        let result = self
            .send_with_retries(&Self::request_body(prompt))
            .await
            .and_then(|response| {
                let (input_tokens, output_tokens) = extract_token_usage(&response);
                extract_text(&response).map(|text| (text, input_tokens, output_tokens))
            });
        let duration = start.elapsed();

        match result {
            Ok((text, input_tokens, output_tokens)) => {
                self.circuit_breaker.record_success();
                if let Some(ref m) = self.metrics {
                    m.record_generation_call(true, duration, input_tokens, output_tokens);
                }
                debug!(
                    "Gemini responded in {:.2}s ({} output tokens)",
                    duration.as_secs_f64(),
                    output_tokens
                );
                Ok(text)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                if let Some(ref m) = self.metrics {
                    m.record_generation_call(false, duration, 0, 0);
                }
                warn!("Gemini generation failed after {:.2}s: {}", duration.as_secs_f64(), e);
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

fn extract_text(response: &serde_json::Value) -> GenerationResult<String> {
    let parts = response["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or_else(|| GenerationError::InvalidResponse("missing candidate content".to_string()))?;

    let text: String = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect();

    if text.trim().is_empty() {
        return Err(GenerationError::InvalidResponse("empty candidate text".to_string()));
    }
    Ok(text)
}

fn extract_token_usage(response: &serde_json::Value) -> (u64, u64) {
    let usage_metadata = &response["usageMetadata"];
    let input_tokens = usage_metadata["promptTokenCount"].as_u64().unwrap_or(0);
    let output_tokens = usage_metadata["candidatesTokenCount"].as_u64().unwrap_or(0);
    (input_tokens, output_tokens)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
