use crate::core::errors::ConfigError;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    /// Upload size limit in bytes
    pub max_file_size: usize,
}

/// Classifier model configuration
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: String,
    pub labels_path: String,
    pub image_size: u32,
    pub classifier_timeout: Duration,
    pub intra_threads: usize,
}

/// Generation backend configuration
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Remedy cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub cache_dir: String,
    pub max_entries: usize,
    pub save_interval: Duration,
    /// Bound on a single cache get/put
    pub timeout: Duration,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub cache: CacheConfig,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let api_key = env::var("GEMINI_API_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            server: ServerConfig {
                port: env_or("SERVER_PORT", 8000),
                host: env_string("SERVER_HOST", "0.0.0.0"),
                log_level,
                max_file_size: env_or("MAX_FILE_SIZE", 16 * 1024 * 1024),
            },
            model: ModelConfig {
                model_path: env_string("MODEL_PATH", "models/classifier.onnx"),
                labels_path: env_string("LABELS_PATH", "models/labels.txt"),
                image_size: env_or("IMAGE_SIZE", 224),
                classifier_timeout: Duration::from_millis(env_or("CLASSIFIER_TIMEOUT_MS", 2000)),
                intra_threads: env_or("CLASSIFIER_THREADS", num_cpus::get().clamp(1, 4)),
            },
            generation: GenerationConfig {
                enabled: env_or("GENERATION_ENABLED", true),
                api_key,
                model: env_string("GEMINI_MODEL", "gemini-1.5-flash"),
                timeout: Duration::from_millis(env_or("GENERATION_TIMEOUT_MS", 8000)),
                max_retries: env_or("GENERATION_MAX_RETRIES", 1),
            },
            cache: CacheConfig {
                enabled: env_or("CACHE_ENABLED", true),
                cache_dir: env_string("CACHE_DIR", ".cache"),
                max_entries: env_or("CACHE_MAX_ENTRIES", 10_000),
                save_interval: Duration::from_secs(env_or("CACHE_SAVE_INTERVAL_SECS", 30)),
                timeout: Duration::from_millis(env_or("CACHE_TIMEOUT_MS", 1500)),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.enabled && self.generation.api_key.is_none() {
            return Err(ConfigError::MissingApiKey);
        }

        if self.generation.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout { name: "GENERATION_TIMEOUT_MS" });
        }
        if self.model.classifier_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout { name: "CLASSIFIER_TIMEOUT_MS" });
        }
        if self.cache.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout { name: "CACHE_TIMEOUT_MS" });
        }

        if !(32..=1024).contains(&self.model.image_size) {
            return Err(ConfigError::InvalidImageSize(self.model.image_size));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidCacheCapacity);
        }

        if self.server.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize);
        }

        // Cache directory itself is created on demand, its parent must exist
        let cache_path = Path::new(&self.cache.cache_dir);
        if let Some(parent) = cache_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidCachePath(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    /// Defaults with generation disabled; used by tests and tooling that
    /// never touch the environment.
    pub fn offline() -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
                max_file_size: 16 * 1024 * 1024,
            },
            model: ModelConfig {
                model_path: "models/classifier.onnx".to_string(),
                labels_path: "models/labels.txt".to_string(),
                image_size: 224,
                classifier_timeout: Duration::from_secs(2),
                intra_threads: 1,
            },
            generation: GenerationConfig {
                enabled: false,
                api_key: None,
                model: "gemini-1.5-flash".to_string(),
                timeout: Duration::from_secs(8),
                max_retries: 0,
            },
            cache: CacheConfig {
                enabled: false,
                cache_dir: ".cache".to_string(),
                max_entries: 10_000,
                save_interval: Duration::from_secs(30),
                timeout: Duration::from_millis(1500),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_config_is_valid() {
        assert!(Config::offline().validate().is_ok());
    }

    #[test]
    fn test_generation_requires_api_key() {
        let mut config = Config::offline();
        config.generation.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiKey)));

        config.generation.api_key = Some("test-key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_timeouts_and_bad_sizes() {
        let mut config = Config::offline();
        config.generation.timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeout { name: "GENERATION_TIMEOUT_MS" })
        ));

        let mut config = Config::offline();
        config.model.image_size = 4096;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidImageSize(4096))));

        let mut config = Config::offline();
        config.cache.max_entries = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCacheCapacity)));
    }

    #[test]
    fn test_rejects_cache_dir_with_missing_parent() {
        let mut config = Config::offline();
        config.cache.cache_dir = "/definitely/not/here/.cache".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCachePath(_))));
    }
}
