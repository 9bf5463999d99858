use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::embedding::{DEFAULT_DIMENSIONS, DEFAULT_MODEL};
use crate::error::ConfigError;
use crate::matching::FallbackMode;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FoodMapperConfig {
    pub logging: LoggingConfig,
    pub embedding: EmbeddingConfig,
    pub remote: RemoteConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Local model settings. `model` is the HuggingFace id `model download`
/// fetches into `cache_dir`; keep it in step with `remote.model`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimensions: usize,
    pub cache_dir: String,
    pub max_seq_len: usize,
    pub intra_threads: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub priority: bool,
    pub max_batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MatchingConfig {
    pub threshold: f64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub fallback_mode: FallbackMode,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub normalize: bool,
    pub dedup_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_food_mapper_dir()
            .join("models")
            .join("gte-large")
            .to_string_lossy()
            .into_owned();
        Self {
            model: DEFAULT_MODEL.into(),
            dimensions: DEFAULT_DIMENSIONS,
            cache_dir,
            max_seq_len: 512,
            intra_threads: 4,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepinfra.com/v1/openai".into(),
            model: DEFAULT_MODEL.into(),
            api_key: String::new(),
            timeout_secs: 45,
            connect_timeout_secs: 20,
            priority: false,
            max_batch_size: 1024,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            batch_size: 200,
            concurrency: 100,
            fallback_mode: FallbackMode::Auto,
            max_retries: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4000,
            normalize: false,
            dedup_targets: true,
        }
    }
}

/// Returns `~/.food-mapper/`
pub fn default_food_mapper_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".food-mapper")
}

/// Returns the default config file path: `~/.food-mapper/config.toml`
pub fn default_config_path() -> PathBuf {
    default_food_mapper_dir().join("config.toml")
}

impl FoodMapperConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            FoodMapperConfig::default()
        };

        config
            .apply_env_overrides()
            .context("invalid environment override")?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any `key -> value` lookup.
    ///
    /// Empty values are ignored. `DEEPINFRA_API_KEY` wins over `DEEPINFRA_TOKEN`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(val) = get("FOOD_MAPPER_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = get("DEEPINFRA_API_KEY").or_else(|| get("DEEPINFRA_TOKEN")) {
            self.remote.api_key = val;
        }
        if let Some(val) = get("EMBEDDING_BASE_URL") {
            self.remote.base_url = val;
        }
        if let Some(val) = get("EMBEDDING_MODEL") {
            self.remote.model = val;
        }
        if let Some(val) = get("DEEPINFRA_PRIORITY") {
            self.remote.priority = parse_flag(&val);
        }
        if let Some(val) = get("API_EMBED_TIMEOUT_SECS") {
            self.remote.timeout_secs = parse_env("API_EMBED_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = get("FOOD_MAPPER_MODEL_DIR") {
            self.embedding.cache_dir = val;
        }
        if let Some(val) = get("EMBEDDING_BATCH_SIZE") {
            self.matching.batch_size = parse_env("EMBEDDING_BATCH_SIZE", &val)?;
        }
        if let Some(val) = get("EMBEDDING_CONCURRENCY") {
            self.matching.concurrency = parse_env("EMBEDDING_CONCURRENCY", &val)?;
        }
        if let Some(val) = get("API_EMBED_MAX_FAILURES") {
            self.matching.max_retries = parse_env("API_EMBED_MAX_FAILURES", &val)?;
        }
        if let Some(val) = get("MODEL_FALLBACK_MODE") {
            self.matching.fallback_mode = val.parse()?;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
