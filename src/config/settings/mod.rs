#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::database::sqlite::DATABASE_FILE;
use crate::embeddings::preprocess::ChunkingConfig;
use crate::embeddings::provider::{DialectPreference, ProviderOptions};
use crate::indexer::ProcessorConfig;
use crate::search::SearchConfig;

pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the base directory
pub const BASE_DIR_ENV: &str = "SEMVAULT_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider identifier used in namespaces
    pub id: String,
    pub endpoint: String,
    pub model: String,
    pub dialect: DialectPreference,
    /// Bearer token; empty means none
    pub api_key: String,
    pub max_batch_size: usize,
    /// In-flight cap for single-document requests
    pub max_concurrency: usize,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    /// 0 means learn it from the first response
    pub dimension: usize,
}

impl Default for ProviderConfig {
    #[inline]
    fn default() -> Self {
        Self {
            id: "ollama".to_string(),
            endpoint: "http://localhost:11434/api/embeddings".to_string(),
            model: "nomic-embed-text".to_string(),
            dialect: DialectPreference::Auto,
            api_key: String::new(),
            max_batch_size: 64,
            max_concurrency: 5,
            timeout_seconds: 30,
            retry_attempts: 3,
            dimension: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid endpoint URL: {0} (must be an http or https URL)")]
    InvalidUrl(String),
    #[error("Invalid provider id: {0} (cannot be empty)")]
    InvalidProviderId(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid request timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid retry attempts: {0} (must be at most 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid target chunk size: {0} (must be between 200 and 20000)")]
    InvalidTargetChunkSize(usize),
    #[error("Invalid overlap ratio: {0} (must be at least 0.0 and below 0.5)")]
    InvalidOverlapRatio(f32),
    #[error("Minimum content size ({0}) must be smaller than maximum content size ({1})")]
    ContentBoundsInverted(usize, usize),
    #[error("Invalid schema version: {0} (must be at least 1)")]
    InvalidSchemaVersion(u32),
    #[error("Invalid similarity floor: {0} (must be between -1.0 and 1.0)")]
    InvalidMinSimilarity(f32),
    #[error("Invalid search slice size: {0} (must be at least 1)")]
    InvalidSliceSize(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Defaults rooted at `base_dir`
    #[inline]
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// `$SEMVAULT_DIR`, or `semvault` under the platform config directory
    #[inline]
    pub fn default_base_dir() -> Result<PathBuf, ConfigError> {
        if let Some(dir) = env::var_os(BASE_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir()
            .map(|dir| dir.join("semvault"))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Read `config.toml` from `base_dir`; a missing file yields defaults
    #[inline]
    pub fn load<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let config_path = base_dir.as_ref().join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::with_base_dir(base_dir));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = base_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let base_dir = self.base_dir();
        fs::create_dir_all(base_dir).with_context(|| {
            format!("Failed to create config directory: {}", base_dir.display())
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    /// Get the path for the embeddings database
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join(DATABASE_FILE)
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider.validate()?;
        self.validate_chunking_config()?;
        self.validate_processor_config()?;
        self.validate_search_config()?;
        Ok(())
    }

    /// Provider settings in the shape the HTTP provider expects
    #[inline]
    pub fn provider_options(&self) -> ProviderOptions {
        let provider = &self.provider;
        let mut options = ProviderOptions::new(&provider.id, &provider.endpoint, &provider.model);
        options.dialect = provider.dialect.resolve(&provider.endpoint);
        options.api_key = provider.api_key().map(str::to_string);
        options.max_batch_size = provider.max_batch_size;
        options.max_concurrency = provider.max_concurrency;
        options.retry_attempts = provider.retry_attempts;
        options
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(200..=20_000).contains(&config.target_chunk_chars) {
            return Err(ConfigError::InvalidTargetChunkSize(config.target_chunk_chars));
        }

        if !(0.0..0.5).contains(&config.overlap_ratio) {
            return Err(ConfigError::InvalidOverlapRatio(config.overlap_ratio));
        }

        if config.min_content_chars >= config.max_content_chars {
            return Err(ConfigError::ContentBoundsInverted(
                config.min_content_chars,
                config.max_content_chars,
            ));
        }

        Ok(())
    }

    fn validate_processor_config(&self) -> Result<(), ConfigError> {
        let config = &self.processor;

        if !(1..=1000).contains(&config.batch_size) {
            return Err(ConfigError::InvalidBatchSize(config.batch_size));
        }

        if !(1..=64).contains(&config.max_concurrency) {
            return Err(ConfigError::InvalidConcurrency(config.max_concurrency));
        }

        if config.schema_version == 0 {
            return Err(ConfigError::InvalidSchemaVersion(config.schema_version));
        }

        Ok(())
    }

    fn validate_search_config(&self) -> Result<(), ConfigError> {
        let config = &self.search;

        if !(-1.0..=1.0).contains(&config.min_similarity) {
            return Err(ConfigError::InvalidMinSimilarity(config.min_similarity));
        }

        if config.async_chunk_size == 0 {
            return Err(ConfigError::InvalidSliceSize(config.async_chunk_size));
        }

        Ok(())
    }
}

impl ProviderConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidProviderId(self.id.clone()));
        }

        self.endpoint_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if !(1..=1000).contains(&self.max_batch_size) {
            return Err(ConfigError::InvalidBatchSize(self.max_batch_size));
        }

        if !(1..=64).contains(&self.max_concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrency));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        if self.retry_attempts > 10 {
            return Err(ConfigError::InvalidRetryAttempts(self.retry_attempts));
        }

        Ok(())
    }

    #[inline]
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let url =
            Url::parse(&self.endpoint).map_err(|_| ConfigError::InvalidUrl(self.endpoint.clone()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(self.endpoint.clone()));
        }
        Ok(url)
    }

    #[inline]
    pub fn api_key(&self) -> Option<&str> {
        let key = self.api_key.trim();
        (!key.is_empty()).then_some(key)
    }

    #[inline]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Configured dimension, if fixed
    #[inline]
    pub const fn dimension(&self) -> Option<usize> {
        if self.dimension == 0 {
            None
        } else {
            Some(self.dimension)
        }
    }
}
