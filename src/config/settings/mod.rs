
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::chunking::ChunkingConfig;
use crate::context::ContextConfig;
use crate::retrieval::RetrievalConfig;
use crate::retry::RetryPolicy;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub url: Url,
    pub model: String,
    pub batch_size: u32,
    /// Expected vector length; checked against every provider response when set
    pub dimension: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
            dimension: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub provider: GenerationBackend,
    /// Provider endpoint; each backend has its own default
    pub url: Option<Url>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Set when `api_key` was taken from the environment; such a key is never saved
    #[serde(skip)]
    pub api_key_from_env: bool,
    /// The file's own key, shadowed by the environment
    #[serde(skip)]
    pub file_api_key: Option<String>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Language every answer must be written in
    pub language: String,
    /// Returned verbatim when retrieval finds nothing
    pub no_context_answer: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationBackend::Ollama,
            url: None,
            model: "llama3.1:8b".to_string(),
            api_key: None,
            api_key_from_env: false,
            file_api_key: None,
            max_output_tokens: 2048,
            temperature: 0.7,
            timeout_secs: 60,
            language: "English".to_string(),
            no_context_answer: "I could not find any relevant material in the course content to answer this question. Please try rephrasing it or ask about another topic.".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0:?} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid embedding dimension: {0} (must be between 1 and 8192)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid {0} timeout: {1}s (must be between 1 and 600 seconds)")]
    InvalidTimeout(&'static str, u64),
    #[error("Invalid min words: {0} (must be at least 1)")]
    InvalidMinWords(usize),
    #[error("Max words ({0}) must be at least min words ({1})")]
    MaxWordsBelowMin(usize, usize),
    #[error("Invalid top_k: {0} (must be between 1 and 100)")]
    InvalidTopK(usize),
    #[error("Invalid max context chunks: {0} (must be at least 1)")]
    InvalidMaxContextChunks(usize),
    #[error("Invalid context token budget: {0} (must be at least 1)")]
    InvalidContextBudget(usize),
    #[error("Invalid preview length: {0} (must be between 1 and 1000 characters)")]
    InvalidPreviewChars(usize),
    #[error("Invalid max output tokens: {0} (must be between 1 and 32000)")]
    InvalidMaxOutputTokens(u32),
    #[error("Invalid temperature: {0} (must be between 0.0 and 2.0)")]
    InvalidTemperature(f32),
    #[error("Invalid language: answers need a target language")]
    InvalidLanguage,
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid retry jitter: {0} (must be between 0.0 and 1.0)")]
    InvalidJitter(f64),
    #[error("Missing API key for the {0} provider (set {API_KEY_ENV} or generation.api_key)")]
    MissingApiKey(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Load `config.toml` from `config_dir`, falling back to defaults when it does not exist
    ///
    /// The API key from the environment wins over the file. The result is validated.
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_path = config_dir.as_ref().join(CONFIG_FILE_NAME);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.base_dir = config_dir.as_ref().to_path_buf();

        if let Some(key) = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
        {
            config.generation.file_api_key = config.generation.api_key.replace(key);
            config.generation.api_key_from_env = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Write `config.toml`; a key that came from the environment stays out of the file
    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = if self.generation.api_key_from_env {
            let mut persisted = self.clone();
            persisted.generation.api_key = persisted.generation.file_api_key.take();
            toml::to_string_pretty(&persisted)
        } else {
            toml::to_string_pretty(self)
        }
        .context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Default configuration directory (`~/.textbook-rag`)
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".textbook-rag"))
            .or_else(|| dirs::data_dir().map(|data| data.join("textbook-rag")))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Get the base directory for the application
    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Get the path for the vector database directory
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }

    /// Where ingestion reports are written
    #[inline]
    pub fn reports_dir(&self) -> PathBuf {
        self.get_base_dir().join("reports")
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.generation.validate()?;
        self.validate_chunking_config()?;
        self.validate_query_config()?;
        self.validate_retry_policy()?;
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if config.min_words == 0 {
            return Err(ConfigError::InvalidMinWords(config.min_words));
        }

        if config.max_words < config.min_words {
            return Err(ConfigError::MaxWordsBelowMin(
                config.max_words,
                config.min_words,
            ));
        }

        Ok(())
    }

    fn validate_query_config(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.retrieval.top_k) {
            return Err(ConfigError::InvalidTopK(self.retrieval.top_k));
        }

        let context = &self.context;
        if context.max_context_chunks == 0 {
            return Err(ConfigError::InvalidMaxContextChunks(
                context.max_context_chunks,
            ));
        }

        if context.max_context_tokens == 0 {
            return Err(ConfigError::InvalidContextBudget(context.max_context_tokens));
        }

        if !(1..=1000).contains(&context.preview_chars) {
            return Err(ConfigError::InvalidPreviewChars(context.preview_chars));
        }

        Ok(())
    }

    fn validate_retry_policy(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(self.retry.max_attempts));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::InvalidJitter(self.retry.jitter));
        }

        Ok(())
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scheme(&self.url)?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if let Some(dimension) = self.dimension {
            if !(1..=8192).contains(&dimension) {
                return Err(ConfigError::InvalidEmbeddingDimension(dimension));
            }
        }

        if !(1..=600).contains(&self.timeout_secs) {
            return Err(ConfigError::InvalidTimeout("embedding", self.timeout_secs));
        }

        Ok(())
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_scheme(&self.endpoint())?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.provider == GenerationBackend::Anthropic
            && self.api_key.as_deref().is_none_or(|key| key.trim().is_empty())
        {
            return Err(ConfigError::MissingApiKey("anthropic"));
        }

        if !(1..=32000).contains(&self.max_output_tokens) {
            return Err(ConfigError::InvalidMaxOutputTokens(self.max_output_tokens));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }

        if !(1..=600).contains(&self.timeout_secs) {
            return Err(ConfigError::InvalidTimeout("generation", self.timeout_secs));
        }

        if self.language.trim().is_empty() {
            return Err(ConfigError::InvalidLanguage);
        }

        Ok(())
    }

    /// Configured endpoint, or the backend's well-known default
    #[inline]
    pub fn endpoint(&self) -> Url {
        self.url.clone().unwrap_or_else(|| match self.provider {
            GenerationBackend::Anthropic => anthropic_url(),
            GenerationBackend::Ollama => default_ollama_url(),
        })
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn validate_scheme(url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidProtocol(other.to_string())),
    }
}

#[expect(clippy::unwrap_used, reason = "literal URL is known to parse")]
fn default_ollama_url() -> Url {
    Url::parse("http://localhost:11434/").unwrap()
}

#[expect(clippy::unwrap_used, reason = "literal URL is known to parse")]
fn anthropic_url() -> Url {
    Url::parse("https://api.anthropic.com/").unwrap()
}
