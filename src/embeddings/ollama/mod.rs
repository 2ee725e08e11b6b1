
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::http::{self, ProviderError};

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
pub struct ModelDetails {
    pub family: Option<String>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaEmbedder {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Self {
        let timeout = config.timeout();
        Self {
            base_url: config.url.clone(),
            model: config.model.clone(),
            agent: http::agent_with_timeout(timeout),
            timeout,
        }
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Test connection to Ollama server and verify model availability
    #[inline]
    pub async fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models().await.context("Server ping failed")?;

        if !models.iter().any(|m| self.matches_model(&m.name)) {
            let available_models: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            warn!(
                "Model {} not found. Available models: {:?}",
                self.model, available_models
            );
            return Err(anyhow::anyhow!(
                "Model '{}' is not available. Available models: {:?}",
                self.model,
                available_models
            ));
        }

        info!(
            "Health check passed for Ollama server at {} with model {}",
            self.base_url, self.model
        );
        Ok(())
    }

    /// List all available models
    #[inline]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build models URL")?;

        debug!("Fetching available models from {}", url);

        let response_text = http::with_timeout(self.timeout, http::get_text(&self.agent, url.as_str()))
            .await
            .context("Failed to fetch models")?;

        let models_response: ModelsResponse =
            serde_json::from_str(&response_text).context("Failed to parse models response")?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    /// `nomic-embed-text` is served as `nomic-embed-text:latest`
    fn matches_model(&self, name: &str) -> bool {
        name == self.model
            || (!self.model.contains(':') && name == format!("{}:latest", self.model))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = self
            .base_url
            .join("/api/embed")
            .map_err(|e| ProviderError::InvalidResponse(format!("bad embedding URL: {}", e)))?;

        let request = BatchEmbedRequest {
            model: &self.model,
            inputs: texts,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        debug!("Requesting {} embeddings from {}", texts.len(), url);

        let response_text = http::post_json(&self.agent, url.as_str(), &[], request_json).await?;

        let batch_response: BatchEmbedResponse = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::InvalidResponse(format!("embedding response: {}", e)))?;

        Ok(batch_response.embeddings)
    }
}
