// Embeddings module
// Provider abstraction plus the batching, retrying service the pipeline talks to


pub mod ollama;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::EmbeddingConfig;
use crate::http::{ProviderError, with_timeout};
use crate::retry::RetryPolicy;
use crate::{RagError, ValidationError};

pub use ollama::{ModelInfo, OllamaEmbedder};

/// Something that turns texts into vectors, one vector per text, in order
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Batches texts, bounds and retries provider calls, and guards vector dimensions
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    configured_dimension: Option<usize>,
    timeout: Duration,
    retry: RetryPolicy,
    dimension: OnceLock<usize>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("batch_size", &self.batch_size)
            .field("configured_dimension", &self.configured_dimension)
            .field("timeout", &self.timeout)
            .field("dimension", &self.dimension.get())
            .finish_non_exhaustive()
    }
}

impl EmbeddingService {
    #[inline]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            batch_size: (config.batch_size as usize).max(1),
            configured_dimension: config.dimension.map(|d| d as usize),
            timeout: config.timeout(),
            retry,
            dimension: OnceLock::new(),
        }
    }

    /// Dimension of the vectors this service produces, once known
    #[inline]
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied().or(self.configured_dimension)
    }

    /// Embed every text, preserving order
    ///
    /// Empty or whitespace-only texts are rejected before any provider call.
    #[inline]
    pub async fn embed(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        if let Some(index) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(ValidationError::EmptyText { index }.into());
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Embedding {} texts in batches of {}",
            texts.len(),
            self.batch_size
        );

        let mut vectors = Vec::with_capacity(texts.len());
        for (batch_number, batch) in texts.chunks(self.batch_size).enumerate() {
            let embedded = self
                .retry
                .run("embedding batch", move || async move {
                    let result = with_timeout(self.timeout, self.provider.embed(batch)).await?;
                    self.check_batch(batch.len(), result)
                })
                .await
                .map_err(|failure| {
                    error!(
                        "Embedding batch {} failed after {} attempt(s): {}",
                        batch_number + 1,
                        failure.attempts,
                        failure.error
                    );
                    RagError::Embedding {
                        attempts: failure.attempts,
                        source: failure.error,
                    }
                })?;
            vectors.extend(embedded);
        }

        debug!("Generated {} embeddings total", vectors.len());
        Ok(vectors)
    }

    /// Embed a single text
    #[inline]
    pub async fn embed_one(&self, text: &str) -> crate::Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| RagError::Embedding {
            attempts: 1,
            source: ProviderError::InvalidResponse("provider returned no vector".to_string()),
        })
    }

    fn check_batch(
        &self,
        expected_count: usize,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if vectors.len() != expected_count {
            return Err(ProviderError::InvalidResponse(format!(
                "Mismatch between request and response counts: {} vs {}",
                expected_count,
                vectors.len()
            )));
        }

        let Some(first) = vectors.first().map(Vec::len) else {
            return Ok(vectors);
        };

        if first == 0 {
            return Err(ProviderError::InvalidResponse(
                "provider returned an empty vector".to_string(),
            ));
        }

        if let Some(other) = vectors.iter().map(Vec::len).find(|len| *len != first) {
            return Err(ProviderError::InvalidResponse(format!(
                "vectors in one batch differ in dimension: {} vs {}",
                first, other
            )));
        }

        let expected = self.dimension.get().copied().or(self.configured_dimension);
        if let Some(expected) = expected {
            if expected != first {
                return Err(ProviderError::InvalidResponse(format!(
                    "expected {}-dimensional vectors, provider returned {}",
                    expected, first
                )));
            }
        }

        let fixed = *self.dimension.get_or_init(|| {
            info!("Embedding dimension fixed at {}", first);
            first
        });
        if fixed != first {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {}-dimensional vectors, provider returned {}",
                fixed, first
            )));
        }

        Ok(vectors)
    }
}
