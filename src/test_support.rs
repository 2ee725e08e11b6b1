// Shared fakes for unit tests

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::embeddings::{EmbeddingProvider, EmbeddingService};
use crate::generation::{GenerationOutput, GenerationProvider, GenerationRequest, TokenUsage};
use crate::http::ProviderError;
use crate::retry::RetryPolicy;
use crate::store::VectorStore;

const VOCABULARY: [&str; 8] = [
    "atom", "molecule", "electron", "energy", "motion", "heat", "bond", "matter",
];

/// Bag-of-words embedder over a tiny vocabulary, plus a constant bias dimension
pub struct VocabularyEmbedder;

impl VocabularyEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; VOCABULARY.len() + 1];
        for word in text.split_whitespace() {
            let normalized: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            let stem = normalized.strip_suffix('s').unwrap_or(&normalized);
            if let Some(position) = VOCABULARY.iter().position(|v| *v == stem) {
                vector[position] += 1.0;
            }
        }
        vector[VOCABULARY.len()] = 0.5;
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Fails every call with a transient network error
#[derive(Default)]
pub struct FailingEmbedder {
    pub calls: AtomicU32,
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Network("connection refused".to_string()))
    }
}

/// Replies with a fixed answer and records every request
pub struct ScriptedGenerator {
    pub reply: String,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, ProviderError> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push(request.clone());
        Ok(GenerationOutput {
            text: self.reply.clone(),
            model: "scripted".to_string(),
            usage: Some(TokenUsage::new(100, 20)),
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    }
}

/// Defaults with quick retries and small chunks, rooted at `base_dir`
pub fn test_config(base_dir: &Path) -> Config {
    let mut config = Config {
        base_dir: base_dir.to_path_buf(),
        retry: fast_retry(),
        ..Config::default()
    };
    config.chunking.min_words = 5;
    config.chunking.max_words = 60;
    config
}

pub fn embedding_service(
    provider: Arc<dyn EmbeddingProvider>,
    config: &Config,
) -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(
        provider,
        &config.embedding,
        config.retry,
    ))
}

pub async fn open_store(config: &Config) -> Arc<VectorStore> {
    Arc::new(
        VectorStore::new(config)
            .await
            .expect("should open vector store"),
    )
}

pub const PHYSICS_BOOK: &str = "# Chapter 1: Matter\n\
\n\
Everything around us is made of matter.\n\
\n\
## 1.1 Atoms\n\
\n\
An atom is the smallest unit of matter. Every atom has a nucleus and electrons.\n\
\n\
## 1.2 Molecules\n\
\n\
A molecule forms when atoms share a bond. Each bond holds the molecule together.\n\
\n\
# Chapter 2: Energy\n\
\n\
## 2.1 Kinetic energy\n\
\n\
Kinetic energy is the energy of motion. Faster motion means more energy.\n\
\n\
## 2.2 Heat\n\
\n\
Heat is energy moving between objects at different temperatures.\n";
