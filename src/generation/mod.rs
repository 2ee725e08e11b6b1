// Generation module
// Prompt construction, provider calls and citation extraction for grounded answers

pub mod anthropic;
pub mod citations;
pub mod ollama;
pub mod orchestrator;
pub mod prompt;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{ConfigError, GenerationBackend, GenerationConfig};
use crate::http::ProviderError;

pub use anthropic::AnthropicProvider;
pub use citations::{Citation, extract_citations};
pub use ollama::OllamaChatProvider;
pub use orchestrator::{
    Answer, AnswerMetadata, GenerationOrchestrator, PipelineStats, QueryStage, StageError,
};

/// One completion request: fixed instructions plus the user turn
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    #[inline]
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    /// Model that actually served the request, as reported by the provider
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// A generative model behind some API
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
    -> Result<GenerationOutput, ProviderError>;

    /// Configured model name
    fn model(&self) -> &str;
}

/// Build the provider selected in the configuration
#[inline]
pub fn provider_from_config(
    config: &GenerationConfig,
) -> Result<Arc<dyn GenerationProvider>, ConfigError> {
    Ok(match config.provider {
        GenerationBackend::Anthropic => Arc::new(AnthropicProvider::new(config)?),
        GenerationBackend::Ollama => Arc::new(OllamaChatProvider::new(config)),
    })
}
