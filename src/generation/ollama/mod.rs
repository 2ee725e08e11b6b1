
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{GenerationOutput, GenerationProvider, GenerationRequest, TokenUsage};
use crate::config::GenerationConfig;
use crate::http::{self, ProviderError};

/// Ollama `/api/chat` client, non-streaming
#[derive(Debug, Clone)]
pub struct OllamaChatProvider {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    message: ResponseMessage,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OllamaChatProvider {
    #[inline]
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            base_url: config.endpoint(),
            model: config.model.clone(),
            agent: http::agent_with_timeout(config.timeout()),
        }
    }
}

#[async_trait]
impl GenerationProvider for OllamaChatProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, ProviderError> {
        let url = self
            .base_url
            .join("/api/chat")
            .map_err(|e| ProviderError::InvalidResponse(format!("bad chat URL: {}", e)))?;

        let body = serde_json::to_string(&ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            stream: false,
            options: ChatOptions {
                num_predict: request.max_output_tokens,
                temperature: request.temperature,
            },
        })
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let response_text = http::post_json(&self.agent, url.as_str(), &[], body).await?;

        let response: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::InvalidResponse(format!("chat response: {}", e)))?;

        if response.message.content.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response contained no text".to_string(),
            ));
        }

        debug!(
            "Ollama returned {} characters",
            response.message.content.len()
        );

        let usage = match (response.prompt_eval_count, response.eval_count) {
            (Some(input), Some(output)) => Some(TokenUsage::new(input, output)),
            _ => None,
        };

        Ok(GenerationOutput {
            text: response.message.content,
            model: response.model.unwrap_or_else(|| self.model.clone()),
            usage,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
