#[cfg(test)]
mod tests;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{GenerationOutput, GenerationProvider, GenerationRequest, TokenUsage};
use crate::config::{ConfigError, GenerationConfig};
use crate::http::{self, ProviderError};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    endpoint: Url,
    api_key: String,
    model: String,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicProvider {
    #[inline]
    pub fn new(config: &GenerationConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey("anthropic"))?;

        Ok(Self {
            endpoint: config.endpoint(),
            api_key,
            model: config.model.clone(),
            agent: http::agent_with_timeout(config.timeout()),
        })
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, ProviderError> {
        let url = self
            .endpoint
            .join("/v1/messages")
            .map_err(|e| ProviderError::InvalidResponse(format!("bad messages URL: {}", e)))?;

        let body = serde_json::to_string(&MessagesRequest {
            model: &self.model,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        })
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let headers = [
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let response_text = http::post_json(&self.agent, url.as_str(), &headers, body).await?;

        let response: MessagesResponse = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::InvalidResponse(format!("messages response: {}", e)))?;

        let text = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<String>();
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response contained no text".to_string(),
            ));
        }

        debug!("Anthropic returned {} characters", text.len());

        Ok(GenerationOutput {
            text,
            model: response.model.unwrap_or_else(|| self.model.clone()),
            usage: response
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
