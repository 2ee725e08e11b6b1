use super::*;
use crate::config::GenerationBackend;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

fn config_for(server: &MockServer) -> GenerationConfig {
    GenerationConfig {
        provider: GenerationBackend::Anthropic,
        url: Some(Url::parse(&server.uri()).expect("mock server uri is a url")),
        model: "claude-sonnet-4-20250514".to_string(),
        api_key: Some("sk-test".to_string()),
        timeout_secs: 5,
        ..GenerationConfig::default()
    }
}

fn request() -> GenerationRequest {
    GenerationRequest {
        system: "be helpful".to_string(),
        prompt: "What is an atom?".to_string(),
        max_output_tokens: 256,
        temperature: 0.2,
    }
}

#[test]
fn api_key_is_required() {
    let config = GenerationConfig {
        provider: GenerationBackend::Anthropic,
        api_key: Some("   ".to_string()),
        ..GenerationConfig::default()
    };
    assert!(matches!(
        AnthropicProvider::new(&config),
        Err(ConfigError::MissingApiKey("anthropic"))
    ));
}

#[tokio::test]
async fn messages_request_and_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 256,
            "system": "be helpful",
            "messages": [{"role": "user", "content": "What is an atom?"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "An atom is "},
                {"type": "text", "text": "tiny [Chapter 1.1: Atoms]."},
            ],
            "usage": {"input_tokens": 120, "output_tokens": 30},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(&config_for(&server)).expect("provider");
    let output = provider.generate(&request()).await.expect("generation");

    assert_eq!(output.text, "An atom is tiny [Chapter 1.1: Atoms].");
    assert_eq!(output.model, "claude-sonnet-4-20250514");
    assert_eq!(output.usage, Some(TokenUsage::new(120, 30)));
    assert_eq!(output.usage.map(|u| u.total), Some(150));
}

#[tokio::test]
async fn overload_is_transient_and_auth_is_not() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .respond_with(ResponseTemplate::new(529))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-wrong"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let overloaded = AnthropicProvider::new(&config_for(&server))
        .expect("provider")
        .generate(&request())
        .await
        .expect_err("529 should fail");
    assert_eq!(overloaded, ProviderError::Server(529));
    assert!(overloaded.is_transient());

    let mut config = config_for(&server);
    config.api_key = Some("sk-wrong".to_string());
    let unauthorized = AnthropicProvider::new(&config)
        .expect("provider")
        .generate(&request())
        .await
        .expect_err("401 should fail");
    assert_eq!(unauthorized, ProviderError::Client(401));
    assert!(!unauthorized.is_transient());
}
