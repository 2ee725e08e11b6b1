#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// Integration tests that require a local Ollama instance
// Run with: cargo test --test integration_ollama -- --ignored

use std::env;
use std::sync::Arc;

use textbook_rag::config::{EmbeddingConfig, GenerationConfig};
use textbook_rag::embeddings::{EmbeddingService, OllamaEmbedder};
use textbook_rag::generation::{GenerationProvider, GenerationRequest, OllamaChatProvider};
use textbook_rag::retry::RetryPolicy;
use tracing::info;
use url::Url;

const TEST_EMBED_MODEL: &str = "nomic-embed-text:latest";
const TEST_CHAT_MODEL: &str = "llama3.1:8b";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

fn ollama_url() -> Url {
    let url = env::var("OLLAMA_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
    Url::parse(&url).expect("OLLAMA_URL should be a valid url")
}

fn embedding_config() -> EmbeddingConfig {
    EmbeddingConfig {
        url: ollama_url(),
        model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| TEST_EMBED_MODEL.to_string()),
        batch_size: 4,
        timeout_secs: 60,
        ..EmbeddingConfig::default()
    }
}

fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_health_check() {
    init_test_tracing();

    let embedder = OllamaEmbedder::new(&embedding_config());
    embedder
        .health_check()
        .await
        .expect("Ollama should be running with the embedding model pulled");

    let models = embedder.list_models().await.expect("models should list");
    info!("Ollama reports {} models", models.len());
    assert!(!models.is_empty());
}

#[tokio::test]
#[ignore = "requires a local Ollama instance"]
async fn real_ollama_embeddings_are_consistent() {
    init_test_tracing();

    let config = embedding_config();
    let service = EmbeddingService::new(
        Arc::new(OllamaEmbedder::new(&config)),
        &config,
        RetryPolicy::default(),
    );
    let texts: Vec<String> = [
        "An atom is the smallest unit of matter.",
        "A molecule is two or more atoms held together.",
        "Kinetic energy is the energy of motion.",
        "Heat is energy moving between objects.",
        "Every atom has a nucleus.",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    let vectors = service.embed(&texts).await.expect("texts should embed");

    assert_eq!(vectors.len(), texts.len());
    let dimension = vectors[0].len();
    assert!(dimension > 0);
    assert!(vectors.iter().all(|v| v.len() == dimension));
    assert_eq!(service.dimension(), Some(dimension));
}

#[tokio::test]
#[ignore = "requires a local Ollama instance with a chat model"]
async fn real_ollama_chat_completion() {
    init_test_tracing();

    let config = GenerationConfig {
        url: Some(ollama_url()),
        model: env::var("OLLAMA_CHAT_MODEL").unwrap_or_else(|_| TEST_CHAT_MODEL.to_string()),
        ..GenerationConfig::default()
    };
    let provider = OllamaChatProvider::new(&config);

    let output = provider
        .generate(&GenerationRequest {
            system: "Answer in one short sentence.".to_string(),
            prompt: "What is an atom?".to_string(),
            max_output_tokens: 64,
            temperature: 0.0,
        })
        .await
        .expect("chat should complete");

    info!("Model {} replied: {}", output.model, output.text);
    assert!(!output.text.trim().is_empty());
}
