use super::*;
use crate::chunking::{Document, chunk_document};
use crate::config::GenerationBackend;
use crate::generation::OllamaChatProvider;
use crate::http::ProviderError;
use crate::store::ChunkRecord;
use crate::test_support::{
    FailingEmbedder, PHYSICS_BOOK, ScriptedGenerator, VocabularyEmbedder, embedding_service,
    open_store, test_config,
};
use crate::GenerationFailure;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

async fn index_book(config: &Config, embeddings: &EmbeddingService, store: &VectorStore) {
    let chunks = chunk_document(&Document::new("physics", PHYSICS_BOOK), &config.chunking)
        .expect("book should chunk");
    let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text()).collect();
    let vectors = embeddings.embed(&texts).await.expect("should embed");
    let records: Vec<ChunkRecord> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| ChunkRecord::new(chunk, vector))
        .collect();
    store.upsert(&records).await.expect("should upsert");
}

struct Fixture {
    orchestrator: GenerationOrchestrator,
    generator: Arc<ScriptedGenerator>,
    _temp_dir: TempDir,
}

async fn fixture(reply: &str, indexed: bool) -> Fixture {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(temp_dir.path());
    let embeddings = embedding_service(Arc::new(VocabularyEmbedder), &config);
    let store = open_store(&config).await;
    if indexed {
        index_book(&config, &embeddings, &store).await;
    }
    let generator = Arc::new(ScriptedGenerator::new(reply));
    let orchestrator =
        GenerationOrchestrator::new(&config, embeddings, store, generator.clone());
    Fixture {
        orchestrator,
        generator,
        _temp_dir: temp_dir,
    }
}

#[test]
fn stages_only_move_forward() {
    use QueryStage::*;

    assert_eq!(Received.advance(Embedding), Ok(Embedding));
    assert_eq!(Embedding.advance(Retrieving), Ok(Retrieving));
    assert_eq!(Retrieving.advance(Completed), Ok(Completed));
    assert_eq!(
        Generating.advance(Failed(ErrorKind::Generation)),
        Ok(Failed(ErrorKind::Generation))
    );

    assert!(Retrieving.advance(Embedding).is_err());
    assert!(Generating.advance(Generating).is_err());
    assert!(Completed.advance(Failed(ErrorKind::Validation)).is_err());
    assert_eq!(
        Failed(ErrorKind::Embedding).advance(Received),
        Err(StageError {
            from: Failed(ErrorKind::Embedding),
            to: Received,
        })
    );
    assert!(Completed.is_terminal());
    assert!(!AssemblingContext.is_terminal());
}

#[tokio::test]
async fn atom_question_cites_the_atoms_section() {
    let fixture = fixture(
        "An atom is the smallest unit of matter [Chapter 1.1: Atoms].",
        true,
    )
    .await;

    let answer = fixture
        .orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect("question should be answered");

    assert_eq!(answer.citations.len(), 4);
    assert_eq!(answer.citations[0].chapter, 1);
    assert_eq!(answer.citations[0].section, "1.1");
    assert_eq!(answer.citations[0].title, "Atoms");
    assert!(answer.citations[0].text_preview.starts_with("An atom is"));
    assert_eq!(answer.metadata.chunks_found, 5);
    assert_eq!(answer.metadata.chunks_used, 4);
    assert_eq!(answer.metadata.model, "scripted");
    assert_eq!(answer.metadata.tokens_used, Some(TokenUsage::new(100, 20)));

    let requests = fixture.generator.requests.lock().expect("lock poisoned");
    assert_eq!(requests.len(), 1);
    assert!(
        requests[0]
            .prompt
            .contains("[Source 1 – Chapter 1.1: Atoms]\nAn atom is the smallest unit")
    );
    assert!(requests[0].system.contains("Always answer in English"));
}

#[tokio::test]
async fn empty_store_returns_the_no_context_answer() {
    let fixture = fixture("unused", false).await;

    let answer = fixture
        .orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect("empty store is not an error");

    assert_eq!(answer.answer, GenerationConfig::default().no_context_answer);
    assert!(answer.citations.is_empty());
    assert_eq!(answer.metadata.chunks_found, 0);
    assert_eq!(answer.metadata.chunks_used, 0);
    assert_eq!(answer.metadata.tokens_used, None);
    assert_eq!(fixture.generator.calls(), 0);
}

#[tokio::test]
async fn chapter_filter_limits_sources() {
    let fixture = fixture("Motion carries energy.", true).await;

    let answer = fixture
        .orchestrator
        .ask(&Query::new("What is energy?").in_chapter(2))
        .await
        .expect("question should be answered");

    assert_eq!(answer.metadata.chunks_found, 2);
    assert!(answer.citations.iter().all(|c| c.chapter == 2));
    assert_eq!(answer.citations.len(), 2);
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let fixture = fixture("unused", true).await;

    let error = fixture
        .orchestrator
        .ask(&Query::new("   "))
        .await
        .expect_err("blank question");

    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(fixture.generator.calls(), 0);
}

#[tokio::test]
async fn embedding_outage_fails_the_question() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(temp_dir.path());
    let failing = Arc::new(FailingEmbedder::default());
    let orchestrator = GenerationOrchestrator::new(
        &config,
        embedding_service(failing.clone(), &config),
        open_store(&config).await,
        Arc::new(ScriptedGenerator::new("unused")),
    );

    let error = orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect_err("embedder is down");

    assert_eq!(error.kind(), ErrorKind::Embedding);
    assert!(error.is_transient());
    assert_eq!(failing.calls.load(Ordering::SeqCst), config.retry.max_attempts);
}

struct RejectingGenerator {
    calls: AtomicU32,
}

#[async_trait]
impl GenerationProvider for RejectingGenerator {
    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<GenerationOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Client(400))
    }

    fn model(&self) -> &str {
        "rejecting"
    }
}

/// Fails with a timeout until `failures` calls have been made, then replies
struct FlakyGenerator {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyGenerator {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl GenerationProvider for FlakyGenerator {
    async fn generate(
        &self,
        _request: &GenerationRequest,
    ) -> Result<GenerationOutput, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ProviderError::Timeout);
        }
        Ok(GenerationOutput {
            text: "An atom is tiny [Chapter 1.1: Atoms].".to_string(),
            model: "flaky".to_string(),
            usage: None,
        })
    }

    fn model(&self) -> &str {
        "flaky"
    }
}

async fn flaky_orchestrator(
    generator: Arc<FlakyGenerator>,
) -> (GenerationOrchestrator, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(temp_dir.path());
    let embeddings = embedding_service(Arc::new(VocabularyEmbedder), &config);
    let store = open_store(&config).await;
    index_book(&config, &embeddings, &store).await;
    let orchestrator = GenerationOrchestrator::new(&config, embeddings, store, generator);
    (orchestrator, temp_dir)
}

#[tokio::test]
async fn transient_generation_errors_get_one_retry() {
    let generator = Arc::new(FlakyGenerator::new(u32::MAX));
    let (orchestrator, _temp_dir) = flaky_orchestrator(generator.clone()).await;

    let error = orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect_err("provider keeps timing out");

    assert!(matches!(
        error,
        RagError::Generation {
            kind: GenerationFailure::Timeout,
            ..
        }
    ));
    assert!(error.is_transient());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn generation_recovers_on_the_retry() {
    let generator = Arc::new(FlakyGenerator::new(1));
    let (orchestrator, _temp_dir) = flaky_orchestrator(generator.clone()).await;

    let answer = orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect("second attempt succeeds");

    assert_eq!(answer.answer, "An atom is tiny [Chapter 1.1: Atoms].");
    assert_eq!(answer.metadata.model, "flaky");
    assert_eq!(answer.citations[0].section, "1.1");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn permanent_generation_errors_are_not_retried() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = test_config(temp_dir.path());
    let embeddings = embedding_service(Arc::new(VocabularyEmbedder), &config);
    let store = open_store(&config).await;
    index_book(&config, &embeddings, &store).await;
    let generator = Arc::new(RejectingGenerator {
        calls: AtomicU32::new(0),
    });
    let orchestrator = GenerationOrchestrator::new(&config, embeddings, store, generator.clone());

    let error = orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect_err("provider rejects the request");

    assert!(matches!(
        error,
        RagError::Generation {
            kind: GenerationFailure::Provider,
            ..
        }
    ));
    assert!(!error.is_transient());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_model_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "message": {"role": "assistant", "content": "too late"},
                }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = test_config(temp_dir.path());
    config.generation.provider = GenerationBackend::Ollama;
    config.generation.url = Some(Url::parse(&server.uri()).expect("mock server uri is a url"));
    config.generation.timeout_secs = 1;

    let embeddings = embedding_service(Arc::new(VocabularyEmbedder), &config);
    let store = open_store(&config).await;
    index_book(&config, &embeddings, &store).await;
    let orchestrator = GenerationOrchestrator::new(
        &config,
        embeddings,
        store,
        Arc::new(OllamaChatProvider::new(&config.generation)),
    );

    let error = orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect_err("model is too slow");

    assert!(matches!(
        error,
        RagError::Generation {
            kind: GenerationFailure::Timeout,
            ..
        }
    ));
    assert_eq!(error.kind(), ErrorKind::Generation);
    assert!(error.is_transient());
}

#[tokio::test]
async fn answer_serializes_to_the_public_shape() {
    let fixture = fixture("Atoms [Source 1].", true).await;

    let answer = fixture
        .orchestrator
        .ask(&Query::new("What is an atom?"))
        .await
        .expect("question should be answered");
    let json = serde_json::to_value(&answer).expect("answer serializes");

    assert_eq!(json["answer"], "Atoms [Source 1].");
    assert_eq!(json["citations"][0]["section"], "1.1");
    assert!(json["citations"][0]["text_preview"].is_string());
    assert_eq!(json["metadata"]["chunks_found"], 5);
    assert!(json["metadata"]["response_time_ms"].is_f64());
    assert_eq!(json["metadata"]["tokens_used"]["total"], 120);
}

#[tokio::test]
async fn stats_report_configuration_and_store() {
    let fixture = fixture("unused", true).await;

    let stats = fixture.orchestrator.stats().await.expect("stats");

    assert_eq!(stats.top_k, 5);
    assert_eq!(stats.max_context_chunks, 4);
    assert_eq!(stats.model, "scripted");
    assert_eq!(stats.store.total_chunks, 5);
    assert_eq!(stats.store.chapters, vec![1, 2]);
    assert_eq!(stats.store.documents, vec!["physics".to_string()]);
}
