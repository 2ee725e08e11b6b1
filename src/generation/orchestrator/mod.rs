#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::citations::{Citation, extract_citations};
use super::prompt::{system_prompt, user_prompt};
use super::{GenerationOutput, GenerationProvider, GenerationRequest, TokenUsage};
use crate::config::{Config, GenerationConfig};
use crate::context::{AssembledContext, ContextAssembler};
use crate::embeddings::EmbeddingService;
use crate::http::with_timeout;
use crate::retrieval::{Query, RetrievalEngine, RetrievalResult};
use crate::retry::RetryPolicy;
use crate::store::{StoreStats, VectorStore};
use crate::{ErrorKind, RagError, ValidationError};

/// Where a question is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Received,
    Embedding,
    Retrieving,
    AssemblingContext,
    Generating,
    Completed,
    Failed(ErrorKind),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid stage transition from {from:?} to {to:?}")]
pub struct StageError {
    pub from: QueryStage,
    pub to: QueryStage,
}

impl QueryStage {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    fn position(self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Embedding => 1,
            Self::Retrieving => 2,
            Self::AssemblingContext => 3,
            Self::Generating => 4,
            Self::Completed | Self::Failed(_) => 5,
        }
    }

    /// Stages only move forward; `Failed` is reachable from any live stage
    #[inline]
    pub fn advance(self, next: Self) -> Result<Self, StageError> {
        let allowed = !self.is_terminal()
            && (matches!(next, Self::Failed(_)) || next.position() > self.position());
        if allowed {
            Ok(next)
        } else {
            Err(StageError {
                from: self,
                to: next,
            })
        }
    }
}

/// Follows one question through its stages, logging each transition
struct StageTracker {
    stage: QueryStage,
}

impl StageTracker {
    fn new() -> Self {
        debug!("stage: {:?}", QueryStage::Received);
        Self {
            stage: QueryStage::Received,
        }
    }

    fn enter(&mut self, next: QueryStage) {
        match self.stage.advance(next) {
            Ok(stage) => {
                debug!("stage: {:?} -> {:?}", self.stage, stage);
                self.stage = stage;
            }
            Err(e) => error!("{}", e),
        }
    }
}

/// The reply to one question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub metadata: AnswerMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerMetadata {
    /// Candidates returned by retrieval
    pub chunks_found: usize,
    /// Candidates that made it into the prompt
    pub chunks_used: usize,
    /// Wall-clock time from question to answer, two decimals
    pub response_time_ms: f64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<TokenUsage>,
}

/// Configuration plus store summary, for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub top_k: usize,
    pub max_context_chunks: usize,
    pub max_context_tokens: usize,
    pub model: String,
    pub store: StoreStats,
}

/// Runs questions through retrieval, context assembly and generation
pub struct GenerationOrchestrator {
    embeddings: Arc<EmbeddingService>,
    retrieval: RetrievalEngine,
    store: Arc<VectorStore>,
    assembler: ContextAssembler,
    provider: Arc<dyn GenerationProvider>,
    generation: GenerationConfig,
    top_k: usize,
    max_context_chunks: usize,
    max_context_tokens: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("model", &self.provider.model())
            .field("top_k", &self.top_k)
            .finish_non_exhaustive()
    }
}

impl GenerationOrchestrator {
    #[inline]
    pub fn new(
        config: &Config,
        embeddings: Arc<EmbeddingService>,
        store: Arc<VectorStore>,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            retrieval: RetrievalEngine::new(Arc::clone(&embeddings), Arc::clone(&store)),
            embeddings,
            store,
            assembler: ContextAssembler::new(config.context.clone()),
            provider,
            generation: config.generation.clone(),
            top_k: config.retrieval.top_k,
            max_context_chunks: config.context.max_context_chunks,
            max_context_tokens: config.context.max_context_tokens,
            // One retry on top of the first attempt
            retry: config.retry.with_max_attempts(2),
        }
    }

    /// Answer a question from the indexed material
    #[inline]
    pub async fn ask(&self, query: &Query) -> crate::Result<Answer> {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", %request_id, chapter = ?query.chapter);

        async move {
            let started = Instant::now();
            let mut tracker = StageTracker::new();
            info!("Question received ({} chars)", query.text.chars().count());

            let result = self.run(query, started, &mut tracker).await;
            match &result {
                Ok(answer) => {
                    tracker.enter(QueryStage::Completed);
                    info!(
                        "Answered in {:.2} ms using {} of {} chunks",
                        answer.metadata.response_time_ms,
                        answer.metadata.chunks_used,
                        answer.metadata.chunks_found
                    );
                }
                Err(e) => {
                    tracker.enter(QueryStage::Failed(e.kind()));
                    error!("Question failed: {}", e);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        query: &Query,
        started: Instant,
        tracker: &mut StageTracker,
    ) -> crate::Result<Answer> {
        if query.text.trim().is_empty() {
            return Err(ValidationError::EmptyQuestion.into());
        }

        tracker.enter(QueryStage::Embedding);
        let vector = self.embeddings.embed_one(&query.text).await?;

        tracker.enter(QueryStage::Retrieving);
        let retrieved = self
            .retrieval
            .query_vector(&vector, query, self.top_k)
            .await?;
        if retrieved.is_empty() {
            warn!("No relevant chunks found");
            return Ok(self.no_context_answer(&retrieved, started));
        }

        tracker.enter(QueryStage::AssemblingContext);
        let context = self.assembler.assemble(&retrieved);
        if context.is_empty() {
            warn!("No retrieved chunk fits the context budget");
            return Ok(self.no_context_answer(&retrieved, started));
        }

        tracker.enter(QueryStage::Generating);
        let output = self.generate(&query.text, &context).await?;
        let citations = extract_citations(&output.text, &context.blocks);

        Ok(Answer {
            answer: output.text,
            citations,
            metadata: AnswerMetadata {
                chunks_found: retrieved.len(),
                chunks_used: context.blocks.len(),
                response_time_ms: elapsed_ms(started.elapsed()),
                model: output.model,
                tokens_used: output.usage,
            },
        })
    }

    async fn generate(
        &self,
        question: &str,
        context: &AssembledContext,
    ) -> crate::Result<GenerationOutput> {
        let request = GenerationRequest {
            system: system_prompt(&self.generation.language),
            prompt: user_prompt(question, &context.blocks, &self.generation.language),
            max_output_tokens: self.generation.max_output_tokens,
            temperature: self.generation.temperature,
        };
        let request = &request;
        let provider = &self.provider;
        let timeout = self.generation.timeout();

        debug!(
            "Prompt carries {} sources (~{} tokens)",
            context.blocks.len(),
            context.estimated_tokens
        );

        self.retry
            .run("generation", move || async move {
                with_timeout(timeout, provider.generate(request)).await
            })
            .await
            .map_err(|failure| RagError::generation(&failure.error))
    }

    fn no_context_answer(&self, retrieved: &RetrievalResult, started: Instant) -> Answer {
        Answer {
            answer: self.generation.no_context_answer.clone(),
            citations: Vec::new(),
            metadata: AnswerMetadata {
                chunks_found: retrieved.len(),
                chunks_used: 0,
                response_time_ms: elapsed_ms(started.elapsed()),
                model: self.provider.model().to_string(),
                tokens_used: None,
            },
        }
    }

    /// Pipeline configuration together with what the store currently holds
    #[inline]
    pub async fn stats(&self) -> crate::Result<PipelineStats> {
        Ok(PipelineStats {
            top_k: self.top_k,
            max_context_chunks: self.max_context_chunks,
            max_context_tokens: self.max_context_tokens,
            model: self.provider.model().to_string(),
            store: self.store.stats().await?,
        })
    }
}

fn elapsed_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}
