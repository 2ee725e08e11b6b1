// Retrieval engine
// Turns a question into a ranked list of candidate chunks


use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ValidationError;
use crate::embeddings::EmbeddingService;
use crate::store::{ChunkFilter, ScoredChunk, VectorStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum number of candidates returned per question
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

/// A question plus an optional chapter restriction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub chapter: Option<u32>,
}

impl Query {
    #[inline]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            chapter: None,
        }
    }

    #[inline]
    pub fn in_chapter(mut self, chapter: u32) -> Self {
        self.chapter = Some(chapter);
        self
    }

    fn filter(&self) -> ChunkFilter {
        ChunkFilter {
            chapter: self.chapter,
            ..ChunkFilter::default()
        }
    }
}

/// Candidates in descending score order, ties in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    #[inline]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalEngine {
    embeddings: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
}

impl RetrievalEngine {
    #[inline]
    pub fn new(embeddings: Arc<EmbeddingService>, store: Arc<VectorStore>) -> Self {
        Self { embeddings, store }
    }

    /// Embed the question and fetch its `top_k` nearest chunks
    #[inline]
    pub async fn retrieve(&self, query: &Query, top_k: usize) -> crate::Result<RetrievalResult> {
        if query.text.trim().is_empty() {
            return Err(ValidationError::EmptyQuestion.into());
        }
        if top_k == 0 {
            return Ok(RetrievalResult::default());
        }

        let vector = self.embeddings.embed_one(&query.text).await?;
        let hits = self.query_vector(&vector, query, top_k).await?;
        Ok(hits)
    }

    /// Fetch candidates for an already embedded question
    #[inline]
    pub async fn query_vector(
        &self,
        vector: &[f32],
        query: &Query,
        top_k: usize,
    ) -> crate::Result<RetrievalResult> {
        if top_k == 0 {
            return Ok(RetrievalResult::default());
        }

        let hits = self.store.query(vector, top_k, &query.filter()).await?;

        debug!(
            "Retrieved {} candidates (top_k {}, chapter {:?})",
            hits.len(),
            top_k,
            query.chapter
        );
        Ok(RetrievalResult { hits })
    }
}
