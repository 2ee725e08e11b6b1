// Ingestion
// Chunk, embed and store whole documents, one failure never stopping the rest


use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunking::{ChunkingConfig, Document, chunk_document};
use crate::embeddings::EmbeddingService;
use crate::store::{ChunkFilter, ChunkRecord, VectorStore};
use crate::{ErrorKind, RagError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Succeeded,
    Failed,
}

/// What happened to one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub source: PathBuf,
    pub status: DocumentStatus,
    /// Chunks written for this document
    pub chunks: usize,
    /// Records from an earlier ingestion that were replaced
    pub replaced: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentOutcome {
    fn failed(document_id: String, source: PathBuf, error: &RagError) -> Self {
        Self {
            document_id,
            source,
            status: DocumentStatus::Failed,
            chunks: 0,
            replaced: 0,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == DocumentStatus::Succeeded
    }
}

/// Summary of one ingestion run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub reset: bool,
    pub documents: Vec<DocumentOutcome>,
}

impl IngestionReport {
    #[inline]
    pub fn succeeded(&self) -> usize {
        self.documents.iter().filter(|d| d.is_success()).count()
    }

    #[inline]
    pub fn failed(&self) -> usize {
        self.documents.len() - self.succeeded()
    }

    #[inline]
    pub fn total_chunks(&self) -> usize {
        self.documents.iter().map(|d| d.chunks).sum()
    }

    /// Write the report as pretty JSON into `dir`, returning the file path
    #[inline]
    pub async fn save(&self, dir: &Path) -> crate::Result<PathBuf> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            "ingestion-{}.json",
            self.started_at.format("%Y%m%dT%H%M%SZ")
        ));
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(&path, json).await?;
        debug!("Saved ingestion report to {:?}", path);
        Ok(path)
    }
}

/// Documents read from a directory, plus the files that could not be read
#[derive(Debug, Default)]
pub struct LoadedDocuments {
    pub documents: Vec<Document>,
    pub unreadable: Vec<DocumentOutcome>,
}

/// Read every `*.md` file in `dir`, sorted by file name
#[inline]
pub async fn load_documents(dir: &Path) -> crate::Result<LoadedDocuments> {
    let mut entries = fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "md") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = LoadedDocuments::default();
    for path in paths {
        match fs::read_to_string(&path).await {
            Ok(text) => loaded.documents.push(Document::from_source(&path, text)),
            Err(e) => {
                warn!("Could not read {:?}: {}", path, e);
                let document = Document::from_source(&path, String::new());
                loaded.unreadable.push(DocumentOutcome::failed(
                    document.id,
                    path,
                    &RagError::Io(e),
                ));
            }
        }
    }

    info!(
        "Found {} documents in {:?} ({} unreadable)",
        loaded.documents.len(),
        dir,
        loaded.unreadable.len()
    );
    Ok(loaded)
}

/// Runs documents through chunking, embedding and the vector store
#[derive(Debug, Clone)]
pub struct Ingestor {
    chunking: ChunkingConfig,
    embeddings: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
}

impl Ingestor {
    #[inline]
    pub fn new(
        chunking: ChunkingConfig,
        embeddings: Arc<EmbeddingService>,
        store: Arc<VectorStore>,
    ) -> Self {
        Self {
            chunking,
            embeddings,
            store,
        }
    }

    /// Ingest every document, optionally clearing the store first
    #[inline]
    pub async fn ingest_all(
        &self,
        documents: &[Document],
        reset: bool,
    ) -> crate::Result<IngestionReport> {
        self.ingest_all_with_progress(documents, reset, |_| {}).await
    }

    /// Like [`Ingestor::ingest_all`], reporting each finished document to `progress`
    #[inline]
    pub async fn ingest_all_with_progress<F>(
        &self,
        documents: &[Document],
        reset: bool,
        mut progress: F,
    ) -> crate::Result<IngestionReport>
    where
        F: FnMut(&DocumentOutcome),
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(%run_id, "Ingesting {} documents (reset: {})", documents.len(), reset);

        if reset {
            self.store.reset().await?;
            info!("Vector store reset");
        }

        let mut outcomes = Vec::with_capacity(documents.len());
        for document in documents {
            let outcome = self.ingest_document(document).await;
            progress(&outcome);
            outcomes.push(outcome);
        }

        let report = IngestionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            reset,
            documents: outcomes,
        };

        info!(
            "Ingestion finished: {} succeeded, {} failed, {} chunks",
            report.succeeded(),
            report.failed(),
            report.total_chunks()
        );
        Ok(report)
    }

    /// Ingest one document, replacing whatever an earlier run stored for it
    #[inline]
    pub async fn ingest_document(&self, document: &Document) -> DocumentOutcome {
        match self.try_ingest(document).await {
            Ok((chunks, replaced)) => {
                info!(
                    "Ingested '{}': {} chunks ({} replaced)",
                    document.id, chunks, replaced
                );
                DocumentOutcome {
                    document_id: document.id.clone(),
                    source: document.source.clone(),
                    status: DocumentStatus::Succeeded,
                    chunks,
                    replaced,
                    error_kind: None,
                    error: None,
                }
            }
            Err(e) => {
                error!("Failed to ingest '{}': {}", document.id, e);
                DocumentOutcome::failed(document.id.clone(), document.source.clone(), &e)
            }
        }
    }

    async fn try_ingest(&self, document: &Document) -> crate::Result<(usize, usize)> {
        let chunks = chunk_document(document, &self.chunking)?;
        debug!("Document '{}' produced {} chunks", document.id, chunks.len());

        let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text()).collect();
        let vectors = self.embeddings.embed(&texts).await?;

        let previous = self
            .store
            .count_matching(&ChunkFilter::document(document.id.as_str()))
            .await?;

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkRecord::new(chunk, vector))
            .collect();
        self.store.upsert(&records).await?;

        let keep: Vec<String> = records.iter().map(|r| r.chunk.id.clone()).collect();
        let stale = self
            .store
            .delete_document_except(document.id.as_str(), &keep)
            .await?;
        debug!(
            "Document '{}' replaced {} previous chunks, {} no longer produced",
            document.id, previous, stale
        );

        Ok((records.len(), previous))
    }
}
