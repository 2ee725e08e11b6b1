use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::http::ProviderError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Embedding error after {attempts} attempt(s): {source}")]
    Embedding {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] StoreError),

    #[error("Generation error ({kind}): {message}")]
    Generation {
        kind: GenerationFailure,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed input caught before any provider or store is involved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("line {line}: unparsable chapter header `{text}`")]
    ChapterHeader { line: usize, text: String },

    #[error("line {line}: unparsable section header `{text}`")]
    SectionHeader { line: usize, text: String },

    #[error("line {line}: section {section} does not belong to chapter {chapter}")]
    SectionOutsideChapter {
        line: usize,
        section: String,
        chapter: u32,
    },

    #[error("line {line}: content appears before the first chapter header")]
    MissingChapter { line: usize },

    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("text at position {index} is empty and cannot be embedded")]
    EmptyText { index: usize },
}

impl ValidationError {
    /// The offending document line, for errors raised while parsing a document
    #[inline]
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::ChapterHeader { line, .. }
            | Self::SectionHeader { line, .. }
            | Self::SectionOutsideChapter { line, .. }
            | Self::MissingChapter { line } => Some(*line),
            Self::EmptyQuestion | Self::EmptyText { .. } => None,
        }
    }
}

/// Why a generation call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFailure {
    Timeout,
    Network,
    Provider,
}

impl fmt::Display for GenerationFailure {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Provider => "provider",
        };
        f.write_str(label)
    }
}

/// Coarse error classification handed to callers that map failures onto their own protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Embedding,
    Retrieval,
    Generation,
    Configuration,
}

impl fmt::Display for ErrorKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Embedding => "embedding",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
            Self::Configuration => "configuration",
        };
        f.write_str(label)
    }
}

impl RagError {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Io(_) => ErrorKind::Validation,
            Self::Embedding { .. } => ErrorKind::Embedding,
            Self::Retrieval(_) => ErrorKind::Retrieval,
            Self::Generation { .. } => ErrorKind::Generation,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether retrying the same request later could succeed
    #[inline]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Embedding { source, .. } => source.is_transient(),
            Self::Generation { kind, .. } => {
                matches!(kind, GenerationFailure::Timeout | GenerationFailure::Network)
            }
            Self::Retrieval(err) => err.is_transient(),
            Self::Validation(_) | Self::Configuration(_) | Self::Io(_) => false,
        }
    }

    pub(crate) fn generation(error: &ProviderError) -> Self {
        let kind = match error {
            ProviderError::Timeout => GenerationFailure::Timeout,
            ProviderError::Network(_) => GenerationFailure::Network,
            _ => GenerationFailure::Provider,
        };
        Self::Generation {
            kind,
            message: error.to_string(),
        }
    }
}

pub mod chunking;
pub mod commands;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod retrieval;
pub mod retry;
pub mod store;

#[cfg(test)]
mod test_support;
