// Context assembly
// Selects ranked chunks into citation-tagged blocks that fit the token budget


use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunking::estimate_token_count;
use crate::retrieval::RetrievalResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Upper bound on blocks handed to the model
    pub max_context_chunks: usize,
    /// Upper bound on the estimated token cost of all blocks together
    pub max_context_tokens: usize,
    /// Characters of each block kept as the citation preview
    pub preview_chars: usize,
}

impl Default for ContextConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_context_chunks: 4,
            max_context_tokens: 3000,
            preview_chars: 150,
        }
    }
}

/// One source passage as shown to the model and cited back to the reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextBlock {
    /// 1-based position in the prompt, referenced as `[Source i]`
    pub index: usize,
    pub chunk_id: String,
    pub chapter: u32,
    pub section: String,
    pub title: String,
    pub text: String,
    pub preview: String,
    pub estimated_tokens: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub estimated_tokens: usize,
}

impl AssembledContext {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    #[inline]
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Take chunks in rank order while they fit the budget
    ///
    /// The first chunk that does not fit is cut at a word boundary to the
    /// remaining budget; everything ranked below it is dropped.
    #[inline]
    pub fn assemble(&self, result: &RetrievalResult) -> AssembledContext {
        let limit = self.config.max_context_chunks.min(result.len());
        let mut remaining = self.config.max_context_tokens;
        let mut context = AssembledContext::default();

        for hit in result.hits.iter().take(limit) {
            let chunk = &hit.chunk;
            let cost = estimate_token_count(&chunk.text);

            let (text, estimated_tokens, truncated) = if cost <= remaining {
                (chunk.text.clone(), cost, false)
            } else {
                match truncate_to_budget(&chunk.text, remaining) {
                    Some((text, tokens)) => (text, tokens, true),
                    None => {
                        debug!("No budget left for chunk {}", chunk.id);
                        break;
                    }
                }
            };

            remaining -= estimated_tokens;
            context.estimated_tokens += estimated_tokens;
            context.blocks.push(ContextBlock {
                index: context.blocks.len() + 1,
                chunk_id: chunk.id.clone(),
                chapter: chunk.chapter,
                section: chunk.section.clone(),
                title: chunk.title.clone(),
                preview: preview(&text, self.config.preview_chars),
                text,
                estimated_tokens,
                truncated,
            });

            if truncated {
                break;
            }
        }

        debug!(
            "Assembled {} of {} candidates (~{} tokens of {})",
            context.blocks.len(),
            result.len(),
            context.estimated_tokens,
            self.config.max_context_tokens
        );

        context
    }
}

/// The longest word prefix of `text` whose estimate fits `budget`
fn truncate_to_budget(text: &str, budget: usize) -> Option<(String, usize)> {
    let ends = word_ends(text);

    // Estimates only grow with the prefix, so the largest fitting prefix can be bisected
    let fits = |words: usize| {
        words == 0
            || text
                .get(..ends[words - 1])
                .is_some_and(|prefix| estimate_token_count(prefix) <= budget)
    };
    let (mut low, mut high) = (0, ends.len());
    while low < high {
        let mid = (low + high).div_ceil(2);
        if fits(mid) {
            low = mid;
        } else {
            high = mid - 1;
        }
    }

    if low == 0 {
        return None;
    }
    let prefix = text.get(..ends[low - 1])?;
    Some((prefix.to_string(), estimate_token_count(prefix)))
}

/// Byte offsets just past the end of every word
fn word_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut in_word = false;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if in_word {
                ends.push(index);
            }
            in_word = false;
        } else {
            in_word = true;
        }
    }
    if in_word {
        ends.push(text.len());
    }
    ends
}

/// First `max_chars` characters, with `...` appended when the text was cut
#[inline]
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", text.get(..cut).unwrap_or(text)),
        None => text.to_string(),
    }
}
