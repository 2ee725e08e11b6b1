#[cfg(test)]
mod tests;

use std::sync::LazyLock;

use fancy_regex::Regex;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::ContextBlock;

/// `[Chapter 1.2: Title]`, `[Kafli 1.2]`, `[1.2]` or `[Source 3]`
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\[(?:(?:chapter|kafli|section)\s*)?(\d+)\.(\d+)[^\]]*\]|\[(?:source|heimild)\s+(\d+)[^\]]*\]",
    )
    .expect("citation pattern is valid")
});

/// A source the answer relies on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub chapter: u32,
    pub section: String,
    pub title: String,
    pub text_preview: String,
}

impl From<&ContextBlock> for Citation {
    #[inline]
    fn from(block: &ContextBlock) -> Self {
        Self {
            chapter: block.chapter,
            section: block.section.clone(),
            title: block.title.clone(),
            text_preview: block.preview.clone(),
        }
    }
}

/// Indices of the blocks the answer explicitly refers to, in first-mention order
///
/// `[N.M]`-style references resolve by section, `[Source i]` by block index.
/// References that match no supplied block are logged and skipped.
#[inline]
pub fn mentioned_blocks(answer: &str, blocks: &[ContextBlock]) -> Vec<usize> {
    REFERENCE
        .captures_iter(answer)
        .filter_map(Result::ok)
        .filter_map(|captures| {
            let found = if let (Some(chapter), Some(minor)) = (captures.get(1), captures.get(2)) {
                let section = format!("{}.{}", chapter.as_str(), minor.as_str());
                blocks.iter().find(|b| b.section == section)
            } else {
                let index = captures.get(3)?.as_str().parse::<usize>().ok()?;
                blocks.iter().find(|b| b.index == index)
            };
            if found.is_none() {
                warn!(
                    "Answer cites {} which is not among the supplied sources",
                    captures.get(0).map_or("", |m| m.as_str())
                );
            }
            found.map(|block| block.index)
        })
        .unique()
        .collect()
}

/// One citation per supplied section, in context rank order
///
/// Every block that went into the prompt is cited; duplicates of a
/// (chapter, section) pair keep their best-ranked occurrence.
#[inline]
pub fn extract_citations(answer: &str, blocks: &[ContextBlock]) -> Vec<Citation> {
    let mentioned = mentioned_blocks(answer, blocks);
    if mentioned.is_empty() && !blocks.is_empty() {
        debug!("Answer carries no recognisable source references");
    } else {
        debug!("Answer refers to sources {:?}", mentioned);
    }

    blocks
        .iter()
        .unique_by(|block| (block.chapter, block.section.clone()))
        .map(Citation::from)
        .collect()
}
