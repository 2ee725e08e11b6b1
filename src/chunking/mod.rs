
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ValidationError;

static CHAPTER_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s+(?i:chapter|kafli)\s+(\d+)\s*:\s*(\S.*?)\s*$")
        .expect("chapter header pattern is valid")
});

static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+(\d+)\.(\d+)\s+(\S.*?)\s*$").expect("section header pattern is valid")
});

/// A source document, ingested as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Stable identifier, the file stem for documents read from disk
    pub id: String,
    pub source: PathBuf,
    pub text: String,
}

impl Document {
    #[inline]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            source: PathBuf::from(&id),
            id,
            text: text.into(),
        }
    }

    /// Build a document from a file path and its already-read contents
    #[inline]
    pub fn from_source(source: &Path, text: String) -> Self {
        let id = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        Self {
            id,
            source: source.to_path_buf(),
            text,
        }
    }
}

/// Represents a chunk of a section, the unit of retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}-{chunk_index:04}`, identical across re-ingestion of the same document
    pub id: String,
    pub document_id: String,
    /// Position of this chunk within its document
    pub chunk_index: usize,
    pub chapter: u32,
    pub chapter_title: String,
    /// Section number in `N.M` form; `N.0` holds a chapter's introduction
    pub section: String,
    /// Section title
    pub title: String,
    pub text: String,
    pub word_count: usize,
}

impl Chunk {
    /// Text sent to the embedding provider, prefixed with where the chunk sits in the book
    #[inline]
    pub fn embedding_text(&self) -> String {
        format!(
            "Chapter {}: {}\nSection {}: {}\n\n{}",
            self.chapter, self.chapter_title, self.section, self.title, self.text
        )
    }
}

/// Configuration for content chunking, in words
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Chunks close once they reach this size, except the last chunk of a section
    pub min_words: usize,
    /// No chunk ever exceeds this size
    pub max_words: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            min_words: 300,
            max_words: 800,
        }
    }
}

/// Body text collected under one section header
#[derive(Debug)]
struct Section {
    chapter: u32,
    chapter_title: String,
    number: String,
    title: String,
    paragraphs: Vec<String>,
    current: Vec<String>,
}

impl Section {
    fn new(chapter: u32, chapter_title: &str, number: String, title: String) -> Self {
        Self {
            chapter,
            chapter_title: chapter_title.to_string(),
            number,
            title,
            paragraphs: Vec::new(),
            current: Vec::new(),
        }
    }

    fn push_line(&mut self, line: &str) {
        self.current.push(line.to_string());
    }

    fn end_paragraph(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let paragraph = self.current.join("\n");
        self.current.clear();
        if !paragraph.trim().is_empty() {
            self.paragraphs.push(paragraph.trim().to_string());
        }
    }
}

/// Split a document into chunks, following its chapter and section headers
///
/// Fails on the first header whose numbering cannot be parsed. An empty
/// document yields no chunks.
#[inline]
pub fn chunk_document(
    document: &Document,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, ValidationError> {
    let sections = parse_sections(&document.text)?;

    let mut chunks = Vec::new();
    for section in sections {
        for text in pack_paragraphs(&section.paragraphs, config) {
            let chunk_index = chunks.len();
            chunks.push(Chunk {
                id: format!("{}-{:04}", document.id, chunk_index),
                document_id: document.id.clone(),
                chunk_index,
                chapter: section.chapter,
                chapter_title: section.chapter_title.clone(),
                section: section.number.clone(),
                title: section.title.clone(),
                word_count: word_count(&text),
                text,
            });
        }
    }

    debug!(
        "Chunked document '{}' into {} chunks (avg {} words)",
        document.id,
        chunks.len(),
        chunks.iter().map(|c| c.word_count).sum::<usize>() / chunks.len().max(1)
    );

    Ok(chunks)
}

fn parse_sections(text: &str) -> Result<Vec<Section>, ValidationError> {
    let mut sections = Vec::new();
    let mut chapter: Option<(u32, String)> = None;
    let mut section: Option<Section> = None;
    let mut in_code_block = false;

    for (index, raw_line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim_end();

        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
        }

        let level = if in_code_block { 0 } else { heading_level(line) };

        match level {
            1 => {
                let (number, title) = parse_chapter_header(line, line_number)?;
                if let Some(mut finished) = section.take() {
                    finished.end_paragraph();
                    sections.push(finished);
                }
                section = Some(Section::new(number, &title, format!("{}.0", number), title.clone()));
                chapter = Some((number, title));
            }
            2 => {
                let Some((chapter_number, chapter_title)) = &chapter else {
                    return Err(ValidationError::MissingChapter { line: line_number });
                };
                let (section_chapter, number, title) = parse_section_header(line, line_number)?;
                if section_chapter != *chapter_number {
                    return Err(ValidationError::SectionOutsideChapter {
                        line: line_number,
                        section: number,
                        chapter: *chapter_number,
                    });
                }
                if let Some(mut finished) = section.take() {
                    finished.end_paragraph();
                    sections.push(finished);
                }
                section = Some(Section::new(*chapter_number, chapter_title, number, title));
            }
            _ => {
                let Some(current) = section.as_mut() else {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Err(ValidationError::MissingChapter { line: line_number });
                };
                if line.trim().is_empty() && !in_code_block {
                    current.end_paragraph();
                } else {
                    current.push_line(line);
                }
            }
        }
    }

    if in_code_block {
        warn!("Document ends inside an unterminated code block");
    }

    if let Some(mut finished) = section.take() {
        finished.end_paragraph();
        sections.push(finished);
    }

    Ok(sections)
}

/// Number of leading `#` characters when followed by whitespace, 0 otherwise
fn heading_level(line: &str) -> usize {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    let followed_by_space = line
        .chars()
        .nth(hashes)
        .is_some_and(char::is_whitespace);
    if hashes > 0 && followed_by_space {
        hashes
    } else {
        0
    }
}

fn parse_chapter_header(line: &str, line_number: usize) -> Result<(u32, String), ValidationError> {
    let invalid = || ValidationError::ChapterHeader {
        line: line_number,
        text: line.to_string(),
    };

    let captures = CHAPTER_HEADER
        .captures(line)
        .ok()
        .flatten()
        .ok_or_else(invalid)?;
    let number = captures
        .get(1)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let title = captures
        .get(2)
        .map(|m| m.as_str().to_string())
        .ok_or_else(invalid)?;

    Ok((number, title))
}

fn parse_section_header(
    line: &str,
    line_number: usize,
) -> Result<(u32, String, String), ValidationError> {
    let invalid = || ValidationError::SectionHeader {
        line: line_number,
        text: line.to_string(),
    };

    let captures = SECTION_HEADER
        .captures(line)
        .ok()
        .flatten()
        .ok_or_else(invalid)?;
    let chapter = captures
        .get(1)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let minor = captures
        .get(2)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let title = captures
        .get(3)
        .map(|m| m.as_str().to_string())
        .ok_or_else(invalid)?;

    Ok((chapter, format!("{}.{}", chapter, minor), title))
}

/// A run of text going into a chunk; `continues` marks a fragment of the previous paragraph
struct Part {
    text: String,
    continues: bool,
}

/// Accumulates parts and closes chunks inside the configured word window
struct Packer<'a> {
    config: &'a ChunkingConfig,
    parts: Vec<Part>,
    words: usize,
    chunks: Vec<String>,
}

impl<'a> Packer<'a> {
    fn new(config: &'a ChunkingConfig) -> Self {
        Self {
            config,
            parts: Vec::new(),
            words: 0,
            chunks: Vec::new(),
        }
    }

    fn add(&mut self, text: String, continues: bool) {
        self.words += word_count(&text);
        self.parts.push(Part { text, continues });
    }

    fn flush(&mut self) {
        if self.parts.is_empty() {
            return;
        }
        let mut chunk = String::new();
        for (i, part) in self.parts.drain(..).enumerate() {
            if i > 0 {
                chunk.push_str(if part.continues { " " } else { "\n\n" });
            }
            chunk.push_str(&part.text);
        }
        self.chunks.push(chunk);
        self.words = 0;
    }

    /// Push a piece of at most `max_words` words
    fn push(&mut self, text: String, continues: bool) {
        let words = word_count(&text);

        if self.words + words <= self.config.max_words {
            self.add(text, continues);
            return;
        }

        if self.words >= self.config.min_words {
            self.flush();
            self.add(text, false);
            return;
        }

        // Still short of the minimum: take what fits of this piece, then close
        let budget = self.config.max_words - self.words;
        let needed = self.config.min_words - self.words;
        let (head, tail) = split_to_budget(&text, budget, needed);
        self.add(head, continues);
        self.flush();
        self.push(tail, true);
    }
}

fn pack_paragraphs(paragraphs: &[String], config: &ChunkingConfig) -> Vec<String> {
    let mut packer = Packer::new(config);

    for paragraph in paragraphs {
        if word_count(paragraph) > config.max_words {
            for (i, piece) in split_oversized(paragraph, config.max_words)
                .into_iter()
                .enumerate()
            {
                packer.push(piece, i > 0);
            }
        } else {
            packer.push(paragraph.clone(), false);
        }
    }

    packer.flush();
    packer.chunks
}

/// Group a paragraph's sentences into pieces of at most `max_words` words
fn split_oversized(paragraph: &str, max_words: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0;

    for sentence in split_sentences(paragraph) {
        let sentence_words = word_count(sentence);

        if sentence_words > max_words {
            if !current.is_empty() {
                pieces.push(current.join(" "));
                current.clear();
                current_words = 0;
            }
            pieces.extend(split_by_words(sentence, max_words));
            continue;
        }

        if current_words + sentence_words > max_words && !current.is_empty() {
            pieces.push(current.join(" "));
            current.clear();
            current_words = 0;
        }

        current.push(sentence);
        current_words += sentence_words;
    }

    if !current.is_empty() {
        pieces.push(current.join(" "));
    }

    pieces
}

/// Split `text` into a head of at most `budget` words and the remaining tail
///
/// The cut lands on a sentence boundary when that still yields `needed` words,
/// otherwise on a word boundary.
fn split_to_budget(text: &str, budget: usize, needed: usize) -> (String, String) {
    let sentences = split_sentences(text);
    let mut taken = 0;
    let mut taken_words = 0;
    for sentence in &sentences {
        let words = word_count(sentence);
        if taken_words + words > budget {
            break;
        }
        taken += 1;
        taken_words += words;
    }

    if taken > 0 && taken_words >= needed {
        let (head, tail) = sentences.split_at(taken);
        return (head.join(" "), tail.join(" "));
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let cut = budget.min(words.len());
    let (head, tail) = words.split_at(cut);
    (head.join(" "), tail.join(" "))
}

fn split_by_words(text: &str, max_words: usize) -> Vec<String> {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .chunks(max_words.max(1))
        .map(|words| words.join(" "))
        .collect()
}

/// Split text after `.`, `!` or `?` when followed by whitespace or the end of the text
#[inline]
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
        if at_boundary {
            let end = index + ch.len_utf8();
            if let Some(sentence) = text.get(start..end).map(str::trim) {
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
            }
            start = end;
        }
    }

    if let Some(rest) = text.get(start..).map(str::trim) {
        if !rest.is_empty() {
            sentences.push(rest);
        }
    }

    sentences
}

#[inline]
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Estimate token count using a simple heuristic
/// This is a rough approximation - actual tokenization would be more accurate
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    // Rough heuristic: 1 token ≈ 0.75 words for English text
    // Add extra tokens for punctuation and special characters
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}
