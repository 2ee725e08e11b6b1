
use crate::context::ContextBlock;

const BLOCK_SEPARATOR: &str = "\n---\n";

/// Fixed instructions sent with every question
#[inline]
pub fn system_prompt(language: &str) -> String {
    format!(
        "You are a patient tutor answering students' questions about their course textbook.\n\
         \n\
         Rules:\n\
         1. Always answer in {language}, whatever language the question is asked in.\n\
         2. Use only the numbered sources you are given. Do not rely on outside knowledge.\n\
         3. If the sources do not contain enough information to answer, say so explicitly.\n\
         4. Cite the sources you use as [Chapter N.M: Title].\n\
         \n\
         Start with a direct answer, then explain with examples where the sources allow."
    )
}

/// Heading that introduces one source in the prompt
#[inline]
pub fn source_label(block: &ContextBlock) -> String {
    format!(
        "[Source {} – Chapter {}: {}]",
        block.index, block.section, block.title
    )
}

/// The user turn: numbered sources followed by the question
#[inline]
pub fn user_prompt(question: &str, blocks: &[ContextBlock], language: &str) -> String {
    let sources = blocks
        .iter()
        .map(|block| format!("{}\n{}\n", source_label(block), block.text))
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR);

    format!(
        "Use the following sources to answer the question.\n\
         \n\
         SOURCES:\n\
         {sources}\n\
         QUESTION: {question}\n\
         \n\
         Answer in {language} and cite sources as [Chapter N.M: Title] where relevant."
    )
}
