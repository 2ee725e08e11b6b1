use super::*;

fn block(index: usize, chapter: u32, section: &str, title: &str) -> ContextBlock {
    ContextBlock {
        index,
        chunk_id: format!("doc-{:04}", index),
        chapter,
        section: section.to_string(),
        title: title.to_string(),
        text: format!("Text about {}", title),
        preview: format!("Text about {}", title),
        estimated_tokens: 4,
        truncated: false,
    }
}

fn blocks() -> Vec<ContextBlock> {
    vec![
        block(1, 1, "1.1", "Atoms"),
        block(2, 1, "1.2", "Molecules"),
        block(3, 2, "2.1", "Energy"),
        block(4, 1, "1.1", "Atoms"),
    ]
}

fn sections(citations: &[Citation]) -> Vec<&str> {
    citations.iter().map(|c| c.section.as_str()).collect()
}

#[test]
fn citations_follow_rank_order_not_mention_order() {
    let ranked = vec![
        block(1, 1, "1.1", "Atoms"),
        block(2, 1, "1.2", "Molecules"),
        block(3, 1, "1.3", "Ions"),
    ];
    let answer = "See [Chapter 1.2: Molecules] and later [Chapter 1.1: Atoms].";

    let citations = extract_citations(answer, &ranked);

    assert_eq!(sections(&citations), vec!["1.1", "1.2", "1.3"]);
    assert_eq!(citations[0].title, "Atoms");
    assert_eq!(citations[0].text_preview, "Text about Atoms");
}

#[test]
fn duplicate_sections_are_cited_once() {
    let citations = extract_citations("[Chapter 1.1: Atoms] twice [1.1]", &blocks());

    assert_eq!(citations.len(), 3);
    assert_eq!(
        citations.iter().filter(|c| c.section == "1.1").count(),
        1
    );
}

#[test]
fn mentions_resolve_in_first_mention_order() {
    let answer = "Energy is conserved [Chapter 2.1: Energy]. Atoms [Chapter 1.1: Atoms] \
                  form molecules [1.2], and atoms again [Chapter 1.1: Atoms].";

    assert_eq!(mentioned_blocks(answer, &blocks()), vec![3, 1, 2]);
}

#[test]
fn source_indices_and_localized_keywords() {
    let answer = "See [Source 2] and [kafli 2.1: Orka], also [Heimild 1].";

    assert_eq!(mentioned_blocks(answer, &blocks()), vec![2, 3, 1]);
}

#[test]
fn unknown_references_are_ignored() {
    let answer = "Compare [Chapter 9.9: Elsewhere] with [Source 3] and [Source 42].";

    assert_eq!(mentioned_blocks(answer, &blocks()), vec![3]);
    assert_eq!(
        sections(&extract_citations(answer, &blocks())),
        vec!["1.1", "1.2", "2.1"]
    );
}

#[test]
fn no_references_cites_every_block_in_rank_order() {
    let citations = extract_citations("Atoms are tiny.", &blocks());
    assert_eq!(sections(&citations), vec!["1.1", "1.2", "2.1"]);
}

#[test]
fn no_blocks_no_citations() {
    assert!(extract_citations("[Chapter 1.1: Atoms]", &[]).is_empty());
}
