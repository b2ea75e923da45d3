use super::*;

const SENTENCE: &str =
    "Semantic search resolves free-text questions by meaning rather than keywords. ";

fn paragraph(min_chars: usize) -> String {
    let mut text = String::new();
    while text.len() < min_chars {
        text.push_str(SENTENCE);
    }
    text.trim_end().to_string()
}

fn assert_chunk_bounds(chunks: &[PreparedChunk], config: &ChunkingConfig) {
    let max = config.max_chunk_chars();
    let min = config.min_chunk_chars();
    for (i, chunk) in chunks.iter().enumerate() {
        assert!(
            chunk.length <= max,
            "chunk {} has {} chars, max is {}",
            i,
            chunk.length,
            max
        );
        if i + 1 < chunks.len() {
            assert!(
                chunk.length >= min,
                "non-final chunk {} has {} chars, min is {}",
                i,
                chunk.length,
                min
            );
        }
        assert_eq!(chunk.index as usize, i);
        assert_eq!(chunk.length, chunk.text.chars().count());
        assert_eq!(chunk.hash, content_hash(&chunk.text));
    }
}

#[test]
fn process_rejects_short_content() {
    let preprocessor = ContentPreprocessor::default();
    assert!(preprocessor.process("# Title\n\nToo short.").is_none());
    assert!(preprocessor.process("").is_none());
}

#[test]
fn process_strips_front_matter_and_formatting() {
    let raw = "---\r\ntags: [a, b]\r\n---\r\n# Heading\r\n\r\n\
               See [the docs](https://example.com) and [[Other Note|the other note]].\r\n\
               ![diagram](img.png)\r\n\r\n\r\n\r\n\
               ```rust\r\nlet x    = 1;\r\n```\r\n\
               More    text to make this long enough for the minimum length check.";
    let processed = ContentPreprocessor::default()
        .process(raw)
        .expect("content is long enough");

    assert!(!processed.text.contains("tags:"));
    assert!(!processed.text.contains("# "));
    assert!(!processed.text.contains("```"));
    assert!(!processed.text.contains("img.png"));
    assert!(!processed.text.contains('\r'));
    assert!(!processed.text.contains("\n\n\n"));
    assert!(processed.text.starts_with("Heading"));
    assert!(processed.text.contains("See the docs and the other note."));
    assert!(processed.text.contains("let x = 1;"));
    assert!(processed.text.contains("More text"));
    assert!(processed.structured.starts_with("# Heading"));
    assert_eq!(processed.hash, content_hash(&processed.text));
    assert_eq!(processed.length, processed.text.chars().count());
    assert!(!processed.truncated);
}

#[test]
fn unterminated_front_matter_is_content() {
    let text = "---\nnot really front matter";
    assert_eq!(strip_front_matter(text), text);
    assert_eq!(strip_front_matter("---\na: 1\n---\nbody"), "body");
}

#[test]
fn truncation_prefers_sentence_then_space_then_raw_cut() {
    let (cut, truncated) = truncate_at_boundary("One. Two three four", 12);
    assert!(truncated);
    assert_eq!(cut, "One.");

    let (cut, _) = truncate_at_boundary("alpha beta gamma", 13);
    assert_eq!(cut, "alpha beta");

    let (cut, _) = truncate_at_boundary("abcdefghij", 4);
    assert_eq!(cut, "abcd");

    let (untouched, truncated) = truncate_at_boundary("short", 100);
    assert_eq!(untouched, "short");
    assert!(!truncated);
}

#[test]
fn process_applies_truncation_ceiling() {
    let config = ChunkingConfig {
        max_content_chars: 500,
        ..ChunkingConfig::default()
    };
    let processed = ContentPreprocessor::new(config)
        .process(&paragraph(5000))
        .expect("long content");
    assert!(processed.truncated);
    assert!(processed.length <= 500);
    assert!(processed.text.ends_with('.'));
}

#[test]
fn content_hash_is_deterministic_and_order_sensitive() {
    let a = content_hash("hello world");
    assert_eq!(a, content_hash("hello world"));
    assert_eq!(a.len(), 16);
    assert_ne!(a, content_hash("hello worle"));
    assert_ne!(content_hash("ab"), content_hash("ba"));
    // Known FNV-1a 64 vector
    assert_eq!(content_hash(""), "cbf29ce484222325");
    assert_eq!(content_hash("a"), "af63dc4c8601ec8c");
}

#[test]
fn single_character_edits_change_the_hash() {
    // FNV-1a is not collision resistant; this only checks the common case of small edits.
    let base = paragraph(2000);
    let base_hash = content_hash(&base);
    for position in [0, 10, 500, 1999] {
        let mut edited: Vec<char> = base.chars().collect();
        edited[position] = if edited[position] == 'x' { 'y' } else { 'x' };
        let edited: String = edited.into_iter().collect();
        assert_ne!(content_hash(&edited), base_hash, "edit at {position}");
    }
}

#[test]
fn two_sections_produce_two_chunks() {
    let source = format!(
        "# Alpha\n\n{}\n\n# Beta\n\n{}",
        paragraph(1450),
        paragraph(1450)
    );
    let preprocessor = ContentPreprocessor::default();
    let processed = preprocessor.process(&source).expect("long content");
    assert!(processed.length >= 2900);

    let chunks = preprocessor.chunk_content_with_hashes(&processed.text, &processed.structured);
    assert_eq!(chunks.len(), 2);
    assert_chunk_bounds(&chunks, preprocessor.config());

    assert_eq!(chunks[0].heading_path, vec!["Alpha".to_string()]);
    assert_eq!(chunks[1].heading_path, vec!["Beta".to_string()]);
    assert!(chunks[0].text.starts_with("Alpha"));
    assert!(chunks[1].text.starts_with("Beta"));
}

#[test]
fn nested_headings_build_a_trail() {
    let source = format!(
        "# Guide\n\n{}\n\n## Install\n\n### Linux\n\n{}\n\n## Usage\n\n{}",
        paragraph(1300),
        paragraph(1300),
        paragraph(1300)
    );
    let preprocessor = ContentPreprocessor::default();
    let chunks = preprocessor.chunk_content_with_hashes("", &source);

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].heading_path, vec!["Guide"]);
    assert_eq!(chunks[1].heading_path, vec!["Guide", "Install"]);
    assert_eq!(chunks[2].heading_path, vec!["Guide", "Usage"]);
    assert_eq!(chunks[2].section_title(), Some("Usage"));
}

#[test]
fn malformed_headings_degrade_to_text() {
    let source = "#NoSpace heading\n\n####### too deep\n\n# \n\nplain paragraph";
    let chunks = ContentPreprocessor::default().chunk_content_with_hashes("", source);

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].heading_path.is_empty());
    assert!(chunks[0].text.contains("#NoSpace heading"));
    assert!(chunks[0].text.contains("plain paragraph"));
}

#[test]
fn headings_inside_code_fences_are_ignored() {
    let source = "# Real\n\n```\n# not a heading\n\nstill code\n```\n\nafter";
    let chunks = ContentPreprocessor::default().chunk_content_with_hashes("", source);

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].heading_path, vec!["Real"]);
    assert!(chunks[0].text.contains("not a heading"));
}

#[test]
fn oversized_paragraph_is_split_with_overlap() {
    let config = ChunkingConfig::default();
    let preprocessor = ContentPreprocessor::new(config.clone());
    let long = paragraph(10_000);

    let chunks = preprocessor.chunk_content_with_hashes(&long, &long);
    assert!(chunks.len() >= 4, "got {} chunks", chunks.len());
    assert_chunk_bounds(&chunks, &config);

    // Each piece starts inside the text of the piece before it
    for pair in chunks.windows(2) {
        let head: String = pair[1].text.chars().take(30).collect();
        assert!(
            pair[0].text.contains(&head),
            "expected overlap between adjacent pieces"
        );
    }

    // Cuts land on sentence boundaries
    for chunk in &chunks[..chunks.len() - 1] {
        assert!(chunk.text.ends_with('.'), "chunk ends mid-sentence");
    }
}

#[test]
fn unbroken_text_still_respects_max() {
    let config = ChunkingConfig::default();
    let blob = "x".repeat(9000);
    let chunks = ContentPreprocessor::new(config.clone()).chunk_content_with_hashes(&blob, &blob);
    assert!(chunks.len() > 1);
    assert_chunk_bounds(&chunks, &config);
}

#[test]
fn small_paragraphs_are_merged_forward() {
    let source = (0..40)
        .map(|i| format!("Paragraph number {i} has a little bit of text in it."))
        .collect::<Vec<_>>()
        .join("\n\n");
    let config = ChunkingConfig::default();
    let chunks = ContentPreprocessor::new(config.clone()).chunk_content_with_hashes("", &source);

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].text.contains("Paragraph number 0"));
    assert!(chunks[0].text.contains("Paragraph number 39"));
    assert_chunk_bounds(&chunks, &config);
}

#[test]
fn short_trailing_chunk_merges_backward() {
    let source = format!(
        "{}\n\n{}\n\n## Notes\n\nTiny tail.",
        paragraph(2000),
        paragraph(2000)
    );
    let config = ChunkingConfig::default();
    let chunks = ContentPreprocessor::new(config.clone()).chunk_content_with_hashes("", &source);

    assert_eq!(chunks.len(), 2);
    assert!(chunks[1].text.ends_with("Tiny tail."));
    assert_chunk_bounds(&chunks, &config);
}

#[test]
fn chunk_bounds_hold_across_mixed_documents() {
    let config = ChunkingConfig::default();
    let preprocessor = ContentPreprocessor::new(config.clone());
    let sizes = [50, 300, 1100, 1250, 2390, 2500, 3300, 5000, 12_000];

    for (seed, size) in sizes.iter().enumerate() {
        let mut source = String::new();
        for (i, other) in sizes.iter().cycle().skip(seed).take(6).enumerate() {
            if i % 2 == 0 {
                source.push_str(&format!("## Section {i}\n\n"));
            }
            source.push_str(&paragraph((*size + *other) / 2));
            source.push_str("\n\n");
        }

        let chunks = preprocessor.chunk_content_with_hashes("", &source);
        assert!(!chunks.is_empty());
        assert_chunk_bounds(&chunks, &config);
    }
}

#[test]
fn empty_structure_falls_back_to_content() {
    let chunks = ContentPreprocessor::default()
        .chunk_content_with_hashes("fallback content body that is used directly", "   \n\n  ");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "fallback content body that is used directly");
}

#[test]
fn excerpt_trims_at_word_boundary() {
    assert_eq!(excerpt("short text", 200), "short text");
    assert_eq!(excerpt("alpha   beta\ngamma delta", 14), "alpha beta…");
}
