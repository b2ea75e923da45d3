#[cfg(test)]
mod tests;

use std::sync::LazyLock;

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Separator inserted between paragraphs joined into one chunk
const PARAGRAPH_SEPARATOR: &str = "\n\n";
const SEPARATOR_CHARS: usize = 2;

/// Maximum heading depth recognized by the block splitter
const MAX_HEADING_LEVEL: usize = 6;

static IMAGE_EMBED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[\[[^\]]*\]\]|!\[[^\]]*\]\([^)]*\)").expect("image pattern is valid")
});
static WIKI_LINK_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[[^\]|]+\|([^\]]+)\]\]").expect("aliased wiki link pattern is valid")
});
static WIKI_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("wiki link pattern is valid"));
static MARKDOWN_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("markdown link pattern is valid")
});
static CODE_FENCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:```|~~~)[^\n]*\n?").expect("code fence pattern is valid")
});
static HEADING_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ ]{0,3}#{1,6}[ \t]+").expect("heading pattern is valid"));
static INLINE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{00A0}]+").expect("whitespace pattern is valid"));
static TRAILING_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").expect("trailing whitespace pattern is valid"));
static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line pattern is valid"));

/// Configuration for content preprocessing and chunking.
///
/// Sizes are measured in characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Cleaned content shorter than this is not worth embedding
    pub min_content_chars: usize,
    /// Hard ceiling applied to pathological inputs
    pub max_content_chars: usize,
    /// Preferred chunk size
    pub target_chunk_chars: usize,
    /// Fraction of a piece repeated at the start of the next piece when a paragraph is split
    pub overlap_ratio: f32,
    /// How far around the target a sentence boundary is searched for when splitting
    pub sentence_lookahead_chars: usize,
    /// Trailing chunks shorter than this are merged into their predecessor
    pub tail_merge_chars: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            min_content_chars: 80,
            max_content_chars: 1_200_000,
            target_chunk_chars: 2400,
            overlap_ratio: 0.2,
            sentence_lookahead_chars: 400,
            tail_merge_chars: 180,
        }
    }
}

impl ChunkingConfig {
    /// Hard upper bound for a single chunk
    #[inline]
    pub fn max_chunk_chars(&self) -> usize {
        self.target_chunk_chars * 135 / 100
    }

    /// Chunks below this size are merged forward instead of emitted alone
    #[inline]
    pub fn min_chunk_chars(&self) -> usize {
        self.target_chunk_chars / 2
    }

    fn overlap_chars(&self) -> usize {
        (self.target_chunk_chars as f32 * self.overlap_ratio.clamp(0.0, 0.5)) as usize
    }
}

/// Cleaned document content ready for chunking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedContent {
    /// Cleaned plain text
    pub text: String,
    /// Source with line endings normalized and front matter removed, headings intact
    pub structured: String,
    /// Content hash of `text`
    pub hash: String,
    /// Length of `text` in characters
    pub length: usize,
    /// Whether the input hit the truncation ceiling
    pub truncated: bool,
}

/// A chunk of content ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChunk {
    /// Zero-based position within the document
    pub index: u32,
    /// Cleaned chunk text
    pub text: String,
    /// Content hash of `text`
    pub hash: String,
    /// Heading trail the chunk starts under, outermost first
    pub heading_path: Vec<String>,
    /// Length of `text` in characters
    pub length: usize,
}

impl PreparedChunk {
    /// Innermost heading, if any
    #[inline]
    pub fn section_title(&self) -> Option<&str> {
        self.heading_path.last().map(String::as_str)
    }
}

/// Paragraph block tagged with the headings it appears under
#[derive(Debug, Clone)]
struct Block {
    text: String,
    heading_path: Vec<String>,
}

/// Chunk under construction
#[derive(Debug, Clone)]
struct Draft {
    text: String,
    length: usize,
    heading_path: Vec<String>,
}

impl Draft {
    fn new(text: String, length: usize, heading_path: Vec<String>) -> Self {
        Self {
            text,
            length,
            heading_path,
        }
    }

    fn append(&mut self, text: &str, length: usize) {
        self.text.push_str(PARAGRAPH_SEPARATOR);
        self.text.push_str(text);
        self.length += SEPARATOR_CHARS + length;
    }
}

/// Turns raw document text into cleaned content and bounded, hashed chunks
#[derive(Debug, Clone, Default)]
pub struct ContentPreprocessor {
    config: ChunkingConfig,
}

impl ContentPreprocessor {
    #[inline]
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Normalize and clean raw text.
    ///
    /// Returns `None` when the cleaned content is too short to be worth embedding.
    #[inline]
    pub fn process(&self, raw: &str) -> Option<ProcessedContent> {
        let normalized = normalize_line_endings(raw);
        let body = strip_front_matter(&normalized);
        let (structured, truncated) = truncate_at_boundary(body, self.config.max_content_chars);
        if truncated {
            debug!(
                "Truncated oversized content to {} characters",
                char_len(&structured)
            );
        }

        let text = clean_text(&structured);
        let length = char_len(&text);
        if length < self.config.min_content_chars {
            debug!(
                "Rejecting content of {} characters (minimum {})",
                length, self.config.min_content_chars
            );
            return None;
        }

        Some(ProcessedContent {
            hash: content_hash(&text),
            text,
            structured,
            length,
            truncated,
        })
    }

    /// Split content into heading-aware, length-bounded chunks with content hashes.
    ///
    /// `structured_source` drives the heading trail; when it yields no blocks the
    /// cleaned `content` is chunked as a single untitled section.
    #[inline]
    pub fn chunk_content_with_hashes(
        &self,
        content: &str,
        structured_source: &str,
    ) -> Vec<PreparedChunk> {
        let mut blocks = split_blocks(structured_source);
        if blocks.iter().all(|b| b.text.trim().is_empty()) {
            blocks = vec![Block {
                text: content.to_string(),
                heading_path: Vec::new(),
            }];
        }

        let drafts = self.assemble(blocks);
        let chunks: Vec<PreparedChunk> = drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| PreparedChunk {
                index: index as u32,
                hash: content_hash(&draft.text),
                length: char_len(&draft.text),
                text: draft.text,
                heading_path: draft.heading_path,
            })
            .collect();

        debug!(
            "Chunked content into {} chunks (avg {} chars)",
            chunks.len(),
            chunks.iter().map(|c| c.length).sum::<usize>() / chunks.len().max(1)
        );

        chunks
    }

    /// Greedily pack cleaned paragraphs into drafts
    fn assemble(&self, blocks: Vec<Block>) -> Vec<Draft> {
        let target = self.config.target_chunk_chars;
        let max = self.config.max_chunk_chars();
        let min = self.config.min_chunk_chars();

        let mut drafts = Vec::new();
        let mut current: Option<Draft> = None;

        for block in blocks {
            let text = clean_text(&block.text);
            if text.is_empty() {
                continue;
            }
            let length = char_len(&text);

            current = match current.take() {
                None => self.start_draft(&mut drafts, text, length, block.heading_path),
                Some(mut draft) => {
                    let combined = draft.length + SEPARATOR_CHARS + length;
                    let section_changed = draft.heading_path != block.heading_path;

                    if combined <= target && !(section_changed && draft.length >= min) {
                        draft.append(&text, length);
                        Some(draft)
                    } else if draft.length >= min {
                        drafts.push(draft);
                        self.start_draft(&mut drafts, text, length, block.heading_path)
                    } else if combined <= max {
                        // Too small to stand alone, so it absorbs the next paragraph
                        draft.append(&text, length);
                        Some(draft)
                    } else {
                        draft.append(&text, length);
                        let Draft {
                            text,
                            length,
                            heading_path,
                        } = draft;
                        self.start_draft(&mut drafts, text, length, heading_path)
                    }
                }
            };
        }

        if let Some(draft) = current {
            drafts.push(draft);
        }

        self.merge_small_tail(&mut drafts);
        drafts
    }

    /// Begin a new draft, splitting oversized text. All pieces but the last are emitted.
    fn start_draft(
        &self,
        drafts: &mut Vec<Draft>,
        text: String,
        length: usize,
        heading_path: Vec<String>,
    ) -> Option<Draft> {
        if length <= self.config.max_chunk_chars() {
            return Some(Draft::new(text, length, heading_path));
        }

        let mut pieces = self.split_with_overlap(&text);
        let last = pieces.pop()?;
        for piece in pieces {
            let piece_length = char_len(&piece);
            drafts.push(Draft::new(piece, piece_length, heading_path.clone()));
        }
        let last_length = char_len(&last);
        Some(Draft::new(last, last_length, heading_path))
    }

    /// Split an oversized paragraph into overlapping pieces, cutting at sentence
    /// boundaries near the target size when one is available
    fn split_with_overlap(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let target = self.config.target_chunk_chars.max(1);
        let max = self.config.max_chunk_chars().max(target);
        let min_piece = self.config.min_chunk_chars();
        let overlap = self.config.overlap_chars();
        let lookahead = self.config.sentence_lookahead_chars;

        let mut pieces = Vec::new();
        let mut start = 0;

        while start < total {
            if total - start <= target {
                push_piece(&mut pieces, &chars[start..]);
                break;
            }

            let hard_end = start + target;
            let window_start = hard_end.saturating_sub(lookahead).max(start + min_piece);
            let window_end = (hard_end + lookahead).min(start + max).min(total);

            let end = sentence_boundary_before(&chars, window_start, hard_end)
                .or_else(|| sentence_boundary_after(&chars, hard_end, window_end))
                .or_else(|| whitespace_before(&chars, window_start, hard_end))
                .unwrap_or(hard_end);

            push_piece(&mut pieces, &chars[start..end]);

            let mut next = end.saturating_sub(overlap).max(start + 1);
            while next < end && !chars[next - 1].is_whitespace() {
                next += 1;
            }
            start = next;
        }

        pieces
    }

    /// Fold a very short final chunk back into its predecessor when it fits
    fn merge_small_tail(&self, drafts: &mut Vec<Draft>) {
        if drafts.len() < 2 {
            return;
        }

        let max = self.config.max_chunk_chars();
        let last_index = drafts.len() - 1;
        let last_length = drafts[last_index].length;
        let previous_length = drafts[last_index - 1].length;

        if last_length < self.config.tail_merge_chars
            && previous_length + SEPARATOR_CHARS + last_length <= max
        {
            if let Some(tail) = drafts.pop() {
                if let Some(previous) = drafts.last_mut() {
                    previous.append(&tail.text, tail.length);
                }
            }
        }
    }
}

fn push_piece(pieces: &mut Vec<String>, chars: &[char]) {
    let piece: String = chars.iter().collect();
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
}

fn is_sentence_end(chars: &[char], position: usize) -> bool {
    if position == 0 || position > chars.len() {
        return false;
    }
    let previous = chars[position - 1];
    if previous == '\n' {
        return true;
    }
    matches!(previous, '.' | '!' | '?')
        && chars.get(position).is_none_or(|c| c.is_whitespace())
}

/// Last sentence boundary in `[from, to]`
fn sentence_boundary_before(chars: &[char], from: usize, to: usize) -> Option<usize> {
    (from..=to).rev().find(|&p| is_sentence_end(chars, p))
}

/// First sentence boundary in `(from, to]`
fn sentence_boundary_after(chars: &[char], from: usize, to: usize) -> Option<usize> {
    (from + 1..=to).find(|&p| is_sentence_end(chars, p))
}

fn whitespace_before(chars: &[char], from: usize, to: usize) -> Option<usize> {
    (from..to).rev().find(|&p| chars[p].is_whitespace())
}

/// Split structured source into paragraph blocks carrying their heading trail.
///
/// Lines inside code fences never count as headings or paragraph breaks, and
/// malformed heading markers stay as plain text.
fn split_blocks(source: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut paragraph = String::new();
    let mut paragraph_headings: Vec<String> = Vec::new();
    let mut in_fence = false;

    let flush = |paragraph: &mut String, trail: &[String], blocks: &mut Vec<Block>| {
        if !paragraph.trim().is_empty() {
            blocks.push(Block {
                text: std::mem::take(paragraph),
                heading_path: trail.to_vec(),
            });
        }
    };

    for line in source.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        if !in_fence {
            if let Some((level, title)) = parse_heading(line) {
                flush(&mut paragraph, &paragraph_headings, &mut blocks);
                while headings.last().is_some_and(|(l, _)| *l >= level) {
                    headings.pop();
                }
                headings.push((level, title));
                paragraph_headings = headings.iter().map(|(_, t)| t.clone()).collect();
            } else if line.trim().is_empty() {
                flush(&mut paragraph, &paragraph_headings, &mut blocks);
                continue;
            }
        }

        if paragraph.is_empty() {
            paragraph_headings = headings.iter().map(|(_, t)| t.clone()).collect();
        } else {
            paragraph.push('\n');
        }
        paragraph.push_str(line);
    }

    flush(&mut paragraph, &paragraph_headings, &mut blocks);
    blocks
}

/// Recognize an ATX heading (`#` to `######`, followed by whitespace and text)
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }

    let rest = line.trim_start_matches(' ');
    let level = rest.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > MAX_HEADING_LEVEL {
        return None;
    }

    let after = rest.trim_start_matches('#');
    if !after.starts_with([' ', '\t']) {
        return None;
    }

    let title = clean_inline(after.trim().trim_end_matches('#').trim());
    if title.is_empty() {
        None
    } else {
        Some((level, title))
    }
}

/// Convert CRLF and lone CR line endings to LF
#[inline]
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Remove a leading front matter block delimited by `---` lines
#[inline]
pub fn strip_front_matter(text: &str) -> &str {
    let without_bom = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(rest) = without_bom.strip_prefix("---\n") else {
        return without_bom;
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == "---" {
            return &rest[offset..];
        }
    }

    // Unterminated front matter is treated as content
    without_bom
}

/// Clean Markdown formatting down to plain text while keeping paragraph breaks
#[inline]
pub fn clean_text(text: &str) -> String {
    let text = IMAGE_EMBED.replace_all(text, "");
    let text = CODE_FENCE_LINE.replace_all(&text, "");
    let text = HEADING_MARKER.replace_all(&text, "");
    let text = clean_inline(&text);
    let text = TRAILING_WHITESPACE.replace_all(&text, "");
    let text = EXCESS_BLANK_LINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Unwrap links to their display text and collapse runs of spaces
fn clean_inline(text: &str) -> String {
    let text = WIKI_LINK_ALIAS.replace_all(text, "$1");
    let text = WIKI_LINK.replace_all(&text, "$1");
    let text = MARKDOWN_LINK.replace_all(&text, "$1");
    INLINE_WHITESPACE.replace_all(&text, " ").into_owned()
}

/// Truncate to at most `max_chars`, preferring the nearest preceding sentence
/// boundary, then the nearest space, then a raw cut
#[inline]
pub fn truncate_at_boundary(text: &str, max_chars: usize) -> (String, bool) {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return (text.to_string(), false);
    };

    let head = &text[..cut];
    let boundary = head
        .rfind(['.', '!', '?', '\n'])
        .map(|p| p + 1)
        .or_else(|| head.rfind(' '))
        .filter(|p| *p > 0)
        .unwrap_or(cut);

    (text[..boundary].trim_end().to_string(), true)
}

/// 64-bit FNV-1a hash of the exact text, rendered as 16 hex digits.
///
/// Not collision resistant; it is only a staleness signal.
#[inline]
pub fn content_hash(text: &str) -> String {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = text.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    });
    format!("{hash:016x}")
}

/// Trim text to at most `max_chars` characters at a word boundary, appending an ellipsis when cut
#[inline]
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let Some((cut, _)) = collapsed.char_indices().nth(max_chars) else {
        return collapsed;
    };

    let head = &collapsed[..cut];
    let end = head.rfind(' ').filter(|p| *p > 0).unwrap_or(cut);
    format!("{}…", head[..end].trim_end())
}

#[inline]
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}
