// Exhaustive top-k similarity search over unit-normalized vectors.
//
// Stored and query vectors are both L2-normalized, so the dot product is the
// cosine similarity.


use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::time::Duration;
use tracing::debug;

use crate::database::EmbeddingVector;
use crate::embeddings::preprocess::excerpt;
use crate::embeddings::vector_math::dot;

pub const DEFAULT_MIN_SIMILARITY: f32 = 0.1;
pub const DEFAULT_EXCERPT_CHARS: usize = 200;
pub const DEFAULT_ASYNC_CHUNK_SIZE: usize = 250;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Scores must exceed this floor to be returned
    pub min_similarity: f32,
    pub excerpt_chars: usize,
    /// Candidates scanned between yields in the async variant
    pub async_chunk_size: usize,
    /// Pause between slices; 0 yields without sleeping
    pub yield_ms: u64,
}

impl Default for SearchConfig {
    #[inline]
    fn default() -> Self {
        Self {
            min_similarity: DEFAULT_MIN_SIMILARITY,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
            async_chunk_size: DEFAULT_ASYNC_CHUNK_SIZE,
            yield_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub path: String,
    pub chunk_id: u32,
    pub score: f32,
    pub title: String,
    pub excerpt: String,
}

/// Sorted, capped list of the best candidates seen so far
struct TopK<'a> {
    limit: usize,
    entries: Vec<(f32, &'a EmbeddingVector)>,
}

impl<'a> TopK<'a> {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Vec::with_capacity(limit.min(1024)),
        }
    }

    fn offer(&mut self, score: f32, vector: &'a EmbeddingVector) {
        if self.limit == 0 {
            return;
        }
        if self.entries.len() == self.limit {
            match self.entries.last() {
                Some((worst, _)) if score <= *worst => return,
                _ => {}
            }
        }

        // Equal scores keep scan order
        let position = self.entries.partition_point(|(existing, _)| *existing >= score);
        self.entries.insert(position, (score, vector));
        if self.entries.len() > self.limit {
            self.entries.pop();
        }
    }

    fn scan<V: Borrow<EmbeddingVector>>(&mut self, query: &[f32], candidates: &'a [V], floor: f32) {
        for candidate in candidates {
            let vector = candidate.borrow();
            if vector.metadata.is_empty || vector.vector.len() != query.len() {
                continue;
            }
            let score = dot(query, &vector.vector);
            if score > floor {
                self.offer(score, vector);
            }
        }
    }

    fn into_results(self, excerpt_chars: usize) -> Vec<SearchResult> {
        self.entries
            .into_iter()
            .map(|(score, vector)| shape_result(vector, score, excerpt_chars))
            .collect()
    }
}

/// Best `limit` matches for `query` among `vectors`, highest score first
#[inline]
pub fn find_similar<V: Borrow<EmbeddingVector>>(
    query: &[f32],
    vectors: &[V],
    limit: usize,
    config: &SearchConfig,
) -> Vec<SearchResult> {
    let mut top = TopK::new(limit);
    top.scan(query, vectors, config.min_similarity);
    top.into_results(config.excerpt_chars)
}

/// Same result as [`find_similar`], scanned in slices of `config.async_chunk_size`
/// with a yield between slices. `on_progress(processed, total)` runs after each slice.
#[inline]
pub async fn find_similar_async<V, F>(
    query: &[f32],
    vectors: &[V],
    limit: usize,
    config: &SearchConfig,
    mut on_progress: F,
) -> Vec<SearchResult>
where
    V: Borrow<EmbeddingVector> + Sync,
    F: FnMut(usize, usize) + Send,
{
    let total = vectors.len();
    let slice_size = config.async_chunk_size.max(1);
    let mut top = TopK::new(limit);
    let mut processed = 0;

    for slice in vectors.chunks(slice_size) {
        top.scan(query, slice, config.min_similarity);
        processed += slice.len();
        on_progress(processed, total);

        if processed < total {
            if config.yield_ms == 0 {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_millis(config.yield_ms)).await;
            }
        }
    }

    debug!("Scanned {} candidates for {} results", total, top.entries.len());
    top.into_results(config.excerpt_chars)
}

/// Trimmed excerpt, prefixed by the section title unless it already starts with it
fn shape_result(vector: &EmbeddingVector, score: f32, excerpt_chars: usize) -> SearchResult {
    let metadata = &vector.metadata;
    let body = excerpt(metadata.excerpt.as_deref().unwrap_or_default(), excerpt_chars);
    let excerpt = match metadata.section_title.as_deref() {
        Some(section) if !section.is_empty() && !body.starts_with(section) => {
            if body.is_empty() {
                section.to_string()
            } else {
                format!("{section}: {body}")
            }
        }
        _ => body,
    };

    SearchResult {
        id: vector.id.clone(),
        path: vector.path.clone(),
        chunk_id: vector.chunk_id,
        score,
        title: metadata.title.clone(),
        excerpt,
    }
}
