// Indexer module
// Drives documents through preprocessing, embedding and storage, reusing
// vectors whose chunk content is unchanged.

pub mod source;


use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::{EmbeddingStorage, EmbeddingVector, VectorMetadata};
use crate::embeddings::namespace::{
    SCHEMA_VERSION, build_namespace, model_prefix, parse_namespace,
};
use crate::embeddings::preprocess::{
    ContentPreprocessor, PreparedChunk, content_hash, excerpt, normalize_line_endings,
};
use crate::embeddings::provider::{
    CancellationFlag, EmbedOptions, EmbeddingsProvider, ProviderError,
};
use crate::embeddings::vector_math::normalize;
use crate::search::{SearchConfig, SearchResult, find_similar_async};

pub use source::{DocumentSource, FsDocumentSource, SourceDocument};

/// Text embedded once to learn the model dimension
const SAMPLE_TEXT: &str = "dimension sample";

/// Stored excerpt length; search trims further
const STORED_EXCERPT_CHARS: usize = 500;

/// Receives `(processed, total)` chunk counts while embedding
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Chunks sent to the provider per call
    pub batch_size: usize,
    /// Provider calls in flight at once
    pub max_concurrency: usize,
    pub schema_version: u32,
}

impl Default for ProcessorConfig {
    #[inline]
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrency: 3,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Why one chunk (or a whole file, when `chunk_id` is `None`) was not stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub path: String,
    pub chunk_id: Option<u32>,
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
    pub retryable: bool,
}

/// Summary of one processing run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    /// Files whose vectors are now complete
    pub completed: usize,
    /// Files skipped because nothing changed
    pub unchanged: usize,
    pub failed: usize,
    pub failed_paths: Vec<String>,
    pub failures: Vec<ChunkFailure>,
    pub embedded_chunks: usize,
    pub reused_chunks: usize,
    /// Paths whose vectors were dropped because the document is gone
    pub removed_paths: usize,
    /// Set when nothing could be processed at all
    pub fatal_error: Option<String>,
}

impl ProcessingResult {
    #[inline]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.fatal_error.is_none()
    }

    fn fail_all(&mut self, paths: &[String], message: String) {
        self.failed = paths.len();
        self.failed_paths = paths.to_vec();
        self.fatal_error = Some(message);
    }

    fn record_file_failure(&mut self, path: &str, code: &str, message: String) {
        self.failures.push(ChunkFailure {
            path: path.to_string(),
            chunk_id: None,
            code: code.to_string(),
            message,
            status: None,
            retryable: false,
        });
        self.mark_failed(path);
    }

    fn mark_failed(&mut self, path: &str) {
        self.failed += 1;
        self.failed_paths.push(path.to_string());
    }
}

/// Namespace every vector of the current run is written to
#[derive(Debug, Clone)]
struct Target {
    namespace: String,
    model_prefix: String,
    dimension: usize,
}

/// Vector already available for a chunk
#[derive(Debug, Clone)]
struct ChunkVector {
    vector: Vec<f32>,
    created_at: i64,
}

/// Work for one changed file
#[derive(Debug)]
struct FilePlan {
    path: String,
    title: String,
    mtime: i64,
    chunks: Vec<PreparedChunk>,
    vectors: Vec<Option<ChunkVector>>,
    failed: bool,
    reused: usize,
}

impl FilePlan {
    fn is_complete(&self) -> bool {
        self.vectors.iter().all(Option::is_some)
    }
}

enum Planned {
    Unchanged,
    Placeholder { path: String, mtime: i64, hash: String },
    Work(FilePlan),
}

#[derive(Debug)]
struct PendingChunk {
    file: usize,
    chunk: usize,
    text: String,
}

/// Keeps the vector store in step with a document source
pub struct EmbeddingsProcessor {
    storage: Arc<EmbeddingStorage>,
    provider: Arc<dyn EmbeddingsProvider>,
    source: Arc<dyn DocumentSource>,
    preprocessor: ContentPreprocessor,
    config: ProcessorConfig,
    search_config: SearchConfig,
    dimension: Option<usize>,
    cancellation: CancellationFlag,
    progress: Option<ProgressCallback>,
}

impl EmbeddingsProcessor {
    #[inline]
    pub fn new(
        storage: Arc<EmbeddingStorage>,
        provider: Arc<dyn EmbeddingsProvider>,
        source: Arc<dyn DocumentSource>,
    ) -> Self {
        Self {
            storage,
            provider,
            source,
            preprocessor: ContentPreprocessor::default(),
            config: ProcessorConfig::default(),
            search_config: SearchConfig::default(),
            dimension: None,
            cancellation: CancellationFlag::new(),
            progress: None,
        }
    }

    #[inline]
    pub fn with_preprocessor(mut self, preprocessor: ContentPreprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    #[inline]
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    pub fn with_search_config(mut self, config: SearchConfig) -> Self {
        self.search_config = config;
        self
    }

    /// Fix the model dimension instead of learning it
    #[inline]
    pub fn with_dimension(mut self, dimension: Option<usize>) -> Self {
        self.dimension = dimension.filter(|d| *d > 0);
        self
    }

    #[inline]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    #[inline]
    pub fn storage(&self) -> &Arc<EmbeddingStorage> {
        &self.storage
    }

    /// Flag that stops further provider calls once set
    #[inline]
    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    /// Process every document in the source and drop vectors of documents that are gone
    #[inline]
    pub async fn index_all(&self) -> Result<ProcessingResult> {
        let paths = self.source.list_files().await?;
        info!("Indexing {} documents", paths.len());

        let mut result = self.process_files(&paths).await?;
        if result.fatal_error.is_some() {
            return Ok(result);
        }

        let present: HashSet<&str> = paths.iter().map(String::as_str).collect();
        for stored in self.storage.paths() {
            if !present.contains(stored.as_str()) {
                let removed = self.storage.remove_by_path(&stored).await?;
                debug!("Removed {} vectors of vanished document {}", removed, stored);
                result.removed_paths += 1;
            }
        }

        Ok(result)
    }

    /// Bring the vectors of `paths` up to date.
    ///
    /// Provider failures are reported per chunk in the result; storage failures
    /// abort the run.
    #[inline]
    pub async fn process_files(&self, paths: &[String]) -> Result<ProcessingResult> {
        let mut result = ProcessingResult::default();
        if paths.is_empty() {
            return Ok(result);
        }

        if let Err(e) = self.provider.validate_configuration() {
            warn!("Provider configuration is invalid: {}", e);
            result.fail_all(paths, e.to_string());
            return Ok(result);
        }

        let target = match self.resolve_target().await {
            Ok(target) => target,
            Err(e) => {
                warn!("Could not determine embedding dimension: {}", e);
                result.fail_all(paths, e.to_string());
                return Ok(result);
            }
        };
        debug!("Processing {} documents into {}", paths.len(), target.namespace);

        let mut plans = Vec::new();
        for path in paths {
            let document = match self.source.read(path).await {
                Ok(document) => document,
                Err(e) => {
                    warn!("Failed to read {}: {}", path, e);
                    result.record_file_failure(path, "read_failed", e.to_string());
                    continue;
                }
            };

            match self.plan_file(path, &document, &target) {
                Planned::Unchanged => result.unchanged += 1,
                Planned::Placeholder { path, mtime, hash } => {
                    self.store_placeholder(&path, mtime, hash, &target).await?;
                    result.completed += 1;
                }
                Planned::Work(plan) => {
                    result.reused_chunks += plan.reused;
                    plans.push(plan);
                }
            }
        }

        self.embed_missing(&mut plans, &target, &mut result).await;

        for plan in &plans {
            self.persist(plan, &target).await?;
            if plan.failed {
                result.mark_failed(&plan.path);
            } else {
                result.completed += 1;
            }
        }

        info!(
            "Processed {} documents: {} completed, {} unchanged, {} failed \
             ({} chunks embedded, {} reused)",
            paths.len(),
            result.completed,
            result.unchanged,
            result.failed,
            result.embedded_chunks,
            result.reused_chunks
        );
        Ok(result)
    }

    /// Move the vectors of a renamed file or directory. Returns the number of vectors moved.
    #[inline]
    pub async fn handle_rename(&self, old_path: &str, new_path: &str) -> Result<usize> {
        let moved = if self.storage.get_vectors_by_path(old_path).is_empty() {
            self.storage.rename_by_directory(old_path, new_path).await?
        } else {
            self.storage.rename_by_path(old_path, new_path).await?
        };
        debug!("Renamed {} -> {} ({} vectors)", old_path, new_path, moved);
        Ok(moved)
    }

    /// Drop the vectors of a deleted file or directory. Returns the number removed.
    #[inline]
    pub async fn handle_delete(&self, path: &str) -> Result<usize> {
        let removed = if self.storage.get_vectors_by_path(path).is_empty() {
            self.storage.remove_by_directory(path).await?
        } else {
            self.storage.remove_by_path(path).await?
        };
        debug!("Deleted {} ({} vectors)", path, removed);
        Ok(removed)
    }

    /// Rank stored chunks of the current namespace against `query`
    #[inline]
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.provider.validate_configuration()?;

        let mut embedded = self
            .provider
            .generate_embeddings(&[query.to_string()], &EmbedOptions::query())
            .await?;
        let Some(query_vector) = embedded.pop().as_deref().and_then(normalize) else {
            warn!("Query embedding could not be normalized");
            return Ok(Vec::new());
        };

        let namespace = build_namespace(
            self.provider.provider_id(),
            self.provider.model(),
            self.config.schema_version,
            query_vector.len(),
        );
        let candidates = self.storage.get_vectors_by_namespace(&namespace);
        debug!("Searching {} vectors in {}", candidates.len(), namespace);

        let results = find_similar_async(
            &query_vector,
            &candidates,
            limit,
            &self.search_config,
            |_, _| {},
        )
        .await;
        Ok(results)
    }

    async fn resolve_target(&self) -> std::result::Result<Target, ProviderError> {
        let provider = self.provider.provider_id();
        let model = self.provider.model();
        let prefix = model_prefix(provider, model);

        let known = self
            .dimension
            .or_else(|| self.provider.observed_dimension())
            .or_else(|| self.stored_dimension(&prefix));
        let dimension = match known {
            Some(dimension) => dimension,
            None => {
                debug!("Asking {} for its embedding dimension", model);
                let sample = self
                    .provider
                    .generate_embeddings(&[SAMPLE_TEXT.to_string()], &EmbedOptions::default())
                    .await?;
                match sample.first().map(Vec::len) {
                    Some(dimension) if dimension > 0 => dimension,
                    _ => {
                        return Err(ProviderError::UnsupportedResponse(
                            "dimension request returned no vector".to_string(),
                        ));
                    }
                }
            }
        };

        Ok(Target {
            namespace: build_namespace(provider, model, self.config.schema_version, dimension),
            model_prefix: prefix,
            dimension,
        })
    }

    /// Dimension of the newest schema already stored for this model
    fn stored_dimension(&self, prefix: &str) -> Option<usize> {
        self.storage
            .namespaces()
            .into_iter()
            .filter(|(namespace, _)| namespace.starts_with(prefix))
            .filter_map(|(namespace, _)| parse_namespace(&namespace))
            .filter(|parts| parts.dimension > 0)
            .max_by_key(|parts| parts.schema_version)
            .map(|parts| parts.dimension)
    }

    fn plan_file(&self, path: &str, document: &SourceDocument, target: &Target) -> Planned {
        let existing: Vec<Arc<EmbeddingVector>> = self
            .storage
            .get_vectors_by_path(path)
            .into_iter()
            .filter(|v| v.namespace() == target.namespace)
            .collect();
        let root = existing.iter().find(|v| v.is_root());

        if root.is_some_and(|r| r.metadata.complete && r.metadata.mtime == document.mtime) {
            return Planned::Unchanged;
        }

        let Some(processed) = self.preprocessor.process(&document.content) else {
            let hash = content_hash(&normalize_line_endings(&document.content));
            let same_placeholder = root.is_some_and(|r| {
                r.metadata.is_empty && r.metadata.complete && r.metadata.content_hash == hash
            });
            if same_placeholder && existing.len() == 1 {
                return Planned::Unchanged;
            }
            return Planned::Placeholder {
                path: path.to_string(),
                mtime: document.mtime,
                hash,
            };
        };

        let chunks = self
            .preprocessor
            .chunk_content_with_hashes(&processed.text, &processed.structured);

        // Content identical to an older schema of the same model is carried over
        let mut candidates: Vec<Arc<EmbeddingVector>> =
            existing.into_iter().filter(|v| !v.metadata.is_empty).collect();
        if candidates.is_empty() {
            if let Some(prior) =
                self.storage
                    .find_prior_namespace(path, &target.model_prefix, &target.namespace)
            {
                let same_dimension =
                    parse_namespace(&prior).is_some_and(|p| p.dimension == target.dimension);
                if same_dimension {
                    debug!("Reusing vectors of {} from {}", path, prior);
                    candidates = self
                        .storage
                        .get_vectors_by_path(path)
                        .into_iter()
                        .filter(|v| v.namespace() == prior && !v.metadata.is_empty)
                        .filter(|v| v.vector.len() == target.dimension)
                        .collect();
                }
            }
        }

        let mut by_hash: HashMap<&str, Vec<&Arc<EmbeddingVector>>> = HashMap::new();
        for candidate in &candidates {
            by_hash
                .entry(candidate.metadata.content_hash.as_str())
                .or_default()
                .push(candidate);
        }

        let mut vectors = Vec::with_capacity(chunks.len());
        let mut reused = 0;
        for chunk in &chunks {
            let found = by_hash.get_mut(chunk.hash.as_str()).and_then(|matches| {
                let position = matches
                    .iter()
                    .position(|v| v.chunk_id == chunk.index)
                    .unwrap_or(0);
                (!matches.is_empty()).then(|| matches.swap_remove(position))
            });

            match found {
                Some(vector) => {
                    reused += 1;
                    vectors.push(Some(ChunkVector {
                        vector: vector.vector.clone(),
                        created_at: vector.metadata.created_at,
                    }));
                }
                None => vectors.push(None),
            }
        }

        Planned::Work(FilePlan {
            path: path.to_string(),
            title: title_for(path),
            mtime: document.mtime,
            chunks,
            vectors,
            failed: false,
            reused,
        })
    }

    /// Embed every chunk without a vector, batched across files
    async fn embed_missing(
        &self,
        plans: &mut [FilePlan],
        target: &Target,
        result: &mut ProcessingResult,
    ) {
        let mut pending = Vec::new();
        for (file, plan) in plans.iter().enumerate() {
            for (chunk, vector) in plan.vectors.iter().enumerate() {
                if vector.is_none() {
                    pending.push(PendingChunk {
                        file,
                        chunk,
                        text: plan.chunks[chunk].text.clone(),
                    });
                }
            }
        }
        if pending.is_empty() {
            return;
        }

        let total = pending.len();
        let batches: Vec<&[PendingChunk]> = pending.chunks(self.config.batch_size.max(1)).collect();
        debug!("Embedding {} chunks in {} batches", total, batches.len());

        let options = EmbedOptions::default().with_cancellation(self.cancellation.clone());
        let provider = &self.provider;
        let options = &options;
        let mut outcomes = stream::iter(batches.iter().copied().enumerate())
            .map(|(index, batch)| {
                let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
                async move { (index, provider.generate_embeddings(&texts, options).await) }
            })
            .buffer_unordered(self.config.max_concurrency.max(1));

        let now = Utc::now().timestamp_millis();
        let mut processed = 0;
        while let Some((index, outcome)) = outcomes.next().await {
            let batch = batches[index];
            processed += batch.len();

            let outcome = outcome.and_then(|vectors| {
                if vectors.len() == batch.len() {
                    Ok(vectors)
                } else {
                    Err(ProviderError::CountMismatch {
                        expected: batch.len(),
                        actual: vectors.len(),
                    })
                }
            });
            match outcome {
                Ok(vectors) => {
                    for (item, raw) in batch.iter().zip(vectors) {
                        let plan = &mut plans[item.file];
                        match normalize(&raw).filter(|v| v.len() == target.dimension) {
                            Some(vector) => {
                                plan.vectors[item.chunk] = Some(ChunkVector {
                                    vector,
                                    created_at: now,
                                });
                                result.embedded_chunks += 1;
                            }
                            None => {
                                let message = if raw.len() == target.dimension {
                                    "vector cannot be normalized".to_string()
                                } else {
                                    format!(
                                        "expected {} dimensions, got {}",
                                        target.dimension,
                                        raw.len()
                                    )
                                };
                                plan.failed = true;
                                result.failures.push(ChunkFailure {
                                    path: plan.path.clone(),
                                    chunk_id: Some(plan.chunks[item.chunk].index),
                                    code: "invalid_vector".to_string(),
                                    message,
                                    status: None,
                                    retryable: false,
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Embedding batch of {} chunks failed: {}", batch.len(), e);
                    for item in batch {
                        let plan = &mut plans[item.file];
                        plan.failed = true;
                        result.failures.push(ChunkFailure {
                            path: plan.path.clone(),
                            chunk_id: Some(plan.chunks[item.chunk].index),
                            code: e.code().to_string(),
                            message: e.to_string(),
                            status: e.status(),
                            retryable: e.is_retryable(),
                        });
                    }
                }
            }

            if let Some(progress) = &self.progress {
                progress(processed, total);
            }
        }
    }

    /// Store whatever the plan holds and drop stale vectors of the file.
    ///
    /// The root is marked complete only when every chunk is written in this commit.
    async fn persist(&self, plan: &FilePlan, target: &Target) -> Result<()> {
        let complete = plan.is_complete();
        let chunk_count = u32::try_from(plan.chunks.len()).unwrap_or(u32::MAX);

        let mut records = Vec::with_capacity(plan.chunks.len());
        for (chunk, vector) in plan.chunks.iter().zip(&plan.vectors) {
            let Some(vector) = vector else {
                continue;
            };
            let is_root = chunk.index == 0;
            let metadata = VectorMetadata {
                title: plan.title.clone(),
                excerpt: Some(excerpt(&chunk.text, STORED_EXCERPT_CHARS)),
                mtime: plan.mtime,
                content_hash: chunk.hash.clone(),
                is_empty: false,
                provider: self.provider.provider_id().to_string(),
                model: self.provider.model().to_string(),
                dimension: target.dimension,
                created_at: vector.created_at,
                namespace: target.namespace.clone(),
                section_title: chunk.section_title().map(str::to_string),
                heading_path: (!chunk.heading_path.is_empty()).then(|| chunk.heading_path.clone()),
                chunk_length: Some(chunk.length),
                complete: is_root && complete,
                chunk_count: (is_root && complete).then_some(chunk_count),
            };
            records.push(EmbeddingVector::new(
                &plan.path,
                chunk.index,
                vector.vector.clone(),
                metadata,
            ));
        }

        if records.is_empty() {
            debug!("Nothing stored for {}", plan.path);
            return Ok(());
        }

        let keep: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        self.storage.store_vectors(records).await?;
        let stale = self
            .storage
            .remove_by_path_except_ids(&plan.path, &target.namespace, &keep)
            .await?;
        if stale > 0 {
            debug!("Removed {} stale vectors of {}", stale, plan.path);
        }

        if complete {
            self.remove_superseded(&plan.path, target).await?;
        }
        Ok(())
    }

    /// Drop vectors of `path` left behind in older schemas of the target model.
    ///
    /// Runs only once the file is complete in the target namespace, so a failed
    /// migration keeps its source vectors for the next run.
    async fn remove_superseded(&self, path: &str, target: &Target) -> Result<usize> {
        let superseded: Vec<String> = self
            .storage
            .get_vectors_by_path(path)
            .into_iter()
            .filter(|v| {
                v.namespace() != target.namespace && v.namespace().starts_with(&target.model_prefix)
            })
            .filter(|v| {
                parse_namespace(v.namespace()).is_some_and(|parts| {
                    parts.dimension == target.dimension
                        && parts.schema_version < self.config.schema_version
                })
            })
            .map(|v| v.id.clone())
            .collect();
        if superseded.is_empty() {
            return Ok(0);
        }

        let removed = self.storage.remove_ids(&superseded).await?;
        debug!("Removed {} superseded vectors of {}", removed, path);
        Ok(removed)
    }

    async fn store_placeholder(
        &self,
        path: &str,
        mtime: i64,
        hash: String,
        target: &Target,
    ) -> Result<()> {
        debug!("Storing empty placeholder for {}", path);
        let metadata = VectorMetadata {
            title: title_for(path),
            mtime,
            content_hash: hash,
            is_empty: true,
            provider: self.provider.provider_id().to_string(),
            model: self.provider.model().to_string(),
            dimension: target.dimension,
            created_at: Utc::now().timestamp_millis(),
            namespace: target.namespace.clone(),
            complete: true,
            chunk_count: Some(1),
            ..VectorMetadata::default()
        };
        let placeholder = EmbeddingVector::new(path, 0, vec![0.0; target.dimension], metadata);
        let keep = HashSet::from([placeholder.id.clone()]);

        self.storage.store_vectors(vec![placeholder]).await?;
        self.storage
            .remove_by_path_except_ids(path, &target.namespace, &keep)
            .await?;
        self.remove_superseded(path, target).await?;
        Ok(())
    }
}

/// File name without its extension
fn title_for(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}
