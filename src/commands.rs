use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::EmbeddingStorage;
use crate::embeddings::provider::transport::UreqTransport;
use crate::embeddings::provider::{EmbeddingsProvider, HttpEmbeddingsProvider};
use crate::embeddings::preprocess::ContentPreprocessor;
use crate::indexer::{EmbeddingsProcessor, FsDocumentSource, ProcessingResult};
use crate::search::SearchResult;

/// Open the embeddings store under the configured base directory
#[inline]
pub async fn open_storage(config: &Config) -> Result<Arc<EmbeddingStorage>> {
    let storage = EmbeddingStorage::open_in_dir(config.base_dir())
        .await
        .with_context(|| {
            format!(
                "Failed to open embeddings database: {}",
                config.database_path().display()
            )
        })?;
    Ok(Arc::new(storage))
}

#[inline]
pub fn build_provider(config: &Config) -> Arc<HttpEmbeddingsProvider> {
    let transport = Arc::new(UreqTransport::new(config.provider.timeout()));
    Arc::new(HttpEmbeddingsProvider::new(config.provider_options(), transport))
}

/// Processor over the documents below `root`
#[inline]
pub fn build_processor(
    config: &Config,
    storage: Arc<EmbeddingStorage>,
    root: &Path,
) -> EmbeddingsProcessor {
    EmbeddingsProcessor::new(
        storage,
        build_provider(config),
        Arc::new(FsDocumentSource::new(root)),
    )
    .with_preprocessor(ContentPreprocessor::new(config.chunking.clone()))
    .with_config(config.processor.clone())
    .with_search_config(config.search.clone())
    .with_dimension(config.provider.dimension())
}

/// Index every document below `dir`
#[inline]
pub async fn index_directory(config: &Config, dir: &Path) -> Result<ProcessingResult> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }
    info!("Indexing documents in {}", dir.display());

    let storage = open_storage(config).await?;
    let bar = if console::user_attended_stderr() {
        ProgressBar::new(0).with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] Embedding chunks {wide_bar}")
                .context("Invalid progress template")?,
        )
    } else {
        ProgressBar::hidden()
    };

    let progress_bar = bar.clone();
    let processor = build_processor(config, Arc::clone(&storage), dir).with_progress(Arc::new(
        move |done, total| {
            progress_bar.set_length(total as u64);
            progress_bar.set_position(done as u64);
        },
    ));

    let result = processor.index_all().await.context("Indexing failed")?;
    bar.finish_and_clear();

    print_processing_result(&result);
    Ok(result)
}

/// Search the index and print the best matches
#[inline]
pub async fn search_index(config: &Config, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
    let storage = open_storage(config).await?;
    let processor = build_processor(config, storage, config.base_dir());
    let results = processor.search(query, limit).await.context("Search failed")?;

    if results.is_empty() {
        println!("No results for \"{}\"", query);
        return Ok(results);
    }

    for (rank, result) in results.iter().enumerate() {
        println!(
            "{}. {} {} {}",
            rank + 1,
            style(&result.title).bold(),
            style(format!("({}#{})", result.path, result.chunk_id)).dim(),
            style(format!("{:.3}", result.score)).green()
        );
        if !result.excerpt.is_empty() {
            println!("   {}", result.excerpt);
        }
    }
    Ok(results)
}

/// Move stored vectors after a file or directory rename
#[inline]
pub async fn rename_path(config: &Config, old_path: &str, new_path: &str) -> Result<usize> {
    let storage = open_storage(config).await?;
    let processor = build_processor(config, storage, config.base_dir());
    let moved = processor
        .handle_rename(old_path, new_path)
        .await
        .with_context(|| format!("Failed to rename {old_path} to {new_path}"))?;

    println!("Moved {} vectors from {} to {}", moved, old_path, new_path);
    Ok(moved)
}

/// Drop stored vectors of a deleted file or directory
#[inline]
pub async fn remove_path(config: &Config, path: &str) -> Result<usize> {
    let storage = open_storage(config).await?;
    let processor = build_processor(config, storage, config.base_dir());
    let removed = processor
        .handle_delete(path)
        .await
        .with_context(|| format!("Failed to remove {path}"))?;

    println!("Removed {} vectors under {}", removed, path);
    Ok(removed)
}

#[inline]
pub async fn purge_corrupted(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;
    let report = storage
        .purge_corrupted_vectors()
        .await
        .context("Failed to purge corrupted vectors")?;

    println!("Scanned {} vectors", report.scanned);
    println!("  Corrected: {}", style(report.corrected).yellow());
    println!("  Removed: {}", style(report.removed).red());
    for path in &report.removed_paths {
        println!("  {} {}", style("-").red(), path);
    }
    if !report.removed_paths.is_empty() {
        println!("Re-run 'semvault index' to embed the affected documents again.");
    }
    Ok(())
}

#[inline]
pub async fn upgrade_vectors(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;
    let report = storage
        .upgrade_vectors_to_canonical_format()
        .await
        .context("Failed to upgrade stored vectors")?;
    storage
        .optimize()
        .await
        .context("Failed to optimize embeddings database")?;

    println!("Scanned {} vectors", report.scanned);
    println!("  Rewritten: {}", report.rewritten);
    println!("  Re-keyed: {}", report.rekeyed);
    println!("  Skipped: {}", report.skipped);
    Ok(())
}

/// Show storage and provider health
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    println!("{}", style("Semvault Status").bold().cyan());
    println!("{}", "=".repeat(50));
    println!();

    println!("Storage:");
    match open_storage(config).await {
        Ok(storage) => {
            println!("   {} {}", style("ok").green(), config.database_path().display());
            println!("   Vectors: {}", storage.count());
            println!("   Documents: {}", storage.paths().len());
            let unreadable = storage.unreadable_count();
            if unreadable > 0 {
                println!(
                    "   {} {} unreadable rows (run 'semvault purge')",
                    style("!").yellow(),
                    unreadable
                );
            }
            for (namespace, count) in storage.namespaces() {
                println!("   {namespace}: {count}");
            }
        }
        Err(e) => println!("   {} {:#}", style("failed").red(), e),
    }

    println!();
    println!("Embeddings provider:");
    let provider = build_provider(config);
    match provider.validate_configuration() {
        Ok(()) => match provider.health_check().await {
            Ok(dimension) => println!(
                "   {} {} at {} ({} dimensions)",
                style("ok").green(),
                provider.model(),
                config.provider.endpoint,
                dimension
            ),
            Err(e) => {
                warn!("Provider health check failed: {}", e);
                println!("   {} {}", style("unreachable").red(), e);
            }
        },
        Err(e) => println!("   {} {}", style("misconfigured").red(), e),
    }

    Ok(())
}

#[inline]
pub fn print_processing_result(result: &ProcessingResult) {
    if let Some(fatal) = &result.fatal_error {
        println!("{} {}", style("Indexing aborted:").red().bold(), fatal);
        return;
    }

    println!(
        "Indexed: {} completed, {} unchanged, {} failed",
        style(result.completed).green(),
        result.unchanged,
        style(result.failed).red()
    );
    println!(
        "Chunks: {} embedded, {} reused",
        result.embedded_chunks, result.reused_chunks
    );
    if result.removed_paths > 0 {
        println!("Removed {} vanished documents", result.removed_paths);
    }

    for failure in &result.failures {
        let location = failure
            .chunk_id
            .map_or_else(|| failure.path.clone(), |chunk| format!("{}#{}", failure.path, chunk));
        let hint = if failure.retryable { " (retryable)" } else { "" };
        println!(
            "  {} {} [{}] {}{}",
            style("x").red(),
            location,
            failure.code,
            failure.message,
            hint
        );
    }
}
