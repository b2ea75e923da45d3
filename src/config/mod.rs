// Configuration management module
// TOML settings plus helpers for showing and initializing them

pub mod settings;

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use console::style;
use std::fmt::Write as _;
use std::path::Path;

pub use settings::{BASE_DIR_ENV, CONFIG_FILE, Config, ConfigError, ProviderConfig};

/// Human-readable summary of `config`, with the API key masked
#[inline]
pub fn render_config(config: &Config) -> String {
    let provider = &config.provider;
    let mut out = String::new();

    let _ = writeln!(out, "{}", style("Current Configuration").bold().cyan());
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", style("Provider:").bold().yellow());
    let _ = writeln!(out, "  Id: {}", style(&provider.id).cyan());
    match provider.endpoint_url() {
        Ok(url) => {
            let _ = writeln!(out, "  Endpoint: {}", style(url).cyan());
        }
        Err(e) => {
            let _ = writeln!(out, "  Endpoint: {} ({})", style("Invalid").red(), e);
        }
    }
    let _ = writeln!(out, "  Model: {}", style(&provider.model).cyan());
    let _ = writeln!(
        out,
        "  Dialect: {}",
        style(format!("{:?}", provider.dialect.resolve(&provider.endpoint))).cyan()
    );
    let api_key = if provider.api_key().is_some() { "set" } else { "not set" };
    let _ = writeln!(out, "  API key: {}", style(api_key).cyan());
    let dimension = provider
        .dimension()
        .map_or_else(|| "learned from first response".to_string(), |d| d.to_string());
    let _ = writeln!(out, "  Dimension: {}", style(dimension).cyan());
    let _ = writeln!(
        out,
        "  Batch size: {} / concurrency: {}",
        style(provider.max_batch_size).cyan(),
        style(provider.max_concurrency).cyan()
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", style("Processing:").bold().yellow());
    let _ = writeln!(
        out,
        "  Target chunk: {} chars ({}% overlap)",
        style(config.chunking.target_chunk_chars).cyan(),
        style((config.chunking.overlap_ratio * 100.0).round()).cyan()
    );
    let _ = writeln!(
        out,
        "  Batch size: {} / concurrency: {}",
        style(config.processor.batch_size).cyan(),
        style(config.processor.max_concurrency).cyan()
    );
    let _ = writeln!(out, "  Schema version: {}", style(config.processor.schema_version).cyan());
    let _ = writeln!(
        out,
        "  Similarity floor: {}",
        style(config.search.min_similarity).cyan()
    );

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
    out
}

#[inline]
pub fn show_config(config: &Config) {
    eprint!("{}", render_config(config));
}

/// Write a default `config.toml` into `base_dir` unless one exists.
/// Returns the effective configuration and whether a file was created.
#[inline]
pub fn init_config(base_dir: &Path) -> Result<(Config, bool)> {
    let config = Config::load(base_dir).context("Failed to load configuration")?;
    if config.config_file_path().exists() {
        return Ok((config, false));
    }

    config.save().context("Failed to save configuration")?;
    Ok((config, true))
}
