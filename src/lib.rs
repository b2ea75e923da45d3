use thiserror::Error;

use crate::config::ConfigError;
use crate::database::StorageError;
use crate::embeddings::provider::ProviderError;

pub type Result<T> = std::result::Result<T, SemvaultError>;

#[derive(Error, Debug)]
pub enum SemvaultError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Embedding provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod indexer;
pub mod search;
