// Database module
// SQLite persistence for chunk vectors plus the cached storage layer built on it

pub mod sqlite;
pub mod storage;

use thiserror::Error;

pub use sqlite::{Database, DbPool, EmbeddingQueries, EmbeddingRow};
pub use storage::{EmbeddingStorage, EmbeddingVector, PurgeReport, UpgradeReport, VectorMetadata};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
