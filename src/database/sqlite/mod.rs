use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use super::StorageResult;


pub mod models;
pub mod queries;

pub use models::EmbeddingRow;
pub use queries::EmbeddingQueries;

pub type DbPool = Pool<Sqlite>;

/// File name of the vector database inside the base directory
pub const DATABASE_FILE: &str = "embeddings.db";

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    /// Open (creating if needed) the database file inside `base_dir`
    #[inline]
    pub async fn initialize_from_dir(base_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(base_dir)?;
        Self::new(base_dir.join(DATABASE_FILE)).await
    }

    /// Optimize database performance by running VACUUM and ANALYZE
    #[inline]
    pub async fn optimize(&self) -> StorageResult<()> {
        info!("Optimizing database performance");

        // Reclaims space left behind by bulk deletes and re-keys
        sqlx::query("VACUUM").execute(&self.pool).await?;

        sqlx::query("ANALYZE").execute(&self.pool).await?;

        debug!("Database optimization completed");
        Ok(())
    }

    #[inline]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
