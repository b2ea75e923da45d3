
use super::models::EmbeddingRow;
use crate::database::StorageResult;
use sqlx::{SqliteConnection, SqlitePool};

const SELECT_COLUMNS: &str = "SELECT id, path, namespace, chunk_id, mtime, content_hash, \
     CAST(vector AS BLOB) AS vector, metadata FROM embeddings";

/// Statements over the `embeddings` table.
///
/// Reads run against the pool; writes take a connection so callers can group
/// them in a transaction.
pub struct EmbeddingQueries;

impl EmbeddingQueries {
    #[inline]
    pub async fn upsert(conn: &mut SqliteConnection, row: &EmbeddingRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO embeddings
                (id, path, namespace, chunk_id, mtime, content_hash, vector, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.path)
        .bind(&row.namespace)
        .bind(row.chunk_id)
        .bind(row.mtime)
        .bind(&row.content_hash)
        .bind(&row.vector)
        .bind(&row.metadata)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[inline]
    pub async fn delete_by_id(conn: &mut SqliteConnection, id: &str) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn delete_by_path(conn: &mut SqliteConnection, path: &str) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE path = ?")
            .bind(path)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete rows with `lower <= path < upper`
    #[inline]
    pub async fn delete_by_path_range(
        conn: &mut SqliteConnection,
        lower: &str,
        upper: &str,
    ) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE path >= ? AND path < ?")
            .bind(lower)
            .bind(upper)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete rows with `lower <= namespace < upper`
    #[inline]
    pub async fn delete_by_namespace_range(
        conn: &mut SqliteConnection,
        lower: &str,
        upper: &str,
    ) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE namespace >= ? AND namespace < ?")
            .bind(lower)
            .bind(upper)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> StorageResult<Vec<EmbeddingRow>> {
        let rows = sqlx::query_as::<_, EmbeddingRow>(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    /// Rows with `lower <= path < upper`, served by the path index
    #[inline]
    pub async fn list_by_path_range(
        pool: &SqlitePool,
        lower: &str,
        upper: &str,
    ) -> StorageResult<Vec<EmbeddingRow>> {
        let rows = sqlx::query_as::<_, EmbeddingRow>(&format!(
            "{SELECT_COLUMNS} WHERE path >= ? AND path < ? ORDER BY path, namespace, chunk_id"
        ))
        .bind(lower)
        .bind(upper)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
