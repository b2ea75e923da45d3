use sqlx::FromRow;

/// Raw `embeddings` row. `vector` is the encoded buffer and `metadata` the JSON document.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct EmbeddingRow {
    pub id: String,
    pub path: String,
    pub namespace: String,
    pub chunk_id: i64,
    pub mtime: i64,
    pub content_hash: String,
    pub vector: Vec<u8>,
    pub metadata: String,
}
