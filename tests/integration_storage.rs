#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

use semvault::database::{Database, EmbeddingStorage, EmbeddingVector, VectorMetadata};
use semvault::embeddings::namespace::{build_namespace, build_vector_id, parse_namespace};
use semvault::embeddings::vector_math::{is_unit_length, normalize};
use semvault::search::{SearchConfig, find_similar};
use tempfile::TempDir;

fn record(namespace: &str, path: &str, chunk_id: u32, values: &[f32]) -> EmbeddingVector {
    let vector = normalize(values).expect("non-zero test vector");
    let parts = parse_namespace(namespace).expect("test namespace is well formed");
    let metadata = VectorMetadata {
        title: path.trim_end_matches(".md").to_string(),
        excerpt: Some(format!("Chunk {chunk_id} of {path}")),
        mtime: 1_700_000_000_000,
        content_hash: format!("{path}#{chunk_id}"),
        provider: parts.provider,
        model: parts.model,
        dimension: vector.len(),
        created_at: 1_700_000_000_000,
        namespace: namespace.to_string(),
        complete: chunk_id == 0,
        chunk_count: (chunk_id == 0).then_some(1),
        ..VectorMetadata::default()
    };
    EmbeddingVector::new(path, chunk_id, vector, metadata)
}

#[tokio::test]
async fn vectors_survive_reopening_and_namespaces_coexist() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let small = build_namespace("ollama", "nomic", 2, 2);
    let large = build_namespace("openai", "text-embedding-3-small", 2, 3);

    {
        let storage = EmbeddingStorage::open_in_dir(temp_dir.path())
            .await
            .expect("open storage");
        let mut batch = Vec::new();
        for i in 0..50 {
            batch.push(record(&small, &format!("notes/{i}.md"), 0, &[1.0, i as f32]));
        }
        batch.push(record(&large, "notes/0.md", 0, &[0.0, 1.0, 1.0]));
        storage.store_vectors(batch).await.expect("store batch");
        storage.database().close().await;
    }

    let storage = EmbeddingStorage::open_in_dir(temp_dir.path())
        .await
        .expect("reopen storage");
    assert_eq!(storage.count(), 51);
    assert_eq!(storage.namespaces(), vec![(small.clone(), 50), (large.clone(), 1)]);
    assert_eq!(storage.get_vectors_by_path("notes/0.md").len(), 2);
    assert_eq!(storage.get_vectors_by_namespace_prefix("ollama:").len(), 50);

    let restored = storage
        .get_vector(&build_vector_id(&small, "notes/3.md", 0))
        .expect("vector restored");
    assert!(is_unit_length(&restored.vector));
    assert!(restored.metadata.complete);

    // Only same-dimension vectors take part in a search
    let snapshot = storage.get_all_vectors();
    let query = normalize(&[1.0, 0.0]).expect("query");
    let results = find_similar(&query, &snapshot, 3, &SearchConfig::default());
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].path, "notes/0.md");
    assert!(results.iter().all(|r| r.id.starts_with(&small)));
}

#[tokio::test]
async fn purge_then_upgrade_leaves_a_clean_store() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::initialize_from_dir(temp_dir.path())
        .await
        .expect("open database");

    let namespace = build_namespace("ollama", "nomic", 2, 2);
    sqlx::query(
        "INSERT INTO embeddings \
         (id, path, namespace, chunk_id, mtime, content_hash, vector, metadata) \
         VALUES (?, 'broken.md', ?, 0, 1, 'x', X'0102', '{}')",
    )
    .bind(build_vector_id(&namespace, "broken.md", 0))
    .bind(&namespace)
    .execute(database.pool())
    .await
    .expect("insert undecodable row");

    let storage = EmbeddingStorage::from_database(database)
        .await
        .expect("load storage");
    assert_eq!(storage.count(), 0);
    assert_eq!(storage.unreadable_count(), 1);

    let mut off_unit = record(&namespace, "drift.md", 0, &[3.0, 4.0]);
    off_unit.vector = vec![3.0, 4.0];
    storage
        .store_vectors(vec![off_unit, record(&namespace, "fine.md", 0, &[1.0, 1.0])])
        .await
        .expect("store");

    let purge = storage.purge_corrupted_vectors().await.expect("purge");
    assert_eq!(purge.scanned, 3);
    assert_eq!(purge.corrected, 1);
    assert_eq!(purge.removed, 1);
    assert_eq!(purge.removed_paths, vec!["broken.md".to_string()]);
    assert_eq!(storage.unreadable_count(), 0);

    let repaired = storage
        .get_vector(&build_vector_id(&namespace, "drift.md", 0))
        .expect("repaired vector");
    assert!(is_unit_length(&repaired.vector));

    let upgrade = storage
        .upgrade_vectors_to_canonical_format()
        .await
        .expect("upgrade");
    assert_eq!(upgrade.scanned, 2);
    assert_eq!(upgrade.rewritten, 0);
    assert_eq!(upgrade.rekeyed, 0);
    assert_eq!(storage.count(), 2);
}
