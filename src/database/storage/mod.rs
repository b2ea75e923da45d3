// Embedding storage: durable SQLite rows mirrored by an in-memory index.
//
// The cache is only touched after the surrounding transaction commits, so a
// failed write leaves both the database and the cache as they were.


use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::sqlite::{Database, EmbeddingQueries, EmbeddingRow};
use super::{StorageError, StorageResult};
use crate::embeddings::namespace::{
    build_namespace, build_vector_id, canonicalize_namespace, normalize_segment, parse_namespace,
    parse_vector_id, prefix_range,
};
use crate::embeddings::vector_math::{self, VectorEncoding};

/// Schema version assigned to records written before namespaces were versioned
const LEGACY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorMetadata {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub mtime: i64,
    pub content_hash: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_empty: bool,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub created_at: i64,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_path: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_length: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
}

/// One stored chunk vector
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub id: String,
    pub path: String,
    pub chunk_id: u32,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

impl EmbeddingVector {
    /// Build a record whose id is derived from `metadata.namespace`, `path` and `chunk_id`
    #[inline]
    pub fn new(path: &str, chunk_id: u32, vector: Vec<f32>, metadata: VectorMetadata) -> Self {
        Self {
            id: build_vector_id(&metadata.namespace, path, chunk_id),
            path: path.to_string(),
            chunk_id,
            vector,
            metadata,
        }
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    #[inline]
    pub const fn is_root(&self) -> bool {
        self.chunk_id == 0
    }

    /// Re-key the record under a different namespace, path or chunk index
    #[inline]
    pub fn rekeyed(&self, namespace: &str, path: &str, chunk_id: u32) -> Self {
        let mut moved = self.clone();
        moved.metadata.namespace = namespace.to_string();
        moved.path = path.to_string();
        moved.chunk_id = chunk_id;
        moved.id = build_vector_id(namespace, path, chunk_id);
        moved
    }

    /// Check the id, namespace and dimension agree
    fn check_consistency(&self) -> StorageResult<()> {
        let invalid = |reason: String| StorageError::InvalidRecord {
            id: self.id.clone(),
            reason,
        };

        let parts = parse_vector_id(&self.id).ok_or_else(|| invalid("malformed id".to_string()))?;
        if parts.namespace != self.metadata.namespace
            || parts.path != self.path
            || parts.chunk_id != self.chunk_id
        {
            return Err(invalid("id does not match namespace, path and chunk".to_string()));
        }
        if self.metadata.dimension != self.vector.len() {
            return Err(invalid(format!(
                "dimension {} does not match vector length {}",
                self.metadata.dimension,
                self.vector.len()
            )));
        }

        let namespace = parse_namespace(&self.metadata.namespace)
            .ok_or_else(|| invalid(format!("malformed namespace {}", self.metadata.namespace)))?;
        if namespace.dimension != self.vector.len() {
            return Err(invalid(format!(
                "namespace dimension {} does not match vector length {}",
                namespace.dimension,
                self.vector.len()
            )));
        }
        if namespace.provider != normalize_segment(&self.metadata.provider)
            || namespace.model != normalize_segment(&self.metadata.model)
        {
            return Err(invalid(format!(
                "namespace {} does not match provider {} and model {}",
                self.metadata.namespace, self.metadata.provider, self.metadata.model
            )));
        }
        Ok(())
    }

    fn to_row(&self) -> StorageResult<EmbeddingRow> {
        Ok(EmbeddingRow {
            id: self.id.clone(),
            path: self.path.clone(),
            namespace: self.metadata.namespace.clone(),
            chunk_id: i64::from(self.chunk_id),
            mtime: self.metadata.mtime,
            content_hash: self.metadata.content_hash.clone(),
            vector: vector_math::to_bytes(&self.vector),
            metadata: serde_json::to_string(&self.metadata)?,
        })
    }

    fn from_row(row: &EmbeddingRow) -> StorageResult<(Self, VectorEncoding)> {
        let invalid = |reason: &str| StorageError::InvalidRecord {
            id: row.id.clone(),
            reason: reason.to_string(),
        };

        let (vector, encoding) = vector_math::from_bytes(&row.vector)
            .ok_or_else(|| invalid("vector buffer is not a float array"))?;
        let metadata: VectorMetadata = serde_json::from_str(&row.metadata)?;
        let chunk_id = u32::try_from(row.chunk_id).map_err(|_| invalid("negative chunk id"))?;

        Ok((
            Self {
                id: row.id.clone(),
                path: row.path.clone(),
                chunk_id,
                vector,
                metadata,
            },
            encoding,
        ))
    }
}

/// Outcome of [`EmbeddingStorage::purge_corrupted_vectors`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub scanned: usize,
    pub corrected: usize,
    pub removed: usize,
    /// Paths whose vectors were re-normalized in place
    pub corrected_paths: Vec<String>,
    /// Paths that lost vectors and need re-indexing
    pub removed_paths: Vec<String>,
}

/// Outcome of [`EmbeddingStorage::upgrade_vectors_to_canonical_format`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    pub scanned: usize,
    pub rewritten: usize,
    pub rekeyed: usize,
    pub skipped: usize,
}

/// Derived snapshot of every cached vector
#[derive(Debug, Clone)]
enum SnapshotState {
    Clean(Arc<Vec<Arc<EmbeddingVector>>>),
    Dirty,
    Rebuilding,
}

#[derive(Debug, Default)]
struct CacheIndex {
    by_id: BTreeMap<String, Arc<EmbeddingVector>>,
    by_path: BTreeMap<String, BTreeSet<String>>,
    by_namespace: BTreeMap<String, BTreeSet<String>>,
    /// Rows that could not be decoded: id -> path
    unreadable: BTreeMap<String, String>,
}

impl CacheIndex {
    fn insert(&mut self, vector: Arc<EmbeddingVector>) {
        if let Some(previous) = self.by_id.remove(&vector.id) {
            self.unlink(&previous);
        }
        self.unreadable.remove(&vector.id);
        self.by_path
            .entry(vector.path.clone())
            .or_default()
            .insert(vector.id.clone());
        self.by_namespace
            .entry(vector.metadata.namespace.clone())
            .or_default()
            .insert(vector.id.clone());
        self.by_id.insert(vector.id.clone(), vector);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<EmbeddingVector>> {
        self.unreadable.remove(id);
        let vector = self.by_id.remove(id)?;
        self.unlink(&vector);
        Some(vector)
    }

    fn unlink(&mut self, vector: &EmbeddingVector) {
        if let Some(ids) = self.by_path.get_mut(&vector.path) {
            ids.remove(&vector.id);
            if ids.is_empty() {
                self.by_path.remove(&vector.path);
            }
        }
        if let Some(ids) = self.by_namespace.get_mut(&vector.metadata.namespace) {
            ids.remove(&vector.id);
            if ids.is_empty() {
                self.by_namespace.remove(&vector.metadata.namespace);
            }
        }
    }

    fn ids_for_path(&self, path: &str) -> Vec<String> {
        self.by_path
            .get(path)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        let (lower, upper) = prefix_range(prefix);
        self.by_path
            .range(lower..upper)
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn namespaces_with_prefix(&self, prefix: &str) -> Vec<String> {
        let (lower, upper) = prefix_range(prefix);
        self.by_namespace
            .range(lower..upper)
            .map(|(namespace, _)| namespace.clone())
            .collect()
    }

    fn collect(&self, ids: &BTreeSet<String>) -> Vec<Arc<EmbeddingVector>> {
        ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect()
    }
}

#[derive(Debug)]
struct CacheState {
    index: CacheIndex,
    snapshot: SnapshotState,
}

/// Durable vector store with an in-memory read path
#[derive(Debug)]
pub struct EmbeddingStorage {
    database: Database,
    cache: RwLock<CacheState>,
    // Serializes transactions with their cache updates
    write_lock: Mutex<()>,
}

impl EmbeddingStorage {
    /// Open the database at `path` and load every vector into memory
    #[inline]
    pub async fn open(path: &Path) -> StorageResult<Self> {
        Self::from_database(Database::new(path).await?).await
    }

    /// Open `embeddings.db` inside `base_dir`
    #[inline]
    pub async fn open_in_dir(base_dir: &Path) -> StorageResult<Self> {
        Self::from_database(Database::initialize_from_dir(base_dir).await?).await
    }

    #[inline]
    pub async fn from_database(database: Database) -> StorageResult<Self> {
        let storage = Self {
            database,
            cache: RwLock::new(CacheState {
                index: CacheIndex::default(),
                snapshot: SnapshotState::Dirty,
            }),
            write_lock: Mutex::new(()),
        };
        storage.reload().await?;
        Ok(storage)
    }

    #[inline]
    pub const fn database(&self) -> &Database {
        &self.database
    }

    /// Rebuild the in-memory index from the database
    #[inline]
    pub async fn reload(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> StorageResult<()> {
        self.write_cache().snapshot = SnapshotState::Rebuilding;

        let rows = match EmbeddingQueries::list_all(self.database.pool()).await {
            Ok(rows) => rows,
            Err(e) => {
                self.write_cache().snapshot = SnapshotState::Dirty;
                return Err(e);
            }
        };

        let mut index = CacheIndex::default();
        for row in &rows {
            match EmbeddingVector::from_row(row) {
                Ok((vector, _)) => index.insert(Arc::new(vector)),
                Err(e) => {
                    warn!("Skipping unreadable vector {}: {}", row.id, e);
                    index.unreadable.insert(row.id.clone(), row.path.clone());
                }
            }
        }

        info!(
            "Loaded {} vectors ({} unreadable)",
            index.by_id.len(),
            index.unreadable.len()
        );

        let mut cache = self.write_cache();
        cache.index = index;
        cache.snapshot = SnapshotState::Dirty;
        Ok(())
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply committed changes to the cache
    fn apply(&self, removed: &[String], stored: Vec<EmbeddingVector>) {
        let mut cache = self.write_cache();
        for id in removed {
            cache.index.remove(id);
        }
        for vector in stored {
            cache.index.insert(Arc::new(vector));
        }
        if !matches!(cache.snapshot, SnapshotState::Rebuilding) {
            cache.snapshot = SnapshotState::Dirty;
        }
    }

    /// Delete `removed` ids and upsert `stored` records in one transaction, then update the cache
    async fn commit(
        &self,
        removed: Vec<String>,
        stored: Vec<EmbeddingVector>,
    ) -> StorageResult<()> {
        if removed.is_empty() && stored.is_empty() {
            return Ok(());
        }

        let rows = stored.iter().map(EmbeddingVector::to_row).collect::<StorageResult<Vec<_>>>()?;

        let mut transaction = self.database.pool().begin().await?;
        for id in &removed {
            EmbeddingQueries::delete_by_id(&mut transaction, id).await?;
        }
        for row in &rows {
            EmbeddingQueries::upsert(&mut transaction, row).await?;
        }
        transaction.commit().await?;

        debug!(
            "Committed {} removals and {} writes",
            removed.len(),
            stored.len()
        );
        self.apply(&removed, stored);
        Ok(())
    }

    /// Persist `vectors` atomically: either all are stored or none
    #[inline]
    pub async fn store_vectors(&self, vectors: Vec<EmbeddingVector>) -> StorageResult<()> {
        for vector in &vectors {
            vector.check_consistency()?;
        }
        let _guard = self.write_lock.lock().await;
        self.commit(Vec::new(), vectors).await
    }

    /// Every vector for `path`, ordered by namespace then chunk
    #[inline]
    pub fn get_vectors_by_path(&self, path: &str) -> Vec<Arc<EmbeddingVector>> {
        let cache = self.read_cache();
        let mut vectors = cache
            .index
            .by_path
            .get(path)
            .map(|ids| cache.index.collect(ids))
            .unwrap_or_default();
        vectors.sort_by(|a, b| {
            a.metadata
                .namespace
                .cmp(&b.metadata.namespace)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        vectors
    }

    #[inline]
    pub fn get_vector(&self, id: &str) -> Option<Arc<EmbeddingVector>> {
        self.read_cache().index.by_id.get(id).cloned()
    }

    /// Snapshot of every cached vector, rebuilt only after a write
    #[inline]
    pub fn get_all_vectors(&self) -> Arc<Vec<Arc<EmbeddingVector>>> {
        if let SnapshotState::Clean(snapshot) = &self.read_cache().snapshot {
            return Arc::clone(snapshot);
        }

        let mut cache = self.write_cache();
        if let SnapshotState::Clean(snapshot) = &cache.snapshot {
            return Arc::clone(snapshot);
        }
        let snapshot = Arc::new(cache.index.by_id.values().cloned().collect::<Vec<_>>());
        if matches!(cache.snapshot, SnapshotState::Dirty) {
            cache.snapshot = SnapshotState::Clean(Arc::clone(&snapshot));
        }
        snapshot
    }

    #[inline]
    pub fn get_vectors_by_namespace(&self, namespace: &str) -> Vec<Arc<EmbeddingVector>> {
        let cache = self.read_cache();
        cache
            .index
            .by_namespace
            .get(namespace)
            .map(|ids| cache.index.collect(ids))
            .unwrap_or_default()
    }

    #[inline]
    pub fn get_vectors_by_namespace_prefix(&self, prefix: &str) -> Vec<Arc<EmbeddingVector>> {
        let cache = self.read_cache();
        let (lower, upper) = prefix_range(prefix);
        cache
            .index
            .by_namespace
            .range(lower..upper)
            .flat_map(|(_, ids)| cache.index.collect(ids))
            .collect()
    }

    /// Number of cached (readable) vectors
    #[inline]
    pub fn count(&self) -> usize {
        self.read_cache().index.by_id.len()
    }

    /// Rows that could not be decoded and will be dropped by the next purge
    #[inline]
    pub fn unreadable_count(&self) -> usize {
        self.read_cache().index.unreadable.len()
    }

    /// Vector count per namespace
    #[inline]
    pub fn namespaces(&self) -> Vec<(String, usize)> {
        self.read_cache()
            .index
            .by_namespace
            .iter()
            .map(|(namespace, ids)| (namespace.clone(), ids.len()))
            .collect()
    }

    /// Distinct paths with at least one vector
    #[inline]
    pub fn paths(&self) -> Vec<String> {
        self.read_cache().index.by_path.keys().cloned().collect()
    }

    #[inline]
    pub async fn remove_ids(&self, ids: &[String]) -> StorageResult<usize> {
        let _guard = self.write_lock.lock().await;
        let existing: Vec<String> = {
            let cache = self.read_cache();
            ids.iter()
                .filter(|id| {
                    cache.index.by_id.contains_key(*id) || cache.index.unreadable.contains_key(*id)
                })
                .cloned()
                .collect()
        };
        let count = existing.len();
        self.commit(existing, Vec::new()).await?;
        Ok(count)
    }

    #[inline]
    pub async fn remove_by_path(&self, path: &str) -> StorageResult<usize> {
        let _guard = self.write_lock.lock().await;

        let mut transaction = self.database.pool().begin().await?;
        let removed = EmbeddingQueries::delete_by_path(&mut transaction, path).await?;
        transaction.commit().await?;

        let mut ids = self.read_cache().index.ids_for_path(path);
        ids.extend(self.unreadable_ids(|p| p == path));
        self.apply(&ids, Vec::new());

        debug!("Removed {} vectors for {}", removed, path);
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    /// Remove vectors of `path` in `namespace` whose ids are not in `keep_ids`
    #[inline]
    pub async fn remove_by_path_except_ids(
        &self,
        path: &str,
        namespace: &str,
        keep_ids: &HashSet<String>,
    ) -> StorageResult<usize> {
        let _guard = self.write_lock.lock().await;
        let stale: Vec<String> = {
            let cache = self.read_cache();
            cache
                .index
                .ids_for_path(path)
                .into_iter()
                .filter(|id| !keep_ids.contains(id))
                .filter(|id| {
                    cache
                        .index
                        .by_id
                        .get(id)
                        .is_some_and(|v| v.metadata.namespace == namespace)
                })
                .collect()
        };
        let count = stale.len();
        self.commit(stale, Vec::new()).await?;
        Ok(count)
    }

    /// Remove every vector whose namespace starts with `prefix`
    #[inline]
    pub async fn remove_by_namespace_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let _guard = self.write_lock.lock().await;
        let (lower, upper) = prefix_range(prefix);

        let mut transaction = self.database.pool().begin().await?;
        let removed =
            EmbeddingQueries::delete_by_namespace_range(&mut transaction, &lower, &upper).await?;
        transaction.commit().await?;

        let ids: Vec<String> = {
            let cache = self.read_cache();
            cache
                .index
                .namespaces_with_prefix(prefix)
                .iter()
                .filter_map(|namespace| cache.index.by_namespace.get(namespace))
                .flat_map(|ids| ids.iter().cloned())
                .collect()
        };
        self.apply(&ids, Vec::new());

        info!("Removed {} vectors under namespace prefix {}", removed, prefix);
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    /// Remove every vector below directory `dir`
    #[inline]
    pub async fn remove_by_directory(&self, dir: &str) -> StorageResult<usize> {
        let prefix = directory_prefix(dir);
        let _guard = self.write_lock.lock().await;
        let (lower, upper) = prefix_range(&prefix);

        let mut transaction = self.database.pool().begin().await?;
        let removed =
            EmbeddingQueries::delete_by_path_range(&mut transaction, &lower, &upper).await?;
        transaction.commit().await?;

        let mut ids: Vec<String> = {
            let cache = self.read_cache();
            cache
                .index
                .paths_with_prefix(&prefix)
                .iter()
                .flat_map(|path| cache.index.ids_for_path(path))
                .collect()
        };
        ids.extend(self.unreadable_ids(|p| p.starts_with(&prefix)));
        self.apply(&ids, Vec::new());

        info!("Removed {} vectors under {}", removed, prefix);
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    /// Re-key every vector of `old_path` to `new_path`, replacing whatever `new_path` held
    #[inline]
    pub async fn rename_by_path(&self, old_path: &str, new_path: &str) -> StorageResult<usize> {
        if old_path == new_path {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let (removed, stored) = {
            let cache = self.read_cache();
            let mut removed = cache.index.ids_for_path(new_path);
            let mut stored = Vec::new();
            for id in cache.index.ids_for_path(old_path) {
                if let Some(vector) = cache.index.by_id.get(&id) {
                    let namespace = &vector.metadata.namespace;
                    stored.push(vector.rekeyed(namespace, new_path, vector.chunk_id));
                    removed.push(id);
                }
            }
            (removed, stored)
        };

        let count = stored.len();
        self.commit(removed, stored).await?;
        debug!("Renamed {} vectors from {} to {}", count, old_path, new_path);
        Ok(count)
    }

    /// Move every vector below `old_dir` under `new_dir`, replacing whatever
    /// `new_dir` held
    #[inline]
    pub async fn rename_by_directory(&self, old_dir: &str, new_dir: &str) -> StorageResult<usize> {
        let old_prefix = directory_prefix(old_dir);
        let new_prefix = directory_prefix(new_dir);
        if old_prefix == new_prefix {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let (lower, upper) = prefix_range(&old_prefix);
        let rows =
            EmbeddingQueries::list_by_path_range(self.database.pool(), &lower, &upper).await?;

        let mut removed: Vec<String> = {
            let cache = self.read_cache();
            cache
                .index
                .paths_with_prefix(&new_prefix)
                .iter()
                .flat_map(|path| cache.index.ids_for_path(path))
                .collect()
        };
        removed.extend(self.unreadable_ids(|p| p.starts_with(&new_prefix)));
        let mut stored = Vec::with_capacity(rows.len());
        for row in &rows {
            removed.push(row.id.clone());
            let Some(relative) = row.path.strip_prefix(&old_prefix) else {
                continue;
            };
            match EmbeddingVector::from_row(row) {
                Ok((vector, _)) => {
                    let new_path = format!("{new_prefix}{relative}");
                    let namespace = &vector.metadata.namespace;
                    stored.push(vector.rekeyed(namespace, &new_path, vector.chunk_id));
                }
                Err(e) => warn!("Dropping unreadable vector {} during rename: {}", row.id, e),
            }
        }

        let count = stored.len();
        self.commit(removed, stored).await?;
        info!("Moved {} vectors from {} to {}", count, old_prefix, new_prefix);
        Ok(count)
    }

    /// Re-key one vector. Returns false when `old_id` does not exist.
    #[inline]
    pub async fn move_vector_id(&self, old_id: &str, new_id: &str) -> StorageResult<bool> {
        let moved = self.move_vector_ids(&[(old_id.to_string(), new_id.to_string())]).await?;
        Ok(moved == 1)
    }

    /// Re-key several vectors in one transaction. Sources are read before any
    /// write, so chains such as `#0 -> #1, #1 -> #2` are safe.
    #[inline]
    pub async fn move_vector_ids(&self, moves: &[(String, String)]) -> StorageResult<usize> {
        let _guard = self.write_lock.lock().await;
        let mut removed = Vec::new();
        let mut stored = Vec::new();
        {
            let cache = self.read_cache();
            for (old_id, new_id) in moves {
                let Some(vector) = cache.index.by_id.get(old_id) else {
                    continue;
                };
                let parts = parse_vector_id(new_id).ok_or_else(|| StorageError::InvalidRecord {
                    id: new_id.clone(),
                    reason: "malformed id".to_string(),
                })?;
                if let Some(target) = parse_namespace(&parts.namespace) {
                    if target.dimension != vector.vector.len() {
                        return Err(StorageError::InvalidRecord {
                            id: new_id.clone(),
                            reason: format!(
                                "namespace dimension {} does not match vector length {}",
                                target.dimension,
                                vector.vector.len()
                            ),
                        });
                    }
                }
                removed.push(old_id.clone());
                stored.push(vector.rekeyed(&parts.namespace, &parts.path, parts.chunk_id));
            }
        }

        // A source that is also a destination must survive the delete pass
        let destinations: HashSet<&str> = stored.iter().map(|v| v.id.as_str()).collect();
        let removed: Vec<String> = removed
            .into_iter()
            .filter(|id| !destinations.contains(id.as_str()))
            .collect();

        let count = stored.len();
        self.commit(removed, stored).await?;
        Ok(count)
    }

    /// Namespace under `prefix` (other than `exclude`) holding vectors for `path`,
    /// preferring the one whose root vector was modified most recently
    #[inline]
    pub fn find_prior_namespace(&self, path: &str, prefix: &str, exclude: &str) -> Option<String> {
        let cache = self.read_cache();
        let ids = cache.index.by_path.get(path)?;

        let mut best: Option<(i64, String)> = None;
        for vector in cache.index.collect(ids) {
            let namespace = &vector.metadata.namespace;
            if namespace == exclude || !namespace.starts_with(prefix) || !vector.is_root() {
                continue;
            }
            let mtime = vector.metadata.mtime;
            if best.as_ref().is_none_or(|(best_mtime, _)| mtime > *best_mtime) {
                best = Some((mtime, namespace.clone()));
            }
        }
        best.map(|(_, namespace)| namespace)
    }

    /// Repair or drop vectors that fail validation.
    ///
    /// Off-unit vectors are re-normalized; non-finite, empty, dimensionless or
    /// hash-less records (and undecodable rows) are removed.
    #[inline]
    pub async fn purge_corrupted_vectors(&self) -> StorageResult<PurgeReport> {
        let _guard = self.write_lock.lock().await;
        let mut report = PurgeReport::default();
        let mut removed = Vec::new();
        let mut corrected = Vec::new();
        let mut removed_paths = BTreeSet::new();
        let mut corrected_paths = BTreeSet::new();

        {
            let cache = self.read_cache();
            report.scanned = cache.index.by_id.len() + cache.index.unreadable.len();

            for (id, path) in &cache.index.unreadable {
                removed.push(id.clone());
                removed_paths.insert(path.clone());
            }

            for vector in cache.index.by_id.values() {
                match validate_vector(vector) {
                    Validation::Valid => {}
                    Validation::Renormalize(fixed) => {
                        let mut repaired = EmbeddingVector::clone(vector);
                        repaired.vector = fixed;
                        corrected_paths.insert(repaired.path.clone());
                        corrected.push(repaired);
                    }
                    Validation::Remove(reason) => {
                        debug!("Removing corrupted vector {}: {}", vector.id, reason);
                        removed.push(vector.id.clone());
                        removed_paths.insert(vector.path.clone());
                    }
                }
            }
        }

        report.corrected = corrected.len();
        report.removed = removed.len();
        report.corrected_paths = corrected_paths.into_iter().collect();
        report.removed_paths = removed_paths.into_iter().collect();

        self.commit(removed, corrected).await?;

        if report.corrected > 0 || report.removed > 0 {
            warn!(
                "Purge corrected {} and removed {} of {} vectors",
                report.corrected, report.removed, report.scanned
            );
        } else {
            info!("Purge found no corrupted vectors in {}", report.scanned);
        }
        Ok(report)
    }

    /// Rewrite every row into canonical form: little-endian float buffer,
    /// unit-normalized, `dimension` equal to the vector length, and namespace
    /// and id rebuilt from normalized provider/model segments.
    #[inline]
    pub async fn upgrade_vectors_to_canonical_format(&self) -> StorageResult<UpgradeReport> {
        let _guard = self.write_lock.lock().await;
        let rows = EmbeddingQueries::list_all(self.database.pool()).await?;
        let mut report = UpgradeReport {
            scanned: rows.len(),
            ..UpgradeReport::default()
        };

        let mut removed = Vec::new();
        let mut stored = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();

        for row in &rows {
            let Ok((vector, encoding)) = EmbeddingVector::from_row(row) else {
                report.skipped += 1;
                continue;
            };
            let Some(canonical) = canonicalize_record(&vector) else {
                debug!("Cannot derive a namespace for {}", vector.id);
                report.skipped += 1;
                continue;
            };

            let rekeyed = canonical.id != vector.id;
            if rekeyed && !claimed.insert(canonical.id.clone()) {
                // Another row already maps onto this id
                removed.push(vector.id.clone());
                report.skipped += 1;
                continue;
            }
            claimed.insert(canonical.id.clone());

            if rekeyed || canonical != vector || encoding == VectorEncoding::LegacyJson {
                if rekeyed {
                    removed.push(vector.id.clone());
                    report.rekeyed += 1;
                }
                report.rewritten += 1;
                stored.push(canonical);
            }
        }

        let destinations: HashSet<&str> = stored.iter().map(|v| v.id.as_str()).collect();
        let removed: Vec<String> = removed
            .into_iter()
            .filter(|id| !destinations.contains(id.as_str()))
            .collect();

        let rows = stored.iter().map(EmbeddingVector::to_row).collect::<StorageResult<Vec<_>>>()?;
        let mut transaction = self.database.pool().begin().await?;
        for id in &removed {
            EmbeddingQueries::delete_by_id(&mut transaction, id).await?;
        }
        for row in &rows {
            EmbeddingQueries::upsert(&mut transaction, row).await?;
        }
        transaction.commit().await?;

        info!(
            "Upgrade rewrote {} of {} vectors ({} re-keyed, {} skipped)",
            report.rewritten, report.scanned, report.rekeyed, report.skipped
        );

        self.reload_locked().await?;
        Ok(report)
    }

    /// VACUUM and ANALYZE the underlying database
    #[inline]
    pub async fn optimize(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.database.optimize().await
    }

    fn unreadable_ids(&self, matches: impl Fn(&str) -> bool) -> Vec<String> {
        self.read_cache()
            .index
            .unreadable
            .iter()
            .filter(|(_, path)| matches(path))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

enum Validation {
    Valid,
    Renormalize(Vec<f32>),
    Remove(&'static str),
}

fn validate_vector(vector: &EmbeddingVector) -> Validation {
    let metadata = &vector.metadata;
    if metadata.content_hash.is_empty() {
        return Validation::Remove("missing content hash");
    }
    if metadata.namespace.is_empty() {
        return Validation::Remove("missing namespace");
    }
    if !vector_math::all_finite(&vector.vector) {
        return Validation::Remove("non-finite component");
    }
    if metadata.is_empty {
        return Validation::Valid;
    }
    if metadata.dimension == 0 || vector.vector.is_empty() {
        return Validation::Remove("zero dimension");
    }
    if metadata.dimension != vector.vector.len() {
        return Validation::Remove("dimension does not match vector length");
    }
    if vector_math::is_unit_length(&vector.vector) {
        return Validation::Valid;
    }
    match vector_math::normalize(&vector.vector) {
        Some(fixed) => Validation::Renormalize(fixed),
        None => Validation::Remove("zero-norm vector"),
    }
}

/// Canonical form of `vector`, or `None` when no namespace can be derived
fn canonicalize_record(vector: &EmbeddingVector) -> Option<EmbeddingVector> {
    let mut canonical = vector.clone();
    if !canonical.metadata.is_empty && !vector_math::is_unit_length(&canonical.vector) {
        if let Some(fixed) = vector_math::normalize(&canonical.vector) {
            canonical.vector = fixed;
        }
    }
    let dimension = canonical.vector.len();
    canonical.metadata.dimension = dimension;

    let namespace = canonicalize_namespace(&canonical.metadata.namespace, dimension)
        .or_else(|| {
            parse_vector_id(&canonical.id)
                .and_then(|parts| canonicalize_namespace(&parts.namespace, dimension))
        })
        .or_else(|| {
            let metadata = &canonical.metadata;
            (!metadata.provider.is_empty() && !metadata.model.is_empty()).then(|| {
                build_namespace(
                    &metadata.provider,
                    &metadata.model,
                    LEGACY_SCHEMA_VERSION,
                    dimension,
                )
            })
        })?;

    if let Some(parts) = parse_namespace(&namespace) {
        canonical.metadata.provider = parts.provider;
        canonical.metadata.model = parts.model;
    } else {
        canonical.metadata.provider = normalize_segment(&canonical.metadata.provider);
        canonical.metadata.model = normalize_segment(&canonical.metadata.model);
    }

    let path = canonical.path.clone();
    let chunk_id = canonical.chunk_id;
    Some(canonical.rekeyed(&namespace, &path, chunk_id))
}

/// Normalize a directory to a `dir/` prefix
fn directory_prefix(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    format!("{trimmed}/")
}
