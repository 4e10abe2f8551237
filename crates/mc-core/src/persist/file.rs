use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::PersistError;

use super::{sanitize_key, Persistence, QueryPredicate};

/// Recently read values kept in memory to spare repeated file reads.
const READ_CACHE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: String,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CollectionIndex {
    entries: Vec<IndexEntry>,
}

impl CollectionIndex {
    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Filesystem persistence backend.
///
/// Each collection is a directory under the base path; each key is one JSON
/// file. Writes go through a temp file followed by a rename so a failed
/// store leaves the prior value intact, and the file is fsynced before the
/// rename. Insertion order is kept in a per-collection `.index.json`, and
/// an LRU cache serves repeated reads without filesystem I/O.
pub struct FileStore {
    base_dir: PathBuf,
    indices: Mutex<HashMap<String, CollectionIndex>>,
    read_cache: Mutex<LruCache<(String, String), Value>>,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(READ_CACHE_CAPACITY).expect("capacity is non-zero");
        Self {
            base_dir: base_dir.into(),
            indices: Mutex::new(HashMap::new()),
            read_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Verify the base directory is usable. Called once at startup so the
    /// host process can exit with its persistence-unavailable code.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let store = Self::new(base_dir);
        tokio::fs::create_dir_all(&store.base_dir).await?;
        Ok(store)
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.base_dir.join(sanitize_key(collection))
    }

    fn entry_path(&self, collection: &str, key: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", sanitize_key(key)))
    }

    fn index_path(&self, collection: &str) -> PathBuf {
        self.collection_dir(collection).join(".index.json")
    }

    /// Load the index for a collection into memory if not already present.
    async fn ensure_index<'a>(
        &self,
        indices: &'a mut HashMap<String, CollectionIndex>,
        collection: &str,
    ) -> Result<&'a mut CollectionIndex, PersistError> {
        if !indices.contains_key(collection) {
            let path = self.index_path(collection);
            let index = match tokio::fs::read_to_string(&path).await {
                Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => CollectionIndex::default(),
                Err(e) => return Err(e.into()),
            };
            indices.insert(collection.to_string(), index);
        }
        Ok(indices.get_mut(collection).expect("index just inserted"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(bytes).await?;
        f.sync_all().await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn persist_index(&self, collection: &str, index: &CollectionIndex) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec(index)?;
        self.write_atomic(&self.index_path(collection), &bytes).await
    }

    async fn store_inner(
        &self,
        collection: &str,
        key: &str,
        value: Value,
        must_be_new: bool,
    ) -> Result<(), PersistError> {
        let mut indices = self.indices.lock().await;
        let index = self.ensure_index(&mut indices, collection).await?;

        let existing = index.position(key);
        if must_be_new && existing.is_some() {
            return Err(PersistError::Conflict {
                collection: collection.to_string(),
                key: key.to_string(),
                reason: "key already exists".to_string(),
            });
        }

        let bytes = serde_json::to_vec_pretty(&value)?;
        self.write_atomic(&self.entry_path(collection, key), &bytes).await?;

        if existing.is_none() {
            index.entries.push(IndexEntry {
                key: key.to_string(),
                stored_at: Utc::now(),
            });
        }
        let snapshot = CollectionIndex {
            entries: index.entries.clone(),
        };
        self.persist_index(collection, &snapshot).await?;

        let mut cache = self.read_cache.lock().await;
        cache.put((collection.to_string(), key.to_string()), value);
        Ok(())
    }
}

#[async_trait]
impl Persistence for FileStore {
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<(), PersistError> {
        self.store_inner(collection, key, value, false).await
    }

    async fn store_new(&self, collection: &str, key: &str, value: Value) -> Result<(), PersistError> {
        self.store_inner(collection, key, value, true).await
    }

    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>, PersistError> {
        {
            let mut cache = self.read_cache.lock().await;
            if let Some(value) = cache.get(&(collection.to_string(), key.to_string())) {
                return Ok(Some(value.clone()));
            }
        }

        let path = self.entry_path(collection, key);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let value: Value = serde_json::from_str(&text)?;
                let mut cache = self.read_cache.lock().await;
                cache.put((collection.to_string(), key.to_string()), value.clone());
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn query(
        &self,
        collection: &str,
        predicate: Option<QueryPredicate<'_>>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, PersistError> {
        let keys: Vec<String> = {
            let mut indices = self.indices.lock().await;
            let index = self.ensure_index(&mut indices, collection).await?;
            index.entries.iter().map(|e| e.key.clone()).collect()
        };

        let mut out = Vec::new();
        let mut matched = 0usize;
        for key in keys {
            if out.len() >= limit {
                break;
            }
            let Some(value) = self.retrieve(collection, &key).await? else {
                continue;
            };
            if let Some(pred) = predicate {
                if !pred(&value) {
                    continue;
                }
            }
            matched += 1;
            if matched <= offset {
                continue;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, PersistError> {
        let mut indices = self.indices.lock().await;
        let index = self.ensure_index(&mut indices, collection).await?;
        let Some(pos) = index.position(key) else {
            return Ok(false);
        };
        index.entries.remove(pos);
        let snapshot = CollectionIndex {
            entries: index.entries.clone(),
        };

        let path = self.entry_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.persist_index(collection, &snapshot).await?;
        self.read_cache
            .lock()
            .await
            .pop(&(collection.to_string(), key.to_string()));
        Ok(true)
    }

    async fn cleanup(&self, collection: &str, before: DateTime<Utc>) -> Result<usize, PersistError> {
        let expired: Vec<String> = {
            let mut indices = self.indices.lock().await;
            let index = self.ensure_index(&mut indices, collection).await?;
            index
                .entries
                .iter()
                .filter(|e| e.stored_at < before)
                .map(|e| e.key.clone())
                .collect()
        };

        let mut removed = 0usize;
        for key in expired {
            if self.delete(collection, &key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(collection, removed, "expired entries cleaned up");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
