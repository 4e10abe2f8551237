use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::PersistError;

pub mod file;
pub mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// Collection names used by the coordination engine. Backends treat these as
/// opaque; the constants exist so callers cannot typo a collection.
pub mod collections {
    pub const PROJECTS: &str = "projects";
    pub const TASKS: &str = "tasks";
    pub const SUBTASKS: &str = "subtasks";
    pub const LEASES: &str = "leases";
    pub const DECISIONS: &str = "decisions";
    pub const ARTIFACTS: &str = "artifacts";
    pub const OUTCOMES: &str = "outcomes";
    pub const EVENTS: &str = "events";

    /// Distinguished key inside `projects` holding the active pointer.
    pub const ACTIVE_PROJECT_KEY: &str = "active_project";
}

// ---------------------------------------------------------------------------
// Persistence trait
// ---------------------------------------------------------------------------

/// Predicate applied to stored values during a query. Runs synchronously
/// against the decoded JSON value.
pub type QueryPredicate<'a> = &'a (dyn Fn(&Value) -> bool + Send + Sync);

/// Collection/key store with atomic per-(collection, key) writes.
///
/// A failed `store` leaves the prior value intact. `query` is deterministic
/// in insertion order. Every `store` is durable before it returns; lost
/// writes are a fatal error at the layer above.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<(), PersistError>;

    /// Store only if `key` is absent in `collection`; `Conflict` otherwise.
    /// This is the compare-and-set primitive the lease manager relies on.
    async fn store_new(&self, collection: &str, key: &str, value: Value) -> Result<(), PersistError>;

    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>, PersistError>;

    /// Return `(key, value)` pairs in insertion order. The predicate filters
    /// before the `(offset, limit)` window is applied.
    async fn query(
        &self,
        collection: &str,
        predicate: Option<QueryPredicate<'_>>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, PersistError>;

    /// Returns `true` when the key existed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, PersistError>;

    /// Remove entries stored before `before`. Returns the number removed.
    async fn cleanup(&self, collection: &str, before: DateTime<Utc>) -> Result<usize, PersistError>;
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Typed convenience layer over the object-safe [`Persistence`] core.
#[async_trait]
pub trait PersistenceExt: Persistence {
    async fn store_typed<T: Serialize + Sync>(
        &self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<(), PersistError> {
        self.store(collection, key, serde_json::to_value(value)?).await
    }

    async fn retrieve_typed<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, PersistError> {
        match self.retrieve(collection, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn query_typed<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<T>, PersistError> {
        let rows = self.query(collection, None, offset, limit).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            out.push(serde_json::from_value(value)?);
        }
        Ok(out)
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}

/// Replace characters that cannot appear in file names or table names.
pub(crate) fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_key("projects/active"), "projects_active");
        assert_eq!(sanitize_key("a-b_c.9"), "a-b_c.9");
    }
}
