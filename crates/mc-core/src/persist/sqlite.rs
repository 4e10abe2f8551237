use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;

use crate::errors::PersistError;

use super::{sanitize_key, Persistence, QueryPredicate};

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// Embedded-SQL persistence backend.
///
/// One table per collection, created lazily. The JSON payload is stored
/// whole; `project_id`, `status`, and `updated_at` are extracted into
/// indexed columns at write time. Insertion order is the rowid, which an
/// overwrite preserves.
pub struct SqliteStore {
    conn: Connection,
    known_tables: Mutex<HashSet<String>>,
}

fn table_name(collection: &str) -> String {
    format!("c_{}", sanitize_key(collection))
}

fn map_err(e: tokio_rusqlite::Error) -> PersistError {
    PersistError::StorageUnavailable(e.to_string())
}

fn extract_text(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let conn = Connection::open(path.as_ref()).await.map_err(map_err)?;
        let store = Self {
            conn,
            known_tables: Mutex::new(HashSet::new()),
        };
        store.init_pragmas().await?;
        Ok(store)
    }

    /// Purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self, PersistError> {
        let conn = Connection::open_in_memory().await.map_err(map_err)?;
        let store = Self {
            conn,
            known_tables: Mutex::new(HashSet::new()),
        };
        store.init_pragmas().await?;
        Ok(store)
    }

    async fn init_pragmas(&self) -> Result<(), PersistError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    async fn ensure_table(&self, collection: &str) -> Result<String, PersistError> {
        let table = table_name(collection);
        let mut known = self.known_tables.lock().await;
        if known.contains(&table) {
            return Ok(table);
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                stored_at  TEXT NOT NULL,
                project_id TEXT,
                status     TEXT,
                updated_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_project ON {t}(project_id);
            CREATE INDEX IF NOT EXISTS idx_{t}_status  ON {t}(status);
            CREATE INDEX IF NOT EXISTS idx_{t}_updated ON {t}(updated_at);",
            t = table
        );
        self.conn
            .call(move |conn| {
                conn.execute_batch(&ddl)?;
                Ok(())
            })
            .await
            .map_err(map_err)?;
        known.insert(table.clone());
        Ok(table)
    }

    async fn store_inner(
        &self,
        collection: &str,
        key: &str,
        value: Value,
        must_be_new: bool,
    ) -> Result<(), PersistError> {
        let table = self.ensure_table(collection).await?;
        let key = key.to_string();
        let key_for_err = key.clone();
        let payload = serde_json::to_string(&value)?;
        let stored_at = Utc::now().to_rfc3339();
        let project_id = extract_text(&value, "project_id");
        let status = extract_text(&value, "status");
        let updated_at = extract_text(&value, "updated_at");

        let conflicted = self
            .conn
            .call(move |conn| {
                if must_be_new {
                    let exists: bool = conn
                        .prepare(&format!("SELECT 1 FROM {} WHERE key = ?1", table))?
                        .exists(rusqlite::params![key])?;
                    if exists {
                        return Ok(true);
                    }
                }
                conn.execute(
                    &format!(
                        "INSERT INTO {t} (key, value, stored_at, project_id, status, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(key) DO UPDATE SET
                            value=excluded.value, project_id=excluded.project_id,
                            status=excluded.status, updated_at=excluded.updated_at",
                        t = table
                    ),
                    rusqlite::params![key, payload, stored_at, project_id, status, updated_at],
                )?;
                Ok(false)
            })
            .await
            .map_err(map_err)?;

        if conflicted {
            return Err(PersistError::Conflict {
                collection: collection.to_string(),
                key: key_for_err,
                reason: "key already exists".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn store(&self, collection: &str, key: &str, value: Value) -> Result<(), PersistError> {
        self.store_inner(collection, key, value, false).await
    }

    async fn store_new(&self, collection: &str, key: &str, value: Value) -> Result<(), PersistError> {
        self.store_inner(collection, key, value, true).await
    }

    async fn retrieve(&self, collection: &str, key: &str) -> Result<Option<Value>, PersistError> {
        let table = self.ensure_table(collection).await?;
        let key = key.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT value FROM {} WHERE key = ?1", table))?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn query(
        &self,
        collection: &str,
        predicate: Option<QueryPredicate<'_>>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, PersistError> {
        let table = self.ensure_table(collection).await?;
        let rows: Vec<(String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT key, value FROM {} ORDER BY rowid", table))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
                }
                Ok(out)
            })
            .await
            .map_err(map_err)?;

        let mut out = Vec::new();
        let mut matched = 0usize;
        for (key, text) in rows {
            if out.len() >= limit {
                break;
            }
            let value: Value = serde_json::from_str(&text)?;
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
        let table = self.ensure_table(collection).await?;
        let key = key.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    &format!("DELETE FROM {} WHERE key = ?1", table),
                    rusqlite::params![key],
                )?;
                Ok(n)
            })
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn cleanup(&self, collection: &str, before: DateTime<Utc>) -> Result<usize, PersistError> {
        let table = self.ensure_table(collection).await?;
        let cutoff = before.to_rfc3339();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    &format!("DELETE FROM {} WHERE stored_at < ?1", table),
                    rusqlite::params![cutoff],
                )?;
                Ok(n)
            })
            .await
            .map_err(map_err)?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn store_and_retrieve_roundtrip() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .store("tasks", "t1", json!({"name": "schema", "project_id": "p1", "status": "todo"}))
            .await
            .unwrap();
        let got = store.retrieve("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(got["name"], "schema");
    }

    #[tokio::test]
    async fn store_new_conflict_leaves_prior_value() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store_new("leases", "t1", json!({"agent": "a1"})).await.unwrap();
        let err = store
            .store_new("leases", "t1", json!({"agent": "a2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Conflict { .. }));
        let got = store.retrieve("leases", "t1").await.unwrap().unwrap();
        assert_eq!(got["agent"], "a1");
    }

    #[tokio::test]
    async fn query_insertion_order_survives_overwrite() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store("tasks", "a", json!({"v": 1})).await.unwrap();
        store.store("tasks", "b", json!({"v": 2})).await.unwrap();
        store.store("tasks", "a", json!({"v": 3})).await.unwrap();

        let rows = store.query("tasks", None, 0, 10).await.unwrap();
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[0].1["v"], 3);
        assert_eq!(rows[1].0, "b");
    }

    #[tokio::test]
    async fn query_predicate_with_window() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        for i in 0..6 {
            store
                .store(
                    "tasks",
                    &format!("t{}", i),
                    json!({"status": if i < 3 { "todo" } else { "done" }}),
                )
                .await
                .unwrap();
        }
        let pred = |v: &Value| v["status"] == "todo";
        let rows = store.query("tasks", Some(&pred), 0, 10).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn delete_and_cleanup() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store("events", "e1", json!({})).await.unwrap();
        assert!(store.delete("events", "e1").await.unwrap());
        assert!(!store.delete("events", "e1").await.unwrap());

        store.store("events", "e2", json!({})).await.unwrap();
        let removed = store
            .cleanup("events", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.store("tasks", "x", json!({"from": "tasks"})).await.unwrap();
        store.store("leases", "x", json!({"from": "leases"})).await.unwrap();
        assert_eq!(
            store.retrieve("tasks", "x").await.unwrap().unwrap()["from"],
            "tasks"
        );
        assert_eq!(
            store.retrieve("leases", "x").await.unwrap().unwrap()["from"],
            "leases"
        );
    }

    #[tokio::test]
    async fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marcus.db");
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.store("projects", "p1", json!({"name": "alpha"})).await.unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        let got = store.retrieve("projects", "p1").await.unwrap().unwrap();
        assert_eq!(got["name"], "alpha");
    }
}
