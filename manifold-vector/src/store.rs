//! SQLite-backed embedding rows.
//!
//! rusqlite is synchronous; the store wraps a shared connection and hops to
//! the blocking pool for every statement.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

/// One persisted embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    pub upstream: String,
    pub tool: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

/// Vectors are stored as little-endian f32 blobs.
fn to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tool_embeddings (
    upstream   TEXT NOT NULL,
    tool       TEXT NOT NULL,
    text       TEXT NOT NULL,
    vector     BLOB NOT NULL,
    dim        INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (upstream, tool)
);
";

/// Persistent store of one embedding row per tool.
#[derive(Clone)]
pub struct EmbeddingStore {
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("connection lock poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }

    /// Insert or replace one row.
    pub async fn upsert(&self, row: EmbeddingRow) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO tool_embeddings (upstream, tool, text, vector, dim, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (upstream, tool) DO UPDATE SET
                     text = excluded.text,
                     vector = excluded.vector,
                     dim = excluded.dim,
                     updated_at = excluded.updated_at",
                params![
                    row.upstream,
                    row.tool,
                    row.text,
                    to_blob(&row.vector),
                    row.vector.len() as i64,
                    row.updated_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn get(&self, upstream: &str, tool: &str) -> Result<Option<EmbeddingRow>, StoreError> {
        let upstream = upstream.to_string();
        let tool = tool.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT upstream, tool, text, vector, updated_at
                 FROM tool_embeddings WHERE upstream = ?1 AND tool = ?2",
                params![upstream, tool],
                row_from_sql,
            )
            .optional()
        })
        .await
    }

    /// Every stored row. The tool catalog is small; similarity search scans
    /// it in memory.
    pub async fn all(&self) -> Result<Vec<EmbeddingRow>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT upstream, tool, text, vector, updated_at
                 FROM tool_embeddings ORDER BY upstream, tool",
            )?;
            let rows = stmt.query_map([], row_from_sql)?;
            rows.collect()
        })
        .await
    }

    /// Stored text per key, used to skip re-embedding unchanged tools.
    pub async fn texts(&self) -> Result<Vec<(String, String, String)>, StoreError> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT upstream, tool, text FROM tool_embeddings")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_key(&self, upstream: &str, tool: &str) -> Result<(), StoreError> {
        let upstream = upstream.to_string();
        let tool = tool.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM tool_embeddings WHERE upstream = ?1 AND tool = ?2",
                params![upstream, tool],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn delete_upstream(&self, upstream: &str) -> Result<(), StoreError> {
        let upstream = upstream.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM tool_embeddings WHERE upstream = ?1",
                params![upstream],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.blocking(|conn| conn.execute("DELETE FROM tool_embeddings", []).map(|_| ()))
            .await
    }

    /// The dimensionality fixed by the first stored row, if any.
    pub async fn dimension(&self) -> Result<Option<usize>, StoreError> {
        self.blocking(|conn| {
            conn.query_row("SELECT dim FROM tool_embeddings LIMIT 1", [], |row| {
                row.get::<_, i64>(0).map(|d| d as usize)
            })
            .optional()
        })
        .await
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> Result<EmbeddingRow, rusqlite::Error> {
    let blob: Vec<u8> = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(EmbeddingRow {
        upstream: row.get(0)?,
        tool: row.get(1)?,
        text: row.get(2)?,
        vector: from_blob(&blob),
        updated_at: updated_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(upstream: &str, tool: &str, text: &str, vector: Vec<f32>) -> EmbeddingRow {
        EmbeddingRow {
            upstream: upstream.into(),
            tool: tool.into(),
            text: text.into(),
            vector,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn blob_codec_round_trips() {
        let vector = vec![0.5_f32, -1.25, 3.75, f32::MIN_POSITIVE];
        assert_eq!(from_blob(&to_blob(&vector)), vector);
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store.upsert(row("a", "t", "v1", vec![1.0, 0.0])).await.unwrap();
        store.upsert(row("a", "t", "v2", vec![0.0, 1.0])).await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "v2");
        assert_eq!(all[0].vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn deletes_by_key_and_upstream() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        store.upsert(row("a", "one", "", vec![1.0])).await.unwrap();
        store.upsert(row("a", "two", "", vec![1.0])).await.unwrap();
        store.upsert(row("b", "one", "", vec![1.0])).await.unwrap();

        store.delete_key("a", "one").await.unwrap();
        assert_eq!(store.all().await.unwrap().len(), 2);

        store.delete_upstream("a").await.unwrap();
        let rest = store.all().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].upstream, "b");
    }

    #[tokio::test]
    async fn dimension_comes_from_first_row() {
        let store = EmbeddingStore::open_in_memory().unwrap();
        assert_eq!(store.dimension().await.unwrap(), None);

        store.upsert(row("a", "t", "", vec![1.0, 2.0, 3.0])).await.unwrap();
        assert_eq!(store.dimension().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");

        {
            let store = EmbeddingStore::open(&path).unwrap();
            store.upsert(row("a", "t", "text", vec![0.25, 0.75])).await.unwrap();
        }

        let store = EmbeddingStore::open(&path).unwrap();
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].vector, vec![0.25, 0.75]);
    }
}
