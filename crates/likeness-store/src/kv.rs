//! SQLite-backed record store. All tables share one `records` table keyed by
//! `(table_name, key)`; items are stored as JSON text.

use async_trait::async_trait;
use likeness_core::{KvStore, StoreError};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    key        TEXT NOT NULL,
    item       TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, key)
);
";

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SqliteKvStore {
    conn: Connection,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(&path).await.map_err(backend)?;
        tracing::info!(path = %path.display(), "record store opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn put(&self, table: &str, key: &str, item: serde_json::Value) -> Result<(), StoreError> {
        let table = table.to_string();
        let key = key.to_string();
        let item = serde_json::to_string(&item)?;
        let updated_at = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO records (table_name, key, item, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (table_name, key)
                     DO UPDATE SET item = excluded.item, updated_at = excluded.updated_at",
                    params![table, key, item, updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let table = table.to_string();
        let key = key.to_string();
        let text: Option<String> = self
            .conn
            .call(move |c| {
                let item = c
                    .query_row(
                        "SELECT item FROM records WHERE table_name = ?1 AND key = ?2",
                        params![table, key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(item)
            })
            .await
            .map_err(backend)?;
        text.map(|t| serde_json::from_str(&t).map_err(StoreError::from))
            .transpose()
    }

    async fn list(&self, table: &str, key_prefix: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        let table = table.to_string();
        let prefix = key_prefix.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT item FROM records
                     WHERE table_name = ?1 AND substr(key, 1, length(?2)) = ?2
                     ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(params![table, prefix], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|t| serde_json::from_str(t).map_err(StoreError::from))
            .collect()
    }
}
