//! Persistent tier of the two-tier caches: namespaced key to bytes, with
//! the time each entry was written.
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PersistentStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    namespace: String,
}

impl PersistentStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<StoredEntry>> {
        let conn = self.get_conn()?;
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                "SELECT value, created_at FROM cache_entries
                 WHERE namespace = ?1 AND cache_key = ?2",
                params![self.namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((value, created_at)) => {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| anyhow::anyhow!("Failed to parse timestamp: {}", e))?
                    .with_timezone(&Utc);
                Ok(Some(StoredEntry { value, created_at }))
            }
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, value: &[u8], created_at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (namespace, cache_key, value, created_at, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.namespace,
                key,
                value,
                created_at.to_rfc3339(),
                value.len() as i64
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND cache_key = ?2",
            params![self.namespace, key],
        )?;
        Ok(deleted > 0)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1",
            params![self.namespace],
        )?;
        Ok(deleted)
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1",
            params![self.namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn total_bytes(&self) -> anyhow::Result<u64> {
        let conn = self.get_conn()?;
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE namespace = ?1",
            params![self.namespace],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }
}
