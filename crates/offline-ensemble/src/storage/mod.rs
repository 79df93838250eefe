//! SQLite storage backing the persistent cache tier
pub mod migration;
pub mod cache_store;

pub use cache_store::{PersistentStore, StoredEntry};
pub use migration::MigrationManager;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_entries: i64,
    pub schema_version: i32,
    pub database_size_bytes: i64,
}

/// Connection pool over the cache database. Each cache gets a namespaced
/// `PersistentStore` view of the same pool.
#[derive(Clone)]
pub struct CacheDatabase {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl CacheDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening cache database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("Cache database initialized successfully");
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Private in-memory database. One connection, since every SQLite
    /// in-memory connection is a separate database.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn store(&self, namespace: &str) -> PersistentStore {
        PersistentStore::new(Arc::clone(&self.pool), namespace)
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let mut conn = self.pool.get()?;
        let total_entries: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        let database_size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        let schema_version = MigrationManager::new(&mut conn).get_current_version()?;

        Ok(DatabaseStats {
            total_entries,
            schema_version,
            database_size_bytes,
        })
    }
}
