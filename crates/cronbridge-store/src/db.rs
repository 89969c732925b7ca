use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Shared SQLite handle for the option table, the cache table and the queue
/// scheduler's action table.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        Ok(f(&conn)?)
    }

    /// Bring the cache table to the current schema.
    ///
    /// Creates it when absent. The first schema stored the manifest in a TEXT
    /// column; SQLite cannot change a column type in place, so such a table is
    /// rebuilt (create, copy, drop, rename) inside one transaction.
    pub fn upgrade_cache_table(&self) -> Result<CacheSchema> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let before = cache_schema(&conn)?;
        match before {
            CacheSchema::Missing => create_cache_table(&conn, "bridge_cache")?,
            CacheSchema::Text => {
                let tx = conn.transaction()?;
                create_cache_table(&tx, "bridge_cache_new")?;
                tx.execute_batch(
                    "INSERT INTO bridge_cache_new (key, value, expires)
                         SELECT key, CAST(value AS BLOB), expires FROM bridge_cache;
                     DROP TABLE bridge_cache;
                     ALTER TABLE bridge_cache_new RENAME TO bridge_cache;",
                )?;
                tx.commit()?;
                info!("cache table rebuilt with BLOB value column");
            }
            CacheSchema::Blob => {}
        }
        Ok(before)
    }

    pub fn cache_schema(&self) -> Result<CacheSchema> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        cache_schema(&conn)
    }
}

/// Shape of the `bridge_cache` table as found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSchema {
    Missing,
    /// First layout, manifest stored as TEXT.
    Text,
    Blob,
}

/// Initialise the option table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS options (
            name        TEXT    NOT NULL PRIMARY KEY,
            value       TEXT    NOT NULL,   -- JSON-encoded
            updated_at  TEXT    NOT NULL
        ) STRICT;",
    )?;
    Ok(())
}

fn create_cache_table(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            key      TEXT    NOT NULL UNIQUE,
            value    BLOB    NOT NULL,
            expires  INTEGER             -- unix seconds, NULL = never
        ) STRICT;"
    ))
}

fn cache_schema(conn: &Connection) -> Result<CacheSchema> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info('bridge_cache')")?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        return Ok(CacheSchema::Missing);
    }
    let text_value = columns
        .iter()
        .any(|(name, ty)| name == "value" && ty.eq_ignore_ascii_case("TEXT"));
    Ok(if text_value {
        CacheSchema::Text
    } else {
        CacheSchema::Blob
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_creates_missing_table() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.cache_schema().unwrap(), CacheSchema::Missing);
        assert_eq!(db.upgrade_cache_table().unwrap(), CacheSchema::Missing);
        assert_eq!(db.cache_schema().unwrap(), CacheSchema::Blob);
        // Second run is a no-op.
        assert_eq!(db.upgrade_cache_table().unwrap(), CacheSchema::Blob);
    }

    #[test]
    fn upgrade_rebuilds_text_column_and_keeps_rows() {
        let db = Database::open_in_memory().unwrap();
        db.with(|conn| {
            conn.execute_batch(
                "CREATE TABLE bridge_cache (
                    key TEXT NOT NULL UNIQUE, value TEXT NOT NULL, expires INTEGER
                 );
                 INSERT INTO bridge_cache (key, value, expires)
                    VALUES ('poll_manifest', '{\"version\":2}', NULL);",
            )
        })
        .unwrap();
        assert_eq!(db.cache_schema().unwrap(), CacheSchema::Text);

        db.upgrade_cache_table().unwrap();

        assert_eq!(db.cache_schema().unwrap(), CacheSchema::Blob);
        let value: Vec<u8> = db
            .with(|conn| {
                conn.query_row(
                    "SELECT value FROM bridge_cache WHERE key = 'poll_manifest'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(value, b"{\"version\":2}");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.db");
        Database::open(&path).unwrap();
        assert!(path.exists());
    }
}
