use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{de::DeserializeOwned, Serialize};

use crate::db::Database;
use crate::error::{Result, StoreError};

/// Single-row-per-key durable storage with upsert semantics.
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key is absent (or its row has expired).
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn upsert(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns whether a row was removed.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// One row of the `bridge_cache` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub key: String,
    pub value: Vec<u8>,
    /// Unix seconds; `None` never expires.
    pub expires: Option<i64>,
}

impl CacheRow {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// `options(name, value TEXT, updated_at)`.
    Options,
    /// `bridge_cache(key, value BLOB, expires)`.
    Cache,
}

/// [`KeyValueStore`] over one of the two SQLite tables.
#[derive(Clone)]
pub struct SqliteTable {
    db: Database,
    layout: Layout,
}

impl SqliteTable {
    /// The host's option table. Values must be UTF-8.
    pub fn options(db: Database) -> Self {
        Self {
            db,
            layout: Layout::Options,
        }
    }

    /// The manifest cache table. Call [`Database::upgrade_cache_table`] first.
    pub fn cache(db: Database) -> Self {
        Self {
            db,
            layout: Layout::Cache,
        }
    }

    /// Raw cache row, expired or not. Always `None` for the option table.
    pub fn row(&self, key: &str) -> Result<Option<CacheRow>> {
        if self.layout != Layout::Cache {
            return Ok(None);
        }
        self.db.with(|conn| {
            conn.query_row(
                "SELECT key, value, expires FROM bridge_cache WHERE key = ?1",
                [key],
                |row| {
                    Ok(CacheRow {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        expires: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Upsert a full cache row including its expiry.
    pub fn upsert_row(&self, row: &CacheRow) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO bridge_cache (key, value, expires) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                expires = excluded.expires",
                rusqlite::params![row.key, row.value, row.expires],
            )
        })?;
        Ok(())
    }
}

impl KeyValueStore for SqliteTable {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.layout {
            Layout::Cache => {
                let now = Utc::now().timestamp();
                Ok(self
                    .row(key)?
                    .filter(|row| !row.is_expired(now))
                    .map(|row| row.value))
            }
            Layout::Options => {
                let value: Option<String> = self.db.with(|conn| {
                    conn.query_row("SELECT value FROM options WHERE name = ?1", [key], |row| {
                        row.get(0)
                    })
                    .optional()
                })?;
                Ok(value.map(String::into_bytes))
            }
        }
    }

    fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.layout {
            Layout::Cache => self.upsert_row(&CacheRow {
                key: key.to_string(),
                value: value.to_vec(),
                expires: None,
            }),
            Layout::Options => {
                let text = std::str::from_utf8(value).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                let now = Utc::now().to_rfc3339();
                self.db.with(|conn| {
                    conn.execute(
                        "INSERT INTO options (name, value, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(name) DO UPDATE SET value = excluded.value,
                                                         updated_at = excluded.updated_at",
                        rusqlite::params![key, text, now],
                    )
                })?;
                Ok(())
            }
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let sql = match self.layout {
            Layout::Cache => "DELETE FROM bridge_cache WHERE key = ?1",
            Layout::Options => "DELETE FROM options WHERE name = ?1",
        };
        let n = self.db.with(|conn| conn.execute(sql, [key]))?;
        Ok(n > 0)
    }
}

/// JSON-typed access to the option table.
#[derive(Clone)]
pub struct OptionStore {
    table: SqliteTable,
}

impl OptionStore {
    pub fn new(db: Database) -> Self {
        Self {
            table: SqliteTable::options(db),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(bytes) = self.table.get(name)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.table.upsert(name, &bytes)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.table.delete(name)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.table.get(name)?.is_some())
    }
}
