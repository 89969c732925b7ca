//! `cronbridge-store` — durable storage and the write-back manifest cache.
//!
//! The option table plays the role of the host's key/value settings store
//! (where the poll manifest lives without the cache). The `bridge_cache`
//! table holds the cached manifest as a single BLOB row.

pub mod db;
pub mod error;
pub mod kv;
pub mod manifest;
pub mod migrate;

pub use db::{CacheSchema, Database};
pub use error::{Result, StoreError};
pub use kv::{CacheRow, KeyValueStore, OptionStore, SqliteTable};
pub use manifest::{ManifestCache, MANIFEST_CACHE_HOOK};
pub use migrate::{activate, revert, Activation, CACHE_SCHEMA_VERSION};
