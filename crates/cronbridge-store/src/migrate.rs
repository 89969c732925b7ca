use cronbridge_core::config::{LEGACY_MANIFEST_OPTION, SCHEMA_VERSION_OPTION};
use cronbridge_core::types::Manifest;
use cronbridge_hooks::HookEngine;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::kv::OptionStore;
use crate::manifest::{ManifestCache, MANIFEST_CACHE_HOOK};

/// Version of the cache table layout (2 = BLOB value column).
pub const CACHE_SCHEMA_VERSION: u32 = 2;

/// What [`activate`] had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activation {
    pub upgraded_schema: bool,
    pub migrated_legacy: bool,
}

/// Prepare durable storage for the cache.
///
/// Upgrades the cache table when the recorded schema version differs, then
/// moves a legacy manifest from the option store into the durable row and
/// deletes the legacy entry.
pub fn activate(db: &Database, options: &OptionStore, cache: &ManifestCache) -> Result<Activation> {
    let mut activation = Activation::default();

    let installed: Option<u32> = options.get_json(SCHEMA_VERSION_OPTION)?;
    if installed != Some(CACHE_SCHEMA_VERSION) {
        db.upgrade_cache_table()?;
        options.set_json(SCHEMA_VERSION_OPTION, &CACHE_SCHEMA_VERSION)?;
        activation.upgraded_schema = true;
        info!(from = ?installed, to = CACHE_SCHEMA_VERSION, "cache schema upgraded");
    }

    if let Some(legacy) = options.get_json::<Manifest>(LEGACY_MANIFEST_OPTION)? {
        cache.seed(&legacy)?;
        options.delete(LEGACY_MANIFEST_OPTION)?;
        activation.migrated_legacy = true;
        info!(events = legacy.len(), "legacy manifest migrated to cache table");
    }

    Ok(activation)
}

/// Undo [`activate`]: stop intercepting, copy the current manifest back to
/// the legacy option, then delete the durable row and the version marker.
///
/// Returns `false` when there was no manifest to restore.
pub fn revert(engine: &HookEngine, cache: &ManifestCache, options: &OptionStore) -> Result<bool> {
    engine.unregister(MANIFEST_CACHE_HOOK);

    if let Err(e) = cache.flush() {
        warn!(error = %e, "final flush before revert failed, using in-process value");
    }
    let current = cache.get()?;

    let restored = match current {
        Some(manifest) => {
            options.set_json(LEGACY_MANIFEST_OPTION, &manifest)?;
            info!(events = manifest.len(), "manifest restored to legacy option");
            true
        }
        None => false,
    };

    cache.discard()?;
    options.delete(SCHEMA_VERSION_OPTION)?;
    Ok(restored)
}
