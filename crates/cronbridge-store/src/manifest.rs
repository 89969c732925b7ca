use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cronbridge_core::config::MANIFEST_CACHE_KEY;
use cronbridge_core::types::{CycleKind, Manifest, SetOutcome};
use cronbridge_hooks::{CycleObserver, HookEngine, ManifestInterceptor};
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::kv::KeyValueStore;

/// Registration name of the cache in the hook engine.
pub const MANIFEST_CACHE_HOOK: &str = "manifest-cache";

#[derive(Default)]
struct CacheState {
    /// Whether the durable tier has been consulted yet.
    loaded: bool,
    value: Option<Manifest>,
    /// Canonical serialization of `value`, kept for no-op detection.
    bytes: Option<Vec<u8>>,
}

/// Write-back cache for the poll manifest.
///
/// Holds the materialized manifest in process and writes it to a single
/// durable row. Writes made while a cycle is open are coalesced into one
/// flush when the outermost cycle completes; outside a cycle they flush
/// immediately.
pub struct ManifestCache {
    durable: Arc<dyn KeyValueStore>,
    state: Mutex<CacheState>,
    flush_pending: AtomicBool,
    open_cycles: AtomicUsize,
}

impl ManifestCache {
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self {
            durable,
            state: Mutex::new(CacheState::default()),
            flush_pending: AtomicBool::new(false),
            open_cycles: AtomicUsize::new(0),
        }
    }

    /// Register as the manifest interceptor and cycle observer.
    pub fn install(cache: &Arc<Self>, engine: &HookEngine) {
        engine.register_manifest(MANIFEST_CACHE_HOOK, 0, cache.clone());
        engine.register_cycle(MANIFEST_CACHE_HOOK, 0, cache.clone());
        info!("manifest cache installed");
    }

    /// Current manifest, loading it from the durable row on first access.
    pub fn get(&self) -> Result<Option<Manifest>> {
        let mut state = self.state.lock().expect("manifest cache poisoned");
        if !state.loaded {
            self.load(&mut state)?;
        }
        Ok(state.value.clone())
    }

    /// Replace the manifest. Identical content is rejected as `Unchanged`
    /// and schedules no flush.
    pub fn set(&self, manifest: Manifest) -> Result<SetOutcome> {
        let bytes = serde_json::to_vec(&manifest)?;
        {
            let mut state = self.state.lock().expect("manifest cache poisoned");
            if !state.loaded {
                if let Err(e) = self.load(&mut state) {
                    warn!(error = %e, "durable manifest unreadable, overwriting");
                    state.loaded = true;
                }
            }
            if state.bytes.as_deref() == Some(bytes.as_slice()) {
                debug!("manifest unchanged, write skipped");
                return Ok(SetOutcome::Unchanged);
            }
            state.value = Some(manifest);
            state.bytes = Some(bytes);
        }

        self.flush_pending.store(true, Ordering::SeqCst);
        if self.open_cycles.load(Ordering::SeqCst) == 0 {
            if let Err(e) = self.flush() {
                error!(error = %e, "manifest flush failed, will retry");
            }
        }
        Ok(SetOutcome::Stored)
    }

    /// Write the in-process manifest to the durable row if a flush is pending.
    ///
    /// Returns whether a write happened. On failure the flush stays pending.
    pub fn flush(&self) -> Result<bool> {
        if !self.flush_pending.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let bytes = {
            let state = self.state.lock().expect("manifest cache poisoned");
            state.bytes.clone()
        };
        let Some(bytes) = bytes else {
            return Ok(false);
        };
        if let Err(e) = self.durable.upsert(MANIFEST_CACHE_KEY, &bytes) {
            self.flush_pending.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!(bytes = bytes.len(), "manifest flushed");
        Ok(true)
    }

    /// Write `manifest` straight to the durable row and adopt it in process.
    pub fn seed(&self, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec(manifest)?;
        self.durable.upsert(MANIFEST_CACHE_KEY, &bytes)?;
        let mut state = self.state.lock().expect("manifest cache poisoned");
        *state = CacheState {
            loaded: true,
            value: Some(manifest.clone()),
            bytes: Some(bytes),
        };
        self.flush_pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Delete the durable row and forget the in-process value.
    pub fn discard(&self) -> Result<()> {
        self.durable.delete(MANIFEST_CACHE_KEY)?;
        let mut state = self.state.lock().expect("manifest cache poisoned");
        *state = CacheState::default();
        self.flush_pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn open_cycles(&self) -> usize {
        self.open_cycles.load(Ordering::SeqCst)
    }

    fn load(&self, state: &mut CacheState) -> Result<()> {
        if let Some(bytes) = self.durable.get(MANIFEST_CACHE_KEY)? {
            let manifest: Manifest =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    key: MANIFEST_CACHE_KEY.to_string(),
                    reason: e.to_string(),
                })?;
            debug!(events = manifest.len(), "manifest materialized from durable row");
            state.value = Some(manifest);
            state.bytes = Some(bytes);
        }
        state.loaded = true;
        Ok(())
    }
}

impl ManifestInterceptor for ManifestCache {
    fn read_manifest(&self) -> cronbridge_core::Result<Option<Manifest>> {
        Ok(self.get()?)
    }

    fn write_manifest(&self, manifest: &Manifest) -> cronbridge_core::Result<Option<SetOutcome>> {
        Ok(Some(self.set(manifest.clone())?))
    }
}

impl CycleObserver for ManifestCache {
    fn cycle_started(&self, _kind: CycleKind) {
        self.open_cycles.fetch_add(1, Ordering::SeqCst);
    }

    fn cycle_completed(&self, kind: CycleKind) {
        let previous = self
            .open_cycles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous > 1 {
            return;
        }
        match self.flush() {
            Ok(true) => debug!(%kind, "deferred manifest flush completed"),
            Ok(false) => {}
            Err(e) => error!(%kind, error = %e, "deferred manifest flush failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use cronbridge_core::types::ScheduledTask;

    /// In-memory durable tier that counts writes and can be made to fail.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<String, Vec<u8>>>,
        writes: AtomicUsize,
        failing: AtomicBool,
    }

    impl KeyValueStore for MemoryStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.rows.lock().unwrap().get(key).cloned())
        }

        fn upsert(&self, key: &str, value: &[u8]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt {
                    key: key.to_string(),
                    reason: "disk full".into(),
                });
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.rows
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<bool> {
            Ok(self.rows.lock().unwrap().remove(key).is_some())
        }
    }

    fn manifest_with(hook: &str) -> Manifest {
        let mut m = Manifest::new();
        m.insert(&ScheduledTask::once(hook, vec![], 1_000));
        m
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ManifestCache>, HookEngine) {
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(ManifestCache::new(store.clone()));
        let engine = HookEngine::new();
        ManifestCache::install(&cache, &engine);
        (store, cache, engine)
    }

    #[test]
    fn writes_inside_a_cycle_coalesce_into_one_flush() {
        let (store, cache, engine) = setup();
        let v2 = manifest_with("second");
        {
            let _cycle = engine.begin_cycle(CycleKind::Batch);
            assert_eq!(cache.set(manifest_with("first")).unwrap(), SetOutcome::Stored);
            assert_eq!(cache.set(v2.clone()).unwrap(), SetOutcome::Stored);
            assert_eq!(store.writes.load(Ordering::SeqCst), 0);
            assert!(cache.is_flush_pending());
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        let durable = store.get(MANIFEST_CACHE_KEY).unwrap().unwrap();
        assert_eq!(durable, serde_json::to_vec(&v2).unwrap());
        assert!(!cache.is_flush_pending());
    }

    #[test]
    fn identical_writes_are_unchanged_and_never_flush() {
        let (store, cache, _engine) = setup();
        let v = manifest_with("h");
        assert_eq!(cache.set(v.clone()).unwrap(), SetOutcome::Stored);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.set(v.clone()).unwrap(), SetOutcome::Unchanged);
        assert_eq!(cache.set(v).unwrap(), SetOutcome::Unchanged);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_cycles_flush_at_outermost_completion() {
        let (store, cache, engine) = setup();
        let request = engine.begin_cycle(CycleKind::Request);
        {
            let _batch = engine.begin_cycle(CycleKind::Batch);
            cache.set(manifest_with("h")).unwrap();
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        drop(request);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.open_cycles(), 0);
    }

    #[test]
    fn failed_flush_keeps_value_and_retries_next_cycle() {
        let (store, cache, engine) = setup();
        store.failing.store(true, Ordering::SeqCst);
        {
            let _cycle = engine.begin_cycle(CycleKind::Request);
            cache.set(manifest_with("h")).unwrap();
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert!(cache.is_flush_pending());
        assert_eq!(cache.get().unwrap(), Some(manifest_with("h")));

        store.failing.store(false, Ordering::SeqCst);
        drop(engine.begin_cycle(CycleKind::Request));
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_materializes_from_durable_row_once() {
        let store = Arc::new(MemoryStore::default());
        let stored = manifest_with("cold");
        store
            .upsert(MANIFEST_CACHE_KEY, &serde_json::to_vec(&stored).unwrap())
            .unwrap();
        let cache = ManifestCache::new(store.clone());
        assert_eq!(cache.get().unwrap(), Some(stored.clone()));
        // Same content as the durable row counts as a no-op write.
        assert_eq!(cache.set(stored).unwrap(), SetOutcome::Unchanged);
    }

    #[test]
    fn absent_on_both_tiers_reads_none() {
        let cache = ManifestCache::new(Arc::new(MemoryStore::default()));
        assert_eq!(cache.get().unwrap(), None);
    }

    #[test]
    fn discard_removes_durable_row() {
        let (store, cache, _engine) = setup();
        cache.seed(&manifest_with("h")).unwrap();
        assert!(store.get(MANIFEST_CACHE_KEY).unwrap().is_some());
        cache.discard().unwrap();
        assert!(store.get(MANIFEST_CACHE_KEY).unwrap().is_none());
        assert_eq!(cache.get().unwrap(), None);
    }
}
