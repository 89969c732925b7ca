use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use cronbridge_core::config::RECONCILED_SCHEDULES_OPTION;
use cronbridge_core::types::CatalogEntry;
use cronbridge_core::{BridgeError, Result};
use cronbridge_hooks::{CatalogFilter, HookEngine, PollApi};
use cronbridge_scheduler::catalog::by_interval;
use cronbridge_store::OptionStore;
use tracing::{debug, info};

/// Registration name of the reconciler's catalog filter.
pub const RECONCILER_HOOK: &str = "catalog-reconciler";

/// Maps raw queue intervals onto named poll catalog entries.
///
/// Entries it creates are persisted under the reconciled-schedules option
/// and contributed back to the poll catalog on every query. They are never
/// pruned.
pub struct CatalogReconciler {
    poll: Weak<dyn PollApi>,
    options: OptionStore,
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl CatalogReconciler {
    /// Build a reconciler seeded with the persisted entries.
    pub fn load(poll: Weak<dyn PollApi>, options: OptionStore) -> Result<Self> {
        let entries: BTreeMap<String, CatalogEntry> = options
            .get_json(RECONCILED_SCHEDULES_OPTION)?
            .unwrap_or_default();
        debug!(entries = entries.len(), "reconciled schedules loaded");
        Ok(Self {
            poll,
            options,
            entries: RwLock::new(entries),
        })
    }

    /// Contribute reconciled entries to the poll catalog.
    pub fn install(reconciler: &Arc<Self>, engine: &HookEngine) {
        engine.register_catalog(RECONCILER_HOOK, 1000, reconciler.clone());
    }

    /// Name of the catalog entry whose interval is exactly `interval_secs`,
    /// creating and persisting one when none exists.
    pub fn find_or_create(&self, interval_secs: u64) -> Result<String> {
        if interval_secs == 0 {
            return Err(BridgeError::Catalog(
                "cannot reconcile a zero-second interval".to_string(),
            ));
        }

        let catalog = match self.poll.upgrade() {
            Some(poll) => poll.schedules(),
            None => self.entries.read().expect("reconciler lock poisoned").clone(),
        };
        if let Some(entry) = by_interval(&catalog)
            .into_iter()
            .find(|e| e.interval_secs == interval_secs)
        {
            return Ok(entry.name.clone());
        }

        let mut entries = self.entries.write().expect("reconciler lock poisoned");
        // Another process sharing the store may have added entries since load.
        let stored: BTreeMap<String, CatalogEntry> = self
            .options
            .get_json(RECONCILED_SCHEDULES_OPTION)?
            .unwrap_or_default();
        let mut next = stored.clone();
        for (name, entry) in entries.iter() {
            next.entry(name.clone()).or_insert_with(|| entry.clone());
        }

        let adopted = by_interval(&next)
            .into_iter()
            .find(|e| e.interval_secs == interval_secs)
            .map(|e| e.name.clone());
        let name = match adopted {
            Some(name) => {
                debug!(%name, interval_secs, "catalog entry created elsewhere, adopted");
                name
            }
            None => {
                let name = format!("queue_every_{interval_secs}_seconds");
                next.insert(
                    name.clone(),
                    CatalogEntry::new(
                        name.clone(),
                        interval_secs,
                        format!("Queue scheduler, every {interval_secs} seconds"),
                    ),
                );
                info!(%name, interval_secs, "catalog entry created for queue interval");
                name
            }
        };

        if next != stored {
            self.options.set_json(RECONCILED_SCHEDULES_OPTION, &next)?;
        }
        *entries = next;
        Ok(name)
    }

    /// Entries created so far, by name.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        let entries = self.entries.read().expect("reconciler lock poisoned");
        entries.values().cloned().collect()
    }
}

impl CatalogFilter for CatalogReconciler {
    fn filter_catalog(&self, catalog: &mut BTreeMap<String, CatalogEntry>) {
        let entries = self.entries.read().expect("reconciler lock poisoned");
        for (name, entry) in entries.iter() {
            catalog.insert(name.clone(), entry.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cronbridge_core::config::PollConfig;
    use cronbridge_scheduler::PollScheduler;
    use cronbridge_store::Database;

    fn fixture() -> (Arc<PollScheduler>, Arc<CatalogReconciler>, OptionStore) {
        let engine = Arc::new(HookEngine::new());
        let options = OptionStore::new(Database::open_in_memory().unwrap());
        let poll = Arc::new(PollScheduler::new(
            engine.clone(),
            options.clone(),
            &PollConfig::default(),
        ));
        let api: Arc<dyn PollApi> = poll.clone();
        let reconciler =
            Arc::new(CatalogReconciler::load(Arc::downgrade(&api), options.clone()).unwrap());
        CatalogReconciler::install(&reconciler, &engine);
        (poll, reconciler, options)
    }

    #[test]
    fn existing_interval_resolves_to_builtin_name() {
        let (_poll, reconciler, _options) = fixture();
        assert_eq!(reconciler.find_or_create(3_600).unwrap(), "hourly");
        assert_eq!(reconciler.find_or_create(86_400).unwrap(), "daily");
        assert!(reconciler.entries().is_empty());
    }

    #[test]
    fn unknown_interval_creates_one_persisted_entry() {
        let (poll, reconciler, options) = fixture();
        let first = reconciler.find_or_create(90).unwrap();
        let second = reconciler.find_or_create(90).unwrap();
        assert_eq!(first, "queue_every_90_seconds");
        assert_eq!(first, second);

        let catalog = poll.schedules();
        let matching: Vec<_> = catalog.values().filter(|e| e.interval_secs == 90).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].display, "Queue scheduler, every 90 seconds");

        let persisted: BTreeMap<String, CatalogEntry> = options
            .get_json(RECONCILED_SCHEDULES_OPTION)
            .unwrap()
            .unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn persisted_entries_survive_reload() {
        let (_poll, reconciler, options) = fixture();
        reconciler.find_or_create(45).unwrap();
        let reloaded = CatalogReconciler::load(Weak::<PollScheduler>::new(), options).unwrap();
        assert_eq!(reloaded.find_or_create(45).unwrap(), "queue_every_45_seconds");
        assert_eq!(reloaded.entries().len(), 1);
    }

    #[test]
    fn reconcilers_sharing_a_store_never_drop_each_others_entries() {
        let options = OptionStore::new(Database::open_in_memory().unwrap());
        let first = CatalogReconciler::load(Weak::<PollScheduler>::new(), options.clone()).unwrap();
        let second =
            CatalogReconciler::load(Weak::<PollScheduler>::new(), options.clone()).unwrap();

        assert_eq!(first.find_or_create(45).unwrap(), "queue_every_45_seconds");
        assert_eq!(second.find_or_create(90).unwrap(), "queue_every_90_seconds");
        // The second reconciler picks up the first one's entry instead of
        // minting a duplicate.
        assert_eq!(second.find_or_create(45).unwrap(), "queue_every_45_seconds");

        let persisted: BTreeMap<String, CatalogEntry> = options
            .get_json(RECONCILED_SCHEDULES_OPTION)
            .unwrap()
            .unwrap();
        let names: Vec<_> = persisted.keys().cloned().collect();
        assert_eq!(names, ["queue_every_45_seconds", "queue_every_90_seconds"]);

        let fresh = CatalogReconciler::load(Weak::<PollScheduler>::new(), options).unwrap();
        assert_eq!(fresh.entries().len(), 2);
    }

    #[test]
    fn zero_interval_is_a_catalog_error() {
        let (_poll, reconciler, _options) = fixture();
        assert!(matches!(
            reconciler.find_or_create(0),
            Err(BridgeError::Catalog(_))
        ));
    }
}
