use std::collections::BTreeMap;

use cronbridge_core::types::{CatalogEntry, Recurrence, ScheduledTask};
use cronbridge_hooks::{CatalogFilter, CommitFilter};
use tracing::debug;

pub const INTERVAL_FLOOR_HOOK: &str = "interval-floor";
pub const CATALOG_EXTENSION_HOOK: &str = "catalog-extension";

/// Lifts recurring poll events below a minimum interval up to it.
///
/// A lifted event also moves to `now + minimum`, so a too-frequent event
/// never fires sooner than the floor allows.
pub struct IntervalFloor {
    minimum_secs: u64,
}

impl IntervalFloor {
    pub fn new(minimum_secs: u64) -> Self {
        Self { minimum_secs }
    }
}

impl CommitFilter for IntervalFloor {
    fn filter_commit(&self, task: ScheduledTask, now: i64) -> ScheduledTask {
        let interval = match task.interval_secs() {
            Some(interval) if interval < self.minimum_secs => interval,
            _ => return task,
        };
        debug!(
            hook = %task.hook,
            from = interval,
            to = self.minimum_secs,
            "recurring interval raised to floor"
        );
        let recurrence = match task.recurrence.as_ref().and_then(Recurrence::name) {
            Some(name) => Recurrence::named(name, self.minimum_secs),
            None => Recurrence::every(self.minimum_secs),
        };
        ScheduledTask {
            timestamp: now + self.minimum_secs as i64,
            recurrence: Some(recurrence),
            ..task
        }
    }
}

/// Static named intervals merged into the poll catalog.
pub struct CatalogExtension {
    entries: Vec<CatalogEntry>,
}

impl CatalogExtension {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }
}

impl CatalogFilter for CatalogExtension {
    fn filter_catalog(&self, catalog: &mut BTreeMap<String, CatalogEntry>) {
        for entry in &self.entries {
            catalog.insert(entry.name.clone(), entry.clone());
        }
    }
}
