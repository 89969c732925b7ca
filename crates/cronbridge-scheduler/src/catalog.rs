use std::collections::BTreeMap;

use cronbridge_core::types::CatalogEntry;

const HOUR_IN_SECONDS: u64 = 60 * 60;
const DAY_IN_SECONDS: u64 = 24 * HOUR_IN_SECONDS;

/// The poll scheduler's own named intervals, before any catalog filter runs.
pub fn builtin_schedules() -> BTreeMap<String, CatalogEntry> {
    [
        CatalogEntry::new("hourly", HOUR_IN_SECONDS, "Once Hourly"),
        CatalogEntry::new("twicedaily", 12 * HOUR_IN_SECONDS, "Twice Daily"),
        CatalogEntry::new("daily", DAY_IN_SECONDS, "Once Daily"),
        CatalogEntry::new("weekly", 7 * DAY_IN_SECONDS, "Once Weekly"),
    ]
    .into_iter()
    .map(|entry| (entry.name.clone(), entry))
    .collect()
}

/// Entries sorted by ascending interval, ties broken by name.
pub fn by_interval(catalog: &BTreeMap<String, CatalogEntry>) -> Vec<&CatalogEntry> {
    let mut entries: Vec<&CatalogEntry> = catalog.values().collect();
    entries.sort_by(|a, b| {
        a.interval_secs
            .cmp(&b.interval_secs)
            .then_with(|| a.name.cmp(&b.name))
    });
    entries
}
