use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Ordered, opaque task parameters. Part of a task's identity.
pub type Args = Vec<Value>;

/// Bumped whenever the manifest layout changes shape.
pub const MANIFEST_FORMAT_VERSION: u32 = 2;

/// Stable identity of an argument list inside the manifest.
///
/// SHA-256 over the JSON encoding. `serde_json::Value` objects are
/// BTreeMap-backed, so equal argument lists always hash identically.
pub fn args_signature(args: &[Value]) -> String {
    let encoded = serde_json::to_vec(args).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// Which scheduler a task was originally created on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    Poll,
    Queue,
}

/// How often a task repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// A poll catalog entry, with the interval it resolved to at commit time.
    Named { name: String, interval_secs: u64 },
    /// Raw "every N seconds", the queue scheduler's native form.
    Every { interval_secs: u64 },
}

impl Recurrence {
    pub fn named(name: impl Into<String>, interval_secs: u64) -> Self {
        Recurrence::Named { name: name.into(), interval_secs }
    }

    pub fn every(interval_secs: u64) -> Self {
        Recurrence::Every { interval_secs }
    }

    pub fn interval_secs(&self) -> u64 {
        match self {
            Recurrence::Named { interval_secs, .. } | Recurrence::Every { interval_secs } => {
                *interval_secs
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Recurrence::Named { name, .. } => Some(name),
            Recurrence::Every { .. } => None,
        }
    }
}

/// A pending unit of work on either scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub hook: String,
    pub args: Args,
    /// Next (or only) execution time, unix seconds.
    pub timestamp: i64,
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub source: TaskSource,
}

impl ScheduledTask {
    pub fn once(hook: impl Into<String>, args: Args, timestamp: i64) -> Self {
        Self {
            hook: hook.into(),
            args,
            timestamp,
            recurrence: None,
            source: TaskSource::Poll,
        }
    }

    pub fn recurring(
        hook: impl Into<String>,
        args: Args,
        timestamp: i64,
        recurrence: Recurrence,
    ) -> Self {
        Self {
            hook: hook.into(),
            args,
            timestamp,
            recurrence: Some(recurrence),
            source: TaskSource::Poll,
        }
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn interval_secs(&self) -> Option<u64> {
        self.recurrence.as_ref().map(Recurrence::interval_secs)
    }

    pub fn signature(&self) -> String {
        args_signature(&self.args)
    }
}

/// A named recurrence definition in the poll scheduler's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(alias = "interval")]
    pub interval_secs: u64,
    pub display: String,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, interval_secs: u64, display: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval_secs,
            display: display.into(),
        }
    }
}

/// Where a scheduling request ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheduler", rename_all = "snake_case")]
pub enum Placement {
    /// Committed to the poll manifest at this timestamp.
    Poll { timestamp: i64 },
    /// Created as a queue action with this id.
    Queue { action_id: i64 },
}

/// Result of a "next scheduled" lookup answered by an interceptor.
///
/// `Missing` is an authoritative "no such task" and still short-circuits
/// the poll scheduler's own lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(ScheduledTask),
    Missing,
}

impl Lookup {
    pub fn into_task(self) -> Option<ScheduledTask> {
        match self {
            Lookup::Found(task) => Some(task),
            Lookup::Missing => None,
        }
    }
}

/// Outcome of handing a new manifest to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The value changed and was accepted.
    Stored,
    /// Identical to the current value; nothing was written.
    Unchanged,
}

/// The unit of work that opened a flush window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// An inbound host request.
    Request,
    /// The poll scheduler's batch run over due events.
    Batch,
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleKind::Request => f.write_str("request"),
            CycleKind::Batch => f.write_str("batch"),
        }
    }
}

/// Ambient information about the call site of a scheduler operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// The hook whose handler is currently executing, if any.
    pub trigger: Option<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggered_by(hook: impl Into<String>) -> Self {
        Self {
            trigger: Some(hook.into()),
        }
    }

    pub fn is_triggered_by(&self, hook: &str) -> bool {
        self.trigger.as_deref() == Some(hook)
    }
}

/// Lifecycle state of a queue action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Canceled,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Complete => "complete",
            ActionStatus::Failed => "failed",
            ActionStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "running" => Ok(ActionStatus::Running),
            "complete" => Ok(ActionStatus::Complete),
            "failed" => Ok(ActionStatus::Failed),
            "canceled" => Ok(ActionStatus::Canceled),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// A queue scheduler action as exposed to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: i64,
    pub hook: String,
    pub args: Args,
    pub group: String,
    pub status: ActionStatus,
    /// Unix seconds.
    pub scheduled_at: i64,
    /// `None` for one-shot actions.
    pub interval_secs: Option<u64>,
}

/// Filter for pending queue actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionQuery {
    pub hook: String,
    /// `None` matches any arguments.
    pub args: Option<Args>,
    /// Only actions scheduled at or after this instant.
    pub not_before: Option<i64>,
    pub limit: usize,
}

impl ActionQuery {
    pub fn hook(hook: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            args: None,
            not_before: None,
            limit: 1,
        }
    }
}

/// One entry in the poll manifest, keyed by timestamp → hook → args signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEvent {
    /// Catalog name for recurring events.
    pub schedule: Option<String>,
    pub interval: Option<u64>,
    pub args: Args,
    #[serde(default)]
    pub source: TaskSource,
}

type HookEvents = BTreeMap<String, BTreeMap<String, ManifestEvent>>;

/// The poll scheduler's complete set of pending events.
///
/// Ordered maps keep the serialized form canonical, which the cache relies on
/// to detect no-op writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub events: BTreeMap<i64, HookEvents>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_FORMAT_VERSION,
            events: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events across all timestamps.
    pub fn len(&self) -> usize {
        self.events
            .values()
            .flat_map(|hooks| hooks.values())
            .map(|sigs| sigs.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert (or overwrite) the event for `task` at its timestamp.
    pub fn insert(&mut self, task: &ScheduledTask) {
        let event = ManifestEvent {
            schedule: task
                .recurrence
                .as_ref()
                .and_then(|r| r.name().map(String::from)),
            interval: task.interval_secs(),
            args: task.args.clone(),
            source: task.source,
        };
        self.events
            .entry(task.timestamp)
            .or_default()
            .entry(task.hook.clone())
            .or_default()
            .insert(task.signature(), event);
    }

    /// Remove the exact event at `timestamp`. Returns whether one existed.
    pub fn remove(&mut self, timestamp: i64, hook: &str, args: &[Value]) -> bool {
        let sig = args_signature(args);
        let Some(hooks) = self.events.get_mut(&timestamp) else {
            return false;
        };
        let removed = hooks
            .get_mut(hook)
            .is_some_and(|sigs| sigs.remove(&sig).is_some());
        if removed {
            self.prune(timestamp);
        }
        removed
    }

    /// Remove every event for `hook`, optionally narrowed to one argument list.
    pub fn remove_matching(&mut self, hook: &str, args: Option<&[Value]>) -> usize {
        let sig = args.map(args_signature);
        let mut removed = 0;
        let timestamps: Vec<i64> = self.events.keys().copied().collect();
        for ts in timestamps {
            if let Some(sigs) = self.events.get_mut(&ts).and_then(|h| h.get_mut(hook)) {
                match &sig {
                    Some(sig) => {
                        if sigs.remove(sig).is_some() {
                            removed += 1;
                        }
                    }
                    None => {
                        removed += sigs.len();
                        sigs.clear();
                    }
                }
            }
            self.prune(ts);
        }
        removed
    }

    /// Whether an identical event exists within `window` seconds of `timestamp`.
    pub fn has_neighbour(&self, hook: &str, args: &[Value], timestamp: i64, window: i64) -> bool {
        let sig = args_signature(args);
        self.events
            .range(timestamp - window..=timestamp + window)
            .any(|(_, hooks)| hooks.get(hook).is_some_and(|sigs| sigs.contains_key(&sig)))
    }

    /// All events as tasks, in timestamp order.
    pub fn tasks(&self) -> impl Iterator<Item = ScheduledTask> + '_ {
        self.events.iter().flat_map(|(ts, hooks)| {
            hooks.iter().flat_map(move |(hook, sigs)| {
                sigs.values().map(move |event| event.to_task(*ts, hook))
            })
        })
    }

    /// Earliest event for `hook` matching the optional argument and time filters.
    pub fn next_for(
        &self,
        hook: &str,
        args: Option<&[Value]>,
        not_before: Option<i64>,
    ) -> Option<ScheduledTask> {
        let sig = args.map(args_signature);
        let from = not_before.unwrap_or(i64::MIN);
        self.events.range(from..).find_map(|(ts, hooks)| {
            let sigs = hooks.get(hook)?;
            let event = match &sig {
                Some(sig) => sigs.get(sig)?,
                None => sigs.values().next()?,
            };
            Some(event.to_task(*ts, hook))
        })
    }

    /// Events whose timestamp has arrived.
    pub fn due(&self, now: i64) -> Vec<ScheduledTask> {
        self.events
            .range(..=now)
            .flat_map(|(ts, hooks)| {
                hooks.iter().flat_map(move |(hook, sigs)| {
                    sigs.values().map(move |event| event.to_task(*ts, hook))
                })
            })
            .collect()
    }

    fn prune(&mut self, timestamp: i64) {
        if let Some(hooks) = self.events.get_mut(&timestamp) {
            hooks.retain(|_, sigs| !sigs.is_empty());
            if hooks.is_empty() {
                self.events.remove(&timestamp);
            }
        }
    }
}

impl ManifestEvent {
    fn to_task(&self, timestamp: i64, hook: &str) -> ScheduledTask {
        let recurrence = match (&self.schedule, self.interval) {
            (Some(name), Some(interval_secs)) => Some(Recurrence::named(name.clone(), interval_secs)),
            _ => None,
        };
        ScheduledTask {
            hook: hook.to_string(),
            args: self.args.clone(),
            timestamp,
            recurrence,
            source: self.source,
        }
    }
}
