use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use cronbridge_core::types::{
    CallContext, CatalogEntry, CycleKind, Lookup, Manifest, Placement, ScheduledTask, SetOutcome,
};
use cronbridge_core::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{
    ActionHandler, CatalogFilter, CommitFilter, CycleObserver, FaultObserver, ManifestInterceptor,
    PollInterceptor, QueueInterceptor, SchedulerFault,
};

struct Registered<H: ?Sized> {
    name: String,
    /// Lower value = earlier execution. Ties broken by registration order.
    priority: i32,
    handler: Arc<H>,
}

type Registry<H> = RwLock<Vec<Registered<H>>>;

/// Typed dispatch table for every interception point of both schedulers.
///
/// A single engine is shared across the process as `Arc<HookEngine>`. Each
/// extension point keeps its own priority-sorted list; `unregister` removes
/// a name from all of them.
pub struct HookEngine {
    poll: Registry<dyn PollInterceptor>,
    queue: Registry<dyn QueueInterceptor>,
    manifest: Registry<dyn ManifestInterceptor>,
    commit: Registry<dyn CommitFilter>,
    catalog: Registry<dyn CatalogFilter>,
    cycle: Registry<dyn CycleObserver>,
    fault: Registry<dyn FaultObserver>,
    actions: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self {
            poll: RwLock::new(Vec::new()),
            queue: RwLock::new(Vec::new()),
            manifest: RwLock::new(Vec::new()),
            commit: RwLock::new(Vec::new()),
            catalog: RwLock::new(Vec::new()),
            cycle: RwLock::new(Vec::new()),
            fault: RwLock::new(Vec::new()),
            actions: RwLock::new(HashMap::new()),
        }
    }

    // --- registration ------------------------------------------------------

    pub fn register_poll(&self, name: &str, priority: i32, handler: Arc<dyn PollInterceptor>) {
        insert(&self.poll, name, priority, handler);
    }

    pub fn register_queue(&self, name: &str, priority: i32, handler: Arc<dyn QueueInterceptor>) {
        insert(&self.queue, name, priority, handler);
    }

    pub fn register_manifest(
        &self,
        name: &str,
        priority: i32,
        handler: Arc<dyn ManifestInterceptor>,
    ) {
        insert(&self.manifest, name, priority, handler);
    }

    pub fn register_commit(&self, name: &str, priority: i32, handler: Arc<dyn CommitFilter>) {
        insert(&self.commit, name, priority, handler);
    }

    pub fn register_catalog(&self, name: &str, priority: i32, handler: Arc<dyn CatalogFilter>) {
        insert(&self.catalog, name, priority, handler);
    }

    pub fn register_cycle(&self, name: &str, priority: i32, handler: Arc<dyn CycleObserver>) {
        insert(&self.cycle, name, priority, handler);
    }

    pub fn register_fault(&self, name: &str, priority: i32, handler: Arc<dyn FaultObserver>) {
        insert(&self.fault, name, priority, handler);
    }

    /// Remove every registration made under `name`. Silent no-op if unknown.
    pub fn unregister(&self, name: &str) {
        let removed = remove(&self.poll, name)
            + remove(&self.queue, name)
            + remove(&self.manifest, name)
            + remove(&self.commit, name)
            + remove(&self.catalog, name)
            + remove(&self.cycle, name)
            + remove(&self.fault, name);
        if removed > 0 {
            debug!(name, removed, "hook unregistered");
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        contains(&self.poll, name)
            || contains(&self.queue, name)
            || contains(&self.manifest, name)
            || contains(&self.commit, name)
            || contains(&self.catalog, name)
            || contains(&self.cycle, name)
            || contains(&self.fault, name)
    }

    // --- poll scheduler chains ---------------------------------------------

    pub fn pre_schedule(&self, ctx: &CallContext, task: &ScheduledTask) -> Result<Option<Placement>> {
        snapshot(&self.poll)
            .iter()
            .try_fold(None, |acc, h| h.pre_schedule(ctx, acc, task))
    }

    pub fn pre_reschedule(
        &self,
        ctx: &CallContext,
        task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        snapshot(&self.poll)
            .iter()
            .try_fold(None, |acc, h| h.pre_reschedule(ctx, acc, task))
    }

    pub fn pre_unschedule(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<bool>> {
        snapshot(&self.poll)
            .iter()
            .try_fold(None, |acc, h| h.pre_unschedule(ctx, acc, timestamp, hook, args))
    }

    pub fn pre_clear_scheduled_hook(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<usize>> {
        snapshot(&self.poll)
            .iter()
            .try_fold(None, |acc, h| h.pre_clear_scheduled_hook(ctx, acc, hook, args))
    }

    pub fn pre_unschedule_hook(&self, ctx: &CallContext, hook: &str) -> Result<Option<usize>> {
        snapshot(&self.poll)
            .iter()
            .try_fold(None, |acc, h| h.pre_unschedule_hook(ctx, acc, hook))
    }

    pub fn pre_get_scheduled(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: Option<&[Value]>,
        not_before: Option<i64>,
    ) -> Result<Option<Lookup>> {
        snapshot(&self.poll)
            .iter()
            .try_fold(None, |acc, h| h.pre_get_scheduled(ctx, acc, hook, args, not_before))
    }

    // --- queue scheduler chains --------------------------------------------

    pub fn pre_schedule_single(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<Placement>> {
        snapshot(&self.queue)
            .iter()
            .try_fold(None, |acc, h| h.pre_schedule_single(ctx, acc, timestamp, hook, args))
    }

    pub fn pre_schedule_recurring(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        interval_secs: u64,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<Placement>> {
        snapshot(&self.queue).iter().try_fold(None, |acc, h| {
            h.pre_schedule_recurring(ctx, acc, timestamp, interval_secs, hook, args)
        })
    }

    pub fn pre_enqueue_async(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<Placement>> {
        snapshot(&self.queue)
            .iter()
            .try_fold(None, |acc, h| h.pre_enqueue_async(ctx, acc, hook, args))
    }

    // --- manifest, commit and catalog --------------------------------------

    /// First interceptor with a manifest wins.
    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        for handler in snapshot(&self.manifest) {
            if let Some(manifest) = handler.read_manifest()? {
                return Ok(Some(manifest));
            }
        }
        Ok(None)
    }

    /// First interceptor to absorb the write wins.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<Option<SetOutcome>> {
        for handler in snapshot(&self.manifest) {
            if let Some(outcome) = handler.write_manifest(manifest)? {
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    pub fn filter_commit(&self, task: ScheduledTask, now: i64) -> ScheduledTask {
        snapshot(&self.commit)
            .iter()
            .fold(task, |task, h| h.filter_commit(task, now))
    }

    pub fn filter_catalog(&self, catalog: &mut BTreeMap<String, CatalogEntry>) {
        for handler in snapshot(&self.catalog) {
            handler.filter_catalog(catalog);
        }
    }

    // --- lifecycle ---------------------------------------------------------

    /// Open a request or batch cycle. Observers are told it completed when
    /// the returned guard drops.
    pub fn begin_cycle(&self, kind: CycleKind) -> CycleGuard<'_> {
        for observer in snapshot(&self.cycle) {
            observer.cycle_started(kind);
        }
        debug!(%kind, "cycle started");
        CycleGuard { engine: self, kind }
    }

    pub fn report_fault(&self, fault: SchedulerFault) {
        let observers = snapshot(&self.fault);
        if observers.is_empty() {
            debug!(hook = %fault.hook, kind = ?fault.kind, "unobserved scheduler fault");
        }
        for observer in observers {
            observer.fault(&fault);
        }
    }

    // --- actions -----------------------------------------------------------

    /// Bind the work executed when `hook` fires. Replaces any previous handler.
    pub fn add_action(&self, hook: &str, handler: Arc<dyn ActionHandler>) {
        let mut actions = self.actions.write().expect("action registry poisoned");
        if actions.insert(hook.to_string(), handler).is_some() {
            warn!(hook, "action handler replaced");
        }
        debug!(hook, "action registered");
    }

    pub fn remove_action(&self, hook: &str) -> bool {
        let mut actions = self.actions.write().expect("action registry poisoned");
        actions.remove(hook).is_some()
    }

    pub fn has_action(&self, hook: &str) -> bool {
        let actions = self.actions.read().expect("action registry poisoned");
        actions.contains_key(hook)
    }

    /// Run the handler bound to `hook`. `None` when nothing is bound.
    pub fn do_action(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: &[Value],
    ) -> Option<std::result::Result<(), String>> {
        let handler = {
            let actions = self.actions.read().expect("action registry poisoned");
            actions.get(hook).cloned()?
        };
        let t = Instant::now();
        let result = handler.run(ctx, args);
        debug!(
            hook,
            duration_ms = t.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "action completed"
        );
        Some(result)
    }

    fn complete_cycle(&self, kind: CycleKind) {
        for observer in snapshot(&self.cycle) {
            observer.cycle_completed(kind);
        }
        debug!(%kind, "cycle completed");
    }
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Open cycle; completion is signalled on drop.
pub struct CycleGuard<'a> {
    engine: &'a HookEngine,
    kind: CycleKind,
}

impl CycleGuard<'_> {
    pub fn kind(&self) -> CycleKind {
        self.kind
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.engine.complete_cycle(self.kind);
    }
}

fn insert<H: ?Sized>(registry: &Registry<H>, name: &str, priority: i32, handler: Arc<H>) {
    let mut hooks = registry.write().expect("hook registry poisoned");
    hooks.push(Registered {
        name: name.to_string(),
        priority,
        handler,
    });
    // Stable sort preserves registration order within the same priority.
    hooks.sort_by_key(|h| h.priority);
    debug!(name, priority, "hook registered");
}

fn remove<H: ?Sized>(registry: &Registry<H>, name: &str) -> usize {
    let mut hooks = registry.write().expect("hook registry poisoned");
    let before = hooks.len();
    hooks.retain(|h| h.name != name);
    before - hooks.len()
}

fn contains<H: ?Sized>(registry: &Registry<H>, name: &str) -> bool {
    let hooks = registry.read().expect("hook registry poisoned");
    hooks.iter().any(|h| h.name == name)
}

/// Clone the handler list so handlers may re-enter the engine.
fn snapshot<H: ?Sized>(registry: &Registry<H>) -> Vec<Arc<H>> {
    let hooks = registry.read().expect("hook registry poisoned");
    hooks.iter().map(|h| Arc::clone(&h.handler)).collect()
}
