use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use cronbridge_core::config::{PollConfig, LEGACY_MANIFEST_OPTION};
use cronbridge_core::types::{
    CallContext, CatalogEntry, CycleKind, Manifest, Placement, Recurrence, ScheduledTask,
};
use cronbridge_hooks::{FaultKind, HookEngine, PollApi, SchedulerFault};
use cronbridge_store::OptionStore;
use serde_json::Value;
use tracing::{debug, info};

use crate::catalog::builtin_schedules;
use crate::error::{Result, SchedulerError};
use crate::types::RunReport;

/// Identical one-shot events closer than this are rejected as duplicates.
pub const DUPLICATE_WINDOW_SECS: i64 = 10 * 60;

/// Request-triggered scheduler keeping all pending events in one manifest.
///
/// Every operation first runs the matching interceptor chain of the hook
/// engine; a non-empty answer short-circuits the scheduler's own handling.
/// The manifest is read and written through the manifest interceptors and
/// falls back to the legacy option when none is installed.
pub struct PollScheduler {
    engine: Arc<HookEngine>,
    options: OptionStore,
    /// Serializes manifest read-modify-write cycles.
    write_lock: Mutex<()>,
    disable_trigger: bool,
}

impl PollScheduler {
    pub fn new(engine: Arc<HookEngine>, options: OptionStore, config: &PollConfig) -> Self {
        Self {
            engine,
            options,
            write_lock: Mutex::new(()),
            disable_trigger: config.disable_trigger,
        }
    }

    pub fn engine(&self) -> &Arc<HookEngine> {
        &self.engine
    }

    /// Current manifest, without running any interceptor chain.
    pub fn manifest(&self) -> Result<Manifest> {
        if let Some(manifest) = self.engine.read_manifest()? {
            return Ok(manifest);
        }
        Ok(self
            .options
            .get_json::<Manifest>(LEGACY_MANIFEST_OPTION)?
            .unwrap_or_default())
    }

    /// Run every event due at `now` inside a batch cycle.
    ///
    /// Recurring events are moved to their next slot, one-shots removed, and
    /// the bound handler invoked. Failures are reported to fault observers
    /// and never stop the batch.
    pub fn run_due(&self, now: i64) -> Result<RunReport> {
        let _cycle = self.engine.begin_cycle(CycleKind::Batch);
        let due = self.manifest()?.due(now);
        let mut report = RunReport::default();
        let ctx = CallContext::new();

        for task in due {
            if task.is_recurring() {
                if let Err(e) = self.reschedule_at(&ctx, task.clone(), now) {
                    self.fault(FaultKind::Reschedule, &task.hook, e);
                }
            }
            if let Err(e) = self.unschedule_at(&ctx, task.timestamp, &task.hook, &task.args) {
                self.fault(FaultKind::Unschedule, &task.hook, e);
            }

            let trigger = CallContext::triggered_by(task.hook.as_str());
            match self.engine.do_action(&trigger, &task.hook, &task.args) {
                Some(Ok(())) => report.ran += 1,
                Some(Err(message)) => {
                    report.failed += 1;
                    self.engine.report_fault(SchedulerFault {
                        kind: FaultKind::Execution,
                        hook: task.hook.clone(),
                        message,
                    });
                }
                None => {
                    debug!(hook = %task.hook, "no handler bound for due event");
                    report.skipped += 1;
                }
            }
        }

        if report.due() > 0 {
            info!(
                ran = report.ran,
                failed = report.failed,
                skipped = report.skipped,
                "poll batch completed"
            );
        }
        Ok(report)
    }

    /// Entry point for an inbound host request. Runs due events unless the
    /// request trigger is disabled in favour of an external one.
    pub fn on_request(&self, now: i64) -> Result<Option<RunReport>> {
        if self.disable_trigger {
            return Ok(None);
        }
        self.run_due(now).map(Some)
    }

    fn schedule_at(&self, ctx: &CallContext, task: ScheduledTask, now: i64) -> Result<Placement> {
        // Interceptors see the catalog's interval, never the caller's.
        let task = self.resolve(task)?;
        if let Some(placement) = self.engine.pre_schedule(ctx, &task)? {
            debug!(hook = %task.hook, ?placement, "schedule answered by interceptor");
            return Ok(placement);
        }

        let task = self.engine.filter_commit(task, now);

        let _guard = self.write_lock.lock().expect("poll write lock poisoned");
        let mut manifest = self.manifest()?;
        if !task.is_recurring()
            && manifest.has_neighbour(&task.hook, &task.args, task.timestamp, DUPLICATE_WINDOW_SECS)
        {
            return Err(SchedulerError::Duplicate { hook: task.hook });
        }
        manifest.insert(&task);
        self.save(&manifest)?;
        info!(
            hook = %task.hook,
            timestamp = task.timestamp,
            interval_secs = ?task.interval_secs(),
            "poll event scheduled"
        );
        Ok(Placement::Poll {
            timestamp: task.timestamp,
        })
    }

    /// Interceptors receive the task already moved to its next slot.
    fn reschedule_at(&self, ctx: &CallContext, task: ScheduledTask, now: i64) -> Result<Placement> {
        let task = self.resolve(task)?;
        let next = ScheduledTask {
            timestamp: next_slot(&task, now)?,
            ..task
        };
        if let Some(placement) = self.engine.pre_reschedule(ctx, &next)? {
            return Ok(placement);
        }
        self.schedule_at(ctx, next, now)
    }

    fn unschedule_at(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> Result<bool> {
        if let Some(answer) = self.engine.pre_unschedule(ctx, timestamp, hook, args)? {
            return Ok(answer);
        }
        let _guard = self.write_lock.lock().expect("poll write lock poisoned");
        let mut manifest = self.manifest()?;
        let removed = manifest.remove(timestamp, hook, args);
        if removed {
            self.save(&manifest)?;
            debug!(%hook, timestamp, "poll event unscheduled");
        }
        Ok(removed)
    }

    fn remove_matching(&self, hook: &str, args: Option<&[Value]>) -> Result<usize> {
        let _guard = self.write_lock.lock().expect("poll write lock poisoned");
        let mut manifest = self.manifest()?;
        let removed = manifest.remove_matching(hook, args);
        if removed > 0 {
            self.save(&manifest)?;
            info!(%hook, removed, "poll events cleared");
        }
        Ok(removed)
    }

    /// Pin a named recurrence to the catalog's current interval.
    fn resolve(&self, task: ScheduledTask) -> Result<ScheduledTask> {
        let name = match task.recurrence.as_ref() {
            None => return Ok(task),
            Some(Recurrence::Named { name, .. }) => name.clone(),
            Some(Recurrence::Every { interval_secs }) => {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "raw interval of {interval_secs}s has no catalog name"
                )))
            }
        };
        let catalog = self.schedules();
        let entry = catalog
            .get(&name)
            .ok_or_else(|| SchedulerError::InvalidSchedule(format!("unknown schedule '{name}'")))?;
        Ok(ScheduledTask {
            recurrence: Some(Recurrence::named(name.as_str(), entry.interval_secs)),
            ..task
        })
    }

    fn save(&self, manifest: &Manifest) -> Result<()> {
        if self.engine.write_manifest(manifest)?.is_some() {
            return Ok(());
        }
        self.options.set_json(LEGACY_MANIFEST_OPTION, manifest)?;
        Ok(())
    }

    fn fault(&self, kind: FaultKind, hook: &str, err: SchedulerError) {
        self.engine.report_fault(SchedulerFault {
            kind,
            hook: hook.to_string(),
            message: err.to_string(),
        });
    }
}

/// First slot after `now` on the task's cadence, counted from its old
/// timestamp. A task not yet due moves a full interval past `now`.
fn next_slot(task: &ScheduledTask, now: i64) -> Result<i64> {
    let interval = task.interval_secs().ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!("'{}' is not a recurring event", task.hook))
    })? as i64;
    Ok(if task.timestamp >= now {
        now + interval
    } else {
        now + (interval - (now - task.timestamp) % interval)
    })
}

impl PollApi for PollScheduler {
    fn schedule_task(
        &self,
        ctx: &CallContext,
        task: ScheduledTask,
    ) -> cronbridge_core::Result<Placement> {
        Ok(self.schedule_at(ctx, task, Utc::now().timestamp())?)
    }

    fn reschedule_task(
        &self,
        ctx: &CallContext,
        task: ScheduledTask,
    ) -> cronbridge_core::Result<Placement> {
        Ok(self.reschedule_at(ctx, task, Utc::now().timestamp())?)
    }

    fn unschedule_task(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> cronbridge_core::Result<bool> {
        Ok(self.unschedule_at(ctx, timestamp, hook, args)?)
    }

    fn clear_scheduled_hook(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: &[Value],
    ) -> cronbridge_core::Result<usize> {
        if let Some(n) = self.engine.pre_clear_scheduled_hook(ctx, hook, args)? {
            return Ok(n);
        }
        Ok(self.remove_matching(hook, Some(args))?)
    }

    fn unschedule_hook(&self, ctx: &CallContext, hook: &str) -> cronbridge_core::Result<usize> {
        if let Some(n) = self.engine.pre_unschedule_hook(ctx, hook)? {
            return Ok(n);
        }
        Ok(self.remove_matching(hook, None)?)
    }

    fn next_scheduled(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: Option<&[Value]>,
        not_before: Option<i64>,
    ) -> cronbridge_core::Result<Option<ScheduledTask>> {
        if let Some(lookup) = self.engine.pre_get_scheduled(ctx, hook, args, not_before)? {
            return Ok(lookup.into_task());
        }
        Ok(self.manifest()?.next_for(hook, args, not_before))
    }

    fn schedules(&self) -> BTreeMap<String, CatalogEntry> {
        let mut catalog = builtin_schedules();
        self.engine.filter_catalog(&mut catalog);
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cronbridge_core::types::{Lookup, TaskSource};
    use cronbridge_hooks::{FaultObserver, PollInterceptor};
    use cronbridge_store::Database;
    use serde_json::json;

    fn scheduler() -> (Arc<HookEngine>, PollScheduler) {
        let engine = Arc::new(HookEngine::new());
        let options = OptionStore::new(Database::open_in_memory().unwrap());
        let poll = PollScheduler::new(engine.clone(), options, &PollConfig::default());
        (engine, poll)
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    struct Faults(Mutex<Vec<SchedulerFault>>);

    impl FaultObserver for Faults {
        fn fault(&self, fault: &SchedulerFault) {
            self.0.lock().unwrap().push(fault.clone());
        }
    }

    /// Claims every lookup as authoritatively missing.
    struct NothingScheduled;

    impl PollInterceptor for NothingScheduled {
        fn pre_get_scheduled(
            &self,
            _ctx: &CallContext,
            _upstream: Option<Lookup>,
            _hook: &str,
            _args: Option<&[Value]>,
            _not_before: Option<i64>,
        ) -> cronbridge_core::Result<Option<Lookup>> {
            Ok(Some(Lookup::Missing))
        }
    }

    /// Records what the schedule and reschedule chains are handed.
    struct Seen(Mutex<Vec<ScheduledTask>>);

    impl PollInterceptor for Seen {
        fn pre_schedule(
            &self,
            _ctx: &CallContext,
            upstream: Option<Placement>,
            task: &ScheduledTask,
        ) -> cronbridge_core::Result<Option<Placement>> {
            self.0.lock().unwrap().push(task.clone());
            Ok(upstream)
        }

        fn pre_reschedule(
            &self,
            _ctx: &CallContext,
            upstream: Option<Placement>,
            task: &ScheduledTask,
        ) -> cronbridge_core::Result<Option<Placement>> {
            self.0.lock().unwrap().push(task.clone());
            Ok(Some(Placement::Poll {
                timestamp: task.timestamp,
            }))
        }
    }

    #[test]
    fn interceptors_see_catalog_interval_and_next_slot() {
        let (engine, poll) = scheduler();
        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        engine.register_poll("seen", 0, seen.clone());
        let ctx = CallContext::new();
        let t = now() + 1_000;

        let task = ScheduledTask::recurring("h", vec![], t, Recurrence::named("hourly", 1));
        poll.schedule_task(&ctx, task.clone()).unwrap();
        let before = now();
        poll.reschedule_task(&ctx, task).unwrap();

        let seen = seen.0.lock().unwrap();
        assert_eq!(seen[0].interval_secs(), Some(3_600));
        assert_eq!(seen[1].interval_secs(), Some(3_600));
        // Not yet due, so the next slot is a full interval past now.
        assert!(seen[1].timestamp >= before + 3_600 && seen[1].timestamp <= now() + 3_600);
    }

    #[test]
    fn raw_interval_is_rejected_before_interceptors_run() {
        let (engine, poll) = scheduler();
        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        engine.register_poll("seen", 0, seen.clone());
        let task = ScheduledTask::recurring("h", vec![], now(), Recurrence::every(90));
        let err = poll.schedule_task(&CallContext::new(), task).unwrap_err();
        assert!(matches!(err, cronbridge_core::BridgeError::Catalog(_)));
        assert!(seen.0.lock().unwrap().is_empty());
    }

    #[test]
    fn schedule_and_lookup_one_shot() {
        let (_engine, poll) = scheduler();
        let ctx = CallContext::new();
        let ts = now() + 100;
        let placement = poll
            .schedule_task(&ctx, ScheduledTask::once("h", vec![json!(1)], ts))
            .unwrap();
        assert_eq!(placement, Placement::Poll { timestamp: ts });

        let found = poll
            .next_scheduled(&ctx, "h", Some(&[json!(1)]), None)
            .unwrap()
            .expect("scheduled");
        assert_eq!(found.timestamp, ts);
        assert_eq!(found.source, TaskSource::Poll);
        assert!(poll.next_scheduled(&ctx, "h", Some(&[json!(2)]), None).unwrap().is_none());
    }

    #[test]
    fn nearby_identical_one_shot_is_a_duplicate() {
        let (_engine, poll) = scheduler();
        let ctx = CallContext::new();
        let ts = now() + 1_000;
        poll.schedule_task(&ctx, ScheduledTask::once("h", vec![], ts)).unwrap();
        let err = poll
            .schedule_task(&ctx, ScheduledTask::once("h", vec![], ts + 60))
            .unwrap_err();
        assert!(matches!(err, cronbridge_core::BridgeError::Scheduler(_)));
        poll.schedule_task(&ctx, ScheduledTask::once("h", vec![], ts + 3_600))
            .unwrap();
    }

    #[test]
    fn unknown_schedule_name_is_rejected() {
        let (_engine, poll) = scheduler();
        let task =
            ScheduledTask::recurring("h", vec![], now(), Recurrence::named("fortnightly", 1));
        let err = poll.schedule_task(&CallContext::new(), task).unwrap_err();
        assert!(matches!(err, cronbridge_core::BridgeError::Catalog(_)));
    }

    #[test]
    fn recurring_interval_comes_from_catalog() {
        let (_engine, poll) = scheduler();
        let ctx = CallContext::new();
        let task = ScheduledTask::recurring("h", vec![], now() + 10, Recurrence::named("hourly", 1));
        poll.schedule_task(&ctx, task).unwrap();
        let stored = poll.next_scheduled(&ctx, "h", None, None).unwrap().unwrap();
        assert_eq!(stored.interval_secs(), Some(3_600));
    }

    #[test]
    fn clear_and_unschedule_hook() {
        let (_engine, poll) = scheduler();
        let ctx = CallContext::new();
        let base = now() + 10_000;
        poll.schedule_task(&ctx, ScheduledTask::once("h", vec![json!("a")], base)).unwrap();
        poll.schedule_task(&ctx, ScheduledTask::once("h", vec![json!("b")], base)).unwrap();
        poll.schedule_task(&ctx, ScheduledTask::once("h", vec![json!("b")], base + 5_000))
            .unwrap();
        assert_eq!(poll.clear_scheduled_hook(&ctx, "h", &[json!("b")]).unwrap(), 2);
        assert_eq!(poll.unschedule_hook(&ctx, "h").unwrap(), 1);
        assert!(poll.manifest().unwrap().is_empty());
    }

    #[test]
    fn run_due_executes_and_reschedules() {
        let (engine, poll) = scheduler();
        let ctx = CallContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        engine.add_action(
            "tick",
            Arc::new(move |ctx: &CallContext, _args: &[Value]| {
                assert!(ctx.is_triggered_by("tick"));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }),
        );
        let t = now();
        poll.schedule_task(
            &ctx,
            ScheduledTask::recurring("tick", vec![], t - 10, Recurrence::named("hourly", 3_600)),
        )
        .unwrap();
        poll.schedule_task(&ctx, ScheduledTask::once("orphan", vec![], t - 5)).unwrap();

        let report = poll.run_due(t).unwrap();
        assert_eq!(report.ran, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let manifest = poll.manifest().unwrap();
        assert_eq!(manifest.len(), 1);
        let next = manifest.next_for("tick", None, None).unwrap();
        assert_eq!(next.timestamp, t - 10 + 3_600);
    }

    #[test]
    fn handler_failure_is_reported_as_fault() {
        let (engine, poll) = scheduler();
        let faults = Arc::new(Faults(Mutex::new(Vec::new())));
        engine.register_fault("faults", 0, faults.clone());
        engine.add_action(
            "boom",
            Arc::new(|_: &CallContext, _: &[Value]| Err::<(), String>("exploded".into())),
        );
        let t = now();
        poll.schedule_task(&CallContext::new(), ScheduledTask::once("boom", vec![], t - 1))
            .unwrap();

        let report = poll.run_due(t).unwrap();
        assert_eq!(report.failed, 1);
        let faults = faults.0.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Execution);
        assert_eq!(faults[0].message, "exploded");
    }

    #[test]
    fn authoritative_missing_lookup_short_circuits() {
        let (engine, poll) = scheduler();
        let ctx = CallContext::new();
        poll.schedule_task(&ctx, ScheduledTask::once("h", vec![], now() + 50)).unwrap();
        engine.register_poll("nothing", 0, Arc::new(NothingScheduled));
        assert!(poll.next_scheduled(&ctx, "h", None, None).unwrap().is_none());
    }

    #[test]
    fn request_trigger_respects_disable_flag() {
        let (_engine, poll) = scheduler();
        assert_eq!(poll.on_request(now()).unwrap(), None);

        let engine = Arc::new(HookEngine::new());
        let options = OptionStore::new(Database::open_in_memory().unwrap());
        let config = PollConfig {
            disable_trigger: false,
            ..PollConfig::default()
        };
        let enabled = PollScheduler::new(engine, options, &config);
        assert_eq!(enabled.on_request(now()).unwrap(), Some(RunReport::default()));
    }
}
