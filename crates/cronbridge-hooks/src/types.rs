use std::collections::BTreeMap;

use cronbridge_core::types::{
    CallContext, CatalogEntry, CycleKind, Lookup, Manifest, Placement, ScheduledTask, SetOutcome,
};
use cronbridge_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Interception points in front of every poll scheduler operation.
///
/// Each method receives the value produced by earlier interceptors in the
/// chain (`upstream`, `None` when nobody has answered yet) and returns the
/// value handed to the next one. A `Some` at the end of the chain
/// short-circuits the poll scheduler's own handling. Default methods pass
/// the upstream value through unchanged.
pub trait PollInterceptor: Send + Sync {
    fn pre_schedule(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        _task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        Ok(upstream)
    }

    fn pre_reschedule(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        _task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        Ok(upstream)
    }

    fn pre_unschedule(
        &self,
        _ctx: &CallContext,
        upstream: Option<bool>,
        _timestamp: i64,
        _hook: &str,
        _args: &[Value],
    ) -> Result<Option<bool>> {
        Ok(upstream)
    }

    fn pre_clear_scheduled_hook(
        &self,
        _ctx: &CallContext,
        upstream: Option<usize>,
        _hook: &str,
        _args: &[Value],
    ) -> Result<Option<usize>> {
        Ok(upstream)
    }

    fn pre_unschedule_hook(
        &self,
        _ctx: &CallContext,
        upstream: Option<usize>,
        _hook: &str,
    ) -> Result<Option<usize>> {
        Ok(upstream)
    }

    fn pre_get_scheduled(
        &self,
        _ctx: &CallContext,
        upstream: Option<Lookup>,
        _hook: &str,
        _args: Option<&[Value]>,
        _not_before: Option<i64>,
    ) -> Result<Option<Lookup>> {
        Ok(upstream)
    }
}

/// Interception points in front of the queue scheduler's create calls.
pub trait QueueInterceptor: Send + Sync {
    fn pre_schedule_single(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        _timestamp: i64,
        _hook: &str,
        _args: &[Value],
    ) -> Result<Option<Placement>> {
        Ok(upstream)
    }

    fn pre_schedule_recurring(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        _timestamp: i64,
        _interval_secs: u64,
        _hook: &str,
        _args: &[Value],
    ) -> Result<Option<Placement>> {
        Ok(upstream)
    }

    fn pre_enqueue_async(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        _hook: &str,
        _args: &[Value],
    ) -> Result<Option<Placement>> {
        Ok(upstream)
    }
}

/// Alternate home for the poll manifest.
///
/// The first interceptor returning `Some` satisfies the read or absorbs the
/// write; the poll scheduler's legacy option is only used when none does.
pub trait ManifestInterceptor: Send + Sync {
    fn read_manifest(&self) -> Result<Option<Manifest>>;
    fn write_manifest(&self, manifest: &Manifest) -> Result<Option<SetOutcome>>;
}

/// Last look at a poll task before it is written to the manifest.
pub trait CommitFilter: Send + Sync {
    fn filter_commit(&self, task: ScheduledTask, now: i64) -> ScheduledTask;
}

/// Contributes entries to the poll catalog listing. Later filters override
/// earlier ones by name.
pub trait CatalogFilter: Send + Sync {
    fn filter_catalog(&self, catalog: &mut BTreeMap<String, CatalogEntry>);
}

/// Notified when a request or batch cycle opens and completes.
pub trait CycleObserver: Send + Sync {
    fn cycle_started(&self, _kind: CycleKind) {}
    fn cycle_completed(&self, kind: CycleKind);
}

/// What went wrong inside one of the schedulers' own engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A recurring poll event could not be moved to its next slot.
    Reschedule,
    /// A fired poll event could not be removed.
    Unschedule,
    /// A handler returned an error.
    Execution,
    /// The next instance of a recurring queue action could not be created.
    NextInstance,
}

/// A scheduler fault reported to [`FaultObserver`]s. Faults never abort the
/// run that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerFault {
    pub kind: FaultKind,
    pub hook: String,
    pub message: String,
}

pub trait FaultObserver: Send + Sync {
    fn fault(&self, fault: &SchedulerFault);
}

/// Work executed when a scheduled hook fires.
pub trait ActionHandler: Send + Sync {
    fn run(&self, ctx: &CallContext, args: &[Value]) -> std::result::Result<(), String>;
}

impl<F> ActionHandler for F
where
    F: Fn(&CallContext, &[Value]) -> std::result::Result<(), String> + Send + Sync,
{
    fn run(&self, ctx: &CallContext, args: &[Value]) -> std::result::Result<(), String> {
        self(ctx, args)
    }
}
