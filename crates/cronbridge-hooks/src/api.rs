//! Scheduler APIs the routers translate between.

use std::collections::BTreeMap;

use cronbridge_core::types::{
    ActionQuery, CallContext, CatalogEntry, Placement, QueuedAction, ScheduledTask,
};
use cronbridge_core::Result;
use serde_json::Value;

/// The request-triggered poll scheduler.
pub trait PollApi: Send + Sync {
    fn schedule_task(&self, ctx: &CallContext, task: ScheduledTask) -> Result<Placement>;

    /// Move a recurring task to its next slot after `task.timestamp`.
    fn reschedule_task(&self, ctx: &CallContext, task: ScheduledTask) -> Result<Placement>;

    fn unschedule_task(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> Result<bool>;

    /// Remove every event for `hook` with exactly these arguments.
    fn clear_scheduled_hook(&self, ctx: &CallContext, hook: &str, args: &[Value])
        -> Result<usize>;

    /// Remove every event for `hook` regardless of arguments.
    fn unschedule_hook(&self, ctx: &CallContext, hook: &str) -> Result<usize>;

    fn next_scheduled(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: Option<&[Value]>,
        not_before: Option<i64>,
    ) -> Result<Option<ScheduledTask>>;

    /// The full catalog, built-ins plus every registered catalog filter.
    fn schedules(&self) -> BTreeMap<String, CatalogEntry>;
}

/// The queue-based background task engine.
pub trait QueueApi: Send + Sync {
    fn schedule_single(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
        group: &str,
    ) -> Result<Placement>;

    fn schedule_recurring(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        interval_secs: u64,
        hook: &str,
        args: &[Value],
        group: &str,
    ) -> Result<Placement>;

    fn enqueue_async(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: &[Value],
        group: &str,
    ) -> Result<Placement>;

    /// Cancel pending actions for `hook` with exactly these arguments.
    fn cancel(&self, hook: &str, args: &[Value]) -> Result<usize>;

    /// Cancel pending actions for `hook`, optionally narrowed by arguments.
    fn cancel_all(&self, hook: &str, args: Option<&[Value]>) -> Result<usize>;

    /// Pending actions matching `query`, earliest first.
    fn query_pending(&self, query: &ActionQuery) -> Result<Vec<QueuedAction>>;
}
