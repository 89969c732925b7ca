//! Opt-in logging observers.

use cronbridge_core::types::{CallContext, Placement, ScheduledTask};
use cronbridge_core::Result;
use cronbridge_hooks::{FaultKind, FaultObserver, PollInterceptor, QueueInterceptor, SchedulerFault};
use serde_json::Value;
use tracing::{debug, error, warn};

pub const DEBUG_TRACE_HOOK: &str = "debug-trace";
pub const FAULT_LOGGER_HOOK: &str = "fault-logger";

/// Logs every scheduling intent at debug level. Registered last in the
/// chain so it sees the final answer; never changes it.
pub struct DebugTrace;

impl PollInterceptor for DebugTrace {
    fn pre_schedule(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        debug!(
            hook = %task.hook,
            timestamp = task.timestamp,
            interval_secs = ?task.interval_secs(),
            trigger = ?ctx.trigger,
            answered = ?upstream,
            "poll schedule"
        );
        Ok(upstream)
    }

    fn pre_reschedule(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        debug!(
            hook = %task.hook,
            timestamp = task.timestamp,
            trigger = ?ctx.trigger,
            answered = ?upstream,
            "poll reschedule"
        );
        Ok(upstream)
    }

    fn pre_unschedule(
        &self,
        _ctx: &CallContext,
        upstream: Option<bool>,
        timestamp: i64,
        hook: &str,
        _args: &[Value],
    ) -> Result<Option<bool>> {
        debug!(%hook, timestamp, answered = ?upstream, "poll unschedule");
        Ok(upstream)
    }
}

impl QueueInterceptor for DebugTrace {
    fn pre_schedule_single(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        timestamp: i64,
        hook: &str,
        _args: &[Value],
    ) -> Result<Option<Placement>> {
        debug!(%hook, timestamp, answered = ?upstream, "queue single");
        Ok(upstream)
    }

    fn pre_schedule_recurring(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        timestamp: i64,
        interval_secs: u64,
        hook: &str,
        _args: &[Value],
    ) -> Result<Option<Placement>> {
        debug!(%hook, timestamp, interval_secs, answered = ?upstream, "queue recurring");
        Ok(upstream)
    }

    fn pre_enqueue_async(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        hook: &str,
        _args: &[Value],
    ) -> Result<Option<Placement>> {
        debug!(%hook, answered = ?upstream, "queue async");
        Ok(upstream)
    }
}

/// Logs scheduler faults.
pub struct FaultLogger;

impl FaultObserver for FaultLogger {
    fn fault(&self, fault: &SchedulerFault) {
        match fault.kind {
            FaultKind::Execution => {
                error!(hook = %fault.hook, message = %fault.message, "scheduled action failed")
            }
            FaultKind::Reschedule => {
                warn!(hook = %fault.hook, message = %fault.message, "could not reschedule event")
            }
            FaultKind::Unschedule => {
                warn!(hook = %fault.hook, message = %fault.message, "could not unschedule event")
            }
            FaultKind::NextInstance => warn!(
                hook = %fault.hook,
                message = %fault.message,
                "could not schedule next instance of recurring action"
            ),
        }
    }
}
