use std::sync::{Arc, Weak};

use cronbridge_core::config::{POLL_ROUTED_GROUP, QUEUE_RUNNER_HOOK};
use cronbridge_core::types::{
    ActionQuery, CallContext, Lookup, Placement, QueuedAction, Recurrence, ScheduledTask,
    TaskSource,
};
use cronbridge_core::Result;
use cronbridge_hooks::{PollInterceptor, QueueApi};
use serde_json::Value;
use tracing::{debug, info};

use crate::reconcile::CatalogReconciler;

pub const POLL_TO_QUEUE_HOOK: &str = "poll-to-queue";

/// Re-issues poll scheduler operations against the queue scheduler.
///
/// Only calls made while the queue runner is executing are translated, and
/// only when no earlier interceptor has answered. The runner's own hook is
/// never routed: it drives the queue and has to stay on the poll side.
pub struct PollToQueueRouter {
    queue: Weak<dyn QueueApi>,
    reconciler: Arc<CatalogReconciler>,
}

impl PollToQueueRouter {
    pub fn new(queue: Weak<dyn QueueApi>, reconciler: Arc<CatalogReconciler>) -> Self {
        Self { queue, reconciler }
    }

    fn target(&self, ctx: &CallContext, hook: &str) -> Option<Arc<dyn QueueApi>> {
        if !ctx.is_triggered_by(QUEUE_RUNNER_HOOK) || hook == QUEUE_RUNNER_HOOK {
            return None;
        }
        let queue = self.queue.upgrade();
        if queue.is_none() {
            debug!(%hook, "queue scheduler gone, passing through");
        }
        queue
    }

    fn to_task(&self, action: QueuedAction) -> Result<ScheduledTask> {
        let recurrence = match action.interval_secs {
            Some(interval) => Some(Recurrence::named(
                self.reconciler.find_or_create(interval)?,
                interval,
            )),
            None => None,
        };
        Ok(ScheduledTask {
            hook: action.hook,
            args: action.args,
            timestamp: action.scheduled_at,
            recurrence,
            source: TaskSource::Queue,
        })
    }
}

/// `task` arrives with its recurrence already pinned to the catalog.
fn create(ctx: &CallContext, queue: &dyn QueueApi, task: &ScheduledTask) -> Result<Placement> {
    let placement = match task.interval_secs() {
        Some(interval) => queue.schedule_recurring(
            ctx,
            task.timestamp,
            interval,
            &task.hook,
            &task.args,
            POLL_ROUTED_GROUP,
        )?,
        None => queue.schedule_single(ctx, task.timestamp, &task.hook, &task.args, POLL_ROUTED_GROUP)?,
    };
    info!(hook = %task.hook, ?placement, "poll task routed to queue");
    Ok(placement)
}

impl PollInterceptor for PollToQueueRouter {
    fn pre_schedule(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        let Some(queue) = self.target(ctx, &task.hook) else {
            return Ok(upstream);
        };
        create(ctx, queue.as_ref(), task).map(Some)
    }

    fn pre_reschedule(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        task: &ScheduledTask,
    ) -> Result<Option<Placement>> {
        if upstream.is_some() || !task.is_recurring() {
            return Ok(upstream);
        }
        let Some(queue) = self.target(ctx, &task.hook) else {
            return Ok(upstream);
        };
        // `task` already carries its next slot.
        queue.cancel(&task.hook, &task.args)?;
        create(ctx, queue.as_ref(), task).map(Some)
    }

    fn pre_unschedule(
        &self,
        ctx: &CallContext,
        upstream: Option<bool>,
        _timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<bool>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        if let Some(queue) = self.target(ctx, hook) {
            queue.cancel(hook, args)?;
        }
        Ok(upstream)
    }

    fn pre_clear_scheduled_hook(
        &self,
        ctx: &CallContext,
        upstream: Option<usize>,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<usize>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        if let Some(queue) = self.target(ctx, hook) {
            queue.cancel_all(hook, Some(args))?;
        }
        Ok(upstream)
    }

    fn pre_unschedule_hook(
        &self,
        ctx: &CallContext,
        upstream: Option<usize>,
        hook: &str,
    ) -> Result<Option<usize>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        if let Some(queue) = self.target(ctx, hook) {
            queue.cancel_all(hook, None)?;
        }
        Ok(upstream)
    }

    fn pre_get_scheduled(
        &self,
        ctx: &CallContext,
        upstream: Option<Lookup>,
        hook: &str,
        args: Option<&[Value]>,
        not_before: Option<i64>,
    ) -> Result<Option<Lookup>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        let Some(queue) = self.target(ctx, hook) else {
            return Ok(upstream);
        };
        let query = ActionQuery {
            args: args.map(<[Value]>::to_vec),
            not_before,
            ..ActionQuery::hook(hook)
        };
        let lookup = match queue.query_pending(&query)?.into_iter().next() {
            Some(action) => Lookup::Found(self.to_task(action)?),
            None => Lookup::Missing,
        };
        Ok(Some(lookup))
    }
}
