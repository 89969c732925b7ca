use std::sync::{Arc, Weak};

use chrono::Utc;
use cronbridge_core::types::{CallContext, Placement, Recurrence, ScheduledTask, TaskSource};
use cronbridge_core::Result;
use cronbridge_hooks::{PollApi, QueueInterceptor};
use serde_json::Value;
use tracing::{debug, info};

use crate::reconcile::CatalogReconciler;

pub const QUEUE_TO_POLL_HOOK: &str = "queue-to-poll";

/// Re-issues queue scheduler create calls against the poll scheduler.
///
/// Unconditional: every create call not already answered upstream becomes a
/// poll event. Raw intervals are mapped to catalog names by the reconciler.
pub struct QueueToPollRouter {
    poll: Weak<dyn PollApi>,
    reconciler: Arc<CatalogReconciler>,
}

impl QueueToPollRouter {
    pub fn new(poll: Weak<dyn PollApi>, reconciler: Arc<CatalogReconciler>) -> Self {
        Self { poll, reconciler }
    }

    fn route(&self, ctx: &CallContext, task: ScheduledTask) -> Result<Option<Placement>> {
        let Some(poll) = self.poll.upgrade() else {
            debug!(hook = %task.hook, "poll scheduler gone, passing through");
            return Ok(None);
        };
        let hook = task.hook.clone();
        let placement = poll.schedule_task(ctx, task.with_source(TaskSource::Queue))?;
        info!(%hook, ?placement, "queue action routed to poll scheduler");
        Ok(Some(placement))
    }
}

impl QueueInterceptor for QueueToPollRouter {
    fn pre_schedule_single(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        timestamp: i64,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<Placement>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        self.route(ctx, ScheduledTask::once(hook, args.to_vec(), timestamp))
    }

    fn pre_schedule_recurring(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        timestamp: i64,
        interval_secs: u64,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<Placement>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        let name = self.reconciler.find_or_create(interval_secs)?;
        let task = ScheduledTask::recurring(
            hook,
            args.to_vec(),
            timestamp,
            Recurrence::named(name, interval_secs),
        );
        self.route(ctx, task)
    }

    fn pre_enqueue_async(
        &self,
        ctx: &CallContext,
        upstream: Option<Placement>,
        hook: &str,
        args: &[Value],
    ) -> Result<Option<Placement>> {
        if upstream.is_some() {
            return Ok(upstream);
        }
        let now = Utc::now().timestamp();
        self.route(ctx, ScheduledTask::once(hook, args.to_vec(), now))
    }
}
