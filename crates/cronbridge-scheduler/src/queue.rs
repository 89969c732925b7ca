use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use cronbridge_core::config::{QueueConfig, QUEUE_RUNNER_HOOK, QUEUE_RUNNER_SCHEDULE};
use cronbridge_core::types::{
    args_signature, ActionQuery, ActionStatus, CallContext, CatalogEntry, Placement, QueuedAction,
    Recurrence, ScheduledTask,
};
use cronbridge_hooks::{CatalogFilter, FaultKind, HookEngine, PollApi, QueueApi, SchedulerFault};
use cronbridge_store::{Database, StoreError};
use rusqlite::OptionalExtension;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::QueueRunReport;

/// Registration name of the runner's catalog entry.
pub const QUEUE_RUNNER_CATALOG: &str = "queue-runner";
/// Cadence of the runner event before any interval floor applies.
pub const QUEUE_RUNNER_INTERVAL_SECS: u64 = 60;

const ACTION_COLUMNS: &str =
    "id, hook, args, group_name, status, scheduled_at, interval_secs";

type RawAction = (i64, String, String, String, String, i64, Option<i64>);

/// Queue-based background task engine over the `queue_actions` table.
pub struct QueueScheduler {
    engine: Arc<HookEngine>,
    db: Database,
    config: QueueConfig,
}

impl QueueScheduler {
    pub fn new(engine: Arc<HookEngine>, db: Database, config: QueueConfig) -> Result<Self> {
        db.with(init_db)?;
        Ok(Self { engine, db, config })
    }

    /// Bind the queue runner to the poll scheduler.
    ///
    /// Registers the runner as the handler of [`QUEUE_RUNNER_HOOK`], adds the
    /// `every_minute` catalog entry and makes sure a recurring runner event
    /// exists. Returns `false` when the runner is disabled by configuration.
    pub fn attach_runner(self: &Arc<Self>, poll: &dyn PollApi) -> Result<bool> {
        if self.config.disable_runner {
            info!("queue runner disabled, not attaching");
            return Ok(false);
        }

        if !self.engine.is_registered(QUEUE_RUNNER_CATALOG) {
            self.engine
                .register_catalog(QUEUE_RUNNER_CATALOG, 100, Arc::new(RunnerSchedule));
        }

        let queue = Arc::downgrade(self);
        self.engine.add_action(
            QUEUE_RUNNER_HOOK,
            Arc::new(move |ctx: &CallContext, _args: &[Value]| -> std::result::Result<(), String> {
                let Some(queue) = queue.upgrade() else {
                    return Ok(());
                };
                let now = Utc::now().timestamp();
                queue.run_queue_in(ctx, now).map_err(|e| e.to_string())?;
                queue.cleanup(now).map_err(|e| e.to_string())?;
                Ok(())
            }),
        );

        let ctx = CallContext::new();
        if poll.next_scheduled(&ctx, QUEUE_RUNNER_HOOK, None, None)?.is_none() {
            poll.schedule_task(
                &ctx,
                ScheduledTask::recurring(
                    QUEUE_RUNNER_HOOK,
                    vec![],
                    Utc::now().timestamp(),
                    Recurrence::named(QUEUE_RUNNER_SCHEDULE, QUEUE_RUNNER_INTERVAL_SECS),
                ),
            )?;
        }
        info!("queue runner attached to poll scheduler");
        Ok(true)
    }

    /// Execute due actions as the queue runner.
    pub fn run_queue(&self, now: i64) -> Result<QueueRunReport> {
        self.run_queue_in(&CallContext::triggered_by(QUEUE_RUNNER_HOOK), now)
    }

    /// Execute due actions in scheduled order until none remain or the run
    /// time limit is reached. Handlers see `ctx`.
    pub fn run_queue_in(&self, ctx: &CallContext, now: i64) -> Result<QueueRunReport> {
        let started = Instant::now();
        let limit = Duration::from_secs(self.config.run_time_limit);
        let mut report = QueueRunReport::default();

        loop {
            if started.elapsed() >= limit {
                warn!(
                    completed = report.completed,
                    limit_secs = self.config.run_time_limit,
                    "queue run time limit reached"
                );
                report.timed_out = true;
                break;
            }
            let Some(action) = self.claim_next(now)? else {
                break;
            };

            let t = Instant::now();
            let outcome = self
                .engine
                .do_action(ctx, &action.hook, &action.args)
                .unwrap_or_else(|| Err(format!("no handler bound for '{}'", action.hook)));
            match outcome {
                Ok(()) => {
                    self.finish(action.id, ActionStatus::Complete, None, now)?;
                    report.completed += 1;
                    info!(
                        action_id = action.id,
                        hook = %action.hook,
                        duration_ms = t.elapsed().as_millis() as u64,
                        "queue action completed"
                    );
                }
                Err(message) => {
                    self.finish(action.id, ActionStatus::Failed, Some(&message), now)?;
                    report.failed += 1;
                    self.engine.report_fault(SchedulerFault {
                        kind: FaultKind::Execution,
                        hook: action.hook.clone(),
                        message,
                    });
                }
            }

            if let Some(interval) = action.interval_secs {
                if let Err(e) = self.schedule_next_instance(&action, interval, now) {
                    self.engine.report_fault(SchedulerFault {
                        kind: FaultKind::NextInstance,
                        hook: action.hook.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Purge finished actions older than the retention period.
    ///
    /// Removes at most `cleanup_batch_size` rows per call.
    pub fn cleanup(&self, now: i64) -> Result<usize> {
        let cutoff = now - self.config.cleanup_retention_period as i64;
        let statuses = if self.config.cleanup_failed {
            "'complete', 'canceled', 'failed'"
        } else {
            "'complete', 'canceled'"
        };
        let sql = format!(
            "DELETE FROM queue_actions WHERE id IN (
                SELECT id FROM queue_actions
                WHERE status IN ({statuses}) AND finished_at <= ?1
                ORDER BY finished_at LIMIT ?2
            )"
        );
        let batch = self.config.cleanup_batch_size;
        let removed = self
            .db
            .with(|conn| conn.execute(&sql, rusqlite::params![cutoff, batch]))?;
        if removed > 0 {
            info!(removed, "queue actions cleaned up");
        }
        Ok(removed)
    }

    /// Every action regardless of status, for inspection.
    pub fn actions(&self) -> Result<Vec<QueuedAction>> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM queue_actions ORDER BY scheduled_at, id");
        let raw = self.db.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], raw_action)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raw.into_iter().map(decode).collect()
    }

    pub fn count_by_status(&self, status: ActionStatus) -> Result<usize> {
        let n: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM queue_actions WHERE status = ?1",
                [status.to_string()],
                |row| row.get(0),
            )
        })?;
        Ok(n as usize)
    }

    fn insert(
        &self,
        timestamp: i64,
        hook: &str,
        args: &[Value],
        group: &str,
        interval_secs: Option<u64>,
    ) -> Result<i64> {
        let args_json = serde_json::to_string(args)?;
        let sig = args_signature(args);
        let now = Utc::now().to_rfc3339();
        let interval = interval_secs.map(|s| s as i64);
        let id = self.db.with(|conn| {
            conn.execute(
                "INSERT INTO queue_actions
                 (hook, args, args_sig, group_name, status, scheduled_at, interval_secs,
                  attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, 0, ?7, ?7)",
                rusqlite::params![hook, args_json, sig, group, timestamp, interval, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(action_id = id, %hook, timestamp, ?interval_secs, "queue action created");
        Ok(id)
    }

    /// Mark the earliest due pending action as running and return it.
    fn claim_next(&self, now: i64) -> Result<Option<QueuedAction>> {
        let select = format!(
            "SELECT {ACTION_COLUMNS} FROM queue_actions
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at, id LIMIT 1"
        );
        let updated_at = Utc::now().to_rfc3339();
        let raw = self.db.with(|conn| {
            let Some(raw) = conn.query_row(&select, [now], raw_action).optional()? else {
                return Ok(None);
            };
            let claimed = conn.execute(
                "UPDATE queue_actions SET status = 'running', attempts = attempts + 1,
                        updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![raw.0, updated_at],
            )?;
            Ok((claimed == 1).then_some(raw))
        })?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut action = decode(raw)?;
        action.status = ActionStatus::Running;
        Ok(Some(action))
    }

    fn finish(&self, id: i64, status: ActionStatus, error: Option<&str>, now: i64) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        self.db.with(|conn| {
            conn.execute(
                "UPDATE queue_actions SET status = ?2, last_error = ?3, finished_at = ?4,
                        updated_at = ?5
                 WHERE id = ?1",
                rusqlite::params![id, status.to_string(), error, now, updated_at],
            )
        })?;
        Ok(())
    }

    fn schedule_next_instance(&self, action: &QueuedAction, interval: u64, now: i64) -> Result<i64> {
        let interval = interval.max(1) as i64;
        let elapsed = (now - action.scheduled_at).max(0);
        let next = action.scheduled_at + interval * (elapsed / interval + 1);
        self.insert(
            next,
            &action.hook,
            &action.args,
            &action.group,
            Some(interval as u64),
        )
    }

    fn cancel_where(&self, hook: &str, args: Option<&[Value]>) -> Result<usize> {
        let sig = args.map(args_signature);
        let now = Utc::now();
        let n = self.db.with(|conn| {
            conn.execute(
                "UPDATE queue_actions SET status = 'canceled', finished_at = ?3, updated_at = ?4
                 WHERE hook = ?1 AND status = 'pending' AND (?2 IS NULL OR args_sig = ?2)",
                rusqlite::params![hook, sig, now.timestamp(), now.to_rfc3339()],
            )
        })?;
        if n > 0 {
            info!(%hook, canceled = n, "queue actions canceled");
        }
        Ok(n)
    }

    fn query(&self, query: &ActionQuery) -> Result<Vec<QueuedAction>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM queue_actions
             WHERE hook = ?1 AND status = 'pending'
               AND (?2 IS NULL OR args_sig = ?2)
               AND (?3 IS NULL OR scheduled_at >= ?3)
             ORDER BY scheduled_at, id LIMIT ?4"
        );
        let sig = query.args.as_deref().map(args_signature);
        let limit = query.limit.max(1) as i64;
        let raw = self.db.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![query.hook, sig, query.not_before, limit],
                raw_action,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raw.into_iter().map(decode).collect()
    }
}

impl QueueApi for QueueScheduler {
    fn schedule_single(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        hook: &str,
        args: &[Value],
        group: &str,
    ) -> cronbridge_core::Result<Placement> {
        if let Some(placement) = self.engine.pre_schedule_single(ctx, timestamp, hook, args)? {
            return Ok(placement);
        }
        let action_id = self.insert(timestamp, hook, args, group, None)?;
        Ok(Placement::Queue { action_id })
    }

    fn schedule_recurring(
        &self,
        ctx: &CallContext,
        timestamp: i64,
        interval_secs: u64,
        hook: &str,
        args: &[Value],
        group: &str,
    ) -> cronbridge_core::Result<Placement> {
        if let Some(placement) =
            self.engine
                .pre_schedule_recurring(ctx, timestamp, interval_secs, hook, args)?
        {
            return Ok(placement);
        }
        if interval_secs == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "recurring action needs a positive interval".to_string(),
            )
            .into());
        }
        let action_id = self.insert(timestamp, hook, args, group, Some(interval_secs))?;
        Ok(Placement::Queue { action_id })
    }

    fn enqueue_async(
        &self,
        ctx: &CallContext,
        hook: &str,
        args: &[Value],
        group: &str,
    ) -> cronbridge_core::Result<Placement> {
        if let Some(placement) = self.engine.pre_enqueue_async(ctx, hook, args)? {
            return Ok(placement);
        }
        let action_id = self.insert(Utc::now().timestamp(), hook, args, group, None)?;
        Ok(Placement::Queue { action_id })
    }

    fn cancel(&self, hook: &str, args: &[Value]) -> cronbridge_core::Result<usize> {
        Ok(self.cancel_where(hook, Some(args))?)
    }

    fn cancel_all(&self, hook: &str, args: Option<&[Value]>) -> cronbridge_core::Result<usize> {
        Ok(self.cancel_where(hook, args)?)
    }

    fn query_pending(&self, query: &ActionQuery) -> cronbridge_core::Result<Vec<QueuedAction>> {
        Ok(self.query(query)?)
    }
}

/// Adds the runner's `every_minute` entry to the poll catalog.
struct RunnerSchedule;

impl CatalogFilter for RunnerSchedule {
    fn filter_catalog(&self, catalog: &mut BTreeMap<String, CatalogEntry>) {
        catalog.insert(
            QUEUE_RUNNER_SCHEDULE.to_string(),
            CatalogEntry::new(QUEUE_RUNNER_SCHEDULE, QUEUE_RUNNER_INTERVAL_SECS, "Every minute"),
        );
    }
}

fn raw_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAction> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode(raw: RawAction) -> Result<QueuedAction> {
    let (id, hook, args_json, group, status, scheduled_at, interval_secs) = raw;
    let args = serde_json::from_str(&args_json)?;
    let status = status
        .parse::<ActionStatus>()
        .map_err(|reason| StoreError::Corrupt {
            key: format!("queue_actions:{id}"),
            reason,
        })?;
    Ok(QueuedAction {
        id,
        hook,
        args,
        group,
        status,
        scheduled_at,
        interval_secs: interval_secs.map(|s| s as u64),
    })
}
