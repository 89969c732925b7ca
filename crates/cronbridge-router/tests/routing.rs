//! End-to-end routing behaviour across both schedulers.

use std::sync::{Arc, Weak};

use chrono::Utc;
use cronbridge_core::config::{BridgeConfig, Direction, POLL_ROUTED_GROUP, QUEUE_RUNNER_HOOK};
use cronbridge_core::types::{
    ActionQuery, CallContext, Placement, Recurrence, ScheduledTask, TaskSource,
};
use cronbridge_core::BridgeError;
use cronbridge_hooks::{PollApi, PollInterceptor, QueueApi};
use cronbridge_router::poll_to_queue::POLL_TO_QUEUE_HOOK;
use cronbridge_router::queue_to_poll::QUEUE_TO_POLL_HOOK;
use cronbridge_router::Bridge;
use cronbridge_scheduler::PollScheduler;
use cronbridge_store::Database;
use serde_json::{json, Value};

fn bridge(direction: Direction) -> Bridge {
    let mut config = BridgeConfig::default();
    config.routing.direction = direction;
    Bridge::install(config, Database::open_in_memory().unwrap()).unwrap()
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn runner() -> CallContext {
    CallContext::triggered_by(QUEUE_RUNNER_HOOK)
}

// ── direction selection ──────────────────────────────────────────────────────

#[test]
fn directions_are_mutually_exclusive() {
    let a_to_b = bridge(Direction::PollToQueue);
    assert!(a_to_b.engine.is_registered(POLL_TO_QUEUE_HOOK));
    assert!(!a_to_b.engine.is_registered(QUEUE_TO_POLL_HOOK));

    let b_to_a = bridge(Direction::QueueToPoll);
    assert!(b_to_a.engine.is_registered(QUEUE_TO_POLL_HOOK));
    assert!(!b_to_a.engine.is_registered(POLL_TO_QUEUE_HOOK));

    let off = bridge(Direction::Off);
    assert!(!off.engine.is_registered(POLL_TO_QUEUE_HOOK));
    assert!(!off.engine.is_registered(QUEUE_TO_POLL_HOOK));
}

// ── poll → queue ─────────────────────────────────────────────────────────────

#[test]
fn runner_triggered_one_shot_becomes_queue_action() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 3_600;

    let placement = b
        .poll
        .schedule_task(&runner(), ScheduledTask::once("h", vec![], t))
        .unwrap();

    assert!(matches!(placement, Placement::Queue { .. }));
    let actions = b.queue.query_pending(&ActionQuery::hook("h")).unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].hook, "h");
    assert!(actions[0].args.is_empty());
    assert_eq!(actions[0].scheduled_at, t);
    assert_eq!(actions[0].interval_secs, None);
    assert_eq!(actions[0].group, POLL_ROUTED_GROUP);
    assert!(b.poll.manifest().unwrap().next_for("h", None, None).is_none());
}

#[test]
fn calls_outside_the_runner_stay_on_the_poll_side() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 3_600;

    let placement = b
        .poll
        .schedule_task(&CallContext::new(), ScheduledTask::once("h", vec![], t))
        .unwrap();

    assert_eq!(placement, Placement::Poll { timestamp: t });
    assert!(b.queue.query_pending(&ActionQuery::hook("h")).unwrap().is_empty());
}

#[test]
fn runner_hook_is_never_routed() {
    let b = bridge(Direction::PollToQueue);
    assert!(b
        .queue
        .query_pending(&ActionQuery::hook(QUEUE_RUNNER_HOOK))
        .unwrap()
        .is_empty());
    let runner_event = b
        .poll
        .next_scheduled(&runner(), QUEUE_RUNNER_HOOK, None, None)
        .unwrap();
    assert!(runner_event.is_some());
}

#[test]
fn routed_recurring_task_keeps_its_interval() {
    let b = bridge(Direction::PollToQueue);
    let task = ScheduledTask::recurring(
        "h",
        vec![json!("x")],
        now(),
        Recurrence::named("daily", 86_400),
    );
    b.poll.schedule_task(&runner(), task).unwrap();

    let actions = b.queue.query_pending(&ActionQuery::hook("h")).unwrap();
    assert_eq!(actions[0].interval_secs, Some(86_400));
}

#[test]
fn routed_lookup_reads_the_queue_and_names_the_interval() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 500;
    b.queue
        .schedule_recurring(&CallContext::new(), t, 3_600, "h", &[json!(1)], "")
        .unwrap();
    b.poll
        .schedule_task(&CallContext::new(), ScheduledTask::once("local", vec![], t))
        .unwrap();

    let found = b
        .poll
        .next_scheduled(&runner(), "h", Some(&[json!(1)]), None)
        .unwrap()
        .expect("queue action visible through the poll api");
    assert_eq!(found.timestamp, t);
    assert_eq!(found.source, TaskSource::Queue);
    assert_eq!(found.recurrence, Some(Recurrence::named("hourly", 3_600)));

    // The queue answers authoritatively, so poll-only events are not found.
    assert!(b.poll.next_scheduled(&runner(), "local", None, None).unwrap().is_none());
    assert!(b
        .poll
        .next_scheduled(&CallContext::new(), "local", None, None)
        .unwrap()
        .is_some());
}

#[test]
fn routed_clear_cancels_queue_actions() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 100;
    b.poll
        .schedule_task(&runner(), ScheduledTask::once("h", vec![json!(1)], t))
        .unwrap();
    b.poll
        .schedule_task(&runner(), ScheduledTask::once("h", vec![json!(2)], t))
        .unwrap();

    b.poll.clear_scheduled_hook(&runner(), "h", &[json!(1)]).unwrap();
    let remaining = b
        .queue
        .query_pending(&ActionQuery {
            limit: 10,
            ..ActionQuery::hook("h")
        })
        .unwrap();
    assert_eq!(remaining.len(), 1);

    b.poll.unschedule_hook(&runner(), "h").unwrap();
    assert!(b.queue.query_pending(&ActionQuery::hook("h")).unwrap().is_empty());
}

#[test]
fn routed_recurring_interval_comes_from_the_catalog() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 600;

    b.poll
        .schedule_task(
            &runner(),
            ScheduledTask::recurring("h", vec![], t, Recurrence::named("hourly", 1)),
        )
        .unwrap();
    let actions = b.queue.query_pending(&ActionQuery::hook("h")).unwrap();
    assert_eq!(actions[0].interval_secs, Some(3_600));

    let unknown = b.poll.schedule_task(
        &runner(),
        ScheduledTask::recurring("g", vec![], t, Recurrence::named("fortnightly", 1)),
    );
    assert!(matches!(unknown, Err(BridgeError::Catalog(_))));
    let raw = b.poll.schedule_task(
        &runner(),
        ScheduledTask::recurring("g", vec![], t, Recurrence::every(90)),
    );
    assert!(matches!(raw, Err(BridgeError::Catalog(_))));
    assert!(b.queue.query_pending(&ActionQuery::hook("g")).unwrap().is_empty());
}

#[test]
fn routed_reschedule_recreates_action_at_next_slot() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 1_000;
    let task = ScheduledTask::recurring("h", vec![json!(1)], t, Recurrence::named("daily", 86_400));
    b.poll.schedule_task(&runner(), task.clone()).unwrap();

    let before = now();
    let placement = b.poll.reschedule_task(&runner(), task).unwrap();

    assert!(matches!(placement, Placement::Queue { .. }));
    let pending = b
        .queue
        .query_pending(&ActionQuery {
            limit: 10,
            ..ActionQuery::hook("h")
        })
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].interval_secs, Some(86_400));
    // Same rule as the poll side: not yet due, so one interval past now.
    assert!(pending[0].scheduled_at >= before + 86_400);
    assert!(pending[0].scheduled_at <= now() + 86_400);
    assert!(pending[0].scheduled_at < t + 86_400);
}

#[test]
fn routed_unschedule_cancels_queue_and_removes_poll_copy() {
    let b = bridge(Direction::PollToQueue);
    let t = now() + 2_000;
    b.poll
        .schedule_task(&CallContext::new(), ScheduledTask::once("h", vec![json!(1)], t))
        .unwrap();
    b.poll
        .schedule_task(&runner(), ScheduledTask::once("h", vec![json!(1)], t))
        .unwrap();
    assert_eq!(b.queue.query_pending(&ActionQuery::hook("h")).unwrap().len(), 1);

    let removed = b.poll.unschedule_task(&runner(), t, "h", &[json!(1)]).unwrap();

    assert!(removed);
    assert!(b.queue.query_pending(&ActionQuery::hook("h")).unwrap().is_empty());
    assert!(b.poll.manifest().unwrap().next_for("h", None, None).is_none());
}

/// Answers every schedule call before the router gets a say.
struct Claim;

impl PollInterceptor for Claim {
    fn pre_schedule(
        &self,
        _ctx: &CallContext,
        upstream: Option<Placement>,
        _task: &ScheduledTask,
    ) -> cronbridge_core::Result<Option<Placement>> {
        Ok(upstream.or(Some(Placement::Poll { timestamp: 42 })))
    }
}

#[test]
fn earlier_answer_is_passed_through_untouched() {
    let b = bridge(Direction::PollToQueue);
    b.engine.register_poll("claim", 0, Arc::new(Claim));

    let placement = b
        .poll
        .schedule_task(&runner(), ScheduledTask::once("h", vec![], now() + 100))
        .unwrap();

    assert_eq!(placement, Placement::Poll { timestamp: 42 });
    assert!(b.queue.query_pending(&ActionQuery::hook("h")).unwrap().is_empty());
    assert!(b.poll.manifest().unwrap().next_for("h", None, None).is_none());
}

#[test]
fn routed_lookup_honours_not_before() {
    let b = bridge(Direction::PollToQueue);
    let early = now() + 100;
    let late = now() + 5_000;
    b.queue
        .schedule_single(&CallContext::new(), early, "h", &[], "")
        .unwrap();
    b.queue
        .schedule_single(&CallContext::new(), late, "h", &[], "")
        .unwrap();

    let first = b.poll.next_scheduled(&runner(), "h", None, None).unwrap().unwrap();
    assert_eq!(first.timestamp, early);
    let after = b
        .poll
        .next_scheduled(&runner(), "h", None, Some(early + 1))
        .unwrap()
        .unwrap();
    assert_eq!(after.timestamp, late);
    assert!(b
        .poll
        .next_scheduled(&runner(), "h", None, Some(late + 1))
        .unwrap()
        .is_none());
}

#[test]
fn handlers_run_by_the_queue_runner_schedule_onto_the_queue() {
    let b = bridge(Direction::PollToQueue);
    let poll: Weak<PollScheduler> = Arc::downgrade(&b.poll);
    let child_at = now() + 7_200;
    b.engine.add_action(
        "spawner",
        Arc::new(move |ctx: &CallContext, _args: &[Value]| -> Result<(), String> {
            let poll = poll.upgrade().ok_or("poll scheduler gone")?;
            poll.schedule_task(ctx, ScheduledTask::once("child", vec![], child_at))
                .map(|_| ())
                .map_err(|e| e.to_string())
        }),
    );
    b.queue
        .schedule_single(&CallContext::new(), now() - 1, "spawner", &[], "")
        .unwrap();

    // The runner event sits at install time plus the interval floor.
    let report = b.run(now() + 600).unwrap();

    assert!(report.ran >= 1);
    let children = b.queue.query_pending(&ActionQuery::hook("child")).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].scheduled_at, child_at);
    assert!(b.poll.manifest().unwrap().next_for("child", None, None).is_none());
}

// ── queue → poll ─────────────────────────────────────────────────────────────

#[test]
fn recurring_action_maps_to_named_poll_schedule() {
    let b = bridge(Direction::QueueToPoll);
    let t = now() + 1_000;

    let placement = b
        .queue
        .schedule_recurring(&CallContext::new(), t, 3_600, "h", &[json!(1)], "")
        .unwrap();

    assert_eq!(placement, Placement::Poll { timestamp: t });
    let task = b
        .poll
        .next_scheduled(&CallContext::new(), "h", Some(&[json!(1)]), None)
        .unwrap()
        .expect("routed to poll");
    assert_eq!(task.source, TaskSource::Queue);
    let name = task.recurrence.as_ref().and_then(|r| r.name()).expect("named");
    assert_eq!(b.poll.schedules()[name].interval_secs, 3_600);
    assert!(b.queue.actions().unwrap().is_empty());
}

#[test]
fn unknown_queue_interval_creates_catalog_entry() {
    let b = bridge(Direction::QueueToPoll);
    b.queue
        .schedule_recurring(&CallContext::new(), now() + 10, 900, "h", &[], "")
        .unwrap();
    b.queue
        .schedule_recurring(&CallContext::new(), now() + 10, 900, "g", &[], "")
        .unwrap();

    let catalog = b.poll.schedules();
    let entry = &catalog["queue_every_900_seconds"];
    assert_eq!(entry.interval_secs, 900);
    assert_eq!(b.reconciler.entries().len(), 1);
}

#[test]
fn single_and_async_actions_become_one_shot_poll_events() {
    let b = bridge(Direction::QueueToPoll);
    let t = now() + 5_000;
    b.queue
        .schedule_single(&CallContext::new(), t, "single", &[], "")
        .unwrap();
    let before = now();
    b.queue
        .enqueue_async(&CallContext::new(), "async", &[json!("a")], "")
        .unwrap();

    let manifest = b.poll.manifest().unwrap();
    let single = manifest.next_for("single", None, None).unwrap();
    assert_eq!(single.timestamp, t);
    assert!(!single.is_recurring());
    let async_task = manifest.next_for("async", None, None).unwrap();
    assert!(async_task.timestamp >= before && async_task.timestamp <= now());
}

// ── interval floor ───────────────────────────────────────────────────────────

#[test]
fn floor_lifts_short_recurring_interval() {
    let b = bridge(Direction::Off);
    assert_eq!(b.config.poll.minimum_interval, 300);
    let before = now();

    b.poll
        .schedule_task(
            &CallContext::new(),
            ScheduledTask::recurring("h", vec![], before, Recurrence::named("every_minute", 60)),
        )
        .unwrap();

    let task = b.poll.manifest().unwrap().next_for("h", None, None).unwrap();
    assert_eq!(task.interval_secs(), Some(300));
    assert!(task.timestamp >= before + 300 && task.timestamp <= now() + 300);
}

#[test]
fn floor_applies_to_routed_queue_actions() {
    let b = bridge(Direction::QueueToPoll);
    b.queue
        .schedule_recurring(&CallContext::new(), now(), 60, "h", &[], "")
        .unwrap();
    let task = b.poll.manifest().unwrap().next_for("h", None, None).unwrap();
    assert_eq!(task.interval_secs(), Some(300));
}

#[test]
fn zero_floor_disables_lifting() {
    let mut config = BridgeConfig::default();
    config.poll.minimum_interval = 0;
    let b = Bridge::install(config, Database::open_in_memory().unwrap()).unwrap();
    let runner_event = b
        .poll
        .next_scheduled(&CallContext::new(), QUEUE_RUNNER_HOOK, None, None)
        .unwrap()
        .unwrap();
    assert_eq!(runner_event.interval_secs(), Some(60));
}
