//! `cronbridge-scheduler` — the two schedulers the bridge sits between.
//!
//! # Overview
//!
//! [`PollScheduler`] keeps every pending event in a single manifest and runs
//! due events when triggered (by an inbound request or an external `run`).
//! [`QueueScheduler`] persists actions to a SQLite `queue_actions` table and
//! executes them from a runner that is itself a recurring poll event.
//!
//! | Scheduler | Recurrence          | Storage                    |
//! |-----------|---------------------|----------------------------|
//! | Poll      | Named catalog entry | Manifest (cache or option) |
//! | Queue     | Raw seconds         | `queue_actions` table      |

pub mod catalog;
pub mod db;
pub mod error;
pub mod poll;
pub mod queue;
pub mod types;

pub use error::{Result, SchedulerError};
pub use poll::PollScheduler;
pub use queue::QueueScheduler;
pub use types::{QueueRunReport, RunReport};
