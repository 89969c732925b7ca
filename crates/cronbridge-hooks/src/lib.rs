//! `cronbridge-hooks` — the interception points of both schedulers and the
//! dispatch table that routes them.
//!
//! Every scheduler operation first runs a priority-ordered chain of
//! interceptors registered in the [`HookEngine`]. The routers, the manifest
//! cache, the interval floor and the diagnostics observers are all just
//! registrations in this table.

pub mod api;
pub mod engine;
pub mod types;

pub use api::{PollApi, QueueApi};
pub use engine::{CycleGuard, HookEngine};
pub use types::{
    ActionHandler, CatalogFilter, CommitFilter, CycleObserver, FaultKind, FaultObserver,
    ManifestInterceptor, PollInterceptor, QueueInterceptor, SchedulerFault,
};
