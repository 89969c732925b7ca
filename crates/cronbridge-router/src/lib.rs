//! `cronbridge-router` — routes tasks between the poll and queue schedulers.
//!
//! Everything here is a registration in the shared [`HookEngine`]:
//!
//! | Component              | Extension point                   |
//! |------------------------|-----------------------------------|
//! | [`PollToQueueRouter`]  | poll interceptor                  |
//! | [`QueueToPollRouter`]  | queue interceptor                 |
//! | [`CatalogReconciler`]  | catalog filter                    |
//! | [`IntervalFloor`]      | commit filter                     |
//! | [`CatalogExtension`]   | catalog filter                    |
//! | [`DebugTrace`]         | poll + queue interceptor (last)   |
//! | [`FaultLogger`]        | fault observer                    |
//!
//! [`Bridge`] wires them according to a [`BridgeConfig`](cronbridge_core::config::BridgeConfig).
//!
//! [`HookEngine`]: cronbridge_hooks::HookEngine

pub mod bridge;
pub mod diagnostics;
pub mod floor;
pub mod poll_to_queue;
pub mod queue_to_poll;
pub mod reconcile;

pub use bridge::{Bridge, Status};
pub use diagnostics::{DebugTrace, FaultLogger};
pub use floor::{CatalogExtension, IntervalFloor};
pub use poll_to_queue::PollToQueueRouter;
pub use queue_to_poll::QueueToPollRouter;
pub use reconcile::CatalogReconciler;
