//! `cronbridge-core` — shared types, configuration and errors for the
//! poll/queue scheduler bridge.

pub mod config;
pub mod error;
pub mod types;

pub use error::{BridgeError, Result};
