use cronbridge_core::BridgeError;
use cronbridge_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the reference schedulers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The recurrence is unknown to the catalog or otherwise unusable.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// An identical one-shot event already sits within the duplicate window.
    #[error("Duplicate event for hook '{hook}'")]
    Duplicate { hook: String },

    /// Raised by an interceptor in the hook chain.
    #[error(transparent)]
    Hook(#[from] BridgeError),
}

impl From<SchedulerError> for BridgeError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Hook(e) => e,
            SchedulerError::Store(e) => e.into(),
            SchedulerError::Serialization(e) => BridgeError::Serialization(e),
            SchedulerError::Database(e) => BridgeError::Storage(e.to_string()),
            SchedulerError::InvalidSchedule(msg) => BridgeError::Catalog(msg),
            other => BridgeError::Scheduler(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
