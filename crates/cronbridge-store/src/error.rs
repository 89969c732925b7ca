use cronbridge_core::BridgeError;
use thiserror::Error;

/// Errors raised by the durable storage tier.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt row '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(e) => BridgeError::Serialization(e),
            other => BridgeError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
