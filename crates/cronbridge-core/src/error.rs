use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// An interval or schedule name the poll catalog cannot represent.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Durable storage read/write failed.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "CONFIG_ERROR",
            BridgeError::Catalog(_) => "CATALOG_ERROR",
            BridgeError::Storage(_) => "STORAGE_ERROR",
            BridgeError::Serialization(_) => "SERIALIZATION_ERROR",
            BridgeError::Scheduler(_) => "SCHEDULER_ERROR",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
