//! Engine Error Module
//!
//! Single error taxonomy shared by every layer of the engine. The variants
//! follow the failure classes the orchestrator cares about when deciding
//! whether an operation may be retried.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Adapter could not be initialized or reached. Fatal for that adapter.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A storage operation failed in a way that may succeed on retry.
    #[error("Storage operation failed: {0}")]
    Operation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Stored data does not match its recorded digest.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Tenant context is required for {0}")]
    TenantRequired(String),

    #[error("Model not registered: {0}")]
    ModelNotRegistered(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether the failure belongs to a transient class that retry may cure.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Operation(_) | EngineError::Io(_) | EngineError::Pool(_) => true,
            EngineError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Short class name, used in logs and audit error text.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Connection(_) => "connection",
            EngineError::Operation(_) | EngineError::Io(_) | EngineError::Sqlite(_) | EngineError::Pool(_) => {
                "operation"
            }
            EngineError::Validation(_) | EngineError::ModelNotRegistered(_) | EngineError::Config(_) => {
                "validation"
            }
            EngineError::Integrity(_) => "integrity",
            EngineError::PermissionDenied(_) | EngineError::TenantRequired(_) => "permission",
            EngineError::Encryption(_) => "encryption",
            EngineError::Serialization(_) => "serialization",
        }
    }
}
