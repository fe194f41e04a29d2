use crate::driver::DriverError;
use std::fmt;
use thiserror::Error;

/// Pipeline phase a callback or listener was running in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPhase {
    BeforeConvert,
    BeforeSave,
    AfterSave,
    AfterConvert,
}

impl fmt::Display for CallbackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackPhase::BeforeConvert => write!(f, "before-convert"),
            CallbackPhase::BeforeSave => write!(f, "before-save"),
            CallbackPhase::AfterSave => write!(f, "after-save"),
            CallbackPhase::AfterConvert => write!(f, "after-convert"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error(
        "Optimistic lock exception on saving entity {entity} with id {id} and version {version} to collection '{collection}'"
    )]
    OptimisticLockingFailure {
        entity: String,
        collection: String,
        id: String,
        version: i64,
    },

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Data integrity violation: {0}")]
    DataIntegrityViolation(String),

    #[error("Resource failure: {0}")]
    ResourceFailure(String),

    #[error("Query timeout: {0}")]
    QueryTimeout(String),

    #[error("Transient failure: {0}")]
    TransientFailure(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("{phase} callback rejected the operation: {message}")]
    CallbackRejected {
        phase: CallbackPhase,
        message: String,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl DbError {
    /// Invalid call shape, reported before anything reaches the store.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, DbError::InvalidUsage(_) | DbError::Mapping(_))
    }

    /// A storage-consistency conflict: lost optimistic lock or duplicate key.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DbError::OptimisticLockingFailure { .. }
                | DbError::DuplicateKey(_)
                | DbError::DataIntegrityViolation(_)
        )
    }

    /// Infrastructure fault raised by the store or the path to it.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            DbError::ResourceFailure(_)
                | DbError::QueryTimeout(_)
                | DbError::TransientFailure(_)
                | DbError::PermissionDenied(_)
                | DbError::Driver(_)
        )
    }

    pub fn callback(phase: CallbackPhase, message: impl Into<String>) -> Self {
        DbError::CallbackRejected {
            phase,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Mapping(err.to_string())
    }
}
