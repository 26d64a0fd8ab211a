use thiserror::Error;

use coffer_shared::{CryptoError, IdentityError, ProtocolError};
use coffer_store::{ReplicaError, StoreError};

/// Errors surfaced by every engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid handle {0}")]
    InvalidHandle(u64),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("sync conflict: {0}")]
    SyncConflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("aborted")]
    Aborted,

    #[error("quota exceeded: {used} of {quota} bytes in use, {requested} more requested")]
    QuotaExceeded { used: u64, quota: u64, requested: u64 },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("replica error: {0}")]
    Replica(ReplicaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn malformed(what: impl std::fmt::Display) -> Self {
        Self::MalformedInput(what.to_string())
    }

    pub fn denied(what: impl std::fmt::Display) -> Self {
        Self::AccessDenied(what.to_string())
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound("record".to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<ReplicaError> for EngineError {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::NotFound(name) => Self::NotFound(name),
            ReplicaError::UnsupportedUrl(url) => Self::MalformedInput(format!("unsupported url {url}")),
            ReplicaError::InvalidName(name) => Self::MalformedInput(format!("invalid name {name}")),
            other => Self::Replica(other),
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed => Self::AccessDenied(e.to_string()),
            other => Self::MalformedInput(other.to_string()),
        }
    }
}

impl From<IdentityError> for EngineError {
    fn from(e: IdentityError) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedInput(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    // a panicked holder leaves the resource unusable
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Aborted
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
