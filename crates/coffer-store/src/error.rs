use thiserror::Error;

/// Errors produced by the catalog database.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform config directory.
    #[error("Could not determine application config directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the catalog directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored JSON column could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex decoding error.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Errors produced by replica back ends.
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unsupported replica url: {0}")]
    UnsupportedUrl(String),

    #[error("Invalid object name: {0}")]
    InvalidName(String),

    #[error("Replica IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Replica lock poisoned")]
    Poisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
