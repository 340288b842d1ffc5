//! Ingest error types

use std::fmt;
use thiserror::Error;

/// Result type alias for ingest operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors that end a pipeline or a run.
///
/// Per-record problems are not errors: they become [`RejectionReason`]s on
/// quarantined lines.
///
/// [`RejectionReason`]: crate::types::RejectionReason
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Unknown data type '{data_type}' for source '{source_id}'")]
    UnknownDataType { source_id: String, data_type: String },

    #[error("Invalid adapter definition: {0}")]
    InvalidAdapter(String),

    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Routing failed for {path}: {cause}")]
    Routing { path: String, cause: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] lifedata_common::CommonError),
}

impl IngestError {
    /// Wrap an object-store failure, keeping the whole context chain
    pub fn storage(err: anyhow::Error) -> Self {
        IngestError::Storage(format!("{:#}", err))
    }
}

/// How a warehouse failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// Connection loss, timeouts, serialization conflicts: retry with backoff
    Transient,
    /// Bad schema, constraint violations, bad SQL: retrying will not help
    Structural,
}

impl LoadErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadErrorKind::Transient => "transient",
            LoadErrorKind::Structural => "structural",
        }
    }
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed warehouse operation. A failed load commits nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} warehouse error: {cause}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub cause: String,
}

impl LoadError {
    pub fn transient(cause: impl Into<String>) -> Self {
        Self {
            kind: LoadErrorKind::Transient,
            cause: cause.into(),
        }
    }

    pub fn structural(cause: impl Into<String>) -> Self {
        Self {
            kind: LoadErrorKind::Structural,
            cause: cause.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == LoadErrorKind::Transient
    }
}

/// SQLSTATE classes and codes worth retrying
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") // connection exception
        || code.starts_with("53") // insufficient resources
        || code == "40001" // serialization_failure
        || code == "40P01" // deadlock_detected
        || code == "57P01" // admin_shutdown
        || code == "57P03" // cannot_connect_now
}

impl From<sqlx::Error> for LoadError {
    fn from(err: sqlx::Error) -> Self {
        let cause = err.to_string();
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => LoadError::transient(cause),
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if is_transient_sqlstate(&code) => LoadError::transient(cause),
                _ => LoadError::structural(cause),
            },
            _ => LoadError::structural(cause),
        }
    }
}
