//! Queue error types.

use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Input file not found: {0}")]
    NotFound(PathBuf),

    #[error("Input file not readable: {0}")]
    PermissionDenied(PathBuf),

    #[error("Input file is empty: {0}")]
    EmptyInput(PathBuf),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Output validation failed: {0}")]
    OutputValidation(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    pub fn output_validation(msg: impl Into<String>) -> Self {
        Self::OutputValidation(msg.into())
    }

    pub fn corrupt_record(msg: impl Into<String>) -> Self {
        Self::CorruptRecord(msg.into())
    }

    /// Map an I/O error observed while fingerprinting `path` into the
    /// taxonomy callers classify on.
    pub fn from_io_at(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }

    /// True when the underlying SQLite database reported lock contention
    /// (SQLITE_BUSY / SQLITE_LOCKED) and the operation is worth retrying.
    pub fn is_busy(&self) -> bool {
        let QueueError::Database(sqlx_err) = self else {
            return false;
        };

        let sqlx::Error::Database(db_err) = sqlx_err else {
            let msg = sqlx_err.to_string().to_ascii_lowercase();
            return msg.contains("database is locked") || msg.contains("database is busy");
        };

        let code = db_err.code().map(Cow::into_owned);
        if matches!(code.as_deref(), Some("5") | Some("6")) {
            return true;
        }

        let msg = db_err.message().to_ascii_lowercase();
        msg.contains("database is locked") || msg.contains("database is busy")
    }
}
