//! Worker error types and retry classification.

use std::path::PathBuf;

use thiserror::Error;

use hype_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// How a failure should be handled by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help; fail the job immediately.
    Permanent,
    /// Worth another attempt (up to `max_attempts`).
    Transient,
    /// The host itself is unhealthy; stop dispatching new jobs.
    Fatal,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("Input file not readable: {0}")]
    InputUnreadable(PathBuf),

    #[error("Input file is empty: {0}")]
    InputEmpty(PathBuf),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Detection failed: {0}")]
    DetectionFailed(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn detection_failed(msg: impl Into<String>) -> Self {
        Self::DetectionFailed(msg.into())
    }

    pub fn render_failed(msg: impl Into<String>) -> Self {
        Self::RenderFailed(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Classify for retry handling. Unrecognized failures default to
    /// transient so a flaky run gets its retries.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::InputMissing(_)
            | Self::InputUnreadable(_)
            | Self::InputEmpty(_)
            | Self::UnsupportedCodec(_)
            | Self::InvalidArgument(_) => ErrorClass::Permanent,

            Self::DiskFull(_) => ErrorClass::Fatal,

            Self::Queue(QueueError::NotFound(_))
            | Self::Queue(QueueError::PermissionDenied(_))
            | Self::Queue(QueueError::EmptyInput(_)) => ErrorClass::Permanent,

            Self::RenderFailed(msg) | Self::DetectionFailed(msg) => classify_tool_error(msg),

            _ => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.classify() == ErrorClass::Fatal
    }
}

/// Classify an external tool failure from its error text. FFmpeg reports
/// everything on stderr, so string matching is the only signal we get.
fn classify_tool_error(msg: &str) -> ErrorClass {
    let msg = msg.to_lowercase();

    if msg.contains("no space left on device") {
        return ErrorClass::Fatal;
    }

    // Broken or unsupported media: retrying re-reads the same bytes.
    if msg.contains("unsupported codec")
        || msg.contains("decoder not found")
        || msg.contains("invalid data found")
        || msg.contains("moov atom not found")
        || msg.contains("invalid argument")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Transient
}
