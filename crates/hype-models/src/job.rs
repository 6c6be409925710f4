//! Job definitions for queue processing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::JobStatus;

/// Unique identifier for a job.
///
/// Stable across retries of the same enqueue; a re-enqueue after a dirty
/// signal produces a fresh id while `video_path` stays the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work, one-to-one with an input file path at a point in time.
///
/// `video_path` is the unique natural key; the stored row doubles as the
/// manifest entry used for dirty detection after the job completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    /// Unique job ID
    pub job_id: JobId,
    /// Absolute path to the input video (unique natural key)
    pub video_path: String,
    /// Sampled fingerprint (size + 5 windows)
    pub input_hash_quick: String,
    /// Full content hash
    pub input_hash_full: String,
    /// Input file size in bytes
    pub input_size: u64,
    /// Fingerprint of the fully-resolved configuration
    pub config_hash: String,
    /// Current job state
    pub status: JobStatus,
    /// Higher dequeues first
    pub priority: i64,
    /// Failed processing attempts so far
    pub attempt_count: u32,
    /// Retry limit; once reached the job stays `failed` until manually reset
    pub max_attempts: u32,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// When a worker claimed the job
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the owning worker
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Worker that claimed the job (set only while running)
    pub worker_id: Option<String>,
    /// Last error message, truncated
    pub last_error: Option<String>,
    /// Produced artifact paths, in render order
    pub output_files: Vec<String>,
    /// Artifact path → content hash
    pub output_hashes: BTreeMap<String, String>,
    /// Free-form tags (resolved config, output directory)
    pub metadata: serde_json::Value,
}

impl JobItem {
    /// Create a new pending job for an input file.
    pub fn new(
        video_path: impl Into<String>,
        input_hash_quick: impl Into<String>,
        input_hash_full: impl Into<String>,
        input_size: u64,
        config_hash: impl Into<String>,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            video_path: video_path.into(),
            input_hash_quick: input_hash_quick.into(),
            input_hash_full: input_hash_full.into(),
            input_size,
            config_hash: config_hash.into(),
            status: JobStatus::Pending,
            priority: 0,
            attempt_count: 0,
            max_attempts: 3,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            worker_id: None,
            last_error: None,
            output_files: Vec::new(),
            output_hashes: BTreeMap::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set retry limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Attach free-form metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Processing outcome produced by a worker and consumed by the queue acks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Job identifier
    pub job_id: JobId,
    /// Final status (succeeded or failed)
    pub status: JobStatus,
    /// Produced artifact paths
    pub output_files: Vec<String>,
    /// Error details if failed
    pub error_message: Option<String>,
    /// Processing time in seconds
    pub duration_s: f64,
    /// Additional result metadata
    pub metadata: serde_json::Value,
}

impl JobResult {
    /// Successful result with the given outputs.
    pub fn succeeded(job_id: JobId, output_files: Vec<String>, duration_s: f64) -> Self {
        Self {
            job_id,
            status: JobStatus::Succeeded,
            output_files,
            error_message: None,
            duration_s,
            metadata: serde_json::Value::Null,
        }
    }

    /// Failed result carrying an error message.
    pub fn failed(job_id: JobId, error: impl Into<String>, duration_s: f64) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            output_files: Vec::new(),
            error_message: Some(error.into()),
            duration_s,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Append-only audit record written on every status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Auto-increment row id (None until persisted)
    pub id: Option<i64>,
    /// Job identifier
    pub job_id: String,
    /// Previous state (None for the initial enqueue)
    pub from_state: Option<String>,
    /// New state
    pub to_state: String,
    /// Transition time
    pub timestamp: DateTime<Utc>,
    /// Worker that caused the transition
    pub worker_id: Option<String>,
    /// First 200 chars of the error, if any
    pub error_snippet: Option<String>,
}
