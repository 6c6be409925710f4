//! Job processing states.

use serde::{Deserialize, Serialize};

/// Job processing state.
///
/// State transitions:
/// ```text
/// pending   → running     (worker dequeues)
/// running   → succeeded   (processing completes, outputs validated)
/// running   → pending     (retryable failure with attempts left, or crash recovery)
/// running   → failed      (non-retryable failure or attempts exhausted)
/// succeeded → dirty       (input content or config changed)
/// dirty     → running     (re-run dequeued)
/// failed    → pending     (manual retry)
/// *         → skipped     (user filter excludes item)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued waiting for a worker
    #[default]
    Pending,
    /// Currently being processed
    Running,
    /// Completed successfully (outputs validated)
    Succeeded,
    /// Failed after exhausting retry attempts
    Failed,
    /// Succeeded previously but input or config changed since
    Dirty,
    /// Intentionally excluded
    Skipped,
}

impl JobStatus {
    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dirty => "dirty",
            JobStatus::Skipped => "skipped",
        }
    }

    /// Check if this is a terminal state (no further transitions expected
    /// without an external signal).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped)
    }

    /// States eligible for dequeue.
    pub fn is_dequeueable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Dirty)
    }

    /// Enqueue over an existing record in this state replaces it; records
    /// that are `running` or `succeeded` are protected (idempotent enqueue).
    pub fn is_replaceable(&self) -> bool {
        !matches!(self, JobStatus::Running | JobStatus::Succeeded)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dirty" => Ok(JobStatus::Dirty),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Dirty,
            JobStatus::Skipped,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("bogus").is_err());
    }

    #[test]
    fn terminal_and_replaceable_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());

        assert!(!JobStatus::Running.is_replaceable());
        assert!(!JobStatus::Succeeded.is_replaceable());
        assert!(JobStatus::Failed.is_replaceable());
        assert!(JobStatus::Dirty.is_replaceable());

        assert!(JobStatus::Pending.is_dequeueable());
        assert!(JobStatus::Dirty.is_dequeueable());
        assert!(!JobStatus::Succeeded.is_dequeueable());
    }
}
