//! Worker configuration.

use std::thread::available_parallelism;
use std::time::Duration;

/// One job per core when the platform reports a core count.
fn default_worker_count() -> usize {
    available_parallelism().map(|n| n.get()).unwrap_or(2)
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Hard ceiling for a single job before the recovery pass may
    /// reclaim it
    pub job_timeout: Duration,
    /// Interval between liveness updates while a job runs
    pub heartbeat_interval: Duration,
    /// Path to the queue database file
    pub queue_db_path: String,
    /// Directory where rendered clips land
    pub output_dir: String,
    /// Free space required before starting a job, as a multiple of the
    /// input size
    pub disk_headroom_factor: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_worker_count(),
            job_timeout: Duration::from_secs(7200), // 2 hours
            heartbeat_interval: Duration::from_secs(60),
            queue_db_path: "hype_queue.db".to_string(),
            output_dir: "output".to_string(),
            disk_headroom_factor: 1.5,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_jobs: std::env::var("HYPE_MAX_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_worker_count),
            job_timeout: Duration::from_secs(
                std::env::var("HYPE_JOB_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(7200),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("HYPE_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            queue_db_path: std::env::var("HYPE_QUEUE_DB")
                .unwrap_or_else(|_| "hype_queue.db".to_string()),
            output_dir: std::env::var("HYPE_OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()),
            disk_headroom_factor: std::env::var("HYPE_DISK_HEADROOM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = WorkerConfig::default();
        assert!(config.max_concurrent_jobs >= 1);
        assert!(config.disk_headroom_factor > 1.0);
        assert!(config.heartbeat_interval < config.job_timeout);
    }
}
