//! Job liveness reporting.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use hype_models::JobId;
use hype_queue::{QueueBackend, SqliteQueue};

/// Periodically refreshes a running job's `last_heartbeat` until dropped.
///
/// The processor holds one of these for the lifetime of a job; aborting
/// on drop means a finished (or panicked) job stops heartbeating
/// immediately, and the recovery pass can reclaim it if the worker dies.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    pub fn start(queue: SqliteQueue, job_id: JobId, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick; dequeue just stamped one.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = queue.update_heartbeat(job_id.as_str()).await {
                    warn!(job_id = %job_id, error = %e, "heartbeat update failed");
                }
            }
        });

        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
