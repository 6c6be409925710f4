//! Queue backend: the job state machine.
//!
//! All lifecycle transitions run inside immediate transactions on the
//! serialized write pool, and every transition appends a row to the
//! `state_transitions` audit log.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use hype_models::{JobItem, JobResult, JobStatus};

use crate::db::{retry_on_busy, QueueDb};
use crate::error::{QueueError, QueueResult};
use crate::fingerprint::compute_output_hash;
use crate::manifest::{format_ts, upsert_row, JobItemRow, ManifestStore, SqliteManifest};

/// Cap on stored `last_error` messages.
const MAX_ERROR_LEN: usize = 500;
/// Cap on audit-log error snippets.
const MAX_SNIPPET_LEN: usize = 200;
/// A running job with a heartbeat older than this is presumed abandoned.
const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Atomic job lifecycle operations.
///
/// Implementations must guarantee that concurrent `dequeue` callers can
/// never claim the same job, and that acks are all-or-nothing.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Idempotent enqueue keyed by `video_path`. Returns `true` if the
    /// item was inserted or replaced, `false` when an existing record in
    /// `running` or `succeeded` made it a no-op.
    async fn enqueue(&self, item: &JobItem) -> QueueResult<bool>;

    /// Atomically claim the best eligible job for `worker_id`:
    /// highest priority first, FIFO within a priority.
    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<JobItem>>;

    /// Validate outputs, store their content hashes, and commit
    /// `succeeded`. Fails loudly when any output is missing or empty.
    async fn ack_success(&self, result: &JobResult) -> QueueResult<()>;

    /// Record a failure. Retryable failures with attempts left return
    /// the job to `pending`; everything else is terminal `failed`.
    async fn ack_fail(&self, job_id: &str, error: &str, retry: bool) -> QueueResult<()>;

    /// Point lookup by job id.
    async fn get_status(&self, job_id: &str) -> QueueResult<Option<JobItem>>;

    /// Crash recovery: revert heartbeat-stale `running` jobs to
    /// `pending` without counting an attempt. Returns the reset count.
    async fn reset_stale_running(&self, timeout: Duration) -> QueueResult<usize>;

    /// Record liveness for a `running` job; silently ignored otherwise.
    async fn update_heartbeat(&self, job_id: &str) -> QueueResult<()>;

    /// Bulk query for status reporting.
    async fn get_all_items(&self, status: Option<JobStatus>) -> QueueResult<Vec<JobItem>>;

    /// Reset every `failed` job to `pending` with attempts and error
    /// cleared. Returns the reset count.
    async fn retry_failed(&self) -> QueueResult<usize>;

    /// Delete all job records, and optionally the audit log.
    async fn clear(&self, clear_transitions: bool) -> QueueResult<()>;
}

/// SQLite queue sharing the manifest database.
#[derive(Clone)]
pub struct SqliteQueue {
    db: QueueDb,
    manifest: SqliteManifest,
}

impl SqliteQueue {
    pub fn new(db: QueueDb) -> Self {
        let manifest = SqliteManifest::new(db.clone());
        Self { db, manifest }
    }

    /// The manifest view over the same database.
    pub fn manifest(&self) -> &SqliteManifest {
        &self.manifest
    }

    async fn fetch_by_job_id(
        conn: &mut SqliteConnection,
        job_id: &str,
    ) -> QueueResult<Option<JobItem>> {
        let row = sqlx::query_as::<_, JobItemRow>("SELECT * FROM job_items WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(conn)
            .await?;
        row.map(JobItem::try_from).transpose()
    }
}

async fn log_transition(
    conn: &mut SqliteConnection,
    job_id: &str,
    from_state: Option<&str>,
    to_state: &str,
    worker_id: Option<&str>,
    error: Option<&str>,
) -> QueueResult<()> {
    let snippet: Option<String> = error.map(|e| truncate(e, MAX_SNIPPET_LEN));

    sqlx::query(
        r#"
        INSERT INTO state_transitions (job_id, from_state, to_state, timestamp, worker_id, error_snippet)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job_id)
    .bind(from_state)
    .bind(to_state)
    .bind(format_ts(Utc::now()))
    .bind(worker_id)
    .bind(snippet)
    .execute(conn)
    .await?;

    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn enqueue(&self, item: &JobItem) -> QueueResult<bool> {
        let row = JobItemRow::try_from(item)?;
        let row = &row;

        retry_on_busy("enqueue", || async move {
            // Guard and upsert share one write-locking transaction, so a
            // dequeue committing `running` can never slip between them.
            let mut tx = self.db.begin_immediate().await?;

            let existing: Option<(String,)> =
                sqlx::query_as("SELECT status FROM job_items WHERE video_path = ?")
                    .bind(&row.video_path)
                    .fetch_optional(&mut *tx)
                    .await?;

            let from_state = match existing {
                Some((ref raw,)) => {
                    let status = JobStatus::from_str(raw).map_err(QueueError::corrupt_record)?;
                    if !status.is_replaceable() {
                        tx.rollback().await?;
                        debug!(
                            video_path = %row.video_path,
                            status = %status,
                            "enqueue no-op: record is protected"
                        );
                        return Ok(false);
                    }
                    Some(status.as_str())
                }
                None => None,
            };

            upsert_row(&mut tx, row).await?;
            log_transition(&mut tx, &row.job_id, from_state, &row.status, None, None).await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<JobItem>> {
        retry_on_busy("dequeue", || async move {
            let mut tx = self.db.begin_immediate().await?;

            // The immediate transaction already holds the write lock, so
            // select-then-update here cannot race another dequeuer.
            let candidate = sqlx::query_as::<_, JobItemRow>(
                r#"
                SELECT * FROM job_items
                WHERE status IN ('pending', 'dirty')
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = candidate else {
                tx.rollback().await?;
                return Ok(None);
            };

            let now = format_ts(Utc::now());
            sqlx::query(
                r#"
                UPDATE job_items
                SET status = 'running', worker_id = ?, started_at = ?, last_heartbeat = ?, updated_at = ?
                WHERE job_id = ?
                "#,
            )
            .bind(worker_id)
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .bind(&row.job_id)
            .execute(&mut *tx)
            .await?;

            log_transition(
                &mut tx,
                &row.job_id,
                Some(&row.status),
                JobStatus::Running.as_str(),
                Some(worker_id),
                None,
            )
            .await?;

            tx.commit().await?;

            let mut item = JobItem::try_from(row)?;
            item.status = JobStatus::Running;
            item.worker_id = Some(worker_id.to_string());
            item.started_at = Some(Utc::now());
            item.last_heartbeat = item.started_at;

            debug!(job_id = %item.job_id, worker_id, "job claimed");
            Ok(Some(item))
        })
        .await
    }

    async fn ack_success(&self, result: &JobResult) -> QueueResult<()> {
        // Validate and hash outputs before touching any state. A missing
        // or empty artifact must fail the ack, not silently mark success.
        let mut output_hashes: BTreeMap<String, String> = BTreeMap::new();
        for file in &result.output_files {
            let meta = tokio::fs::metadata(file).await.map_err(|_| {
                QueueError::output_validation(format!("output file missing: {file}"))
            })?;
            if meta.len() == 0 {
                return Err(QueueError::output_validation(format!(
                    "output file is empty: {file}"
                )));
            }
            output_hashes.insert(file.clone(), compute_output_hash(file).await?);
        }

        let job_id = result.job_id.as_str();
        let output_files_json = serde_json::to_string(&result.output_files)?;
        let output_hashes_json = serde_json::to_string(&output_hashes)?;
        let output_files_json = output_files_json.as_str();
        let output_hashes_json = output_hashes_json.as_str();

        retry_on_busy("ack_success", || async move {
            let mut tx = self.db.begin_immediate().await?;

            let Some(item) = Self::fetch_by_job_id(&mut tx, job_id).await? else {
                tx.rollback().await?;
                return Err(QueueError::JobNotFound(job_id.to_string()));
            };

            let now = format_ts(Utc::now());
            sqlx::query(
                r#"
                UPDATE job_items
                SET status = 'succeeded', completed_at = ?, updated_at = ?,
                    output_files = ?, output_hashes = ?, last_error = NULL
                WHERE job_id = ?
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(output_files_json)
            .bind(output_hashes_json)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            log_transition(
                &mut tx,
                job_id,
                Some(item.status.as_str()),
                JobStatus::Succeeded.as_str(),
                item.worker_id.as_deref(),
                None,
            )
            .await?;

            tx.commit().await?;
            info!(job_id, outputs = result.output_files.len(), "job succeeded");
            Ok(())
        })
        .await
    }

    async fn ack_fail(&self, job_id: &str, error: &str, retry: bool) -> QueueResult<()> {
        let error_msg = truncate(error, MAX_ERROR_LEN);
        let error_msg = error_msg.as_str();

        retry_on_busy("ack_fail", || async move {
            let mut tx = self.db.begin_immediate().await?;

            let Some(item) = Self::fetch_by_job_id(&mut tx, job_id).await? else {
                tx.rollback().await?;
                return Err(QueueError::JobNotFound(job_id.to_string()));
            };

            let new_attempt = item.attempt_count + 1;
            let now = format_ts(Utc::now());

            let to_state = if retry && new_attempt < item.max_attempts {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'pending', attempt_count = ?, last_error = ?,
                        worker_id = NULL, updated_at = ?
                    WHERE job_id = ?
                    "#,
                )
                .bind(new_attempt)
                .bind(error_msg)
                .bind(&now)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                JobStatus::Pending
            } else {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'failed', completed_at = ?, attempt_count = ?,
                        last_error = ?, worker_id = NULL, updated_at = ?
                    WHERE job_id = ?
                    "#,
                )
                .bind(&now)
                .bind(new_attempt)
                .bind(error_msg)
                .bind(&now)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                JobStatus::Failed
            };

            log_transition(
                &mut tx,
                job_id,
                Some(item.status.as_str()),
                to_state.as_str(),
                item.worker_id.as_deref(),
                Some(error_msg),
            )
            .await?;

            tx.commit().await?;
            warn!(
                job_id,
                attempt = new_attempt,
                max_attempts = item.max_attempts,
                to_state = %to_state,
                "job failed"
            );
            Ok(())
        })
        .await
    }

    async fn get_status(&self, job_id: &str) -> QueueResult<Option<JobItem>> {
        let row = sqlx::query_as::<_, JobItemRow>("SELECT * FROM job_items WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.db.read())
            .await?;
        row.map(JobItem::try_from).transpose()
    }

    async fn reset_stale_running(&self, timeout: Duration) -> QueueResult<usize> {
        let now = Utc::now();
        let heartbeat_cutoff = format_ts(
            now - chrono::Duration::from_std(HEARTBEAT_STALE_AFTER)
                .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        );
        let started_cutoff = format_ts(
            now - chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(7200)),
        );

        let heartbeat_cutoff = heartbeat_cutoff.as_str();
        let started_cutoff = started_cutoff.as_str();

        retry_on_busy("reset_stale_running", || async move {
            let mut tx = self.db.begin_immediate().await?;

            let stale: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT job_id FROM job_items
                WHERE status = 'running'
                  AND (
                      last_heartbeat < ?
                      OR (started_at < ? AND last_heartbeat IS NULL)
                  )
                "#,
            )
            .bind(heartbeat_cutoff)
            .bind(started_cutoff)
            .fetch_all(&mut *tx)
            .await?;

            let now = format_ts(Utc::now());
            for (job_id,) in &stale {
                // attempt_count untouched: a crashed worker is not a
                // processing failure.
                sqlx::query(
                    "UPDATE job_items SET status = 'pending', worker_id = NULL, updated_at = ? WHERE job_id = ?",
                )
                .bind(&now)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

                log_transition(
                    &mut tx,
                    job_id,
                    Some(JobStatus::Running.as_str()),
                    JobStatus::Pending.as_str(),
                    None,
                    Some("stale job reset (crash recovery)"),
                )
                .await?;
            }

            tx.commit().await?;

            if !stale.is_empty() {
                info!(count = stale.len(), "reset stale running jobs");
            }
            Ok(stale.len())
        })
        .await
    }

    async fn update_heartbeat(&self, job_id: &str) -> QueueResult<()> {
        retry_on_busy("update_heartbeat", || async move {
            // Status guard: a late heartbeat must not resurrect a job
            // that already reached a terminal state.
            sqlx::query(
                "UPDATE job_items SET last_heartbeat = ? WHERE job_id = ? AND status = 'running'",
            )
            .bind(format_ts(Utc::now()))
            .bind(job_id)
            .execute(self.db.write())
            .await
            .map_err(QueueError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_all_items(&self, status: Option<JobStatus>) -> QueueResult<Vec<JobItem>> {
        self.manifest.get_all_items(status).await
    }

    async fn retry_failed(&self) -> QueueResult<usize> {
        retry_on_busy("retry_failed", || async move {
            let mut tx = self.db.begin_immediate().await?;

            let failed: Vec<(String,)> =
                sqlx::query_as("SELECT job_id FROM job_items WHERE status = 'failed'")
                    .fetch_all(&mut *tx)
                    .await?;

            let now = format_ts(Utc::now());
            for (job_id,) in &failed {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'pending', attempt_count = 0, last_error = NULL,
                        worker_id = NULL, updated_at = ?
                    WHERE job_id = ?
                    "#,
                )
                .bind(&now)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

                log_transition(
                    &mut tx,
                    job_id,
                    Some(JobStatus::Failed.as_str()),
                    JobStatus::Pending.as_str(),
                    None,
                    Some("manual retry"),
                )
                .await?;
            }

            tx.commit().await?;
            Ok(failed.len())
        })
        .await
    }

    async fn clear(&self, clear_transitions: bool) -> QueueResult<()> {
        retry_on_busy("clear", || async move {
            let mut tx = self.db.begin_immediate().await?;
            sqlx::query("DELETE FROM job_items").execute(&mut *tx).await?;
            if clear_transitions {
                sqlx::query("DELETE FROM state_transitions")
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}
