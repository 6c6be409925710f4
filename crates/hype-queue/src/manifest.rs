//! Durable per-input manifest.
//!
//! The manifest is the persisted projection of a [`JobItem`], keyed by
//! `video_path`. It outlives queue activity: an entry can report
//! "succeeded" long after its job finished, which is what makes the
//! clean/dirty skip decision possible across runs.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{FromRow, SqliteConnection};

use hype_models::{JobId, JobItem, JobStatus};

use crate::db::{retry_on_busy, QueueDb};
use crate::error::{QueueError, QueueResult};
use crate::fingerprint::InputFingerprint;

/// Outcome of the tiered hash comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashVerdict {
    pub is_clean: bool,
    pub reason: &'static str,
}

impl HashVerdict {
    fn clean(reason: &'static str) -> Self {
        Self {
            is_clean: true,
            reason,
        }
    }

    fn dirty(reason: &'static str) -> Self {
        Self {
            is_clean: false,
            reason,
        }
    }
}

/// Durable, indexed record of per-input processing state.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Point lookup by input path.
    async fn get_item_state(&self, video_path: &str) -> QueueResult<Option<JobItem>>;

    /// Atomic insert-or-update keyed by `video_path`.
    async fn upsert_item(&self, item: &JobItem) -> QueueResult<()>;

    /// Tiered comparison against the stored entry, short-circuiting on
    /// the first mismatch: config hash, size, quick hash, full hash.
    async fn verify_hashes(
        &self,
        video_path: &str,
        config_hash: &str,
        fingerprint: &InputFingerprint,
    ) -> QueueResult<HashVerdict>;

    /// Force status to `dirty` regardless of hash state.
    async fn mark_dirty(&self, video_path: &str) -> QueueResult<()>;

    /// Full scan, optionally filtered by status. Operator tooling only.
    async fn get_all_items(&self, status: Option<JobStatus>) -> QueueResult<Vec<JobItem>>;
}

/// SQLite-backed manifest store.
#[derive(Clone)]
pub struct SqliteManifest {
    db: QueueDb,
}

impl SqliteManifest {
    pub fn new(db: QueueDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &QueueDb {
        &self.db
    }
}

#[async_trait]
impl ManifestStore for SqliteManifest {
    async fn get_item_state(&self, video_path: &str) -> QueueResult<Option<JobItem>> {
        let row = sqlx::query_as::<_, JobItemRow>("SELECT * FROM job_items WHERE video_path = ?")
            .bind(video_path)
            .fetch_optional(self.db.read())
            .await?;

        row.map(JobItem::try_from).transpose()
    }

    async fn upsert_item(&self, item: &JobItem) -> QueueResult<()> {
        let row = JobItemRow::try_from(item)?;
        let row = &row;

        retry_on_busy("upsert_item", || async move {
            let mut conn = self.db.write().acquire().await?;
            upsert_row(&mut conn, row).await
        })
        .await
    }

    async fn verify_hashes(
        &self,
        video_path: &str,
        config_hash: &str,
        fingerprint: &InputFingerprint,
    ) -> QueueResult<HashVerdict> {
        let Some(item) = self.get_item_state(video_path).await? else {
            return Ok(HashVerdict::dirty("not in manifest"));
        };

        if item.config_hash != config_hash {
            return Ok(HashVerdict::dirty("config changed"));
        }

        if item.input_size != fingerprint.size {
            return Ok(HashVerdict::dirty("file size changed"));
        }

        if item.input_hash_quick == fingerprint.quick_hash {
            return Ok(HashVerdict::clean("content unchanged (quick hash match)"));
        }

        if item.input_hash_full != fingerprint.full_hash {
            return Ok(HashVerdict::dirty("file content changed"));
        }

        // Quick hash moved but full hash agrees: the file was touched
        // (e.g. mtime bump) without a byte changing.
        Ok(HashVerdict::clean("metadata changed, content unchanged"))
    }

    async fn mark_dirty(&self, video_path: &str) -> QueueResult<()> {
        retry_on_busy("mark_dirty", || async move {
            sqlx::query("UPDATE job_items SET status = ?, updated_at = ? WHERE video_path = ?")
                .bind(JobStatus::Dirty.as_str())
                .bind(format_ts(Utc::now()))
                .bind(video_path)
                .execute(self.db.write())
                .await
                .map_err(QueueError::from)?;
            Ok(())
        })
        .await
    }

    async fn get_all_items(&self, status: Option<JobStatus>) -> QueueResult<Vec<JobItem>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, JobItemRow>(
                    "SELECT * FROM job_items WHERE status = ? ORDER BY created_at ASC",
                )
                .bind(status.as_str())
                .fetch_all(self.db.read())
                .await?
            }
            None => {
                sqlx::query_as::<_, JobItemRow>("SELECT * FROM job_items ORDER BY created_at ASC")
                    .fetch_all(self.db.read())
                    .await?
            }
        };

        rows.into_iter().map(JobItem::try_from).collect()
    }
}

/// Insert-or-replace a manifest row keyed by `video_path`, on whatever
/// connection or transaction the caller holds.
pub(crate) async fn upsert_row(conn: &mut SqliteConnection, row: &JobItemRow) -> QueueResult<()> {
    sqlx::query(
        r#"
        INSERT INTO job_items (
            job_id, video_path, input_hash_quick, input_hash_full, input_size,
            config_hash, status, priority, attempt_count, max_attempts,
            created_at, updated_at, started_at, completed_at, last_heartbeat,
            worker_id, last_error, output_files, output_hashes, metadata
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(video_path) DO UPDATE SET
            job_id = excluded.job_id,
            input_hash_quick = excluded.input_hash_quick,
            input_hash_full = excluded.input_hash_full,
            input_size = excluded.input_size,
            config_hash = excluded.config_hash,
            status = excluded.status,
            priority = excluded.priority,
            attempt_count = excluded.attempt_count,
            max_attempts = excluded.max_attempts,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            last_heartbeat = excluded.last_heartbeat,
            worker_id = excluded.worker_id,
            last_error = excluded.last_error,
            output_files = excluded.output_files,
            output_hashes = excluded.output_hashes,
            metadata = excluded.metadata
        "#,
    )
    .bind(&row.job_id)
    .bind(&row.video_path)
    .bind(&row.input_hash_quick)
    .bind(&row.input_hash_full)
    .bind(row.input_size)
    .bind(&row.config_hash)
    .bind(&row.status)
    .bind(row.priority)
    .bind(row.attempt_count)
    .bind(row.max_attempts)
    .bind(&row.created_at)
    .bind(&row.updated_at)
    .bind(&row.started_at)
    .bind(&row.completed_at)
    .bind(&row.last_heartbeat)
    .bind(&row.worker_id)
    .bind(&row.last_error)
    .bind(&row.output_files)
    .bind(&row.output_hashes)
    .bind(&row.metadata)
    .execute(conn)
    .await?;

    Ok(())
}

/// Fixed-width RFC 3339 with microseconds, so lexicographic ordering in
/// SQLite matches chronological ordering.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::corrupt_record(format!("bad timestamp {raw:?}: {e}")))
}

/// Raw `job_items` row; JSON columns stay serialized until converted.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobItemRow {
    pub job_id: String,
    pub video_path: String,
    pub input_hash_quick: String,
    pub input_hash_full: String,
    pub input_size: i64,
    pub config_hash: String,
    pub status: String,
    pub priority: i64,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub created_at: String,
    #[allow(dead_code)]
    pub updated_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub last_heartbeat: Option<String>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub output_files: Option<String>,
    pub output_hashes: Option<String>,
    pub metadata: Option<String>,
}

impl TryFrom<JobItemRow> for JobItem {
    type Error = QueueError;

    fn try_from(row: JobItemRow) -> QueueResult<Self> {
        let status = JobStatus::from_str(&row.status).map_err(QueueError::corrupt_record)?;

        let output_files: Vec<String> = match row.output_files.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        let output_hashes: BTreeMap<String, String> = match row.output_hashes.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        let metadata: serde_json::Value = match row.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => serde_json::Value::Null,
        };

        Ok(JobItem {
            job_id: JobId::from_string(row.job_id),
            video_path: row.video_path,
            input_hash_quick: row.input_hash_quick,
            input_hash_full: row.input_hash_full,
            input_size: row.input_size.max(0) as u64,
            config_hash: row.config_hash,
            status,
            priority: row.priority,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: parse_ts(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            last_heartbeat: row.last_heartbeat.as_deref().map(parse_ts).transpose()?,
            worker_id: row.worker_id,
            last_error: row.last_error,
            output_files,
            output_hashes,
            metadata,
        })
    }
}

impl TryFrom<&JobItem> for JobItemRow {
    type Error = QueueError;

    fn try_from(item: &JobItem) -> QueueResult<Self> {
        Ok(Self {
            job_id: item.job_id.as_str().to_string(),
            video_path: item.video_path.clone(),
            input_hash_quick: item.input_hash_quick.clone(),
            input_hash_full: item.input_hash_full.clone(),
            input_size: item.input_size as i64,
            config_hash: item.config_hash.clone(),
            status: item.status.as_str().to_string(),
            priority: item.priority,
            attempt_count: item.attempt_count as i64,
            max_attempts: item.max_attempts as i64,
            created_at: format_ts(item.created_at),
            updated_at: Some(format_ts(Utc::now())),
            started_at: item.started_at.map(format_ts),
            completed_at: item.completed_at.map(format_ts),
            last_heartbeat: item.last_heartbeat.map(format_ts),
            worker_id: item.worker_id.clone(),
            last_error: item.last_error.clone(),
            output_files: Some(serde_json::to_string(&item.output_files)?),
            output_hashes: Some(serde_json::to_string(&item.output_hashes)?),
            metadata: Some(serde_json::to_string(&item.metadata)?),
        })
    }
}
