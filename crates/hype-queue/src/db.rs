//! SQLite connection management.
//!
//! Two pools over the same database file:
//! - a read pool for point lookups and scans
//! - a single-connection write pool, so only one connection ever
//!   attempts to take the SQLite write lock
//!
//! Dequeue and the ack operations run inside `BEGIN IMMEDIATE`
//! transactions on the write pool. Immediate mode takes the write lock
//! up front, which closes the check-then-act race where two callers
//! read the same "next" row before either commits.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::random;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{QueueError, QueueResult};

pub type DbPool = Pool<Sqlite>;

const DEFAULT_READ_POOL_SIZE: u32 = 4;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

const BUSY_MAX_RETRIES: usize = 8;
const BUSY_BASE_DELAY_MS: u64 = 100;
const BUSY_MAX_DELAY_MS: u64 = 2_000;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_items (
    job_id TEXT PRIMARY KEY,
    video_path TEXT UNIQUE NOT NULL,
    input_hash_quick TEXT NOT NULL,
    input_hash_full TEXT NOT NULL,
    input_size INTEGER NOT NULL,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    last_heartbeat TEXT,
    worker_id TEXT,
    last_error TEXT,
    output_files TEXT,
    output_hashes TEXT,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_items_status ON job_items(status);
CREATE INDEX IF NOT EXISTS idx_job_items_priority_created
    ON job_items(priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS state_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    worker_id TEXT,
    error_snippet TEXT
);

CREATE INDEX IF NOT EXISTS idx_transitions_job_ts
    ON state_transitions(job_id, timestamp);
"#;

/// Handle to the queue database (read pool + serialized write pool).
///
/// Cloning is cheap; the pools are internally reference-counted. Each
/// worker execution context should still open its own handle via
/// [`QueueDb::open`] rather than sharing one across the pool boundary.
#[derive(Clone)]
pub struct QueueDb {
    read: DbPool,
    write: DbPool,
    path: PathBuf,
}

impl QueueDb {
    /// Open (creating if missing) the queue database at `path` and
    /// ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .foreign_keys(true)
            .create_if_missing(true);

        let read = SqlitePoolOptions::new()
            .max_connections(DEFAULT_READ_POOL_SIZE)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options.clone())
            .await?;

        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(60))
            .connect_with(connect_options)
            .await?;

        sqlx::raw_sql(SCHEMA_SQL).execute(&write).await?;

        debug!("queue database opened at {}", path.display());

        Ok(Self { read, write, path })
    }

    /// Pool for read-only queries.
    pub fn read(&self) -> &DbPool {
        &self.read
    }

    /// Serialized write pool.
    pub fn write(&self) -> &DbPool {
        &self.write
    }

    /// Path to the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin an immediate (write-locking) transaction on the write pool.
    pub async fn begin_immediate(&self) -> QueueResult<ImmediateTransaction> {
        let mut conn = self.write.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(ImmediateTransaction {
            conn,
            finished: false,
        })
    }
}

/// Manual immediate transaction.
///
/// Dropping without commit closes the connection, which rolls the
/// transaction back at the SQLite level.
pub struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub async fn commit(mut self) -> QueueResult<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> QueueResult<()> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

/// Run `op`, retrying with capped exponential backoff plus jitter while
/// the database reports lock contention. Bounded; the final busy error
/// surfaces to the caller.
pub async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_busy() || attempt >= BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let exp_ms = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt);
                let capped_ms = exp_ms.min(BUSY_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay = Duration::from_millis((capped_ms + jitter_ms).min(BUSY_MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
