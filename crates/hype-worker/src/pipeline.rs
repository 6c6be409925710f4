//! Batch orchestration: enqueue, supervise, report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use hype_models::{JobItem, JobStatus, PipelineConfig};
use hype_queue::{
    compute_config_hash, compute_input_hash, InputFingerprint, ManifestStore, QueueBackend,
    QueueDb, QueueError, QueueResult, SqliteQueue,
};

use crate::config::WorkerConfig;
use crate::error::{ErrorClass, WorkerResult};
use crate::heartbeat::HeartbeatGuard;
use crate::media::{Detector, Renderer};
use crate::pool::WorkerPool;
use crate::processor::{process_job, ProcessingContext};

/// Knobs for one enqueue pass.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Higher dequeues first.
    pub priority: i64,
    /// Re-enqueue even when the manifest says the input is clean.
    pub force: bool,
    /// Inputs smaller than this are recorded as `skipped`.
    pub min_input_size: u64,
    /// Retry budget per job.
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            force: false,
            min_input_size: 0,
            max_attempts: 3,
        }
    }
}

/// Outcome counts from an enqueue pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueStats {
    pub enqueued: usize,
    pub cached: usize,
    pub skipped: usize,
    pub failed_hash: usize,
    pub total: usize,
}

/// Outcome counts from a processing run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessStats {
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded jobs that produced no clips.
    pub skipped: usize,
    pub total_duration_s: f64,
    /// A fatal condition (disk full) stopped dispatch early.
    pub halted: bool,
}

struct JobOutcome {
    succeeded: bool,
    output_count: usize,
    duration_s: f64,
    fatal: bool,
}

/// The resumable highlight pipeline over one queue database.
pub struct Pipeline {
    queue: SqliteQueue,
    ctx: Arc<ProcessingContext>,
    consumer: String,
}

impl Pipeline {
    pub async fn open(
        config: PipelineConfig,
        worker_config: WorkerConfig,
        detector: Arc<dyn Detector>,
        renderer: Arc<dyn Renderer>,
    ) -> WorkerResult<Self> {
        let db = QueueDb::open(&worker_config.queue_db_path).await?;
        let queue = SqliteQueue::new(db);
        let consumer = format!("worker-{}", Uuid::new_v4());

        let ctx = Arc::new(ProcessingContext {
            detector,
            renderer,
            config,
            worker_config,
        });

        Ok(Self {
            queue,
            ctx,
            consumer,
        })
    }

    pub fn queue(&self) -> &SqliteQueue {
        &self.queue
    }

    /// Fingerprint `video_files`, skip clean and undersized inputs, and
    /// enqueue the rest.
    pub async fn enqueue_batch(
        &self,
        video_files: &[String],
        options: &EnqueueOptions,
    ) -> WorkerResult<EnqueueStats> {
        let config_hash = compute_config_hash(&self.ctx.config)?;
        let mut stats = EnqueueStats {
            total: video_files.len(),
            ..Default::default()
        };

        // Fingerprinting is I/O-heavy; hash in parallel, then walk the
        // results in input order for the serialized queue writes.
        let pool = WorkerPool::new(self.ctx.worker_config.max_concurrent_jobs);
        let fingerprints: Vec<Result<QueueResult<InputFingerprint>, _>> = pool
            .map(video_files.to_vec(), |path| async move {
                compute_input_hash(&path).await
            })
            .await;

        for (video_path, fingerprint) in video_files.iter().zip(fingerprints) {
            let fingerprint = match fingerprint {
                Ok(Ok(fp)) => fp,
                Ok(Err(e)) => {
                    warn!(video = %video_path, error = %e, "failed to fingerprint input");
                    stats.failed_hash += 1;
                    continue;
                }
                Err(e) => {
                    warn!(video = %video_path, error = %e, "fingerprint task aborted");
                    stats.failed_hash += 1;
                    continue;
                }
            };

            let mut item = JobItem::new(
                video_path.as_str(),
                &fingerprint.quick_hash,
                &fingerprint.full_hash,
                fingerprint.size,
                &config_hash,
            )
            .with_priority(options.priority)
            .with_max_attempts(options.max_attempts)
            .with_metadata(json!({
                "config": self.ctx.config,
                "output_dir": self.ctx.worker_config.output_dir,
            }));

            if fingerprint.size < options.min_input_size {
                item.status = JobStatus::Skipped;
                self.queue.enqueue(&item).await?;
                info!(video = %video_path, size = fingerprint.size, "input excluded by size filter");
                stats.skipped += 1;
                continue;
            }

            if !options.force {
                let verdict = self
                    .queue
                    .manifest()
                    .verify_hashes(video_path, &config_hash, &fingerprint)
                    .await?;

                if verdict.is_clean {
                    info!(video = %video_path, reason = %verdict.reason, "cached, skipping");
                    stats.cached += 1;
                    continue;
                }

                info!(video = %video_path, reason = %verdict.reason, "dirty, re-enqueueing");
                self.queue.manifest().mark_dirty(video_path).await?;
            } else if self.queue.manifest().get_item_state(video_path).await?.is_some() {
                // Force must also reprocess succeeded records, which a
                // plain enqueue would refuse to replace.
                self.queue.manifest().mark_dirty(video_path).await?;
            }

            if self.queue.enqueue(&item).await? {
                stats.enqueued += 1;
            } else {
                stats.cached += 1;
            }
        }

        info!(
            enqueued = stats.enqueued,
            cached = stats.cached,
            skipped = stats.skipped,
            failed_hash = stats.failed_hash,
            "enqueue pass complete"
        );
        Ok(stats)
    }

    /// Drain the queue with bounded parallelism.
    ///
    /// Runs crash recovery first, then dispatches until the queue is
    /// empty, `max_jobs` is hit, or a fatal condition halts dispatch
    /// (in-flight jobs still finish).
    pub async fn process_queue(&self, max_jobs: Option<usize>) -> WorkerResult<ProcessStats> {
        let reset = self
            .queue
            .reset_stale_running(self.ctx.worker_config.job_timeout)
            .await?;
        if reset > 0 {
            info!(count = reset, "recovered jobs from crashed workers");
        }

        let pool = WorkerPool::new(self.ctx.worker_config.max_concurrent_jobs);
        let fatal = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let mut dispatched = 0usize;

        loop {
            if fatal.load(Ordering::SeqCst) {
                warn!("fatal condition reported, halting dispatch");
                break;
            }
            if max_jobs.is_some_and(|cap| dispatched >= cap) {
                info!(cap = dispatched, "reached max jobs cap");
                break;
            }

            let Some(permit) = pool.acquire_slot().await else {
                break;
            };
            if fatal.load(Ordering::SeqCst) {
                break;
            }

            let worker_id = format!("{}-{}", self.consumer, dispatched);
            let Some(job) = self.queue.dequeue(&worker_id).await? else {
                // Nothing eligible right now, but an in-flight job may
                // still fail transiently and return to pending. Only an
                // empty queue with an idle pool ends the run.
                drop(permit);
                if pool.idle() {
                    break;
                }
                pool.wait_idle().await;
                continue;
            };
            dispatched += 1;

            // Each execution context gets its own database handle; the
            // shared one stays with the supervisor.
            let job_queue = match QueueDb::open(&self.ctx.worker_config.queue_db_path).await {
                Ok(db) => SqliteQueue::new(db),
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "could not open job database handle");
                    self.queue
                        .ack_fail(job.job_id.as_str(), &e.to_string(), true)
                        .await?;
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            let fatal_flag = Arc::clone(&fatal);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = run_one(ctx, job_queue, job).await;
                if outcome.fatal {
                    fatal_flag.store(true, Ordering::SeqCst);
                }
                outcome
            }));
        }

        let mut stats = ProcessStats::default();
        for result in join_all(handles).await {
            match result {
                Ok(outcome) => {
                    if outcome.succeeded {
                        stats.succeeded += 1;
                        if outcome.output_count == 0 {
                            stats.skipped += 1;
                        }
                    } else {
                        stats.failed += 1;
                    }
                    stats.total_duration_s += outcome.duration_s;
                }
                Err(e) => {
                    error!(error = %e, "job task aborted");
                    stats.failed += 1;
                }
            }
        }
        stats.halted = fatal.load(Ordering::SeqCst);

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            halted = stats.halted,
            "processing run complete"
        );
        Ok(stats)
    }

    /// Per-state job counts, plus a `total`.
    pub async fn queue_stats(&self) -> WorkerResult<BTreeMap<String, usize>> {
        let items = self.queue.get_all_items(None).await?;

        let mut stats: BTreeMap<String, usize> = BTreeMap::new();
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Dirty,
            JobStatus::Skipped,
        ] {
            stats.insert(status.as_str().to_string(), 0);
        }
        for item in &items {
            *stats.entry(item.status.as_str().to_string()).or_insert(0) += 1;
        }
        stats.insert("total".to_string(), items.len());
        Ok(stats)
    }

    /// Reset every failed job back to pending.
    pub async fn retry_failed(&self) -> WorkerResult<usize> {
        Ok(self.queue.retry_failed().await?)
    }

    /// Delete all job records, and optionally the audit log.
    pub async fn clear_queue(&self, clear_transitions: bool) -> WorkerResult<()> {
        Ok(self.queue.clear(clear_transitions).await?)
    }
}

/// Process one claimed job and ack exactly once.
async fn run_one(ctx: Arc<ProcessingContext>, queue: SqliteQueue, job: JobItem) -> JobOutcome {
    let started = Instant::now();
    let job_id = job.job_id.clone();

    let _heartbeat = HeartbeatGuard::start(
        queue.clone(),
        job_id.clone(),
        ctx.worker_config.heartbeat_interval,
    );

    match process_job(&ctx, &job).await {
        Ok(result) => match queue.ack_success(&result).await {
            Ok(()) => JobOutcome {
                succeeded: true,
                output_count: result.output_files.len(),
                duration_s: result.duration_s,
                fatal: false,
            },
            Err(ack_err) => {
                // A result whose artifacts failed validation is a job
                // failure; anything else (lock contention after
                // retries) is worth another attempt.
                let retry = !matches!(ack_err, QueueError::OutputValidation(_));
                error!(job_id = %job_id, error = %ack_err, "success ack rejected");
                if let Err(e) = queue
                    .ack_fail(job_id.as_str(), &ack_err.to_string(), retry)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failure ack also failed");
                }
                JobOutcome {
                    succeeded: false,
                    output_count: 0,
                    duration_s: started.elapsed().as_secs_f64(),
                    fatal: false,
                }
            }
        },
        Err(job_err) => {
            let class = job_err.classify();
            let retry = class == ErrorClass::Transient;
            warn!(
                job_id = %job_id,
                video = %job.video_path,
                error = %job_err,
                ?class,
                "job failed"
            );
            if let Err(e) = queue
                .ack_fail(job_id.as_str(), &job_err.to_string(), retry)
                .await
            {
                error!(job_id = %job_id, error = %e, "failure ack failed");
            }
            JobOutcome {
                succeeded: false,
                output_count: 0,
                duration_s: started.elapsed().as_secs_f64(),
                fatal: class == ErrorClass::Fatal,
            }
        }
    }
}
