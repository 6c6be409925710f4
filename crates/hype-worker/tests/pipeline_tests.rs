//! End-to-end pipeline tests with fake detection and rendering.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use hype_models::{DetectionConfig, JobStatus, PipelineConfig, RenderingConfig, Segment};
use hype_queue::QueueBackend;
use hype_worker::{
    Detector, EnqueueOptions, Pipeline, Renderer, WorkerConfig, WorkerError, WorkerResult,
};

/// Detector returning a fixed event list, optionally failing the first
/// N calls with a configurable message.
struct FakeDetector {
    events: Vec<Segment>,
    failures_left: AtomicUsize,
    failure_message: String,
}

impl FakeDetector {
    fn with_events(events: Vec<Segment>) -> Self {
        Self {
            events,
            failures_left: AtomicUsize::new(0),
            failure_message: String::new(),
        }
    }

    fn failing_first(n: usize, message: &str, events: Vec<Segment>) -> Self {
        Self {
            events,
            failures_left: AtomicUsize::new(n),
            failure_message: message.to_string(),
        }
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(
        &self,
        _video_path: &Path,
        _config: &DetectionConfig,
    ) -> WorkerResult<Vec<Segment>> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(WorkerError::DetectionFailed(self.failure_message.clone()));
        }
        Ok(self.events.clone())
    }
}

/// Renderer that writes small real files so success validation passes.
struct FakeRenderer {
    fail_message: Option<String>,
}

impl FakeRenderer {
    fn working() -> Self {
        Self { fail_message: None }
    }

    fn failing_with(message: &str) -> Self {
        Self {
            fail_message: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn media_duration(&self, _video_path: &Path) -> WorkerResult<f64> {
        Ok(60.0)
    }

    async fn render_clip(
        &self,
        _input: &Path,
        output: &Path,
        _segment: &Segment,
        _config: &RenderingConfig,
    ) -> WorkerResult<()> {
        if let Some(msg) = &self.fail_message {
            return Err(WorkerError::RenderFailed(msg.clone()));
        }
        tokio::fs::write(output, b"fake clip bytes").await?;
        Ok(())
    }

    async fn concatenate(&self, _inputs: &[PathBuf], output: &Path) -> WorkerResult<()> {
        tokio::fs::write(output, b"fake montage bytes").await?;
        Ok(())
    }
}

fn events() -> Vec<Segment> {
    vec![
        Segment {
            start: 5.0,
            end: 8.0,
            score: 1.0,
        },
        Segment {
            start: 30.0,
            end: 34.0,
            score: 2.0,
        },
    ]
}

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_concurrent_jobs: 1,
            queue_db_path: self
                .dir
                .path()
                .join("queue.db")
                .to_string_lossy()
                .into_owned(),
            output_dir: self.dir.path().join("out").to_string_lossy().into_owned(),
            ..WorkerConfig::default()
        }
    }

    fn write_video(&self, name: &str, content: &[u8]) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn pipeline(
        &self,
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        renderer: Arc<dyn Renderer>,
    ) -> Pipeline {
        Pipeline::open(config, self.worker_config(), detector, renderer)
            .await
            .unwrap()
    }

    async fn pipeline_wide(
        &self,
        max_jobs: usize,
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        renderer: Arc<dyn Renderer>,
    ) -> Pipeline {
        let worker_config = WorkerConfig {
            max_concurrent_jobs: max_jobs,
            ..self.worker_config()
        };
        Pipeline::open(config, worker_config, detector, renderer)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn round_trip_clean_skip_and_config_change() {
    let env = Env::new();
    let video = env.write_video("match.mp4", b"pretend this is a video");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    // First pass renders clips.
    let enq = pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(enq.enqueued, 1);

    let first_job = pipeline.queue().get_all_items(None).await.unwrap().remove(0);

    let run = pipeline.process_queue(None).await.unwrap();
    assert_eq!(run.succeeded, 1);
    assert_eq!(run.failed, 0);

    let item = pipeline
        .queue()
        .get_status(first_job.job_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.status, JobStatus::Succeeded);
    assert_eq!(item.output_files.len(), 2);
    for file in &item.output_files {
        assert!(Path::new(file).exists());
    }

    // Unchanged input under the same config is a cache hit.
    let enq = pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(enq.enqueued, 0);
    assert_eq!(enq.cached, 1);

    // A config change dirties the item and issues a fresh job id.
    let mut changed = PipelineConfig::default();
    changed.processing.merge_gap_s = 9.0;
    let pipeline2 = env
        .pipeline(
            changed,
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    let enq = pipeline2
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(enq.enqueued, 1);

    let items = pipeline2.queue().get_all_items(None).await.unwrap();
    assert_eq!(items.len(), 1, "video_path stays the natural key");
    assert_ne!(items[0].job_id, first_job.job_id);

    let run = pipeline2.process_queue(None).await.unwrap();
    assert_eq!(run.succeeded, 1);
}

#[tokio::test]
async fn no_events_is_success_without_clips() {
    let env = Env::new();
    let video = env.write_video("quiet.mp4", b"nothing interesting inside");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(Vec::new())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    let run = pipeline.process_queue(None).await.unwrap();

    assert_eq!(run.succeeded, 1);
    assert_eq!(run.skipped, 1);

    let item = pipeline.queue().get_all_items(None).await.unwrap().remove(0);
    assert_eq!(item.status, JobStatus::Succeeded);
    assert!(item.output_files.is_empty());
}

#[tokio::test]
async fn missing_input_fails_permanently() {
    let env = Env::new();
    let video = env.write_video("vanishing.mp4", b"here for the enqueue only");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();

    // File disappears between enqueue and processing.
    std::fs::remove_file(&video).unwrap();

    let run = pipeline.process_queue(None).await.unwrap();
    assert_eq!(run.failed, 1);

    let item = pipeline.queue().get_all_items(None).await.unwrap().remove(0);
    assert_eq!(item.status, JobStatus::Failed);
    // Permanent failures skip the retry budget.
    assert_eq!(item.attempt_count, 1);
    assert!(item.last_error.unwrap().contains("not found"));
}

#[tokio::test]
async fn transient_failures_retry_until_exhausted() {
    let env = Env::new();
    let video = env.write_video("flaky.mp4", b"video behind a bad disk");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            // Never recovers within the retry budget.
            Arc::new(FakeDetector::failing_first(10, "i/o stall", events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    let options = EnqueueOptions {
        max_attempts: 2,
        ..EnqueueOptions::default()
    };
    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &options)
        .await
        .unwrap();

    // One run drains the retries: fail -> pending -> fail -> failed.
    let run = pipeline.process_queue(None).await.unwrap();
    assert_eq!(run.failed, 2);

    let item = pipeline.queue().get_all_items(None).await.unwrap().remove(0);
    assert_eq!(item.status, JobStatus::Failed);
    assert_eq!(item.attempt_count, 2);
}

#[tokio::test]
async fn transient_failure_then_recovery_succeeds() {
    let env = Env::new();
    let video = env.write_video("recovers.mp4", b"video behind a flaky disk");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::failing_first(1, "i/o stall", events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    let run = pipeline.process_queue(None).await.unwrap();

    // First dispatch failed, second succeeded, within the same run.
    assert_eq!(run.succeeded, 1);
    assert_eq!(run.failed, 1);

    let item = pipeline.queue().get_all_items(None).await.unwrap().remove(0);
    assert_eq!(item.status, JobStatus::Succeeded);
    assert_eq!(item.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spare_capacity_still_drains_retries() {
    let env = Env::new();
    let video = env.write_video("solo.mp4", b"one flaky video, two slots");

    // More slots than jobs: the dispatcher sees an empty queue while the
    // only job is still in flight. It must wait for the job to land back
    // in pending and retry it, not end the run early.
    let pipeline = env
        .pipeline_wide(
            2,
            PipelineConfig::default(),
            Arc::new(FakeDetector::failing_first(1, "i/o stall", events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    let run = pipeline.process_queue(None).await.unwrap();

    assert_eq!(run.failed, 1);
    assert_eq!(run.succeeded, 1);

    let item = pipeline.queue().get_all_items(None).await.unwrap().remove(0);
    assert_eq!(item.status, JobStatus::Succeeded);
    assert_eq!(item.attempt_count, 1);
}

#[tokio::test]
async fn disk_full_halts_dispatch() {
    let env = Env::new();
    let a = env.write_video("a.mp4", b"first video");
    let b = env.write_video("b.mp4", b"second video");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::failing_with("No space left on device")),
        )
        .await;

    pipeline
        .enqueue_batch(&[a, b], &EnqueueOptions::default())
        .await
        .unwrap();

    let run = pipeline.process_queue(None).await.unwrap();
    assert!(run.halted);
    assert_eq!(run.failed, 1);

    // The second job was never dispatched.
    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats["failed"], 1);
    assert_eq!(stats["pending"], 1);
}

#[tokio::test]
async fn undersized_inputs_are_marked_skipped() {
    let env = Env::new();
    let tiny = env.write_video("tiny.mp4", b"x");
    let real = env.write_video("real.mp4", b"a full size recording, allegedly");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    let options = EnqueueOptions {
        min_input_size: 10,
        ..EnqueueOptions::default()
    };
    let enq = pipeline.enqueue_batch(&[tiny, real], &options).await.unwrap();

    assert_eq!(enq.skipped, 1);
    assert_eq!(enq.enqueued, 1);

    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats["skipped"], 1);
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["total"], 2);
}

#[tokio::test]
async fn unreadable_input_counts_as_failed_hash() {
    let env = Env::new();
    let missing = env
        .dir
        .path()
        .join("never_existed.mp4")
        .to_string_lossy()
        .into_owned();

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    let enq = pipeline
        .enqueue_batch(&[missing], &EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(enq.failed_hash, 1);
    assert_eq!(enq.enqueued, 0);
}

#[tokio::test]
async fn force_reprocesses_clean_inputs() {
    let env = Env::new();
    let video = env.write_video("rerun.mp4", b"processed twice on purpose");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &EnqueueOptions::default())
        .await
        .unwrap();
    pipeline.process_queue(None).await.unwrap();

    let options = EnqueueOptions {
        force: true,
        ..EnqueueOptions::default()
    };
    let enq = pipeline
        .enqueue_batch(std::slice::from_ref(&video), &options)
        .await
        .unwrap();
    assert_eq!(enq.enqueued, 1);

    let run = pipeline.process_queue(None).await.unwrap();
    assert_eq!(run.succeeded, 1);
}

#[tokio::test]
async fn retry_failed_makes_jobs_eligible_again() {
    let env = Env::new();
    let video = env.write_video("eventually.mp4", b"fails once, then fixed");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            // Exhausts the single attempt, then would succeed.
            Arc::new(FakeDetector::failing_first(1, "i/o stall", events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    let options = EnqueueOptions {
        max_attempts: 1,
        ..EnqueueOptions::default()
    };
    pipeline
        .enqueue_batch(std::slice::from_ref(&video), &options)
        .await
        .unwrap();
    pipeline.process_queue(None).await.unwrap();

    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats["failed"], 1);

    assert_eq!(pipeline.retry_failed().await.unwrap(), 1);
    let run = pipeline.process_queue(None).await.unwrap();
    assert_eq!(run.succeeded, 1);

    let item = pipeline.queue().get_all_items(None).await.unwrap().remove(0);
    assert_eq!(item.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn max_jobs_caps_a_run() {
    let env = Env::new();
    let a = env.write_video("a.mp4", b"first video");
    let b = env.write_video("b.mp4", b"second video");

    let pipeline = env
        .pipeline(
            PipelineConfig::default(),
            Arc::new(FakeDetector::with_events(events())),
            Arc::new(FakeRenderer::working()),
        )
        .await;

    pipeline
        .enqueue_batch(&[a, b], &EnqueueOptions::default())
        .await
        .unwrap();

    let run = pipeline.process_queue(Some(1)).await.unwrap();
    assert_eq!(run.succeeded, 1);

    let stats = pipeline.queue_stats().await.unwrap();
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["succeeded"], 1);
}
