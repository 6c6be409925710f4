//! Highlight-extraction worker binary.
//!
//! Scans the directory given on the command line (default `videos/`),
//! enqueues every video file, and drains the queue.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hype_models::PipelineConfig;
use hype_worker::{
    EnqueueOptions, FfmpegRenderer, Pipeline, SilenceDetector, WorkerConfig,
};

const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "mov", "avi", "webm"];

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hype=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting hype-worker");

    let worker_config = WorkerConfig::from_env();
    info!("Worker config: {:?}", worker_config);

    let scan_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "videos".to_string());

    let videos = match collect_videos(&scan_dir) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to scan {}: {}", scan_dir, e);
            std::process::exit(1);
        }
    };
    info!("Found {} video files under {}", videos.len(), scan_dir);

    let pipeline = match Pipeline::open(
        PipelineConfig::default(),
        worker_config,
        Arc::new(SilenceDetector::default()),
        Arc::new(FfmpegRenderer),
    )
    .await
    {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to open pipeline: {}", e);
            std::process::exit(1);
        }
    };

    let enqueue_stats = match pipeline
        .enqueue_batch(&videos, &EnqueueOptions::default())
        .await
    {
        Ok(stats) => stats,
        Err(e) => {
            error!("Enqueue failed: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Enqueued {} / {} ({} cached, {} skipped, {} failed to hash)",
        enqueue_stats.enqueued,
        enqueue_stats.total,
        enqueue_stats.cached,
        enqueue_stats.skipped,
        enqueue_stats.failed_hash
    );

    let run = tokio::select! {
        result = pipeline.process_queue(None) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal; in-flight jobs will be recovered on next run");
            return;
        }
    };

    match run {
        Ok(stats) => {
            info!(
                "Done: {} succeeded ({} with no clips), {} failed, {:.1}s total",
                stats.succeeded, stats.skipped, stats.failed, stats.total_duration_s
            );
            if stats.halted {
                error!("Processing halted on a fatal condition; check disk space");
                std::process::exit(2);
            }
        }
        Err(e) => {
            error!("Processing run failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn collect_videos(dir: &str) -> std::io::Result<Vec<String>> {
    let mut videos = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_video = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_video {
            videos.push(path.to_string_lossy().into_owned());
        }
    }
    videos.sort();
    Ok(videos)
}
