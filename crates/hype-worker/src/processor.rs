//! Per-job processing: validate, detect, shape, render.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sysinfo::Disks;
use tracing::{debug, info};

use hype_models::{JobItem, JobResult, PipelineConfig};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::media::{Detector, Renderer};
use crate::segments::{clamp_segments, filter_min_duration, merge_segments, pad_segments};

/// Everything a job needs besides the job itself.
pub struct ProcessingContext {
    pub detector: Arc<dyn Detector>,
    pub renderer: Arc<dyn Renderer>,
    pub config: PipelineConfig,
    pub worker_config: WorkerConfig,
}

/// Run one job end to end and return its result. Does not touch queue
/// state; the caller owns the ack.
///
/// The job's metadata may carry the resolved config and output
/// directory it was enqueued with; those win over the context defaults
/// so a re-run processes old jobs the way they were submitted.
pub async fn process_job(ctx: &ProcessingContext, job: &JobItem) -> WorkerResult<JobResult> {
    let started = Instant::now();
    let input = Path::new(&job.video_path);

    let config = job_config(ctx, job)?;
    let output_dir = job
        .metadata
        .get("output_dir")
        .and_then(|v| v.as_str())
        .unwrap_or(&ctx.worker_config.output_dir)
        .to_string();
    let output_dir = Path::new(&output_dir);

    validate_input(input).await?;

    check_disk_space(
        output_dir,
        headroom_bytes(job.input_size, ctx.worker_config.disk_headroom_factor),
    )?;
    tokio::fs::create_dir_all(output_dir).await?;

    let duration = ctx.renderer.media_duration(input).await?;
    let events = ctx.detector.detect(input, &config.detection).await?;

    if events.is_empty() {
        // Nothing worth clipping is a valid outcome, not a failure.
        info!(video = %job.video_path, "no events detected");
        return Ok(JobResult::succeeded(
            job.job_id.clone(),
            Vec::new(),
            started.elapsed().as_secs_f64(),
        ));
    }

    let shaped = merge_segments(
        clamp_segments(
            pad_segments(
                filter_min_duration(events, config.detection.min_event_duration_s),
                config.processing.context_padding_s,
            ),
            0.0,
            duration,
        ),
        config.processing.merge_gap_s,
        config.processing.max_segment_duration_s,
    );

    debug!(
        video = %job.video_path,
        segments = shaped.len(),
        "segments shaped"
    );

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip".to_string());
    let format = &config.rendering.output_format;

    let mut clip_paths: Vec<PathBuf> = Vec::with_capacity(shaped.len());
    for (i, segment) in shaped.iter().enumerate() {
        let clip = output_dir.join(format!("{stem}_clip_{i:03}.{format}"));
        ctx.renderer
            .render_clip(input, &clip, segment, &config.rendering)
            .await?;
        clip_paths.push(clip);
    }

    let mut outputs: Vec<String> = clip_paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    if config.rendering.concatenate && clip_paths.len() > 1 {
        let montage = output_dir.join(format!("{stem}_highlights.{format}"));
        ctx.renderer.concatenate(&clip_paths, &montage).await?;
        outputs.push(montage.to_string_lossy().into_owned());
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        video = %job.video_path,
        clips = outputs.len(),
        elapsed_s = %format!("{elapsed:.1}"),
        "job processed"
    );

    Ok(JobResult::succeeded(job.job_id.clone(), outputs, elapsed))
}

fn job_config(ctx: &ProcessingContext, job: &JobItem) -> WorkerResult<PipelineConfig> {
    match job.metadata.get("config") {
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
            WorkerError::invalid_argument(format!("job carries unreadable config: {e}"))
        }),
        None => Ok(ctx.config.clone()),
    }
}

async fn validate_input(input: &Path) -> WorkerResult<()> {
    let meta = tokio::fs::metadata(input).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => WorkerError::InputMissing(input.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => WorkerError::InputUnreadable(input.to_path_buf()),
        _ => WorkerError::Io(e),
    })?;

    if meta.len() == 0 {
        return Err(WorkerError::InputEmpty(input.to_path_buf()));
    }
    Ok(())
}

fn headroom_bytes(input_size: u64, factor: f64) -> u64 {
    (input_size as f64 * factor.max(1.0)) as u64
}

/// Preflight free-space check on the disk holding `output_dir`.
///
/// When no mounted disk matches the path (unusual container setups),
/// the check is skipped rather than failing the job.
fn check_disk_space(output_dir: &Path, required: u64) -> WorkerResult<()> {
    let probe = output_dir
        .canonicalize()
        .unwrap_or_else(|_| output_dir.to_path_buf());

    let disks = Disks::new_with_refreshed_list();
    let best = disks
        .iter()
        .filter(|d| probe.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    if let Some(disk) = best {
        let available = disk.available_space();
        if available < required {
            return Err(WorkerError::DiskFull(format!(
                "{} has {} bytes free, job needs {}",
                disk.mount_point().display(),
                available,
                required
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn validate_rejects_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();

        let missing = validate_input(&dir.path().join("nope.mp4")).await;
        assert!(matches!(missing, Err(WorkerError::InputMissing(_))));

        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        let result = validate_input(&empty).await;
        assert!(matches!(result, Err(WorkerError::InputEmpty(_))));

        let real = dir.path().join("real.mp4");
        std::fs::write(&real, b"bytes").unwrap();
        assert!(validate_input(&real).await.is_ok());
    }

    #[test]
    fn headroom_never_shrinks_the_requirement() {
        assert_eq!(headroom_bytes(1000, 1.5), 1500);
        // Factors below 1.0 clamp up.
        assert_eq!(headroom_bytes(1000, 0.5), 1000);
    }

    #[test]
    fn tiny_requirement_passes_disk_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_disk_space(dir.path(), 1).is_ok());
    }
}
