//! Detection and rendering seams.
//!
//! Both traits wrap external process invocations; the FFmpeg-backed
//! implementations here surface tool failures as errors the processor
//! classifies by message text.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use hype_models::{DetectionConfig, RenderingConfig, Segment};

use crate::error::{WorkerError, WorkerResult};

/// How much tool stderr to keep in error messages.
const STDERR_TAIL: usize = 800;

/// Finds highlight-worthy time ranges in a video.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, video_path: &Path, config: &DetectionConfig)
        -> WorkerResult<Vec<Segment>>;
}

/// Cuts and assembles clips.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Media duration in seconds.
    async fn media_duration(&self, video_path: &Path) -> WorkerResult<f64>;

    /// Render one segment of `input` into `output`.
    async fn render_clip(
        &self,
        input: &Path,
        output: &Path,
        segment: &Segment,
        config: &RenderingConfig,
    ) -> WorkerResult<()>;

    /// Concatenate rendered clips into a single file.
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> WorkerResult<()>;
}

/// Audio-first detector: loud stretches between silences are events.
///
/// Runs FFmpeg's `silencedetect` filter and inverts the reported silence
/// intervals. Scores are the raw event durations; longer sustained noise
/// ranks higher when merging competes for a capped window.
pub struct SilenceDetector {
    /// Silence threshold passed to the filter, e.g. "-30dB".
    pub noise_floor: String,
    /// Minimum silence length in seconds that splits two events.
    pub min_silence: f64,
}

impl Default for SilenceDetector {
    fn default() -> Self {
        Self {
            noise_floor: "-30dB".to_string(),
            min_silence: 1.0,
        }
    }
}

#[async_trait]
impl Detector for SilenceDetector {
    async fn detect(
        &self,
        video_path: &Path,
        config: &DetectionConfig,
    ) -> WorkerResult<Vec<Segment>> {
        let filter = format!(
            "silencedetect=noise={}:d={}",
            self.noise_floor, self.min_silence
        );

        let output = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-i")
            .arg(video_path)
            .args(["-af", &filter, "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(WorkerError::Io)?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(WorkerError::detection_failed(tail(&stderr)));
        }

        let duration = probe_duration(video_path).await?;
        let events = invert_silences(&parse_silences(&stderr), duration);

        debug!(
            video = %video_path.display(),
            events = events.len(),
            "audio detection complete"
        );

        Ok(events
            .into_iter()
            .filter(|s| s.score >= config.score_threshold)
            .collect())
    }
}

/// Silence intervals reported by the filter, as (start, end) pairs.
fn parse_silences(stderr: &str) -> Vec<(f64, f64)> {
    let mut silences = Vec::new();
    let mut open: Option<f64> = None;

    for line in stderr.lines() {
        if let Some(raw) = line.split("silence_start:").nth(1) {
            open = raw.trim().parse::<f64>().ok();
        } else if let Some(raw) = line.split("silence_end:").nth(1) {
            let end = raw
                .split('|')
                .next()
                .and_then(|v| v.trim().parse::<f64>().ok());
            if let (Some(start), Some(end)) = (open.take(), end) {
                silences.push((start, end));
            }
        }
    }

    silences
}

/// The complement of the silence intervals over `[0, duration]`.
fn invert_silences(silences: &[(f64, f64)], duration: f64) -> Vec<Segment> {
    let mut events = Vec::new();
    let mut cursor = 0.0;

    for &(start, end) in silences {
        if start > cursor {
            events.push(Segment {
                start: cursor,
                end: start,
                score: start - cursor,
            });
        }
        cursor = cursor.max(end);
    }

    if duration > cursor {
        events.push(Segment {
            start: cursor,
            end: duration,
            score: duration - cursor,
        });
    }

    events
}

/// FFmpeg/ffprobe-backed renderer.
#[derive(Default)]
pub struct FfmpegRenderer;

#[async_trait]
impl Renderer for FfmpegRenderer {
    async fn media_duration(&self, video_path: &Path) -> WorkerResult<f64> {
        probe_duration(video_path).await
    }

    async fn render_clip(
        &self,
        input: &Path,
        output: &Path,
        segment: &Segment,
        config: &RenderingConfig,
    ) -> WorkerResult<()> {
        if segment.end <= segment.start {
            return Err(WorkerError::invalid_argument(format!(
                "segment end {} is not after start {}",
                segment.end, segment.start
            )));
        }

        // Fast seek before the input, then re-encode the window. Stream
        // copy would snap to keyframes and drift the cut points.
        let result = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-y")
            .args(["-ss", &segment.start.to_string()])
            .arg("-i")
            .arg(input)
            .args(["-t", &segment.duration().to_string()])
            .args(["-c:v", "libx264", "-preset", "fast"])
            .args(["-c:a", "aac"])
            .args(["-loglevel", "error"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(WorkerError::Io)?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(WorkerError::render_failed(tail(&stderr)));
        }

        debug!(
            output = %output.display(),
            format = %config.output_format,
            "clip rendered"
        );
        Ok(())
    }

    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> WorkerResult<()> {
        if inputs.is_empty() {
            return Err(WorkerError::invalid_argument(
                "no clips to concatenate".to_string(),
            ));
        }

        // Concat demuxer needs a list file; single quotes in paths must
        // be escaped for it.
        let mut list = String::new();
        for path in inputs {
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            list.push_str(&format!("file '{escaped}'\n"));
        }

        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, &list).await?;

        let result = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-y")
            .args(["-f", "concat", "-safe", "0"])
            .arg("-i")
            .arg(&list_path)
            .args(["-c", "copy"])
            .args(["-loglevel", "error"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        tokio::fs::remove_file(&list_path).await.ok();

        let result = result.map_err(WorkerError::Io)?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(WorkerError::render_failed(tail(&stderr)));
        }

        Ok(())
    }
}

async fn probe_duration(video_path: &Path) -> WorkerResult<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(video_path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(WorkerError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorkerError::detection_failed(tail(&stderr)));
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    raw.trim().parse::<f64>().map_err(|_| {
        WorkerError::detection_failed(format!("ffprobe returned unparseable duration: {raw:?}"))
    })
}

fn tail(s: &str) -> String {
    if s.len() <= STDERR_TAIL {
        return s.trim().to_string();
    }
    let start = s.char_indices().rev().nth(STDERR_TAIL - 1).map(|(i, _)| i);
    match start {
        Some(i) => s[i..].trim().to_string(),
        None => s.trim().to_string(),
    }
}
