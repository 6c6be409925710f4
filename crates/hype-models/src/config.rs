//! Resolved pipeline configuration.
//!
//! The queue fingerprints this structure (deterministic serialization)
//! to decide whether a previously processed input must be re-run.

use serde::{Deserialize, Serialize};

/// Fully-resolved configuration for one processing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
}

/// Detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Events shorter than this are discarded
    pub min_event_duration_s: f64,
    /// Minimum detection score to keep an event
    pub score_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_event_duration_s: 0.5,
            score_threshold: 0.0,
        }
    }
}

/// Segment post-processing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Pre/post-roll added around each event, seconds
    pub context_padding_s: f64,
    /// Events closer than this are merged into one clip, seconds
    pub merge_gap_s: f64,
    /// Cap on any single merged clip, seconds (None = unlimited)
    pub max_segment_duration_s: Option<f64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            context_padding_s: 2.0,
            merge_gap_s: 5.0,
            max_segment_duration_s: Some(60.0),
        }
    }
}

/// Rendering parameters passed through to the external renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderingConfig {
    /// Container extension for produced clips
    pub output_format: String,
    /// Whether to concatenate all clips into one montage
    pub concatenate: bool,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            output_format: "mp4".to_string(),
            concatenate: false,
        }
    }
}
