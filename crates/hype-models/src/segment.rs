//! Time-ranged detection events.

use serde::{Deserialize, Serialize};

/// A scored time range produced by the detector and refined by the
/// segment transforms before rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Detection score (peak energy); used for merge tie-breaking
    #[serde(default)]
    pub score: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64, score: f64) -> Self {
        Self { start, end, score }
    }

    /// Length of the segment in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}
