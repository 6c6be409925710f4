//! Shared data models for the Hypereel backend.
//!
//! This crate defines the job queue data model (items, results, audit
//! records), the job state machine, detection segments, and the resolved
//! pipeline configuration. It carries no storage or runtime dependencies
//! so every other crate can depend on it.

pub mod config;
pub mod job;
pub mod job_status;
pub mod segment;

pub use config::{DetectionConfig, PipelineConfig, ProcessingConfig, RenderingConfig};
pub use job::{JobId, JobItem, JobResult, StateTransition};
pub use job_status::JobStatus;
pub use segment::Segment;
