//! Resumable highlight-extraction worker pool.
//!
//! Pulls jobs from the SQLite queue, runs detection and rendering with
//! bounded parallelism, and reports outcomes back through the queue's
//! ack operations. Crash recovery and clean-skip decisions live in
//! `hype-queue`; this crate owns execution.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod media;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod segments;

pub use config::WorkerConfig;
pub use error::{ErrorClass, WorkerError, WorkerResult};
pub use heartbeat::HeartbeatGuard;
pub use media::{Detector, FfmpegRenderer, Renderer, SilenceDetector};
pub use pipeline::{EnqueueOptions, EnqueueStats, Pipeline, ProcessStats};
pub use pool::WorkerPool;
pub use processor::{process_job, ProcessingContext};
