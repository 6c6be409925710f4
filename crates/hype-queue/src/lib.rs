//! Crash-safe job queue and manifest store backed by SQLite.
//!
//! This crate provides:
//! - Tiered content fingerprinting for dirty detection
//! - A durable per-input manifest with atomic upserts
//! - Atomic enqueue/dequeue/ack operations with an audit log
//! - Heartbeat-based crash recovery
//!
//! Concurrency model: all mutation goes through a serialized write pool
//! with `BEGIN IMMEDIATE` transactions, so two workers can never claim
//! the same pending job. Lock contention is retried with exponential
//! backoff rather than surfaced to callers.

pub mod db;
pub mod error;
pub mod fingerprint;
pub mod manifest;
pub mod queue;

pub use db::QueueDb;
pub use error::{QueueError, QueueResult};
pub use fingerprint::{
    compute_config_hash, compute_input_hash, compute_output_hash, verify_output_integrity,
    InputFingerprint,
};
pub use manifest::{HashVerdict, ManifestStore, SqliteManifest};
pub use queue::{QueueBackend, SqliteQueue};
