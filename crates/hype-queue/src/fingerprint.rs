//! Tiered content fingerprinting for dirty detection.
//!
//! Two tiers per input file:
//! 1. Quick hash: file size plus five sampled 1 MiB windows. O(1) I/O
//!    regardless of file size.
//! 2. Full hash: entire content, chunked. Only consulted when the quick
//!    hash disagrees with a stored value.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{QueueError, QueueResult};

/// Bytes hashed per sample window.
const SAMPLE_WINDOW: u64 = 1024 * 1024;

/// File-relative sample offsets for the quick hash, as fractions of size.
/// The final window is anchored to the end of the file instead.
const SAMPLE_POSITIONS: [f64; 4] = [0.0, 0.25, 0.5, 0.75];

/// Chunk size for full-content hashing.
const FULL_HASH_CHUNK: usize = 64 * 1024;

/// Two-tier fingerprint of an input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFingerprint {
    /// SHA-256 over size + five sampled windows
    pub quick_hash: String,
    /// SHA-512 over the full content
    pub full_hash: String,
    /// File size in bytes
    pub size: u64,
}

/// Compute the two-tier fingerprint of an input file.
///
/// Deterministic for a given file content and size. Fails with
/// [`QueueError::NotFound`], [`QueueError::PermissionDenied`], or
/// [`QueueError::EmptyInput`] for the corresponding input conditions.
pub async fn compute_input_hash(path: impl AsRef<Path>) -> QueueResult<InputFingerprint> {
    let path = path.as_ref();

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| QueueError::from_io_at(e, path))?;
    let size = meta.len();

    if size == 0 {
        return Err(QueueError::EmptyInput(path.to_path_buf()));
    }

    let mut file = File::open(path)
        .await
        .map_err(|e| QueueError::from_io_at(e, path))?;

    // Tier 1: size + sampled windows.
    let mut quick = Sha256::new();
    quick.update(size.to_string().as_bytes());

    let mut window = vec![0u8; SAMPLE_WINDOW as usize];
    for pos in SAMPLE_POSITIONS {
        let offset = (size as f64 * pos) as u64;
        quick.update(read_window(&mut file, offset, size, &mut window).await?);
    }
    // Last window: the final 1 MiB (or the whole file when smaller).
    let tail_offset = size.saturating_sub(SAMPLE_WINDOW);
    quick.update(read_window(&mut file, tail_offset, size, &mut window).await?);

    // Tier 2: full content.
    file.seek(SeekFrom::Start(0)).await?;
    let mut full = Sha512::new();
    let mut chunk = vec![0u8; FULL_HASH_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        full.update(&chunk[..n]);
    }

    Ok(InputFingerprint {
        quick_hash: hex::encode(quick.finalize()),
        full_hash: hex::encode(full.finalize()),
        size,
    })
}

async fn read_window<'a>(
    file: &mut File,
    offset: u64,
    size: u64,
    buf: &'a mut [u8],
) -> QueueResult<&'a [u8]> {
    let len = SAMPLE_WINDOW.min(size - offset) as usize;
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut buf[..len]).await?;
    Ok(&buf[..len])
}

/// Deterministic hash of a resolved configuration.
///
/// The value is serialized through `serde_json::Value`, whose object
/// maps keep keys sorted, so semantically identical configs hash
/// identically regardless of construction order.
pub fn compute_config_hash<T: Serialize>(config: &T) -> QueueResult<String> {
    let value = serde_json::to_value(config)?;
    let canonical = serde_json::to_string(&value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Full-content SHA-256 of a produced artifact, for post-hoc integrity
/// verification. Fails with [`QueueError::NotFound`] if the artifact is
/// missing.
pub async fn compute_output_hash(path: impl AsRef<Path>) -> QueueResult<String> {
    let path = path.as_ref();

    let mut file = File::open(path)
        .await
        .map_err(|e| QueueError::from_io_at(e, path))?;

    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; FULL_HASH_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify every output file exists, is non-empty, and (when an expected
/// hash is recorded) still matches its stored content hash.
pub async fn verify_output_integrity(
    output_files: &[String],
    expected_hashes: &BTreeMap<String, String>,
) -> QueueResult<()> {
    for file in output_files {
        let path = Path::new(file);

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| QueueError::output_validation(format!("output file missing: {file}")))?;

        if meta.len() == 0 {
            return Err(QueueError::output_validation(format!(
                "output file is empty: {file}"
            )));
        }

        if let Some(expected) = expected_hashes.get(file) {
            let actual = compute_output_hash(path).await?;
            if &actual != expected {
                return Err(QueueError::output_validation(format!(
                    "output hash mismatch: {file}"
                )));
            }
        }
    }

    Ok(())
}
