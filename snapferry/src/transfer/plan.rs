//! Transfer planning.
//!
//! Turns a selected [`BackupDescriptor`] plus a destination and quota into
//! an immutable [`TransferPlan`] of dense, zero-based chunk ranges. The same
//! descriptor, destination and chunk size always produce identical ranges,
//! which is what lets a resumed plan line up with the integrity log.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::checksum::Digest;
use super::output::{output_dir_for, Manifest};
use super::space::Quota;
use crate::source::{BackupDescriptor, Origin};

/// Default chunk size (16 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Smallest chunk size accepted by the planner.
pub const MIN_CHUNK_SIZE: u64 = 1024;

/// Default fixed safety margin added on top of the backup size (512 MiB).
pub const DEFAULT_SAFETY_MARGIN_BYTES: u64 = 512 * 1024 * 1024;

/// Headroom over the approximate size, in percent.
pub const HEADROOM_PERCENT: u64 = 15;

/// Errors building a plan. Fatal to the current attempt.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The backup cannot be transferred; no flag overrides this.
    #[error("backup {backup_id} ({origin}) is not downloadable")]
    NotDownloadable { backup_id: String, origin: Origin },

    /// Not enough free space at the destination.
    #[error(
        "insufficient space at {}: {required} bytes required, {available} available",
        .destination.display()
    )]
    InsufficientSpace {
        destination: PathBuf,
        required: u64,
        available: u64,
    },

    /// Configured chunk size is too small.
    #[error("chunk size {0} is below the minimum of {MIN_CHUNK_SIZE} bytes")]
    InvalidChunkSize(u64),

    /// Supplied expected digests do not fit the plan.
    #[error("expected digests do not match the plan: {0}")]
    ManifestMismatch(String),

    /// Chunk indices are `u32`; the backup needs more chunks than that.
    #[error("{total_bytes} bytes in {chunk_size}-byte chunks exceeds the chunk index range")]
    TooManyChunks { total_bytes: u64, chunk_size: u64 },
}

/// One contiguous byte range `[start, end)` of the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSpec {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub expected_digest: Option<Digest>,
}

impl ChunkSpec {
    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// An immutable plan for one transfer attempt.
///
/// A retry builds a new plan rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub backup_id: String,
    pub device_name: String,
    pub created_at: DateTime<Utc>,
    pub destination_root: PathBuf,
    /// `<destination_root>/<device>_<created_at>` holding the artifact and manifest.
    pub output_dir: PathBuf,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkSpec>,
    pub total_bytes: u64,
    /// Whole-artifact digest to check after reassembly, if known.
    pub artifact_digest: Option<Digest>,
    /// Source that listed the backup and serves its bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

impl TransferPlan {
    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Digests known ahead of the transfer, e.g. from a previous manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedDigests {
    /// Chunk size the digests were computed with.
    pub chunk_size: Option<u64>,
    /// Per-chunk digests, in chunk order.
    pub chunks: Vec<Digest>,
    /// Whole-artifact digest.
    pub artifact: Option<Digest>,
}

impl ExpectedDigests {
    /// Only a whole-artifact digest.
    pub fn artifact(digest: Digest) -> Self {
        Self {
            artifact: Some(digest),
            ..Default::default()
        }
    }

    /// Take the digests recorded in an output manifest.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            chunk_size: Some(manifest.chunk_size),
            chunks: manifest.chunks.iter().map(|c| c.digest).collect(),
            artifact: Some(manifest.artifact_digest),
        }
    }
}

/// Planner configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    pub chunk_size: u64,
    pub safety_margin_bytes: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            safety_margin_bytes: DEFAULT_SAFETY_MARGIN_BYTES,
        }
    }
}

/// Space required for a backup of `size` bytes.
///
/// `max(size * 1.15, size + safety_margin)`, rounded up.
pub fn required_space(size: u64, safety_margin: u64) -> u64 {
    let with_headroom = (size as u128 * (100 + HEADROOM_PERCENT) as u128).div_ceil(100);
    let with_margin = size as u128 + safety_margin as u128;
    with_headroom.max(with_margin).min(u64::MAX as u128) as u64
}

/// Builds transfer plans.
#[derive(Debug, Clone, Default)]
pub struct TransferPlanner {
    config: PlannerConfig,
}

impl TransferPlanner {
    /// Create a planner with the given configuration.
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Planner configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a transfer without precomputed digests.
    pub fn plan(
        &self,
        descriptor: &BackupDescriptor,
        destination_root: &Path,
        quota: Quota,
    ) -> Result<TransferPlan, PlanError> {
        self.plan_with_digests(
            descriptor,
            destination_root,
            quota,
            ExpectedDigests::default(),
        )
    }

    /// Plan a transfer, attaching known digests.
    pub fn plan_with_digests(
        &self,
        descriptor: &BackupDescriptor,
        destination_root: &Path,
        quota: Quota,
        expected: ExpectedDigests,
    ) -> Result<TransferPlan, PlanError> {
        if !descriptor.downloadable() {
            warn!(
                backup_id = descriptor.id(),
                origin = %descriptor.origin(),
                "Refusing to plan transfer of non-downloadable backup"
            );
            return Err(PlanError::NotDownloadable {
                backup_id: descriptor.id().to_string(),
                origin: descriptor.origin(),
            });
        }

        let chunk_size = self.config.chunk_size;
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(PlanError::InvalidChunkSize(chunk_size));
        }

        let size = descriptor.approx_size_bytes();
        let required = required_space(size, self.config.safety_margin_bytes);
        if quota.available_bytes < required {
            return Err(PlanError::InsufficientSpace {
                destination: destination_root.to_path_buf(),
                required,
                available: quota.available_bytes,
            });
        }

        let mut chunks = chunk_ranges(size, chunk_size)?;
        attach_digests(&mut chunks, chunk_size, &expected)?;

        debug!(
            backup_id = descriptor.id(),
            chunks = chunks.len(),
            chunk_size,
            total_bytes = size,
            "Transfer planned"
        );

        Ok(TransferPlan {
            backup_id: descriptor.id().to_string(),
            device_name: descriptor.device_name().to_string(),
            created_at: descriptor.created_at(),
            destination_root: destination_root.to_path_buf(),
            output_dir: output_dir_for(destination_root, descriptor),
            chunk_size,
            chunks,
            total_bytes: size,
            artifact_digest: expected.artifact,
            source_name: descriptor.source_name().map(str::to_string),
        })
    }
}

/// Dense zero-based ranges of `chunk_size`; the last one holds the remainder.
fn chunk_ranges(total: u64, chunk_size: u64) -> Result<Vec<ChunkSpec>, PlanError> {
    let count = u32::try_from(total.div_ceil(chunk_size)).map_err(|_| PlanError::TooManyChunks {
        total_bytes: total,
        chunk_size,
    })?;
    Ok((0..count)
        .map(|index| {
            let start = u64::from(index) * chunk_size;
            ChunkSpec {
                index,
                start,
                end: start.saturating_add(chunk_size).min(total),
                expected_digest: None,
            }
        })
        .collect())
}

fn attach_digests(
    chunks: &mut [ChunkSpec],
    chunk_size: u64,
    expected: &ExpectedDigests,
) -> Result<(), PlanError> {
    if expected.chunks.is_empty() {
        return Ok(());
    }
    if let Some(size) = expected.chunk_size {
        if size != chunk_size {
            return Err(PlanError::ManifestMismatch(format!(
                "digests use chunk size {}, plan uses {}",
                size, chunk_size
            )));
        }
    }
    if expected.chunks.len() != chunks.len() {
        return Err(PlanError::ManifestMismatch(format!(
            "{} digests for {} chunks",
            expected.chunks.len(),
            chunks.len()
        )));
    }
    for (chunk, digest) in chunks.iter_mut().zip(&expected.chunks) {
        chunk.expected_digest = Some(*digest);
    }
    Ok(())
}
