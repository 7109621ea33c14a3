//! Output directory layout and manifest.
//!
//! Each backup is reassembled into its own directory named after the device
//! and the snapshot time:
//!
//! ```text
//! <destination>/<device>_<YYYYMMDDTHHMMSSZ>/
//!     <backup id>.bin.partial   while chunks are still arriving
//!     <backup id>.bin           after whole-artifact verification
//!     manifest.json             chunk-to-digest mapping
//! ```
//!
//! The manifest is enough for an external tool (or `snapferry verify`) to
//! re-hash the artifact independently.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::checksum::{ChecksumVerifier, Digest, DIGEST_ALGORITHM};
use crate::source::BackupDescriptor;

/// Manifest file name inside an output directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

const PARTIAL_SUFFIX: &str = ".partial";

/// Errors reading or writing output files.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid manifest {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest {} uses unsupported algorithm {algorithm}", .path.display())]
    UnsupportedAlgorithm { path: PathBuf, algorithm: String },
}

impl OutputError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Replace path-unsafe characters with `_`.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        return "_".to_string();
    }
    if cleaned.starts_with('.') {
        return format!("_{}", cleaned);
    }
    cleaned
}

/// Output directory for a backup under `destination_root`.
pub fn output_dir_for(destination_root: &Path, descriptor: &BackupDescriptor) -> PathBuf {
    let name = format!(
        "{}_{}",
        sanitize_component(descriptor.device_name()),
        descriptor.created_at().format("%Y%m%dT%H%M%SZ")
    );
    destination_root.join(name)
}

/// Final artifact path inside an output directory.
pub fn artifact_path(output_dir: &Path, backup_id: &str) -> PathBuf {
    output_dir.join(artifact_file_name(backup_id))
}

/// In-progress artifact path inside an output directory.
pub fn partial_path(output_dir: &Path, backup_id: &str) -> PathBuf {
    output_dir.join(format!("{}{}", artifact_file_name(backup_id), PARTIAL_SUFFIX))
}

fn artifact_file_name(backup_id: &str) -> String {
    format!("{}.bin", sanitize_component(backup_id))
}

/// One chunk entry in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub digest: Digest,
}

/// Chunk-to-digest mapping written next to the reassembled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub backup_id: String,
    pub device_name: String,
    pub created_at: DateTime<Utc>,
    pub algorithm: String,
    pub chunk_size: u64,
    pub total_bytes: u64,
    /// Artifact file name, relative to the manifest.
    pub artifact_file: String,
    pub artifact_digest: Digest,
    pub chunks: Vec<ManifestChunk>,
    pub generator: String,
}

impl Manifest {
    /// Load `manifest.json` from an output directory.
    pub fn load(output_dir: &Path) -> Result<Self, OutputError> {
        let path = output_dir.join(MANIFEST_FILE);
        let data = fs::read(&path).map_err(|e| OutputError::io(&path, e))?;
        let manifest: Manifest =
            serde_json::from_slice(&data).map_err(|source| OutputError::Manifest {
                path: path.clone(),
                source,
            })?;
        if manifest.algorithm != DIGEST_ALGORITHM {
            return Err(OutputError::UnsupportedAlgorithm {
                path,
                algorithm: manifest.algorithm,
            });
        }
        Ok(manifest)
    }

    /// Write `manifest.json` atomically (temp file, sync, rename).
    pub fn write(&self, output_dir: &Path) -> Result<PathBuf, OutputError> {
        let path = output_dir.join(MANIFEST_FILE);
        let tmp = output_dir.join(format!("{}.tmp", MANIFEST_FILE));
        let data = serde_json::to_vec_pretty(self).map_err(|source| OutputError::Manifest {
            path: path.clone(),
            source,
        })?;

        let mut file = fs::File::create(&tmp).map_err(|e| OutputError::io(&tmp, e))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|e| OutputError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| OutputError::io(&path, e))?;

        debug!(path = %path.display(), "Manifest written");
        Ok(path)
    }
}

/// Result of re-hashing an output directory against its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    pub backup_id: String,
    pub artifact_path: PathBuf,
    pub artifact_present: bool,
    pub chunks_ok: usize,
    pub failed_chunks: Vec<u32>,
    pub artifact_ok: bool,
}

impl VerificationSummary {
    /// Check whether every chunk and the whole artifact matched.
    pub fn is_ok(&self) -> bool {
        self.artifact_present && self.artifact_ok && self.failed_chunks.is_empty()
    }
}

/// Re-hash the artifact in `output_dir` against its manifest.
pub fn verify_output(output_dir: &Path) -> Result<VerificationSummary, OutputError> {
    let manifest = Manifest::load(output_dir)?;
    let path = output_dir.join(&manifest.artifact_file);
    let mut summary = VerificationSummary {
        backup_id: manifest.backup_id.clone(),
        artifact_path: path.clone(),
        artifact_present: path.is_file(),
        chunks_ok: 0,
        failed_chunks: Vec::new(),
        artifact_ok: false,
    };

    if !summary.artifact_present {
        warn!(path = %path.display(), "Artifact missing from output directory");
        summary.failed_chunks = manifest.chunks.iter().map(|c| c.index).collect();
        return Ok(summary);
    }

    let verifier = ChecksumVerifier::new();
    for chunk in &manifest.chunks {
        match verifier.digest_file_range(&path, chunk.start, chunk.end) {
            Ok(actual) if verifier.verify(&actual, &chunk.digest) => summary.chunks_ok += 1,
            Ok(actual) => {
                warn!(
                    chunk = chunk.index,
                    expected = %chunk.digest,
                    actual = %actual,
                    "Chunk digest mismatch"
                );
                summary.failed_chunks.push(chunk.index);
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(chunk = chunk.index, error = %e, "Artifact truncated");
                summary.failed_chunks.push(chunk.index);
            }
            Err(e) => return Err(OutputError::io(&path, e)),
        }
    }

    let actual = verifier
        .digest_file(&path)
        .map_err(|e| OutputError::io(&path, e))?;
    summary.artifact_ok = verifier.verify(&actual, &manifest.artifact_digest);
    Ok(summary)
}
