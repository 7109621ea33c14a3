//! Transfer completion reports.
//!
//! A [`Report`] is built once when a transfer completes or is abandoned and
//! is immutable afterwards. Rendering is left to the caller; the report
//! serializes to JSON for that purpose.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::transfer::{sanitize_component, CounterSnapshot, Digest};

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Every chunk verified and the artifact is in place.
    Completed,
    /// At least one chunk is terminally failed.
    Incomplete,
    /// The caller cancelled the transfer.
    Cancelled,
    /// The session expired mid-transfer.
    SessionExpired,
    /// Every chunk verified but the whole-artifact digest never matched.
    IntegrityFailed,
}

impl FinalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Cancelled => "cancelled",
            Self::SessionExpired => "session expired",
            Self::IntegrityFailed => "integrity check failed",
        };
        f.write_str(s)
    }
}

/// Errors writing a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write report to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Summary of one transfer attempt.
///
/// `files_ok` and `files_failed` count chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub files_ok: usize,
    pub files_failed: usize,
    pub total_bytes: u64,
    pub retries: usize,
    pub final_status: FinalStatus,
    pub chunks_fetched: usize,
    pub chunks_skipped: usize,
    pub bytes_fetched: u64,
    pub artifact_digest: Option<Digest>,
    pub output_path: Option<PathBuf>,
}

impl Report {
    /// Write the report as pretty JSON into `dir`.
    ///
    /// The file is named `report_<backup id>_<UTC end time>.json`.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!(
            "report_{}_{}.json",
            sanitize_component(&self.backup_id),
            self.ended_at.format("%Y%m%dT%H%M%SZ")
        ));
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&path, data).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), status = %self.final_status, "Report written");
        Ok(path)
    }
}

/// Collects transfer results into a [`Report`].
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    backup_id: String,
    started_at: DateTime<Utc>,
    total_bytes: u64,
    files_ok: usize,
    files_failed: usize,
    counters: CounterSnapshot,
    artifact_digest: Option<Digest>,
    output_path: Option<PathBuf>,
}

impl ReportBuilder {
    /// Start a report; the start time is now.
    pub fn new(backup_id: impl Into<String>, total_bytes: u64) -> Self {
        Self::started_at(backup_id, total_bytes, Utc::now())
    }

    pub fn started_at(backup_id: impl Into<String>, total_bytes: u64, at: DateTime<Utc>) -> Self {
        Self {
            backup_id: backup_id.into(),
            started_at: at,
            total_bytes,
            files_ok: 0,
            files_failed: 0,
            counters: CounterSnapshot::default(),
            artifact_digest: None,
            output_path: None,
        }
    }

    pub fn chunk_outcomes(mut self, ok: usize, failed: usize) -> Self {
        self.files_ok = ok;
        self.files_failed = failed;
        self
    }

    pub fn counters(mut self, counters: CounterSnapshot) -> Self {
        self.counters = counters;
        self
    }

    pub fn artifact_digest(mut self, digest: Option<Digest>) -> Self {
        self.artifact_digest = digest;
        self
    }

    pub fn output_path(mut self, path: Option<PathBuf>) -> Self {
        self.output_path = path;
        self
    }

    /// Freeze the report with the given status; the end time is now.
    pub fn finish(self, final_status: FinalStatus) -> Report {
        Report {
            backup_id: self.backup_id,
            started_at: self.started_at,
            ended_at: Utc::now().max(self.started_at),
            files_ok: self.files_ok,
            files_failed: self.files_failed,
            total_bytes: self.total_bytes,
            retries: self.counters.retries,
            final_status,
            chunks_fetched: self.counters.chunks_fetched,
            chunks_skipped: self.counters.chunks_skipped,
            bytes_fetched: self.counters.bytes_fetched,
            artifact_digest: self.artifact_digest,
            output_path: self.output_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(status: FinalStatus) -> Report {
        ReportBuilder::new("dev/1", 1000)
            .chunk_outcomes(3, 1)
            .counters(CounterSnapshot {
                chunks_fetched: 2,
                chunks_skipped: 1,
                retries: 4,
                bytes_fetched: 600,
                ..Default::default()
            })
            .finish(status)
    }

    #[test]
    fn test_builder_carries_counters() {
        let report = sample(FinalStatus::Incomplete);
        assert_eq!(report.files_ok, 3);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.retries, 4);
        assert_eq!(report.chunks_fetched, 2);
        assert_eq!(report.chunks_skipped, 1);
        assert!(report.ended_at >= report.started_at);
        assert!(!report.final_status.is_success());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_value(sample(FinalStatus::SessionExpired)).unwrap();
        assert_eq!(json["final_status"], "session_expired");
        assert_eq!(json["backup_id"], "dev/1");
    }

    #[test]
    fn test_write_json() {
        let temp = TempDir::new().unwrap();
        let report = sample(FinalStatus::Completed);

        let path = report.write_json(&temp.path().join("reports")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("report_dev_1_"));
        assert!(name.ends_with(".json"));

        let loaded: Report = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }
}
