//! Durable per-chunk state, the source of truth for resume.
//!
//! Each backup gets one append-only JSON-lines file under the log root. A
//! write supersedes earlier records for the same chunk without touching
//! them; the current state of a chunk is its latest line. Every record is
//! flushed and synced before [`IntegrityLog::record_state`] returns, so a
//! crash leaves at most the chunk being written in an ambiguous state.
//!
//! On load:
//! - a torn trailing line (crash mid-write) is ignored with a warning
//! - `InFlight` is reported as `Pending`, since no fetch survives a restart

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::checksum::{ChecksumVerifier, Digest};
use super::output::sanitize_component;
use super::plan::ChunkSpec;

const LOG_EXTENSION: &str = "jsonl";

/// Errors reading or writing the integrity log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("integrity log I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode chunk record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("integrity log {} is corrupt at line {line}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

pub type LogResult<T> = Result<T, LogError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LogError + '_ {
    move |source| LogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// State of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Verified,
    Failed,
}

/// One durable record for `(backup_id, chunk_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub backup_id: String,
    pub chunk_index: u32,
    pub state: ChunkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Byte range the record was written for; guards resume across plan changes.
    pub range_start: u64,
    pub range_end: u64,
    /// Output directory the chunk was written into. Records from another
    /// destination never satisfy a chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl ChunkRecord {
    /// A record for a planned chunk.
    pub fn for_chunk(backup_id: &str, chunk: &ChunkSpec, state: ChunkState, attempts: u32) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            chunk_index: chunk.index,
            state,
            digest: None,
            attempts,
            last_error: None,
            updated_at: Utc::now(),
            range_start: chunk.start,
            range_end: chunk.end,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, output_dir: &Path) -> Self {
        self.output_dir = Some(output_dir.to_path_buf());
        self
    }

    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Check whether this record lets `chunk` be skipped on resume.
    ///
    /// The record must be `Verified` for the same byte range and the same
    /// output directory. With an expected digest it must match; without
    /// one, some digest must have been recorded.
    pub fn satisfies(&self, chunk: &ChunkSpec, output_dir: &Path) -> bool {
        if self.state != ChunkState::Verified
            || self.range_start != chunk.start
            || self.range_end != chunk.end
            || self.output_dir.as_deref() != Some(output_dir)
        {
            return false;
        }
        match (&chunk.expected_digest, &self.digest) {
            (Some(expected), Some(recorded)) => expected == recorded,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// Per-state counts for one backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub pending: usize,
    pub verified: usize,
    pub failed: usize,
}

impl LogSummary {
    pub fn total(&self) -> usize {
        self.pending + self.verified + self.failed
    }
}

/// Append-only chunk state store rooted at a directory.
///
/// All writes go through one lock, so records for a backup are appended
/// in the order callers complete them.
#[derive(Debug)]
pub struct IntegrityLog {
    root: PathBuf,
    handles: Mutex<HashMap<String, File>>,
}

impl IntegrityLog {
    /// Open (creating if needed) a log rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> LogResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the log file for a backup.
    pub fn path_for(&self, backup_id: &str) -> PathBuf {
        let mut name = sanitize_component(backup_id);
        if name != backup_id {
            // Keep distinct ids distinct after sanitizing.
            let hash = ChecksumVerifier::new().digest(backup_id.as_bytes()).to_hex();
            name = format!("{}-{}", name, &hash[..12]);
        }
        self.root.join(format!("{}.{}", name, LOG_EXTENSION))
    }

    /// Durably append a record.
    ///
    /// Returns only after the line is synced to disk.
    pub fn record_state(&self, record: &ChunkRecord) -> LogResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let path = self.path_for(&record.backup_id);
        let mut handles = self.handles.lock();
        let file = match handles.entry(record.backup_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(io_err(&path))?,
            ),
        };

        let written = file
            .write_all(&line)
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());
        if let Err(e) = written {
            // Reopen on next write rather than reuse a handle in an unknown state.
            handles.remove(&record.backup_id);
            return Err(LogError::Io { path, source: e });
        }

        debug!(
            backup_id = %record.backup_id,
            chunk = record.chunk_index,
            state = ?record.state,
            attempts = record.attempts,
            "Chunk state recorded"
        );
        Ok(())
    }

    /// Latest record per chunk index. `InFlight` is reported as `Pending`.
    pub fn load_state(&self, backup_id: &str) -> LogResult<BTreeMap<u32, ChunkRecord>> {
        let mut records = self.load_raw(backup_id)?;
        for record in records.values_mut() {
            if record.state == ChunkState::InFlight {
                record.state = ChunkState::Pending;
            }
        }
        Ok(records)
    }

    fn load_raw(&self, backup_id: &str) -> LogResult<BTreeMap<u32, ChunkRecord>> {
        let path = self.path_for(backup_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(LogError::Io { path, source: e }),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<io::Result<_>>()
            .map_err(io_err(&path))?;

        let mut records = BTreeMap::new();
        let last = lines.len().saturating_sub(1);
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ChunkRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) if number == last => {
                    warn!(
                        path = %path.display(),
                        line = number + 1,
                        error = %e,
                        "Ignoring torn trailing record"
                    );
                    continue;
                }
                Err(e) => {
                    return Err(LogError::Corrupt {
                        path,
                        line: number + 1,
                        reason: e.to_string(),
                    })
                }
            };
            if record.backup_id != backup_id {
                warn!(
                    path = %path.display(),
                    found = %record.backup_id,
                    "Skipping record for another backup"
                );
                continue;
            }
            records.insert(record.chunk_index, record);
        }
        Ok(records)
    }

    /// Counts per state for a backup.
    pub fn summary(&self, backup_id: &str) -> LogResult<LogSummary> {
        let mut summary = LogSummary::default();
        for record in self.load_state(backup_id)?.values() {
            match record.state {
                ChunkState::Pending | ChunkState::InFlight => summary.pending += 1,
                ChunkState::Verified => summary.verified += 1,
                ChunkState::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    /// Rewrite a backup's log to one record per chunk.
    ///
    /// Written to a temp file and renamed into place, so a crash leaves
    /// either the old or the compacted log.
    pub fn compact(&self, backup_id: &str) -> LogResult<usize> {
        let mut handles = self.handles.lock();
        let records = self.load_state(backup_id)?;
        let path = self.path_for(backup_id);
        if records.is_empty() {
            return Ok(0);
        }

        let tmp = path.with_extension(format!("{}.tmp", LOG_EXTENSION));
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        for record in records.values() {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line).map_err(io_err(&tmp))?;
        }
        file.sync_all().map_err(io_err(&tmp))?;

        handles.remove(backup_id);
        fs::rename(&tmp, &path).map_err(io_err(&path))?;

        info!(backup_id, records = records.len(), "Integrity log compacted");
        Ok(records.len())
    }

    /// Close the cached append handle for a backup, if any.
    ///
    /// The next write reopens the file.
    pub fn release(&self, backup_id: &str) {
        if self.handles.lock().remove(backup_id).is_some() {
            debug!(backup_id, "Integrity log handle released");
        }
    }

    /// Number of backups with a cached append handle.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Remove a backup's log.
    pub fn clear(&self, backup_id: &str) -> LogResult<()> {
        let mut handles = self.handles.lock();
        handles.remove(backup_id);
        let path = self.path_for(backup_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(backup_id, "Integrity log cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogError::Io { path, source: e }),
        }
    }
}
