//! Exclusive access to a backup and its output directory.
//!
//! Two layers keep a second transfer of the same backup out:
//! an in-process registry keyed by backup id and shared by every engine
//! built from the same [`TransferRegistry`], and a `.transfer.lock` file in
//! the output directory for other processes. The registry key matches the
//! integrity log's, so one backup never has two writers in this process
//! even when they target different destinations. A lock file whose recorded pid is no longer alive on
//! this host is treated as stale and replaced.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lock file name inside an output directory.
pub const LOCK_FILE: &str = ".transfer.lock";

/// Errors acquiring a transfer lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("backup {backup_id} is already being transferred ({holder})")]
    Held { backup_id: String, holder: String },

    #[error("lock file error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    backup_id: String,
    hostname: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockEntry {
    fn current(backup_id: &str) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            hostname: hostname(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "pid {} on {} since {}",
            self.pid,
            self.hostname,
            self.acquired_at.to_rfc3339()
        )
    }

    fn is_stale(&self) -> bool {
        self.hostname == hostname() && self.pid != std::process::id() && !process_alive(self.pid)
    }
}

/// In-process registry of active transfers keyed by backup id.
#[derive(Debug, Clone, Default)]
pub struct TransferRegistry {
    active: Arc<DashMap<String, PathBuf>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers currently holding a lock.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Acquire exclusive access to `output_dir` for `backup_id`.
    ///
    /// Creates the directory if needed. The lock is released when the
    /// returned guard is dropped.
    pub fn acquire(&self, backup_id: &str, output_dir: &Path) -> Result<TransferLock, LockError> {
        fs::create_dir_all(output_dir).map_err(|source| LockError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let key = backup_id.to_string();

        match self.active.entry(key.clone()) {
            Entry::Occupied(entry) => {
                return Err(LockError::Held {
                    backup_id: backup_id.to_string(),
                    holder: format!("in this process into {}", entry.get().display()),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(output_dir.to_path_buf());
            }
        }

        let lock_path = output_dir.join(LOCK_FILE);
        match create_lock_file(&lock_path, backup_id) {
            Ok(()) => {
                debug!(backup_id, path = %lock_path.display(), "Transfer lock acquired");
                Ok(TransferLock {
                    registry: self.active.clone(),
                    key,
                    output_dir: output_dir.to_path_buf(),
                    lock_path,
                })
            }
            Err(e) => {
                self.active.remove(&key);
                Err(e)
            }
        }
    }
}

fn create_lock_file(path: &Path, backup_id: &str) -> Result<(), LockError> {
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let entry = LockEntry::current(backup_id);
                let data = serde_json::to_vec(&entry)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
                    .and_then(|data| {
                        file.write_all(&data)?;
                        file.sync_all()
                    });
                if let Err(source) = data {
                    let _ = fs::remove_file(path);
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let existing = fs::read(path)
                    .ok()
                    .and_then(|data| serde_json::from_slice::<LockEntry>(&data).ok());
                match existing {
                    Some(entry) if entry.is_stale() => {
                        warn!(
                            path = %path.display(),
                            holder = %entry.describe(),
                            "Removing stale transfer lock"
                        );
                        fs::remove_file(path).map_err(|source| LockError::Io {
                            path: path.to_path_buf(),
                            source,
                        })?;
                    }
                    Some(entry) => {
                        return Err(LockError::Held {
                            backup_id: backup_id.to_string(),
                            holder: entry.describe(),
                        })
                    }
                    None => {
                        return Err(LockError::Held {
                            backup_id: backup_id.to_string(),
                            holder: format!("unreadable lock file {}", path.display()),
                        })
                    }
                }
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    Err(LockError::Held {
        backup_id: backup_id.to_string(),
        holder: "lock contended while replacing stale lock".to_string(),
    })
}

/// Guard for an acquired transfer lock.
#[derive(Debug)]
pub struct TransferLock {
    registry: Arc<DashMap<String, PathBuf>>,
    key: String,
    output_dir: PathBuf,
    lock_path: PathBuf,
}

impl TransferLock {
    pub fn backup_id(&self) -> &str {
        &self.key
    }

    /// Output directory this lock covers.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl Drop for TransferLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "Failed to remove transfer lock");
            }
        }
        self.registry.remove(&self.key);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}
