//! JSON catalog of backup artifacts stored on local disk.
//!
//! The catalog file looks like:
//!
//! ```json
//! {
//!   "backups": [
//!     {
//!       "id": "00008030-001A",
//!       "device_name": "Work Phone",
//!       "device_os_version": "17.2",
//!       "created_at": "2024-05-01T10:00:00Z",
//!       "path": "artifacts/00008030-001A.img"
//!     }
//!   ]
//! }
//! ```
//!
//! Relative paths resolve against the catalog's directory. Entries marked
//! `"privileged": true` are only exposed through [`CatalogSource::privileged`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BoxFuture, Origin, RawBackup, RemoteError, RemoteSource};
use crate::session::Session;

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub device_name: String,
    #[serde(default)]
    pub device_os_version: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    /// Size hint used when the artifact is not present locally.
    #[serde(default)]
    pub approx_size_bytes: Option<u64>,
    #[serde(default)]
    pub privileged: bool,
}

/// Top-level catalog document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub backups: Vec<CatalogEntry>,
}

impl CatalogFile {
    /// Load a catalog. A missing file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path).map_err(|e| {
            RemoteError::Unavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            RemoteError::Unavailable(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

/// A [`RemoteSource`] backed by a catalog file.
#[derive(Debug)]
pub struct CatalogSource {
    name: String,
    catalog_path: PathBuf,
    origin: Origin,
    artifacts: RwLock<HashMap<String, PathBuf>>,
}

impl CatalogSource {
    /// Expose the catalog's non-privileged entries as `Local` backups.
    pub fn local(catalog_path: impl Into<PathBuf>) -> Self {
        Self::with_origin("local-catalog", catalog_path.into(), Origin::Local)
    }

    /// Expose the catalog's privileged entries as `RemotePrivileged` backups.
    pub fn privileged(catalog_path: impl Into<PathBuf>) -> Self {
        Self::with_origin(
            "privileged-catalog",
            catalog_path.into(),
            Origin::RemotePrivileged,
        )
    }

    /// Rename the source. Names must be unique among a service's sources,
    /// since transfers are routed by name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn with_origin(name: &str, catalog_path: PathBuf, origin: Origin) -> Self {
        Self {
            name: name.to_string(),
            catalog_path,
            origin,
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.catalog_path
            .parent()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|| path.to_path_buf())
    }

    fn wants(&self, entry: &CatalogEntry) -> bool {
        entry.privileged == (self.origin == Origin::RemotePrivileged)
    }

    fn scan(&self) -> Result<Vec<RawBackup>, RemoteError> {
        let catalog = CatalogFile::load(&self.catalog_path)?;
        let mut artifacts = HashMap::new();
        let mut backups = Vec::new();

        for entry in catalog.backups.into_iter().filter(|e| self.wants(e)) {
            let path = self.resolve(&entry.path);
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) => match entry.approx_size_bytes {
                    Some(size) => size,
                    None => {
                        warn!(
                            source = %self.name,
                            backup_id = %entry.id,
                            path = %path.display(),
                            error = %e,
                            "Catalog entry has no readable artifact, skipping"
                        );
                        continue;
                    }
                },
            };

            artifacts.insert(entry.id.clone(), path);
            backups.push(RawBackup {
                id: entry.id,
                device_name: entry.device_name,
                device_os_version: entry.device_os_version,
                created_at: entry.created_at,
                approx_size_bytes: size,
            });
        }

        debug!(source = %self.name, count = backups.len(), "Catalog scanned");
        *self.artifacts.write() = artifacts;
        Ok(backups)
    }

    fn artifact_path(&self, backup_id: &str) -> Result<Option<PathBuf>, RemoteError> {
        if let Some(path) = self.artifacts.read().get(backup_id) {
            return Ok(Some(path.clone()));
        }
        self.scan()?;
        Ok(self.artifacts.read().get(backup_id).cloned())
    }

    fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buffer = vec![0u8; end.saturating_sub(start) as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

impl RemoteSource for CatalogSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin(&self) -> Origin {
        self.origin
    }

    fn list_backups<'a>(
        &'a self,
        _session: &'a Session,
    ) -> BoxFuture<'a, Result<Vec<RawBackup>, RemoteError>> {
        Box::pin(async move { self.scan() })
    }

    fn fetch_range<'a>(
        &'a self,
        backup_id: &'a str,
        start: u64,
        end: u64,
    ) -> BoxFuture<'a, Result<Bytes, RemoteError>> {
        Box::pin(async move {
            let unavailable = |reason: String| RemoteError::RangeUnavailable {
                backup_id: backup_id.to_string(),
                start,
                end,
                reason,
            };

            if self.origin == Origin::RemotePrivileged {
                return Err(unavailable(
                    "privileged backups cannot be transferred".to_string(),
                ));
            }
            if end < start {
                return Err(unavailable("inverted range".to_string()));
            }

            let path = self
                .artifact_path(backup_id)?
                .ok_or_else(|| unavailable("backup not in catalog".to_string()))?;

            let data = tokio::task::spawn_blocking(move || Self::read_range(&path, start, end))
                .await
                .map_err(|e| unavailable(format!("read task failed: {}", e)))?
                .map_err(|e| unavailable(e.to_string()))?;

            Ok(Bytes::from(data))
        })
    }
}
