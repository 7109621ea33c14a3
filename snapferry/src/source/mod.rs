//! Backup descriptors and the `RemoteSource` capability.
//!
//! A [`RemoteSource`] supplies backup metadata and byte ranges. The core
//! treats it as opaque: it may be a local catalog, a device sync directory
//! or a policy-gated remote listing. Sources report raw entries
//! ([`RawBackup`]); [`BackupDescriptor`] is the normalized, immutable form
//! built by the indexer.
//!
//! # Dyn Compatibility
//!
//! Async methods return [`BoxFuture`] so sources can be held as
//! `Arc<dyn RemoteSource>` and mixed in one listing.

mod catalog;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Session;

pub use catalog::{CatalogEntry, CatalogFile, CatalogSource};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a backup listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Locally enumerable and verifiable; transferable.
    Local,
    /// Obtained through the policy-gated privileged path; never transferable.
    RemotePrivileged,
}

impl Origin {
    /// Preference when the same id appears in several sources (lower wins).
    pub(crate) fn merge_rank(&self) -> u8 {
        match self {
            Self::Local => 0,
            Self::RemotePrivileged => 1,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::RemotePrivileged => f.write_str("remote-privileged"),
        }
    }
}

/// A listing entry as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBackup {
    pub id: String,
    pub device_name: String,
    #[serde(default)]
    pub device_os_version: String,
    pub created_at: DateTime<Utc>,
    pub approx_size_bytes: u64,
}

/// A normalized backup snapshot.
///
/// Immutable once constructed. `downloadable` is derived from the origin:
/// it is always false for `RemotePrivileged` entries and cannot be changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupDescriptor {
    id: String,
    device_name: String,
    device_os_version: String,
    created_at: DateTime<Utc>,
    approx_size_bytes: u64,
    origin: Origin,
    downloadable: bool,
    /// Name of the source that listed this entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    source_name: Option<String>,
}

impl BackupDescriptor {
    /// Normalize a raw entry from a source of the given origin.
    pub fn new(raw: RawBackup, origin: Origin) -> Self {
        Self {
            id: raw.id.trim().to_string(),
            device_name: raw.device_name.trim().to_string(),
            device_os_version: raw.device_os_version.trim().to_string(),
            created_at: raw.created_at,
            approx_size_bytes: raw.approx_size_bytes,
            origin,
            downloadable: origin == Origin::Local,
            source_name: None,
        }
    }

    /// Record which source listed this entry; transfers are routed back to it.
    pub fn with_source(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_os_version(&self) -> &str {
        &self.device_os_version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn approx_size_bytes(&self) -> u64 {
        self.approx_size_bytes
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn downloadable(&self) -> bool {
        self.downloadable
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }
}

/// Failures reported by a [`RemoteSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The source rejected the session.
    #[error("source rejected the session as unauthorized")]
    Unauthorized,

    /// The source could not be reached or read.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The requested range could not be served.
    #[error("range {start}..{end} of backup {backup_id} unavailable: {reason}")]
    RangeUnavailable {
        backup_id: String,
        start: u64,
        end: u64,
        reason: String,
    },

    /// The session expired while the source was in use.
    #[error("session expired")]
    SessionExpired,
}

/// Opaque provider of backup metadata and byte ranges.
pub trait RemoteSource: Send + Sync {
    /// Short name used in logs and listing failures.
    fn name(&self) -> &str;

    /// Origin of every entry this source lists.
    fn origin(&self) -> Origin;

    /// List the backups visible to the session.
    fn list_backups<'a>(
        &'a self,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<Vec<RawBackup>, RemoteError>>;

    /// Fetch the bytes `[start, end)` of a backup artifact.
    fn fetch_range<'a>(
        &'a self,
        backup_id: &'a str,
        start: u64,
        end: u64,
    ) -> BoxFuture<'a, Result<Bytes, RemoteError>>;
}
