//! Backup indexing across sources.
//!
//! Turns raw [`RemoteSource`] listings into [`BackupDescriptor`]s. A source
//! offering privileged entries is only consulted after the policy gate
//! allows it; a denial is kept in the [`Listing`] so that "blocked" can
//! never be rendered as "nothing there".

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::session::{DenialReason, PolicyError, Session, SessionGate};
use crate::source::{BackupDescriptor, Origin, RemoteError, RemoteSource};

/// Errors listing a single source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// The policy gate refused the privileged listing.
    #[error(transparent)]
    Denied(#[from] PolicyError),

    /// The source itself failed.
    #[error("source {source_name} failed: {error}")]
    Source {
        source_name: String,
        error: RemoteError,
    },
}

/// A source whose listing was blocked by policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDenial {
    pub source_name: String,
    pub reason: DenialReason,
}

/// A source whose listing failed for a non-policy reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source_name: String,
    pub error: RemoteError,
}

/// How a listing should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOutcome {
    /// At least one backup was found.
    Found(usize),
    /// Nothing was found and nothing was blocked.
    Empty,
    /// Nothing was found because the privileged listing was denied.
    Denied(DenialReason),
    /// Nothing was found because every source failed.
    Unavailable,
}

/// Merged result of listing several sources.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Backups sorted newest first.
    pub backups: Vec<BackupDescriptor>,
    /// Sources blocked by the policy gate.
    pub denials: Vec<SourceDenial>,
    /// Sources that failed for other reasons.
    pub failures: Vec<SourceFailure>,
}

impl Listing {
    /// Summarize the listing without losing a denial.
    pub fn outcome(&self) -> ListOutcome {
        if !self.backups.is_empty() {
            return ListOutcome::Found(self.backups.len());
        }
        if let Some(denial) = self.denials.first() {
            return ListOutcome::Denied(denial.reason);
        }
        if !self.failures.is_empty() {
            return ListOutcome::Unavailable;
        }
        ListOutcome::Empty
    }

    /// Find a backup by id.
    pub fn find(&self, backup_id: &str) -> Option<&BackupDescriptor> {
        self.backups.iter().find(|b| b.id() == backup_id)
    }
}

/// Lists and merges backups from several sources.
#[derive(Debug, Clone)]
pub struct BackupIndexer {
    gate: Arc<SessionGate>,
}

impl BackupIndexer {
    /// Create an indexer that consults the given gate.
    pub fn new(gate: Arc<SessionGate>) -> Self {
        Self { gate }
    }

    /// List one source.
    ///
    /// Privileged sources are gated first; an empty `Ok` always means the
    /// source genuinely has no backups.
    pub async fn list_source(
        &self,
        source: &dyn RemoteSource,
        session: &Session,
    ) -> Result<Vec<BackupDescriptor>, IndexError> {
        let origin = source.origin();
        if origin == Origin::RemotePrivileged {
            self.gate.require_privileged(session)?;
        }

        let raw = source
            .list_backups(session)
            .await
            .map_err(|error| IndexError::Source {
                source_name: source.name().to_string(),
                error,
            })?;

        debug!(source = source.name(), count = raw.len(), "Source listed");
        Ok(raw
            .into_iter()
            .map(|entry| BackupDescriptor::new(entry, origin).with_source(source.name()))
            .filter(|descriptor| !descriptor.id().is_empty())
            .collect())
    }

    /// List every source and merge by id.
    ///
    /// On duplicate ids the `Local` entry wins over `RemotePrivileged`,
    /// since it is the one that can actually be transferred.
    pub async fn list(&self, sources: &[Arc<dyn RemoteSource>], session: &Session) -> Listing {
        let mut merged: HashMap<String, BackupDescriptor> = HashMap::new();
        let mut listing = Listing::default();

        for source in sources {
            match self.list_source(source.as_ref(), session).await {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        merge_descriptor(&mut merged, descriptor);
                    }
                }
                Err(IndexError::Denied(err)) => {
                    info!(
                        source = source.name(),
                        reason = %err.reason(),
                        "Privileged listing denied"
                    );
                    listing.denials.push(SourceDenial {
                        source_name: source.name().to_string(),
                        reason: err.reason(),
                    });
                }
                Err(IndexError::Source { source_name, error }) => {
                    warn!(source = %source_name, error = %error, "Source listing failed");
                    listing.failures.push(SourceFailure { source_name, error });
                }
            }
        }

        let mut backups: Vec<_> = merged.into_values().collect();
        backups.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        listing.backups = backups;
        listing
    }
}

fn merge_descriptor(merged: &mut HashMap<String, BackupDescriptor>, descriptor: BackupDescriptor) {
    match merged.get(descriptor.id()) {
        Some(existing) if existing.origin().merge_rank() <= descriptor.origin().merge_rank() => {}
        _ => {
            merged.insert(descriptor.id().to_string(), descriptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BoxFuture, RawBackup};
    use bytes::Bytes;
    use chrono::{Duration, TimeZone, Utc};

    struct FixedSource {
        name: &'static str,
        origin: Origin,
        entries: Result<Vec<RawBackup>, RemoteError>,
    }

    impl RemoteSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn origin(&self) -> Origin {
            self.origin
        }

        fn list_backups<'a>(
            &'a self,
            _session: &'a Session,
        ) -> BoxFuture<'a, Result<Vec<RawBackup>, RemoteError>> {
            Box::pin(async move { self.entries.clone() })
        }

        fn fetch_range<'a>(
            &'a self,
            backup_id: &'a str,
            start: u64,
            end: u64,
        ) -> BoxFuture<'a, Result<Bytes, RemoteError>> {
            Box::pin(async move {
                Err(RemoteError::RangeUnavailable {
                    backup_id: backup_id.to_string(),
                    start,
                    end,
                    reason: "fixed".to_string(),
                })
            })
        }
    }

    fn raw(id: &str, day: u32) -> RawBackup {
        RawBackup {
            id: id.to_string(),
            device_name: "Phone".to_string(),
            device_os_version: "17".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap(),
            approx_size_bytes: 100,
        }
    }

    fn session(privileged: bool) -> Session {
        let mut session = Session::new("alice", "tok", true, Utc::now() + Duration::hours(1));
        session.privileged_access_allowed = privileged;
        session
    }

    fn source(
        name: &'static str,
        origin: Origin,
        entries: Vec<RawBackup>,
    ) -> Arc<dyn RemoteSource> {
        Arc::new(FixedSource {
            name,
            origin,
            entries: Ok(entries),
        })
    }

    fn indexer() -> BackupIndexer {
        BackupIndexer::new(Arc::new(SessionGate::new()))
    }

    #[tokio::test]
    async fn test_denied_is_not_empty() {
        let sources = vec![source(
            "cloud",
            Origin::RemotePrivileged,
            vec![raw("a", 1)],
        )];

        let listing = indexer().list(&sources, &session(false)).await;
        assert!(listing.backups.is_empty());
        assert_eq!(
            listing.outcome(),
            ListOutcome::Denied(DenialReason::NotPrivileged)
        );
    }

    #[tokio::test]
    async fn test_list_source_denial_is_error() {
        let cloud = source("cloud", Origin::RemotePrivileged, vec![raw("a", 1)]);
        let err = indexer()
            .list_source(cloud.as_ref(), &session(false))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Denied(_)));
    }

    #[tokio::test]
    async fn test_empty_is_empty() {
        let sources = vec![source("local", Origin::Local, vec![])];
        let listing = indexer().list(&sources, &session(false)).await;
        assert_eq!(listing.outcome(), ListOutcome::Empty);
    }

    #[tokio::test]
    async fn test_local_listing_survives_privileged_denial() {
        let sources = vec![
            source("local", Origin::Local, vec![raw("a", 1)]),
            source("cloud", Origin::RemotePrivileged, vec![raw("b", 2)]),
        ];

        let listing = indexer().list(&sources, &session(false)).await;
        assert_eq!(listing.outcome(), ListOutcome::Found(1));
        assert_eq!(listing.denials.len(), 1);
        assert_eq!(listing.denials[0].source_name, "cloud");
    }

    #[tokio::test]
    async fn test_local_wins_on_duplicate_id() {
        let sources = vec![
            source("cloud", Origin::RemotePrivileged, vec![raw("a", 1)]),
            source("local", Origin::Local, vec![raw("a", 1)]),
        ];

        let listing = indexer().list(&sources, &session(true)).await;
        assert_eq!(listing.backups.len(), 1);
        assert_eq!(listing.backups[0].origin(), Origin::Local);
        assert!(listing.backups[0].downloadable());
        assert_eq!(listing.backups[0].source_name(), Some("local"));
    }

    #[tokio::test]
    async fn test_sorted_newest_first() {
        let sources = vec![source(
            "local",
            Origin::Local,
            vec![raw("old", 1), raw("new", 9), raw("mid", 5)],
        )];

        let listing = indexer().list(&sources, &session(false)).await;
        let ids: Vec<_> = listing.backups.iter().map(|b| b.id()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let failing: Arc<dyn RemoteSource> = Arc::new(FixedSource {
            name: "flaky",
            origin: Origin::Local,
            entries: Err(RemoteError::Unavailable("down".to_string())),
        });

        let listing = indexer().list(&[failing], &session(false)).await;
        assert_eq!(listing.outcome(), ListOutcome::Unavailable);
        assert_eq!(listing.failures[0].source_name, "flaky");
    }
}
