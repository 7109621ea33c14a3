//! Orchestration of a full transfer.
//!
//! [`TransferService`] wires the components in their fixed order:
//! session check, listing, planning, execution, report writing. Policy
//! denials and plan refusals pass through unchanged so that callers can
//! render the specific reason.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigFile;
use crate::index::{BackupIndexer, Listing};
use crate::report::{Report, ReportError};
use crate::session::{PolicyError, Session, SessionGate};
use crate::source::{BackupDescriptor, Origin, RemoteSource};
use crate::transfer::{
    DownloadEngine, EngineConfig, ExpectedDigests, IntegrityLog, LogError, LogSummary, PlanError,
    PlannerConfig, ProgressEvent, Quota, TransferError, TransferPlan, TransferPlanner,
    TransferRegistry,
};

/// Errors from the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("no backup with id {backup_id}")]
    NotFound { backup_id: String },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("cannot measure free space at {}: {source}", .path.display())]
    Space {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no source can serve backup {backup_id}")]
    NoSource { backup_id: String },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Settings for the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub download_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Where reports are written; reports are not persisted when unset.
    pub report_dir: Option<PathBuf>,
    pub planner: PlannerConfig,
    pub engine: EngineConfig,
}

impl ServiceConfig {
    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            download_dir: config.storage.download_dir.clone(),
            log_dir: config.storage.log_dir.clone(),
            report_dir: Some(config.storage.report_dir.clone()),
            planner: config.planner_config(),
            engine: config.engine_config(),
        }
    }
}

/// A finished download: the report and where it was saved.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub report: Report,
    pub report_path: Option<PathBuf>,
}

/// Entry point used by front ends.
pub struct TransferService {
    gate: Arc<SessionGate>,
    indexer: BackupIndexer,
    planner: TransferPlanner,
    engine: DownloadEngine,
    sources: Vec<Arc<dyn RemoteSource>>,
    config: ServiceConfig,
}

impl TransferService {
    /// Create a service; opens the integrity log under `config.log_dir`.
    pub fn new(
        config: ServiceConfig,
        gate: Arc<SessionGate>,
        sources: Vec<Arc<dyn RemoteSource>>,
    ) -> ServiceResult<Self> {
        let log = Arc::new(IntegrityLog::open(&config.log_dir)?);
        Ok(Self {
            indexer: BackupIndexer::new(Arc::clone(&gate)),
            planner: TransferPlanner::new(config.planner),
            engine: DownloadEngine::new(log, config.engine.clone()),
            gate,
            sources,
            config,
        })
    }

    /// Share an in-process transfer registry with other services.
    pub fn with_registry(mut self, registry: TransferRegistry) -> Self {
        self.engine = self.engine.with_registry(registry);
        self
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    pub fn log(&self) -> &Arc<IntegrityLog> {
        self.engine.log()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// List backups from every source.
    ///
    /// The session must be valid. Privileged sources are gated inside the
    /// indexer; their denials are part of the returned [`Listing`].
    pub async fn list_backups(&self, session: &Session) -> ServiceResult<Listing> {
        self.gate.require_session(session)?;
        for line in self.gate.describe_capabilities(session) {
            info!(account = %session.account_id, "{}", line);
        }
        Ok(self.indexer.list(&self.sources, session).await)
    }

    /// Find a backup by id.
    ///
    /// If the backup is not listed and a privileged source was denied, the
    /// denial is returned instead of `NotFound`.
    pub async fn find_backup(
        &self,
        session: &Session,
        backup_id: &str,
    ) -> ServiceResult<BackupDescriptor> {
        let listing = self.list_backups(session).await?;
        if let Some(descriptor) = listing.find(backup_id) {
            return Ok(descriptor.clone());
        }
        if let Some(denial) = listing.denials.first() {
            return Err(PolicyError::Denied {
                reason: denial.reason,
            }
            .into());
        }
        Err(ServiceError::NotFound {
            backup_id: backup_id.to_string(),
        })
    }

    /// Plan a transfer into `destination` (the configured download dir when `None`).
    pub async fn plan(
        &self,
        session: &Session,
        backup_id: &str,
        destination: Option<&Path>,
        expected: ExpectedDigests,
    ) -> ServiceResult<TransferPlan> {
        let descriptor = self.find_backup(session, backup_id).await?;
        let destination = destination.unwrap_or(&self.config.download_dir);
        let quota = Quota::probe(destination).map_err(|source| ServiceError::Space {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok(self
            .planner
            .plan_with_digests(&descriptor, destination, quota, expected)?)
    }

    /// Execute a plan and persist its report.
    pub async fn execute(
        &self,
        session: &Session,
        plan: &TransferPlan,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> ServiceResult<DownloadOutcome> {
        self.gate.require_session(session)?;
        let source = self
            .transfer_source(plan)
            .ok_or_else(|| ServiceError::NoSource {
                backup_id: plan.backup_id.clone(),
            })?;

        let report = self.engine.execute(plan, source, cancel, progress).await?;
        let report_path = match &self.config.report_dir {
            Some(dir) => match report.write_json(dir) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(error = %e, "Failed to persist report");
                    None
                }
            },
            None => None,
        };
        Ok(DownloadOutcome {
            report,
            report_path,
        })
    }

    /// Plan and execute in one call.
    pub async fn download(
        &self,
        session: &Session,
        backup_id: &str,
        destination: Option<&Path>,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> ServiceResult<DownloadOutcome> {
        let plan = self
            .plan(session, backup_id, destination, ExpectedDigests::default())
            .await?;
        self.execute(session, &plan, cancel, progress).await
    }

    /// Integrity log counts for a backup.
    pub fn status(&self, backup_id: &str) -> ServiceResult<LogSummary> {
        Ok(self.log().summary(backup_id)?)
    }

    /// Forget resume state for a backup.
    pub fn reset(&self, backup_id: &str) -> ServiceResult<()> {
        Ok(self.log().clear(backup_id)?)
    }

    /// The `Local` source that listed the plan's backup.
    fn transfer_source(&self, plan: &TransferPlan) -> Option<Arc<dyn RemoteSource>> {
        let name = plan.source_name.as_deref()?;
        self.sources
            .iter()
            .find(|source| source.origin() == Origin::Local && source.name() == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FinalStatus;
    use crate::session::DenialReason;
    use crate::source::{CatalogEntry, CatalogFile, CatalogSource};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn session() -> Session {
        Session::new("alice", "tok", true, Utc::now() + Duration::hours(1))
    }

    fn setup(temp: &Path) -> TransferService {
        let artifacts = temp.join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join("phone.img"), vec![7u8; 3000]).unwrap();

        let entry = |id: &str, path: &str, privileged: bool| CatalogEntry {
            id: id.to_string(),
            device_name: "Phone".to_string(),
            device_os_version: "17".to_string(),
            created_at: Utc::now(),
            path: PathBuf::from(path),
            approx_size_bytes: Some(3000),
            privileged,
        };
        let catalog = CatalogFile {
            backups: vec![
                entry("phone", "artifacts/phone.img", false),
                entry("cloud", "missing.img", true),
            ],
        };
        let catalog_path = temp.join("catalog.json");
        std::fs::write(&catalog_path, serde_json::to_vec(&catalog).unwrap()).unwrap();

        let config = ServiceConfig {
            download_dir: temp.join("out"),
            log_dir: temp.join("log"),
            report_dir: Some(temp.join("reports")),
            planner: PlannerConfig {
                chunk_size: 1024,
                safety_margin_bytes: 0,
            },
            engine: EngineConfig::default(),
        };
        TransferService::new(
            config,
            Arc::new(SessionGate::new()),
            vec![
                Arc::new(CatalogSource::local(&catalog_path)),
                Arc::new(CatalogSource::privileged(&catalog_path)),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_download_local_backup() {
        let temp = TempDir::new().unwrap();
        let service = setup(temp.path());

        let outcome = service
            .download(&session(), "phone", None, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome.report.final_status, FinalStatus::Completed);
        assert_eq!(outcome.report.files_ok, 3);
        assert!(outcome.report_path.unwrap().exists());
        assert_eq!(service.status("phone").unwrap().verified, 3);
    }

    fn write_catalog(dir: &Path, id: &str, fill: u8) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("artifact.img"), vec![fill; 2500]).unwrap();
        let catalog = CatalogFile {
            backups: vec![CatalogEntry {
                id: id.to_string(),
                device_name: id.to_string(),
                device_os_version: "17".to_string(),
                created_at: Utc::now(),
                path: PathBuf::from("artifact.img"),
                approx_size_bytes: Some(2500),
                privileged: false,
            }],
        };
        let path = dir.join("catalog.json");
        std::fs::write(&path, serde_json::to_vec(&catalog).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_download_routes_to_listing_source() {
        let temp = TempDir::new().unwrap();
        let first = write_catalog(&temp.path().join("first"), "phone", 1);
        let second = write_catalog(&temp.path().join("second"), "tablet", 2);
        let config = ServiceConfig {
            download_dir: temp.path().join("out"),
            log_dir: temp.path().join("log"),
            report_dir: None,
            planner: PlannerConfig {
                chunk_size: 1024,
                safety_margin_bytes: 0,
            },
            engine: EngineConfig::default(),
        };
        let service = TransferService::new(
            config,
            Arc::new(SessionGate::new()),
            vec![
                Arc::new(CatalogSource::local(&first).with_name("first-catalog")),
                Arc::new(CatalogSource::local(&second).with_name("second-catalog")),
            ],
        )
        .unwrap();

        let plan = service
            .plan(&session(), "tablet", None, ExpectedDigests::default())
            .await
            .unwrap();
        assert_eq!(plan.source_name.as_deref(), Some("second-catalog"));

        let outcome = service
            .execute(&session(), &plan, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.report.final_status, FinalStatus::Completed);
        let bytes = std::fs::read(outcome.report.output_path.unwrap()).unwrap();
        assert_eq!(bytes, vec![2u8; 2500]);
    }

    #[tokio::test]
    async fn test_plan_for_unknown_source_is_rejected() {
        let temp = TempDir::new().unwrap();
        let service = setup(temp.path());
        let mut plan = service
            .plan(&session(), "phone", None, ExpectedDigests::default())
            .await
            .unwrap();
        plan.source_name = Some("elsewhere".to_string());

        let err = service
            .execute(&session(), &plan, CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoSource { .. }));
    }

    #[tokio::test]
    async fn test_privileged_backup_is_denied_not_missing() {
        let temp = TempDir::new().unwrap();
        let service = setup(temp.path());

        let err = service
            .download(&session(), "cloud", None, CancellationToken::new(), None)
            .await
            .unwrap_err();
        match err {
            ServiceError::Policy(e) => assert_eq!(e.reason(), DenialReason::NotPrivileged),
            other => panic!("Expected policy denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_privileged_backup_never_downloadable() {
        let temp = TempDir::new().unwrap();
        let service = setup(temp.path());
        let mut session = session();
        session.privileged_access_allowed = true;

        let err = service
            .plan(&session, "cloud", None, ExpectedDigests::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Plan(PlanError::NotDownloadable { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_backup_not_found() {
        let temp = TempDir::new().unwrap();
        let service = setup(temp.path());
        let mut session = session();
        session.privileged_access_allowed = true;

        let err = service
            .plan(&session, "nope", None, ExpectedDigests::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_expired_session_rejected() {
        let temp = TempDir::new().unwrap();
        let service = setup(temp.path());
        let mut session = session();
        session.expires_at = Utc::now() - Duration::minutes(1);

        let err = service.list_backups(&session).await.unwrap_err();
        match err {
            ServiceError::Policy(e) => assert_eq!(e.reason(), DenialReason::Expired),
            other => panic!("Expected policy denial, got {:?}", other),
        }
    }
}
