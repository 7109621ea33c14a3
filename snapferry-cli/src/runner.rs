//! Shared setup for commands: configuration, logging, session and service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapferry::config::ConfigFile;
use snapferry::logging::{init_logging, LoggingGuard};
use snapferry::service::{ServiceConfig, TransferService};
use snapferry::session::{AuthFlow, PrivilegeOptIn, Session, SessionGate};
use snapferry::source::{CatalogSource, RemoteSource};
use tracing::info;

use crate::commands::common::AccessArgs;
use crate::error::CliError;

/// Loads configuration and logging once per invocation.
pub struct CliRunner {
    config: ConfigFile,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Load configuration from `config_path` (or the default location) and
    /// install logging. Each `-v` raises the level one step.
    pub fn new(config_path: Option<&Path>, verbose: u8) -> Result<Self, CliError> {
        let config = load_config(config_path)?;

        let mut logging = config.logging_config();
        match verbose {
            0 => {}
            1 => logging.level = "debug".to_string(),
            _ => logging.level = "trace".to_string(),
        }
        let guard = init_logging(&logging)?;

        Ok(Self {
            config,
            _logging: guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigFile {
        &mut self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            version = snapferry::VERSION,
            command,
            download_dir = %self.config.storage.download_dir.display(),
            "snapferry starting"
        );
    }

    /// Run the login flow over the session file.
    ///
    /// The privileged opt-in is requested only by `--allow-privileged` or
    /// `[policy] allow_privileged`; the file's own flag is discarded.
    pub fn open_session(&self, access: &AccessArgs) -> Result<Session, CliError> {
        let session = Session::load(&access.session).map_err(|e| {
            CliError::Session(format!(
                "failed to read session file {}: {}",
                access.session.display(),
                e
            ))
        })?;

        let mut flow = AuthFlow::new();
        flow.begin_login()?;
        flow.complete_second_factor(session)?;

        if access.allow_privileged || self.config.policy.allow_privileged {
            let source = if access.allow_privileged {
                "--allow-privileged"
            } else {
                "[policy] allow_privileged"
            };
            flow.opt_in_privileged(PrivilegeOptIn::new(format!(
                "requested via {}",
                source
            )))?;
        }

        flow.session()
            .cloned()
            .ok_or_else(|| CliError::Session("session expired during login".to_string()))
    }

    /// Build the service over the catalog named in `access`.
    pub fn create_service(&self, access: &AccessArgs) -> Result<TransferService, CliError> {
        let catalog = access.catalog.clone();
        let sources: Vec<Arc<dyn RemoteSource>> = vec![
            Arc::new(CatalogSource::local(&catalog)),
            Arc::new(CatalogSource::privileged(&catalog)),
        ];
        let service = TransferService::new(
            ServiceConfig::from_config(&self.config),
            Arc::new(SessionGate::new()),
            sources,
        )?;
        Ok(service)
    }
}

fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    match path {
        Some(path) => {
            let mut config = ConfigFile::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(ConfigFile::load()?),
    }
}

/// Build a multi-thread runtime for async commands.
pub fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

/// Resolve `--dest` against the configured download directory.
pub fn destination(cli_dest: Option<&PathBuf>, config: &ConfigFile) -> PathBuf {
    cli_dest
        .cloned()
        .unwrap_or_else(|| config.storage.download_dir.clone())
}
