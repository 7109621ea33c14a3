//! Configuration file handling.
//!
//! Settings live in an INI file, by default
//! `<config dir>/snapferry/config.ini`:
//!
//! ```ini
//! [download]
//! chunk_size_mb = 16
//! concurrency = 4
//! max_attempts = 3
//! backoff_initial_ms = 250
//! backoff_max_secs = 30
//!
//! [storage]
//! download_dir = /data/backups
//! log_dir = /var/lib/snapferry/integrity
//! report_dir = /var/lib/snapferry/reports
//! safety_margin_mb = 512
//!
//! [policy]
//! allow_privileged = false
//!
//! [logging]
//! level = info
//! file = /var/log/snapferry
//! ```
//!
//! A missing file yields defaults. Environment variables
//! (`SNAPFERRY_DOWNLOAD_DIR`, `SNAPFERRY_CHUNK_SIZE_MB`,
//! `SNAPFERRY_MAX_PARALLEL`, `SNAPFERRY_ALLOW_PRIVILEGED`,
//! `SNAPFERRY_LOG_LEVEL`) override file values.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use tracing::debug;

use crate::logging::{LoggingConfig, DEFAULT_LOG_LEVEL};
use crate::transfer::{
    EngineConfig, PlannerConfig, RetryPolicy, DEFAULT_CONCURRENCY, DEFAULT_INITIAL_DELAY_MS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_SECS, MAX_CONCURRENCY,
};

const MIB: u64 = 1024 * 1024;

/// Default chunk size in MiB.
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 16;

/// Default fixed safety margin in MiB.
pub const DEFAULT_SAFETY_MARGIN_MB: u64 = 512;

/// Smallest configurable chunk size in MiB.
pub const MIN_CHUNK_SIZE_MB: u64 = 1;

pub const ENV_DOWNLOAD_DIR: &str = "SNAPFERRY_DOWNLOAD_DIR";
pub const ENV_CHUNK_SIZE_MB: &str = "SNAPFERRY_CHUNK_SIZE_MB";
pub const ENV_MAX_PARALLEL: &str = "SNAPFERRY_MAX_PARALLEL";
pub const ENV_ALLOW_PRIVILEGED: &str = "SNAPFERRY_ALLOW_PRIVILEGED";
pub const ENV_LOG_LEVEL: &str = "SNAPFERRY_LOG_LEVEL";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("failed to write config {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("could not determine the user's config directory")]
    NoConfigDir,
}

/// `[download]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub chunk_size_mb: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            chunk_size_mb: DEFAULT_CHUNK_SIZE_MB,
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_initial_ms: DEFAULT_INITIAL_DELAY_MS,
            backoff_max_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

/// `[storage]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    /// Destination root for reassembled backups.
    pub download_dir: PathBuf,
    /// Integrity log root.
    pub log_dir: PathBuf,
    /// Where reports are written.
    pub report_dir: PathBuf,
    pub safety_margin_mb: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data = data_root();
        Self {
            download_dir: data.join("backups"),
            log_dir: data.join("integrity"),
            report_dir: data.join("reports"),
            safety_margin_mb: DEFAULT_SAFETY_MARGIN_MB,
        }
    }
}

/// `[policy]` settings.
///
/// `allow_privileged` only requests the per-session opt-in for privileged
/// listings. It never makes a privileged backup downloadable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySettings {
    pub allow_privileged: bool,
}

/// `[logging]` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub download: DownloadSettings,
    pub storage: StorageSettings,
    pub policy: PolicySettings,
    pub logging: LoggingSettings,
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snapferry")
}

/// Default config file location.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("snapferry").join("config.ini"))
        .ok_or(ConfigError::NoConfigDir)
}

fn invalid(section: &str, key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_number<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, "expected a non-negative integer"))
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(section, key, value, "expected true or false")),
    }
}

impl ConfigFile {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&config_file_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` without environment overrides. Missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(config);
        }

        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(section) = ini.section(Some("download")) {
            if let Some(v) = section.get("chunk_size_mb") {
                config.download.chunk_size_mb = parse_number("download", "chunk_size_mb", v)?;
            }
            if let Some(v) = section.get("concurrency") {
                config.download.concurrency = parse_number("download", "concurrency", v)?;
            }
            if let Some(v) = section.get("max_attempts") {
                config.download.max_attempts = parse_number("download", "max_attempts", v)?;
            }
            if let Some(v) = section.get("backoff_initial_ms") {
                config.download.backoff_initial_ms =
                    parse_number("download", "backoff_initial_ms", v)?;
            }
            if let Some(v) = section.get("backoff_max_secs") {
                config.download.backoff_max_secs = parse_number("download", "backoff_max_secs", v)?;
            }
        }

        if let Some(section) = ini.section(Some("storage")) {
            if let Some(v) = section.get("download_dir").filter(|v| !v.trim().is_empty()) {
                config.storage.download_dir = PathBuf::from(v.trim());
            }
            if let Some(v) = section.get("log_dir").filter(|v| !v.trim().is_empty()) {
                config.storage.log_dir = PathBuf::from(v.trim());
            }
            if let Some(v) = section.get("report_dir").filter(|v| !v.trim().is_empty()) {
                config.storage.report_dir = PathBuf::from(v.trim());
            }
            if let Some(v) = section.get("safety_margin_mb") {
                config.storage.safety_margin_mb = parse_number("storage", "safety_margin_mb", v)?;
            }
        }

        if let Some(section) = ini.section(Some("policy")) {
            if let Some(v) = section.get("allow_privileged") {
                config.policy.allow_privileged = parse_bool("policy", "allow_privileged", v)?;
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            if let Some(v) = section.get("level").filter(|v| !v.trim().is_empty()) {
                config.logging.level = v.trim().to_string();
            }
            if let Some(v) = section.get("file").filter(|v| !v.trim().is_empty()) {
                config.logging.file = Some(PathBuf::from(v.trim()));
            }
        }

        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_DOWNLOAD_DIR).filter(|v| !v.is_empty()) {
            self.storage.download_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_CHUNK_SIZE_MB) {
            self.download.chunk_size_mb = parse_number("env", ENV_CHUNK_SIZE_MB, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PARALLEL) {
            self.download.concurrency = parse_number("env", ENV_MAX_PARALLEL, &v)?;
        }
        if let Some(v) = lookup(ENV_ALLOW_PRIVILEGED) {
            self.policy.allow_privileged = parse_bool("env", ENV_ALLOW_PRIVILEGED, &v)?;
        }
        if let Some(v) = lookup(ENV_LOG_LEVEL).filter(|v| !v.is_empty()) {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.download;
        if d.chunk_size_mb < MIN_CHUNK_SIZE_MB {
            return Err(invalid(
                "download",
                "chunk_size_mb",
                &d.chunk_size_mb.to_string(),
                format!("must be at least {}", MIN_CHUNK_SIZE_MB),
            ));
        }
        if d.chunk_size_mb.checked_mul(MIB).is_none() {
            return Err(invalid(
                "download",
                "chunk_size_mb",
                &d.chunk_size_mb.to_string(),
                "too large",
            ));
        }
        if !(1..=MAX_CONCURRENCY).contains(&d.concurrency) {
            return Err(invalid(
                "download",
                "concurrency",
                &d.concurrency.to_string(),
                format!("must be between 1 and {}", MAX_CONCURRENCY),
            ));
        }
        if d.max_attempts == 0 {
            return Err(invalid("download", "max_attempts", "0", "must be at least 1"));
        }
        Ok(())
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        ini.with_section(Some("download"))
            .set("chunk_size_mb", self.download.chunk_size_mb.to_string())
            .set("concurrency", self.download.concurrency.to_string())
            .set("max_attempts", self.download.max_attempts.to_string())
            .set("backoff_initial_ms", self.download.backoff_initial_ms.to_string())
            .set("backoff_max_secs", self.download.backoff_max_secs.to_string());
        ini.with_section(Some("storage"))
            .set("download_dir", self.storage.download_dir.display().to_string())
            .set("log_dir", self.storage.log_dir.display().to_string())
            .set("report_dir", self.storage.report_dir.display().to_string())
            .set("safety_margin_mb", self.storage.safety_margin_mb.to_string());
        ini.with_section(Some("policy"))
            .set("allow_privileged", self.policy.allow_privileged.to_string());
        let mut logging = ini.with_section(Some("logging"));
        logging.set("level", self.logging.level.clone());
        if let Some(file) = &self.logging.file {
            logging.set("file", file.display().to_string());
        }

        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        ini.write_to_file(path).map_err(write_err)
    }

    /// Engine settings derived from `[download]`.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            concurrency: self.download.concurrency,
            retry: RetryPolicy::with_delays(
                self.download.max_attempts,
                Duration::from_millis(self.download.backoff_initial_ms),
                Duration::from_secs(self.download.backoff_max_secs),
            ),
        }
    }

    /// Planner settings derived from `[download]` and `[storage]`.
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            chunk_size: self.download.chunk_size_mb.saturating_mul(MIB),
            safety_margin_bytes: self.storage.safety_margin_mb.saturating_mul(MIB),
        }
    }

    /// Logging settings derived from `[logging]`.
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.logging.level.clone(),
            log_dir: self.logging.file.clone(),
            ..LoggingConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp.path().join("none.ini")).unwrap();
        assert_eq!(config, ConfigFile::default());
        assert!(!config.policy.allow_privileged);
        assert_eq!(config.planner_config().chunk_size, 16 * MIB);
    }

    #[test]
    fn test_load_sections() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(
            &path,
            "[download]\nchunk_size_mb = 8\nconcurrency = 2\nmax_attempts = 5\n\n\
             [storage]\ndownload_dir = /data/out\nsafety_margin_mb = 64\n\n\
             [policy]\nallow_privileged = yes\n\n\
             [logging]\nlevel = debug\nfile = /tmp/logs\n",
        )
        .unwrap();

        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.download.chunk_size_mb, 8);
        assert_eq!(config.download.concurrency, 2);
        assert_eq!(config.download.max_attempts, 5);
        assert_eq!(config.storage.download_dir, PathBuf::from("/data/out"));
        assert_eq!(config.planner_config().safety_margin_bytes, 64 * MIB);
        assert!(config.policy.allow_privileged);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging_config().log_dir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.engine_config().retry.max_attempts(), 5);
    }

    #[test]
    fn test_invalid_number_names_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[download]\nconcurrency = lots\n").unwrap();

        match ConfigFile::load_from(&path) {
            Err(ConfigError::InvalidValue { section, key, .. }) => {
                assert_eq!(section, "download");
                assert_eq!(key, "concurrency");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigFile::default();
        config
            .apply_overrides(env(&[
                (ENV_DOWNLOAD_DIR, "/env/out"),
                (ENV_CHUNK_SIZE_MB, "32"),
                (ENV_MAX_PARALLEL, "8"),
                (ENV_ALLOW_PRIVILEGED, "on"),
                (ENV_LOG_LEVEL, "trace"),
            ]))
            .unwrap();

        assert_eq!(config.storage.download_dir, PathBuf::from("/env/out"));
        assert_eq!(config.download.chunk_size_mb, 32);
        assert_eq!(config.download.concurrency, 8);
        assert!(config.policy.allow_privileged);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_bad_env_bool_rejected() {
        let mut config = ConfigFile::default();
        let err = config
            .apply_overrides(env(&[(ENV_ALLOW_PRIVILEGED, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation_ranges() {
        let mut config = ConfigFile::default();
        config.download.concurrency = 0;
        assert!(config.validate().is_err());

        config.download.concurrency = 65;
        assert!(config.validate().is_err());

        config.download.concurrency = 4;
        config.download.chunk_size_mb = 0;
        assert!(config.validate().is_err());

        config.download.chunk_size_mb = 1;
        config.download.max_attempts = 0;
        assert!(config.validate().is_err());

        config.download.max_attempts = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.ini");
        let mut config = ConfigFile::default();
        config.download.chunk_size_mb = 4;
        config.policy.allow_privileged = true;
        config.logging.file = Some(PathBuf::from("/var/log/snapferry"));

        config.save_to(&path).unwrap();
        assert_eq!(ConfigFile::load_from(&path).unwrap(), config);
    }
}
