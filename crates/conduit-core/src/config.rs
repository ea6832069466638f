//! Configuration for the Conduit engine
//!
//! Defaults, then an optional YAML file named by `CONDUIT_CONFIG`, then
//! `CONDUIT_*` environment overrides.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of work items executed concurrently
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// How long an idle dispatcher waits before polling the queue again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Claims of one work item before a lost race counts as a failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Largest serialized connector output accepted
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Tracing filter directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Recovery settings
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Persistence settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Directory of YAML process definitions deployed at start-up
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
}

/// Recovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Run recovery at start-up and periodically
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Elements untouched for longer than this are considered stuck
    #[serde(default = "default_consider_older_than_ms")]
    pub consider_older_than_ms: u64,

    /// Delay between periodic recovery passes
    #[serde(default = "default_recovery_interval_ms")]
    pub interval_ms: u64,
}

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store, lost on exit
    Memory,
    /// PostgreSQL
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(CoreError::ConfigurationError(format!(
                "Unknown store backend: {}",
                other
            ))),
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// PostgreSQL connection string
    #[serde(default)]
    pub postgres_url: Option<String>,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Timeout for acquiring a pooled connection, in seconds
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Apply migrations on start-up
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_worker_count() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_log_filter() -> String {
    "info,conduit=debug".to_string()
}

fn default_true() -> bool {
    true
}

fn default_consider_older_than_ms() -> u64 {
    60_000
}

fn default_recovery_interval_ms() -> u64 {
    30_000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consider_older_than_ms: default_consider_older_than_ms(),
            interval_ms: default_recovery_interval_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            postgres_url: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            max_output_bytes: default_max_output_bytes(),
            log_filter: default_log_filter(),
            log_json: false,
            recovery: RecoveryConfig::default(),
            store: StoreConfig::default(),
            definitions_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self, CoreError> {
        let mut config = match env::var("CONDUIT_CONFIG") {
            Ok(path) => Self::from_yaml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        info!(
            worker_count = config.worker_count,
            backend = ?config.store.backend,
            recovery_enabled = config.recovery.enabled,
            "Loaded engine configuration"
        );

        Ok(config)
    }

    /// Read a YAML configuration file
    pub fn from_yaml_file(path: &Path) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse a YAML configuration document
    pub fn from_yaml(contents: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(contents)
            .map_err(|e| CoreError::ConfigurationError(format!("Invalid configuration: {}", e)))
    }

    /// Apply `CONDUIT_*` environment variables; invalid values are logged and ignored
    pub fn apply_env_overrides(&mut self) {
        override_parsed("CONDUIT_WORKER_COUNT", &mut self.worker_count);
        override_parsed("CONDUIT_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        override_parsed("CONDUIT_MAX_ATTEMPTS", &mut self.max_attempts);
        override_parsed("CONDUIT_MAX_OUTPUT_BYTES", &mut self.max_output_bytes);
        override_parsed("CONDUIT_LOG_JSON", &mut self.log_json);
        override_parsed("CONDUIT_RECOVERY_ENABLED", &mut self.recovery.enabled);
        override_parsed(
            "CONDUIT_RECOVERY_OLDER_THAN_MS",
            &mut self.recovery.consider_older_than_ms,
        );
        override_parsed("CONDUIT_RECOVERY_INTERVAL_MS", &mut self.recovery.interval_ms);
        override_parsed("CONDUIT_STORE_BACKEND", &mut self.store.backend);
        override_parsed("CONDUIT_DB_MAX_CONNECTIONS", &mut self.store.max_connections);

        if let Ok(filter) = env::var("CONDUIT_LOG_FILTER") {
            self.log_filter = filter;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.store.postgres_url = Some(url);
        }
        if let Ok(dir) = env::var("CONDUIT_DEFINITIONS_DIR") {
            self.definitions_dir = Some(PathBuf::from(dir));
        }
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_count == 0 {
            return Err(CoreError::ConfigurationError(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::ConfigurationError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.postgres_url.is_none() {
            return Err(CoreError::ConfigurationError(
                "postgres backend requires store.postgres_url or DATABASE_URL".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RecoveryConfig {
    /// Staleness threshold as a duration
    pub fn consider_older_than(&self) -> Duration {
        Duration::from_millis(self.consider_older_than_ms)
    }

    /// Delay between passes as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.recovery.consider_older_than(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            r#"
worker_count: 8
recovery:
  consider_older_than_ms: 500
store:
  backend: postgres
  postgres_url: postgres://localhost/conduit
"#,
        )
        .unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.recovery.consider_older_than_ms, 500);
        assert_eq!(config.recovery.interval_ms, 30_000);
        assert_eq!(config.store.backend, StoreBackend::Postgres);
        assert_eq!(config.store.max_connections, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.worker_count = 0;
        assert!(matches!(config.validate(), Err(CoreError::ConfigurationError(_))));

        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Postgres;
        assert!(config.validate().is_err());

        assert!(EngineConfig::from_yaml("worker_count: [1]").is_err());
        assert_eq!("PostgreSQL".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
    }
}
