use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use super::{
    ExecutorConfig, GroupingConfig, HeartbeatMonitorConfig, NotifierConfig, SchedulerConfig,
    ServerConfig, deserialize_duration_from_seconds,
};

/// Provides the default value for shutdown_timeout.
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Provides the default value for ingest_channel_capacity.
fn default_ingest_channel_capacity() -> usize {
    1024
}

/// Provides the default value for ingest_workers.
fn default_ingest_workers() -> usize {
    4
}

/// Provides the default notification channel for users without a policy.
fn default_channel() -> String {
    "push".to_string()
}

/// Application configuration for Beacon.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Database URL for the SQLite database.
    pub database_url: String,

    /// The maximum time in seconds to wait for graceful shutdown.
    #[serde(
        deserialize_with = "deserialize_duration_from_seconds",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,

    /// Capacity of the ingestion queue.
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,

    /// Number of tasks consuming the ingestion queue.
    #[serde(default = "default_ingest_workers")]
    pub ingest_workers: usize,

    /// Channel used for users without a notification policy.
    #[serde(default = "default_channel")]
    pub default_channel: String,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Escalation executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Alert grouping settings.
    #[serde(default)]
    pub grouping: GroupingConfig,

    /// Deadline sweep settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Heartbeat monitor settings.
    #[serde(default)]
    pub heartbeat: HeartbeatMonitorConfig,

    /// Outbound notification settings.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Path to `integrations.yaml`.
    #[serde(skip_deserializing)]
    pub integrations_config_path: PathBuf,

    /// Path to `escalation_chains.yaml`.
    #[serde(skip_deserializing)]
    pub escalation_chains_config_path: PathBuf,

    /// Path to `users.yaml`.
    #[serde(skip_deserializing)]
    pub users_config_path: PathBuf,

    /// Path to `schedules.yaml`.
    #[serde(skip_deserializing)]
    pub schedules_config_path: PathBuf,

    /// Path to `webhooks.yaml`.
    #[serde(skip_deserializing)]
    pub webhooks_config_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            shutdown_timeout: default_shutdown_timeout(),
            ingest_channel_capacity: default_ingest_channel_capacity(),
            ingest_workers: default_ingest_workers(),
            default_channel: default_channel(),
            server: ServerConfig::default(),
            executor: ExecutorConfig::default(),
            grouping: GroupingConfig::default(),
            scheduler: SchedulerConfig::default(),
            heartbeat: HeartbeatMonitorConfig::default(),
            notifier: NotifierConfig::default(),
            integrations_config_path: PathBuf::new(),
            escalation_chains_config_path: PathBuf::new(),
            users_config_path: PathBuf::new(),
            schedules_config_path: PathBuf::new(),
            webhooks_config_path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Creates a new `AppConfig` by reading from the configuration directory.
    pub fn new(config_dir: Option<&str>) -> Result<Self, ConfigError> {
        let config_dir_str = config_dir.unwrap_or("configs");
        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/app.yaml", config_dir_str)))
            .add_source(Environment::with_prefix("BEACON").separator("__"))
            .build()?;
        let mut config: Self = s.try_deserialize()?;
        config.set_resource_paths(Path::new(config_dir_str));
        Ok(config)
    }

    /// Points every resource file path into `config_dir`.
    pub fn set_resource_paths(&mut self, config_dir: &Path) {
        self.integrations_config_path = config_dir.join("integrations.yaml");
        self.escalation_chains_config_path = config_dir.join("escalation_chains.yaml");
        self.users_config_path = config_dir.join("users.yaml");
        self.schedules_config_path = config_dir.join("schedules.yaml");
        self.webhooks_config_path = config_dir.join("webhooks.yaml");
    }
}
