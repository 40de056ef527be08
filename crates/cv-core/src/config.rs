use std::collections::BTreeMap;
use std::path::PathBuf;

use cv_telemetry::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_JOB_TIMEOUT_SECS;

/// Job type the orchestrator enqueues for pipeline work.
pub const AGENT_RUN_JOB_TYPE: &str = "agent_run";

/// Top-level configuration loaded from `~/.conveyor/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Executor command per job type.
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorConfig>,
}

impl Config {
    /// Load config from `~/.conveyor/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.queue.validate()?;
        self.workers.validate()?;
        self.orchestrator.validate()?;
        self.daemon.validate()?;
        for (job_type, executor) in &self.executors {
            if executor.command.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "executors.{job_type}.command must not be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        data_dir().join("config.toml")
    }
}

/// `~/.conveyor`, or `./.conveyor` when no home directory is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conveyor")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` (alias `text`) or `json`, any case.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log_format()?;
        Ok(())
    }

    /// The parsed `log_format`, accepting exactly what the logger accepts.
    pub fn log_format(&self) -> Result<LogFormat, ConfigError> {
        self.log_format.parse::<LogFormat>().map_err(|e| {
            ConfigError::Validation(format!(
                "general.log_format must be `human`, `text` or `json`: {e}"
            ))
        })
    }
}

fn default_project_name() -> String {
    "conveyor".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// The store path with a leading `~/` expanded to the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        match (self.path.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.path),
        }
    }
}

fn default_store_path() -> String {
    "~/.conveyor/conveyor.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Terminal jobs older than this are removed by the patrol loop.
    #[serde(default = "default_stale_job_max_age")]
    pub stale_job_max_age_secs: u64,
    /// Failed attempts per task stage before the task is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            stale_job_max_age_secs: default_stale_job_max_age(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "queue.default_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "queue.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn default_stale_job_max_age() -> u64 {
    7 * 24 * 60 * 60
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Job types the pool serves. Every type needs an executor.
    #[serde(default = "default_job_types")]
    pub job_types: Vec<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval(),
            job_types: default_job_types(),
        }
    }
}

impl WorkersConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::Validation(
                "workers.count must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "workers.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "workers.sweep_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_worker_count() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_job_types() -> Vec<String> {
    vec![AGENT_RUN_JOB_TYPE.to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_max_tasks_per_cycle")]
    pub max_tasks_per_cycle: usize,
    /// Reset failed QA/Security gates to Dev with remediation tasks.
    #[serde(default = "default_true")]
    pub auto_loop_back: bool,
    /// Add an umbrella "investigate" task alongside per-finding tasks.
    #[serde(default)]
    pub umbrella_tasks: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            max_tasks_per_cycle: default_max_tasks_per_cycle(),
            auto_loop_back: true,
            umbrella_tasks: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks_per_cycle == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_tasks_per_cycle must be at least 1".into(),
            ));
        }
        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.cycle_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_cycle_interval() -> u64 {
    15
}
fn default_max_tasks_per_cycle() -> usize {
    20
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_patrol_interval")]
    pub patrol_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            patrol_interval_secs: default_patrol_interval(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patrol_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.patrol_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_patrol_interval() -> u64 {
    300
}

/// External command run for one job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}
