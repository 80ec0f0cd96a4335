//! Configuration loader and validator for the scheduling bridge.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub wfm: Remote,
    pub frontend: Remote,
    pub engine: Engine,
    pub sync: Sync,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

/// Connection settings for a remote JSON API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
}

/// Change-dispatch engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Engine {
    pub lease_attempts: u32,
    pub lease_retry_ms: u64,
    pub lease_ttl_seconds: u64,
    pub ledger_recheck_ms: u64,
    /// An `InProgress` ledger marker older than this may be claimed again.
    pub ledger_stale_seconds: u64,
    pub auto_approve_swaps: bool,
    pub auto_approve_delay_seconds: u64,
}

/// Periodic pull-sync settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sync {
    pub interval_seconds: u64,
    pub max_batch_size: usize,
    pub weeks_behind: u32,
    pub weeks_ahead: u32,
    pub share_after_sync: bool,
}

/// Runtime view of [`Engine`] handed to handlers and repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub lease_attempts: u32,
    pub lease_retry: Duration,
    pub lease_ttl_seconds: u64,
    pub ledger_recheck: Duration,
    pub ledger_stale_seconds: u64,
    pub auto_approve_swaps: bool,
    pub auto_approve_delay_seconds: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lease_attempts: 10,
            lease_retry: Duration::from_millis(200),
            lease_ttl_seconds: 60,
            ledger_recheck: Duration::from_secs(2),
            ledger_stale_seconds: 120,
            auto_approve_swaps: false,
            auto_approve_delay_seconds: 300,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.app.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.app.data_dir.clone(),
            },
            None => self.app.data_dir.clone(),
        }
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/shiftbridge.db", self.resolved_data_dir()))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lease_attempts: self.engine.lease_attempts,
            lease_retry: Duration::from_millis(self.engine.lease_retry_ms),
            lease_ttl_seconds: self.engine.lease_ttl_seconds,
            ledger_recheck: Duration::from_millis(self.engine.ledger_recheck_ms),
            ledger_stale_seconds: self.engine.ledger_stale_seconds,
            auto_approve_swaps: self.engine.auto_approve_swaps,
            auto_approve_delay_seconds: self.engine.auto_approve_delay_seconds,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.wfm.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("wfm.base_url must be non-empty"));
    }
    if cfg.wfm.token.trim().is_empty() {
        return Err(ConfigError::Invalid("wfm.token must be non-empty"));
    }
    if cfg.frontend.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("frontend.base_url must be non-empty"));
    }
    if cfg.frontend.token.trim().is_empty() {
        return Err(ConfigError::Invalid("frontend.token must be non-empty"));
    }

    if cfg.engine.lease_attempts == 0 {
        return Err(ConfigError::Invalid("engine.lease_attempts must be > 0"));
    }
    if cfg.engine.lease_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("engine.lease_ttl_seconds must be > 0"));
    }
    if cfg.engine.ledger_stale_seconds == 0 {
        return Err(ConfigError::Invalid("engine.ledger_stale_seconds must be > 0"));
    }

    if cfg.sync.interval_seconds == 0 {
        return Err(ConfigError::Invalid("sync.interval_seconds must be > 0"));
    }
    if cfg.sync.max_batch_size == 0 {
        return Err(ConfigError::Invalid("sync.max_batch_size must be > 0"));
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60

wfm:
  base_url: "https://wfm.example.com/api/"
  token: "YOUR_WFM_API_TOKEN"

frontend:
  base_url: "https://scheduling.example.com/v1.0/"
  token: "YOUR_FRONTEND_API_TOKEN"

engine:
  lease_attempts: 10
  lease_retry_ms: 200
  lease_ttl_seconds: 60
  ledger_recheck_ms: 2000
  ledger_stale_seconds: 120
  auto_approve_swaps: true
  auto_approve_delay_seconds: 300

sync:
  interval_seconds: 900
  max_batch_size: 100
  weeks_behind: 1
  weeks_ahead: 3
  share_after_sync: true
"#
}
