//! Server configuration.
//!
//! Read from a TOML file, then overridden from the environment. Every field
//! has a default, so a missing file is fine.
//!
//! ```text
//! ~/.map-orchestrator/
//! ├── config.toml       # This file
//! ├── map.db            # SQLite database
//! └── service-token     # Generated on first start (0600)
//! ```
//!
//! Environment:
//! - `MAP_CONFIG`: config file path
//! - `MAP_LISTEN`: listen address
//! - `MAP_DATABASE_PATH`: database file

use map_core::tasks::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base directory for orchestrator state
pub fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".map-orchestrator")
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub ml: MlConfig,
    /// Where this config was read from
    #[serde(skip)]
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8470".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: base_dir().join("map.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub base_retry_secs: u64,
    pub max_retry_secs: u64,
    /// Unset retries forever
    pub max_retries: Option<u32>,
    pub alert_after: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            workers: 4,
            base_retry_secs: policy.base_delay.as_secs(),
            max_retry_secs: policy.max_delay.as_secs(),
            max_retries: policy.max_retries,
            alert_after: policy.alert_after,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.base_retry_secs),
            max_delay: Duration::from_secs(self.max_retry_secs.max(self.base_retry_secs)),
            max_retries: self.max_retries,
            alert_after: self.alert_after,
        }
    }
}

/// Delays before the first monitor run after a status notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub running_delay_secs: u64,
    pub completed_delay_secs: u64,
    pub stage_delay_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            running_delay_secs: 60,
            completed_delay_secs: 10,
            stage_delay_secs: 10,
        }
    }
}

impl MonitoringConfig {
    pub fn running_delay(&self) -> Duration {
        Duration::from_secs(self.running_delay_secs)
    }

    pub fn completed_delay(&self) -> Duration {
        Duration::from_secs(self.completed_delay_secs)
    }

    pub fn stage_delay(&self) -> Duration {
        Duration::from_secs(self.stage_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout for outbound facility and ML calls
    pub timeout_secs: u64,
    /// Token presented to facilities, if they require one
    pub facility_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            facility_token: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_file: PathBuf,
    /// Facility name → token it presents on callbacks
    pub facility_tokens: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: base_dir().join("service-token"),
            facility_tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Public base URL of this server, handed to the ML advisor
    pub callback_url: Option<String>,
}

impl Config {
    /// Load configuration from an explicit path, `MAP_CONFIG` or the default
    /// location, then apply environment overrides.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path
            .or_else(|| std::env::var("MAP_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| base_dir().join("config.toml"));

        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a config file; a missing file yields defaults
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `MAP_*` overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("MAP_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(path) = lookup("MAP_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
    }
}
