use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Settings file looked up in the working directory when none is given.
pub const DEFAULT_SETTINGS_FILE: &str = "backup-sync.toml";

/// Host environment: where things live and how long tools may run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub database: DatabaseTarget,
    #[serde(default)]
    pub timeouts: ToolTimeouts,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,
    /// Extra directories searched for tools before system locations
    #[serde(default)]
    pub tool_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTimeouts {
    #[serde(default = "default_database_timeout", with = "humantime_serde")]
    pub database: Duration,
    #[serde(default = "default_vcs_timeout", with = "humantime_serde")]
    pub vcs: Duration,
    #[serde(default = "default_vcs_stage_timeout", with = "humantime_serde")]
    pub vcs_stage: Duration,
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub connection_probe: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            repo_dir: default_repo_dir(),
            settings_file: default_settings_file(),
            env_file: default_env_file(),
            tool_dirs: Vec::new(),
        }
    }
}

impl Default for DatabaseTarget {
    fn default() -> Self {
        Self {
            name: default_db_name(),
            user: default_db_user(),
            host: default_db_host(),
            port: default_db_port(),
        }
    }
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            database: default_database_timeout(),
            vcs: default_vcs_timeout(),
            vcs_stage: default_vcs_stage_timeout(),
            connection_probe: default_probe_timeout(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_bind_address(),
            port: default_metrics_port(),
        }
    }
}

impl AppSettings {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    /// Load `path` when given (it must exist), otherwise the default file if
    /// present, otherwise built-in defaults.
    pub async fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None if Path::new(DEFAULT_SETTINGS_FILE).is_file() => Self::load(DEFAULT_SETTINGS_FILE).await,
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::ConfigIo(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::ConfigIo(e.to_string()))
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.name.trim().is_empty() {
            return Err(SyncError::ConfigIo("database name cannot be empty".to_string()));
        }
        let timeouts = [
            ("database", self.timeouts.database),
            ("vcs", self.timeouts.vcs),
            ("vcs_stage", self.timeouts.vcs_stage),
            ("connection_probe", self.timeouts.connection_probe),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(SyncError::ConfigIo(format!("timeout '{}' must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

// Default value functions
fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backup-sync")
}

fn default_backup_dir() -> PathBuf { data_dir().join("backups") }
fn default_repo_dir() -> PathBuf { data_dir() }
fn default_settings_file() -> PathBuf { data_dir().join("sync_settings.json") }
fn default_env_file() -> PathBuf { PathBuf::from(".env") }

fn default_db_name() -> String { "business".to_string() }
fn default_db_user() -> String { "postgres".to_string() }
fn default_db_host() -> String { "localhost".to_string() }
fn default_db_port() -> u16 { 5432 }

fn default_database_timeout() -> Duration { Duration::from_secs(15) }
fn default_vcs_timeout() -> Duration { Duration::from_secs(15) }
fn default_vcs_stage_timeout() -> Duration { Duration::from_secs(10) }
fn default_probe_timeout() -> Duration { Duration::from_secs(5) }

fn default_log_level() -> String { "info".to_string() }
fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_metrics_port() -> u16 { 9187 }
