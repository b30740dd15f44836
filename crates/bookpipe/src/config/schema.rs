use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub api: ApiSettings,
    /// KDP login-status polling.
    #[serde(default = "default_probe")]
    pub probe: RetrySettings,
    /// Remote submissions and queue fetches.
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub credentials: Option<CredentialSettings>,
    /// Overrides the default `~/.bookpipe/data/bookpipe.db` location.
    #[serde(default)]
    pub database_path: Option<String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Settings {
    /// The configured database path, falling back to the platform default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            api: ApiSettings::default(),
            probe: default_probe(),
            retry: RetrySettings::default(),
            session: SessionSettings::default(),
            sync: SyncSettings::default(),
            jobs: JobSettings::default(),
            logging: LoggingSettings::default(),
            credentials: None,
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Applied to status calls only; job endpoints run without a timeout.
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_status_timeout() -> u64 {
    30
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            status_timeout_secs: default_status_timeout(),
        }
    }
}

/// Attempt budget. Exponential backoff when `max_interval_ms` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_retry_interval() -> u64 {
    2000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_probe() -> RetrySettings {
    RetrySettings {
        interval_ms: 3000,
        max_attempts: 20,
        max_interval_ms: None,
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            interval_ms: default_retry_interval(),
            max_attempts: default_retry_attempts(),
            max_interval_ms: Some(8000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

fn default_ttl_hours() -> i64 {
    24
}

impl SessionSettings {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Periodic reconciliation interval; 0 disables the scheduler.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    /// Wait between a generation finishing and the confirming reconciliation.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

fn default_sync_interval() -> u64 {
    30
}

fn default_settle_delay() -> u64 {
    1500
}

impl SyncSettings {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            settle_delay_ms: default_settle_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Log lines kept per job run.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_log_capacity() -> usize {
    200
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

/// KDP account credentials. The password resolves from the first source set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialSettings {
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_file: Option<String>,
    #[serde(default)]
    pub password_env_var: Option<String>,
}
