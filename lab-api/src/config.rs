use lab_orchestrator::{BrokerConfig, ExecutorConfig, RegistryBackend};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid bind address '{0}'")]
    BindAddr(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// `memory` for a single instance, `shared` when several instances serve one store.
    #[serde(default = "default_registry_backend")]
    pub registry_backend: RegistryBackend,

    /// Store for the shared registry; the main database when unset.
    #[serde(default = "default_shared_store_url")]
    pub shared_store_url: Option<String>,

    #[serde(default = "default_reaper_enabled")]
    pub reaper_enabled: bool,

    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    #[serde(default = "default_deployment_ttl")]
    pub deployment_ttl_secs: u64,

    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    #[serde(default = "default_action_retention")]
    pub action_retention_secs: u64,

    #[serde(default = "default_archiver_interval")]
    pub archiver_interval_secs: u64,

    #[serde(default = "default_log_drain")]
    pub log_drain_secs: u64,

    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,

    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: PathBuf,

    #[serde(default = "default_labs_dir")]
    pub labs_dir: PathBuf,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("LAB_API_BIND").unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("LAB_API_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("lab").join("api").join("lab.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".lab").join("api").join("lab.db")
    }
}

fn default_registry_backend() -> RegistryBackend {
    env_or("LAB_API_REGISTRY", RegistryBackend::Memory)
}

fn default_shared_store_url() -> Option<String> {
    std::env::var("LAB_API_SHARED_STORE_URL").ok()
}

fn default_reaper_enabled() -> bool {
    env_or("LAB_API_REAPER_ENABLED", true)
}

fn default_reaper_interval() -> u64 {
    env_or("LAB_API_REAPER_INTERVAL", 60) // 1 minute
}

fn default_deployment_ttl() -> u64 {
    env_or("LAB_API_DEPLOYMENT_TTL", 4 * 60 * 60) // 4 hours
}

fn default_action_timeout() -> u64 {
    env_or("LAB_API_ACTION_TIMEOUT", 30 * 60) // 30 minutes
}

fn default_action_retention() -> u64 {
    env_or("LAB_API_ACTION_RETENTION", 7 * 24 * 60 * 60) // 7 days
}

fn default_archiver_interval() -> u64 {
    env_or("LAB_API_ARCHIVER_INTERVAL", 60 * 60)
}

fn default_log_drain() -> u64 {
    env_or("LAB_API_LOG_DRAIN", 5 * 60)
}

fn default_log_buffer() -> usize {
    env_or("LAB_API_LOG_BUFFER", 1024)
}

fn default_terraform_bin() -> PathBuf {
    PathBuf::from(std::env::var("LAB_API_TERRAFORM_BIN").unwrap_or_else(|_| "terraform".to_string()))
}

fn default_labs_dir() -> PathBuf {
    PathBuf::from(std::env::var("LAB_API_LABS_DIR").unwrap_or_else(|_| "labs".to_string()))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            registry_backend: default_registry_backend(),
            shared_store_url: default_shared_store_url(),
            reaper_enabled: default_reaper_enabled(),
            reaper_interval_secs: default_reaper_interval(),
            deployment_ttl_secs: default_deployment_ttl(),
            action_timeout_secs: default_action_timeout(),
            action_retention_secs: default_action_retention(),
            archiver_interval_secs: default_archiver_interval(),
            log_drain_secs: default_log_drain(),
            log_buffer: default_log_buffer(),
            terraform_bin: default_terraform_bin(),
            labs_dir: default_labs_dir(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::BindAddr(self.bind_addr.clone()))?;

        let positive = [
            ("reaper_interval_secs", self.reaper_interval_secs),
            ("deployment_ttl_secs", self.deployment_ttl_secs),
            ("action_timeout_secs", self.action_timeout_secs),
            ("archiver_interval_secs", self.archiver_interval_secs),
            ("log_buffer", self.log_buffer as u64),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*field));
        }

        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            subscriber_buffer: self.log_buffer,
            drain_window: Duration::from_secs(self.log_drain_secs),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: Duration::from_secs(self.action_timeout_secs),
            deployment_ttl: Duration::from_secs(self.deployment_ttl_secs),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn action_retention(&self) -> Duration {
        Duration::from_secs(self.action_retention_secs)
    }

    pub fn archiver_interval(&self) -> Duration {
        Duration::from_secs(self.archiver_interval_secs)
    }
}
