//! Configuration management for the daemon
//!
//! This module handles loading, validation, and management of all daemon
//! configuration. Thresholds come with defaults so an empty file (or no file
//! at all) yields a working configuration.

pub mod models;

pub use models::*;

use crate::utils::error::{HealthError, Result};
use std::env;
use std::path::Path;
use tracing::{debug, info, warn};

/// Main configuration struct for the daemon
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host system check thresholds (disk, cpu, memory)
    pub syscheck: SyscheckConfig,
    /// Service check thresholds (elasticsearch, swarmpit, consul)
    pub srvcheck: SrvcheckConfig,
    /// History persistence backend
    pub storage: StorageConfig,
    /// Chat alerting backend
    pub alerting: AlertingConfig,
    /// Consul agent endpoint
    pub consul: ConsulConfig,
}

impl Config {
    /// Load configuration: the file when it exists, defaults otherwise,
    /// then environment overrides, then validation.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if tokio::fs::metadata(path).await.is_ok() {
            Self::from_file(path).await?
        } else {
            warn!("config file {:?} not found, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("loading configuration from: {:?}", path);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HealthError::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| HealthError::Config(format!("failed to parse config: {}", e)))?;

        debug!("configuration loaded successfully");
        Ok(config)
    }

    /// Apply environment variable overrides for the endpoints that commonly
    /// differ between deployments.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = env::var("ELASTICSEARCH_URL") {
            self.storage.elasticsearch.url = url;
        }
        if let Ok(url) = env::var("CONSUL_URL") {
            self.consul.url = url;
        }
        if let Ok(webhook) = env::var("SLACK_WEBHOOK_URL") {
            self.alerting.slack.webhook_url = Some(webhook);
        }
        Ok(())
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        debug!("validating configuration");

        if self.storage.elasticsearch.url.is_empty() {
            return Err(HealthError::Validation(
                "storage.elasticsearch.url must not be empty".to_string(),
            ));
        }

        let cpu = &self.syscheck.cpu;
        if cpu.warning_usage <= 0.0 || cpu.maximum_usage <= 0.0 {
            return Err(HealthError::Validation(
                "cpu usage thresholds must be positive".to_string(),
            ));
        }
        if cpu.warning_usage >= cpu.maximum_usage {
            return Err(HealthError::Validation(
                "syscheck.cpu.warning_usage must be below maximum_usage".to_string(),
            ));
        }

        let memory = &self.syscheck.memory;
        if memory.warning_usage >= memory.maximum_usage {
            return Err(HealthError::Validation(
                "syscheck.memory.warning_usage must be below maximum_usage".to_string(),
            ));
        }

        if self.syscheck.disk.min_capacity.as_u64() == 0 {
            return Err(HealthError::Validation(
                "syscheck.disk.min_capacity must be positive".to_string(),
            ));
        }

        if self.srvcheck.elasticsearch.maximum_shards == 0 {
            return Err(HealthError::Validation(
                "srvcheck.elasticsearch.maximum_shards must be positive".to_string(),
            ));
        }

        debug!("configuration validation completed");
        Ok(())
    }

    /// Convert to YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| HealthError::Config(format!("failed to serialize config to YAML: {}", e)))
    }
}
