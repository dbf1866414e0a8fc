//! turing.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TuringConfig {
    pub deployment: DeploymentConfig,
    pub router: RouterDefaults,
    pub ensembling: EnsemblingConfig,
    pub environments: Vec<EnvironmentConfig>,
}

/// Settings for the deployment orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Deadline in seconds for a whole deploy call.
    pub timeout_secs: u64,
    /// Deadline in seconds for a whole undeploy call.
    pub deletion_timeout_secs: u64,
    /// Size of the persistent volume claim backing the batched logger.
    pub pvc_size: String,
    pub fluentd: FluentdConfig,
    /// Capacity of the progress event queue.
    pub event_buffer: usize,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            deletion_timeout_secs: 60,
            pvc_size: "2Gi".to_string(),
            fluentd: FluentdConfig::default(),
            event_buffer: 64,
        }
    }
}

impl DeploymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.deletion_timeout_secs)
    }
}

/// The fluentd sidecar used when results are batch-loaded to BigQuery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluentdConfig {
    pub image: String,
    pub tag: String,
    pub flush_interval_secs: u64,
}

impl Default for FluentdConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/caraml-dev/turing/fluentd".to_string(),
            tag: "latest".to_string(),
            flush_interval_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterDefaults {
    pub image: String,
    pub port: u16,
    /// DNS suffix of the stable router endpoint.
    pub domain: String,
}

impl Default for RouterDefaults {
    fn default() -> Self {
        Self {
            image: "ghcr.io/caraml-dev/turing/turing-router:latest".to_string(),
            port: 8080,
            domain: "models.local".to_string(),
        }
    }
}

/// Settings for the ensembling job controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsemblingConfig {
    pub poll_interval_secs: u64,
    /// Pending jobs claimed per tick.
    pub batch_limit: usize,
    /// Submission attempts before a job is marked `failed_submission`.
    pub max_retries: u32,
}

impl Default for EnsemblingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            batch_limit: 10,
            max_retries: 3,
        }
    }
}

impl EnsemblingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// A deployment environment backed by one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Cluster the environment's controller talks to.
    pub cluster: String,
}

impl TuringConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: TuringConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.deployment.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "deployment.timeout_secs must be positive".to_string(),
            ));
        }
        if self.deployment.deletion_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "deployment.deletion_timeout_secs must be positive".to_string(),
            ));
        }
        if self.deployment.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "deployment.event_buffer must be positive".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate environment: {}",
                    env.name
                )));
            }
        }
        Ok(())
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }
}
