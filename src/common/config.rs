//! Configuration for minishard components
//!
//! Two layers live here:
//! - [`Config`]: process-level settings (namespace, local server ip, polling)
//! - [`JobConfig`]: the per-job snapshot stored as JSON in the `config` node

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "MINISHARD_CONFIG";

/// Process-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of every job tree (`/{namespace}/{job}/...`)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// IP this process registers under `servers/{ip}`
    #[serde(default = "default_server_ip")]
    pub server_ip: String,

    /// Optional suffix to tell apart several instances on one host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_suffix: Option<String>,

    /// Polling policy for every leader/drain/cleaning wait
    #[serde(default)]
    pub wait: WaitPolicy,

    /// Capacity of the change-event channel feeding the dispatcher
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_namespace() -> String {
    "minishard".to_string()
}
fn default_server_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_event_capacity() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            server_ip: default_server_ip(),
            instance_suffix: None,
            wait: WaitPolicy::default(),
            event_capacity: default_event_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the file named by `MINISHARD_CONFIG`, falling back to defaults.
    pub fn load() -> Self {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => match Self::from_file(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Ignoring unreadable config file");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: Config = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "namespace must be a single non-empty path segment, got '{}'",
                self.namespace
            )));
        }
        if self.server_ip.is_empty() {
            return Err(Error::InvalidConfig("server_ip cannot be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be > 0".into()));
        }
        self.wait.validate()
    }
}

/// Bounded backoff for polling waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 10,
            max_ms: 100,
        }
    }
}

impl WaitPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 || self.max_ms < self.initial_ms {
            return Err(Error::InvalidConfig(format!(
                "wait policy needs 0 < initial_ms <= max_ms (got {} / {})",
                self.initial_ms, self.max_ms
            )));
        }
        Ok(())
    }
}

/// Job configuration snapshot, persisted as JSON in the job's `config` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,

    /// Carried for the trigger layer; never interpreted here.
    #[serde(default)]
    pub cron: String,

    pub sharding_total_count: u32,

    /// `"0=Beijing,1=Shanghai"`
    #[serde(default)]
    pub sharding_item_parameters: String,

    #[serde(default)]
    pub job_parameter: String,

    #[serde(default = "default_true")]
    pub monitor_execution: bool,

    #[serde(default)]
    pub failover: bool,

    #[serde(default = "default_true")]
    pub misfire: bool,

    /// Keep the existing assignment when the fleet changes.
    #[serde(default)]
    pub static_sharding: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_sharding_strategy_type: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Replace the stored config on registration instead of keeping it.
    #[serde(default)]
    pub overwrite: bool,
}

fn default_true() -> bool {
    true
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, sharding_total_count: u32) -> Self {
        Self {
            job_name: job_name.into(),
            cron: String::new(),
            sharding_total_count,
            sharding_item_parameters: String::new(),
            job_parameter: String::new(),
            monitor_execution: true,
            failover: false,
            misfire: true,
            static_sharding: false,
            job_sharding_strategy_type: None,
            description: String::new(),
            overwrite: false,
        }
    }

    pub fn with_failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_monitor_execution(mut self, monitor: bool) -> Self {
        self.monitor_execution = monitor;
        self
    }

    pub fn with_item_parameters(mut self, params: impl Into<String>) -> Self {
        self.sharding_item_parameters = params.into();
        self
    }

    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        self.job_sharding_strategy_type = Some(name.into());
        self
    }

    /// Failover needs running markers to detect crashes.
    pub fn is_failover_active(&self) -> bool {
        self.failover && self.monitor_execution
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() || self.job_name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "invalid job name '{}'",
                self.job_name
            )));
        }
        if self.sharding_total_count == 0 {
            return Err(Error::InvalidConfig(
                "sharding_total_count must be at least 1".into(),
            ));
        }
        self.item_parameters().map(|_| ())
    }

    /// Parse `sharding_item_parameters` into item → parameter.
    pub fn item_parameters(&self) -> Result<BTreeMap<u32, String>> {
        let mut params = BTreeMap::new();
        for pair in self
            .sharding_item_parameters
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let (item, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidConfig(format!("sharding item parameter '{}' has no '='", pair))
            })?;
            let item: u32 = item.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("sharding item '{}' is not a number", item))
            })?;
            params.insert(item, value.trim().to_string());
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_item_parameters() {
        let config = JobConfig::new("job", 3).with_item_parameters("0=Beijing, 1=Shanghai,2=");
        let params = config.item_parameters().unwrap();
        assert_eq!(params.get(&0).map(String::as_str), Some("Beijing"));
        assert_eq!(params.get(&1).map(String::as_str), Some("Shanghai"));
        assert_eq!(params.get(&2).map(String::as_str), Some(""));
    }

    #[test]
    fn test_item_parameters_invalid() {
        assert!(JobConfig::new("job", 3)
            .with_item_parameters("zero=A")
            .validate()
            .is_err());
        assert!(JobConfig::new("job", 3)
            .with_item_parameters("0A")
            .validate()
            .is_err());
    }

    #[test]
    fn test_job_config_defaults_from_json() {
        let config: JobConfig =
            serde_json::from_str(r#"{"job_name":"report","sharding_total_count":4}"#).unwrap();
        assert!(config.monitor_execution);
        assert!(config.misfire);
        assert!(!config.failover);
        assert!(!config.is_failover_active());
        assert!(config.with_failover(true).is_failover_active());
    }

    #[test]
    fn test_failover_requires_monitoring() {
        let config = JobConfig::new("job", 2)
            .with_failover(true)
            .with_monitor_execution(false);
        assert!(!config.is_failover_active());
    }

    #[test]
    fn test_validate_job_config() {
        assert!(JobConfig::new("job", 0).validate().is_err());
        assert!(JobConfig::new("a/b", 1).validate().is_err());
        assert!(JobConfig::new("job", 1).validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"namespace":"prod","server_ip":"10.0.0.7","wait":{{"initial_ms":5,"max_ms":50}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.server_ip, "10.0.0.7");
        assert_eq!(config.wait.max(), Duration::from_millis(50));
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_config_rejects_bad_wait_policy() {
        let config = Config {
            wait: WaitPolicy {
                initial_ms: 50,
                max_ms: 10,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
