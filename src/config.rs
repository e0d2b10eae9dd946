//! Orchestrator configuration.
//!
//! Every section is optional in the TOML file; missing fields fall back to
//! the defaults below. A handful of fields can be overridden from the
//! environment with [`Config::apply_env`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages retained for diagnostics before the oldest is evicted.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Buffered events per observer before a slow observer starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_history_capacity() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval agents are expected to heartbeat at.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this degrades a healthy agent.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Period of the background liveness sweep.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Whole missed intervals after which a degraded agent is evicted.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_interval_ms(),
            check_interval_ms: default_check_interval_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_check_interval_ms() -> u64 {
    10_000
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries after the first attempt; only timeouts and transport
    /// failures are retried.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Cap on concurrent outbound calls per broadcast; unbounded when unset.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: BackoffStrategy::default(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_concurrency: None,
            health_check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

impl ConnectorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let base = self.retry_delay_ms;
        let delay = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long shutdown waits for in-flight work before forcing teardown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Threats kept in a summary.
    #[serde(default = "default_max_threats")]
    pub max_threats: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_threats: default_max_threats(),
        }
    }
}

impl ManagerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_threats() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8700
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `path` when given, otherwise defaults; environment overrides are
    /// applied in both cases.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_parse::<u16>("ATHENA_PORT")? {
            self.server.port = port;
        }
        if let Some(interval) = env_parse::<u64>("ATHENA_HEARTBEAT_INTERVAL_MS")? {
            self.registry.heartbeat_interval_ms = interval;
        }
        if let Some(timeout) = env_parse::<u64>("ATHENA_REQUEST_TIMEOUT_MS")? {
            self.connector.request_timeout_ms = timeout;
        }
        if let Some(attempts) = env_parse::<u32>("ATHENA_RETRY_ATTEMPTS")? {
            self.connector.retry_attempts = attempts;
        }
        Ok(())
    }

    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(None),
    }
}
