//! Configuration structures.
//!
//! Configuration is loaded from JSON config files; every section falls back
//! to its defaults when omitted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::invocation::retry::RetryPolicy;
use crate::registry::session::HealthThresholds;

/// Separator between plugin and tool in qualified tool names.
pub const QUALIFIED_NAME_SEPARATOR: &str = "__";

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Session registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Invocation service configuration.
    #[serde(default)]
    pub invocation: InvocationConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document; missing sections take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would make the registry or service unusable.
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.invocation.validate()
    }
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of live sessions across all users.
    pub max_sessions: usize,

    /// Idle time after which a session is unloaded.
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,

    /// How often the idle-expiry sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How often the health sweep runs.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Remaining idle budget under which an expiry warning is logged.
    #[serde(with = "humantime_serde")]
    pub expiry_warning: Duration,

    /// Error-ratio thresholds for session status.
    pub health: HealthThresholds,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(300),
            expiry_warning: Duration::from_secs(5 * 60),
            health: HealthThresholds::default(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::config("registry.max_sessions must be at least 1"));
        }
        if self.sweep_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(Error::config("registry sweep intervals must be non-zero"));
        }
        self.health.validate()
    }
}

/// Invocation service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Tool definition cache TTL.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Retry and backoff policy for tool calls.
    pub retry: RetryPolicy,

    /// Pause between consecutive batches in `execute_tool_calls`.
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,

    /// Per-call timeout when the caller does not supply one.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Batch size when the caller does not supply one.
    pub max_concurrency: usize,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            batch_delay: Duration::from_millis(100),
            default_timeout: Duration::from_secs(30),
            max_concurrency: 5,
        }
    }
}

impl InvocationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::config("invocation.max_concurrency must be at least 1"));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::config("invocation.default_timeout must be non-zero"));
        }
        self.retry.validate()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Transport kind a plugin endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Sse,
    StreamableHttp,
    Websocket,
    Stdio,
}

/// Persisted plugin configuration for one (user, plugin) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub user_id: String,
    pub plugin_name: String,
    pub endpoint_url: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "humantime_serde", default = "default_plugin_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_plugin_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_enabled() -> bool {
    true
}

impl PluginConfig {
    pub fn new(
        user_id: impl Into<String>,
        plugin_name: impl Into<String>,
        endpoint_url: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            plugin_name: plugin_name.into(),
            endpoint_url: endpoint_url.into(),
            transport,
            headers: BTreeMap::new(),
            timeout: default_plugin_timeout(),
            enabled: true,
        }
    }

    /// Check the config is usable before any connection attempt.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::config("user_id is empty"));
        }
        if self.plugin_name.trim().is_empty() {
            return Err(Error::config("plugin_name is empty"));
        }
        if self.plugin_name.contains(QUALIFIED_NAME_SEPARATOR) {
            return Err(Error::config(format!(
                "plugin_name '{}' must not contain '{}'",
                self.plugin_name, QUALIFIED_NAME_SEPARATOR
            )));
        }
        let endpoint = self.endpoint_url.trim();
        if endpoint.is_empty() {
            return Err(Error::config(format!(
                "plugin '{}' has no endpoint",
                self.plugin_name
            )));
        }
        let scheme_ok = match self.transport {
            TransportKind::Sse | TransportKind::StreamableHttp => {
                endpoint.starts_with("http://") || endpoint.starts_with("https://")
            }
            TransportKind::Websocket => {
                endpoint.starts_with("ws://") || endpoint.starts_with("wss://")
            }
            TransportKind::Stdio => true,
        };
        if !scheme_ok {
            return Err(Error::config(format!(
                "endpoint '{}' does not match transport {:?}",
                endpoint, self.transport
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::config(format!(
                "plugin '{}' has a zero timeout",
                self.plugin_name
            )));
        }
        Ok(())
    }
}
