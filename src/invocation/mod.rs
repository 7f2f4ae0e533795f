//! Resilient tool invocation on top of the session registry.
//!
//! Entry point for callers: resolves sessions through the registry, serves
//! tool lists from a short-TTL cache, runs batches of tool calls with bounded
//! concurrency and per-call retry, and keeps per-tool call metrics.

pub mod cache;
pub mod metrics;
pub mod retry;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::registry::{SessionHandle, SessionInfo, SessionRegistry};
use crate::transport::ToolDefinition;
use crate::types::{
    Error, ErrorKind, InvocationConfig, PluginConfig, Result, SessionKey, QUALIFIED_NAME_SEPARATOR,
};

pub use cache::{CacheEntryInfo, CacheSnapshot, ToolCache};
pub use metrics::{CallMetrics, ToolMetricsReport};
pub use retry::RetryPolicy;

// =============================================================================
// Requests & outcomes
// =============================================================================

/// One tool call in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default = "new_call_id")]
    pub id: String,
    pub plugin: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ToolCallRequest {
    pub fn new(plugin: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: new_call_id(),
            plugin: plugin.into(),
            tool: tool.into(),
            arguments,
        }
    }

    /// Build from a plugin-qualified name as produced by `get_user_tools`.
    pub fn from_qualified(name: &str, arguments: Value) -> Result<Self> {
        let (plugin, tool) = split_qualified_name(name)
            .ok_or_else(|| Error::not_found(format!("'{name}' is not a plugin-qualified tool name")))?;
        Ok(Self::new(plugin, tool, arguments))
    }
}

/// Result of one call in a batch. Failures are data, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutcome {
    pub id: String,
    pub plugin: String,
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

impl ToolCallOutcome {
    fn from_result(call: &ToolCallRequest, result: Result<Value>, elapsed: Duration) -> Self {
        let (success, result, error, error_kind) = match result {
            Ok(value) => (true, Some(value), None, None),
            Err(e) => (false, None, Some(e.to_string()), Some(e.kind())),
        };
        Self {
            id: call.id.clone(),
            plugin: call.plugin.clone(),
            tool: call.tool.clone(),
            success,
            result,
            error,
            error_kind,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// `<plugin>__<tool>`.
pub fn qualified_tool_name(plugin: &str, tool: &str) -> String {
    format!("{plugin}{QUALIFIED_NAME_SEPARATOR}{tool}")
}

/// Inverse of [`qualified_tool_name`]. Plugin names never contain the separator.
pub fn split_qualified_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(QUALIFIED_NAME_SEPARATOR)
        .filter(|(plugin, tool)| !plugin.is_empty() && !tool.is_empty())
}

// =============================================================================
// Service
// =============================================================================

/// Public entry point for listing and invoking plugin tools.
#[derive(Debug)]
pub struct InvocationService {
    registry: Arc<SessionRegistry>,
    config: InvocationConfig,
    cache: ToolCache,
    metrics: CallMetrics,
    /// Configs seen for each key, used to reconnect expired or broken sessions.
    plugin_configs: DashMap<SessionKey, PluginConfig>,
}

impl InvocationService {
    pub fn new(registry: Arc<SessionRegistry>, config: InvocationConfig) -> Self {
        let cache = ToolCache::new(config.cache_ttl);
        Self {
            registry,
            config,
            cache,
            metrics: CallMetrics::new(),
            plugin_configs: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &InvocationConfig {
        &self.config
    }

    // =========================================================================
    // Plugin configuration
    // =========================================================================

    /// Remember `config` so calls can reconnect its session on demand.
    pub fn register_plugin(&self, config: PluginConfig) {
        let key = SessionKey::new(&config.user_id, &config.plugin_name);
        self.plugin_configs.insert(key, config);
    }

    /// Apply a changed plugin configuration: drop cached tools and reload the session.
    pub async fn refresh_plugin(&self, config: PluginConfig) -> bool {
        self.clear_cache(Some(&config.user_id), Some(&config.plugin_name));
        let reloaded = self.registry.reload(&config).await;
        tracing::info!(
            "plugin_refreshed: user={}, plugin={}, reloaded={}",
            config.user_id,
            config.plugin_name,
            reloaded
        );
        self.register_plugin(config);
        reloaded
    }

    /// Forget a removed plugin: config, cached tools and session.
    pub async fn remove_plugin(&self, user_id: &str, plugin_name: &str) {
        self.plugin_configs
            .remove(&SessionKey::new(user_id, plugin_name));
        self.clear_cache(Some(user_id), Some(plugin_name));
        self.registry.unload(user_id, plugin_name).await;
    }

    async fn ensure_session(&self, user_id: &str, plugin_name: &str) -> Result<SessionHandle> {
        let key = SessionKey::new(user_id, plugin_name);
        let config = self.plugin_configs.get(&key).map(|c| c.value().clone());
        match config {
            Some(config) => self.registry.get_or_reconnect(&config).await,
            None => self
                .registry
                .peek(user_id, plugin_name)
                .await
                .ok_or_else(|| Error::session_unavailable(&key)),
        }
    }

    // =========================================================================
    // Tool listing
    // =========================================================================

    /// Plugin-qualified tools across every enabled plugin of `user_id`.
    ///
    /// Plugins are resolved concurrently; one plugin failing is logged and
    /// skipped. Output keeps the order of `configs`.
    pub async fn get_user_tools(&self, user_id: &str, configs: &[PluginConfig]) -> Vec<ToolDefinition> {
        let enabled: Vec<&PluginConfig> = configs
            .iter()
            .filter(|c| c.enabled && c.user_id == user_id)
            .collect();

        let per_plugin = join_all(enabled.iter().map(|config| async move {
            self.register_plugin((*config).clone());
            let key = SessionKey::new(user_id, &config.plugin_name);
            let tools = match self.registry.get_or_reconnect(config).await {
                Ok(_) => match self.cached_tools(&key) {
                    Some(tools) => Ok(tools),
                    None => self.fetch_tools(key).await,
                },
                Err(e) => Err(e),
            };
            (*config, tools)
        }))
        .await;

        let mut all = Vec::new();
        for (config, tools) in per_plugin {
            match tools {
                Ok(tools) => all.extend(tools.iter().map(|tool| ToolDefinition {
                    name: qualified_tool_name(&config.plugin_name, &tool.name),
                    ..tool.clone()
                })),
                Err(e) => tracing::warn!(
                    "plugin_tools_skipped: user={}, plugin={}, error={}",
                    user_id,
                    config.plugin_name,
                    e
                ),
            }
        }
        all
    }

    /// Tool list for one plugin, from cache when unexpired.
    pub async fn get_plugin_tools_cached(
        &self,
        user_id: &str,
        plugin_name: &str,
    ) -> Result<Arc<Vec<ToolDefinition>>> {
        let key = SessionKey::new(user_id, plugin_name);
        if let Some(tools) = self.cached_tools(&key) {
            return Ok(tools);
        }
        self.ensure_session(user_id, plugin_name).await?;
        self.fetch_tools(key).await
    }

    fn cached_tools(&self, key: &SessionKey) -> Option<Arc<Vec<ToolDefinition>>> {
        let tools = self.cache.get(key)?;
        tracing::debug!("tool_cache_hit: key={}, tools={}", key, tools.len());
        Some(tools)
    }

    /// Caller has already ensured the session.
    async fn fetch_tools(&self, key: SessionKey) -> Result<Arc<Vec<ToolDefinition>>> {
        let tools = self
            .registry
            .list_tools(&key.user_id, &key.plugin_name)
            .await?;
        tracing::debug!("tool_cache_refreshed: key={}, tools={}", key, tools.len());
        Ok(self.cache.insert(key, tools))
    }

    // =========================================================================
    // Tool execution
    // =========================================================================

    /// Call one tool with timeout, retry and backoff.
    ///
    /// Every attempt is recorded in the metrics for `plugin.tool`.
    pub async fn call_tool_with_retry(
        &self,
        user_id: &str,
        plugin_name: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let result = self
            .config
            .retry
            .run(move |attempt| {
                let arguments = arguments.clone();
                async move {
                    let started = Instant::now();
                    let outcome = self
                        .attempt_call(user_id, plugin_name, tool, arguments, timeout)
                        .await;
                    self.metrics
                        .record(plugin_name, tool, outcome.is_ok(), started.elapsed());
                    if let Err(e) = &outcome {
                        tracing::debug!(
                            "tool_call_attempt_failed: user={}, plugin={}, tool={}, attempt={}, error={}",
                            user_id,
                            plugin_name,
                            tool,
                            attempt + 1,
                            e
                        );
                    }
                    outcome
                }
            })
            .await;

        if let Err(e) = &result {
            tracing::warn!(
                "tool_call_failed: user={}, plugin={}, tool={}, error={}",
                user_id,
                plugin_name,
                tool,
                e
            );
        }
        result
    }

    async fn attempt_call(
        &self,
        user_id: &str,
        plugin_name: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_session(user_id, plugin_name).await?;
        let call = self.registry.call_tool(user_id, plugin_name, tool, arguments);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let err = Error::timeout(plugin_name, tool, timeout.as_millis() as u64);
                self.registry
                    .record_failure(user_id, plugin_name, tool, &err)
                    .await;
                Err(err)
            }
        }
    }

    /// Run `calls` in batches of at most `max_concurrency`, pausing
    /// `batch_delay` between batches. Returns one outcome per call, in input
    /// order; a failing call never affects its siblings.
    pub async fn execute_tool_calls(
        &self,
        user_id: &str,
        calls: Vec<ToolCallRequest>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Vec<ToolCallOutcome> {
        let batch_size = max_concurrency.max(1);
        let mut outcomes = Vec::with_capacity(calls.len());

        for (index, batch) in calls.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let results = join_all(batch.iter().map(|call| async move {
                let started = Instant::now();
                let result = self
                    .call_tool_with_retry(
                        user_id,
                        &call.plugin,
                        &call.tool,
                        call.arguments.clone(),
                        timeout,
                    )
                    .await;
                ToolCallOutcome::from_result(call, result, started.elapsed())
            }))
            .await;
            outcomes.extend(results);
        }

        let failed = outcomes.iter().filter(|o| !o.success).count();
        tracing::info!(
            "tool_batch_completed: user={}, calls={}, batch_size={}, failed={}",
            user_id,
            outcomes.len(),
            batch_size,
            failed
        );
        outcomes
    }

    // =========================================================================
    // Cache administration & observability
    // =========================================================================

    /// Drop cached tool lists by filter (`None` matches all).
    pub fn clear_cache(&self, user_id: Option<&str>, plugin_name: Option<&str>) -> usize {
        let removed = self.cache.clear(user_id, plugin_name);
        tracing::debug!(
            "tool_cache_cleared: user={:?}, plugin={:?}, removed={}",
            user_id,
            plugin_name,
            removed
        );
        removed
    }

    pub fn metrics_snapshot(&self) -> Vec<ToolMetricsReport> {
        self.metrics.snapshot()
    }

    pub fn tool_metrics(&self, plugin_name: &str, tool: &str) -> Option<ToolMetricsReport> {
        self.metrics.get(plugin_name, tool)
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    pub async fn sessions_info(&self, persisted: &[PluginConfig]) -> Vec<SessionInfo> {
        self.registry.sessions_info(persisted).await
    }
}

// =============================================================================
// Tests
// =============================================================================
