//! In-memory plugin fakes shared by the unit tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{ToolDefinition, TransportClient, TransportFactory};
use crate::types::{Error, PluginConfig, RegistryConfig, Result, TransportKind};

/// Registry config whose background sweeps never fire during a test.
pub(crate) fn test_registry_config() -> RegistryConfig {
    RegistryConfig {
        max_sessions: 10,
        session_ttl: Duration::from_secs(600),
        sweep_interval: Duration::from_secs(24 * 3600),
        health_check_interval: Duration::from_secs(24 * 3600),
        expiry_warning: Duration::from_secs(120),
        ..Default::default()
    }
}

pub(crate) fn plugin_config(user: &str, plugin: &str) -> PluginConfig {
    PluginConfig::new(
        user,
        plugin,
        format!("https://{plugin}.plugins.local/mcp"),
        TransportKind::StreamableHttp,
    )
}

/// Shared behaviour and counters for every client created for one plugin name.
#[derive(Debug, Default)]
pub(crate) struct FakePlugin {
    connects: AtomicUsize,
    closes: AtomicUsize,
    lists: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    failing_tools: Mutex<HashSet<String>>,
    slow_tools: Mutex<HashMap<String, Duration>>,
    script: Mutex<VecDeque<Result<Value>>>,
}

impl FakePlugin {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// `connect` takes `delay` before answering.
    pub fn slow_connect(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Every call to `tool` fails with a tool error.
    pub fn fail_tool(&self, tool: &str) {
        self.failing_tools.lock().unwrap().insert(tool.to_string());
    }

    /// Calls to `tool` take `delay` before answering.
    pub fn slow_tool(&self, tool: &str, delay: Duration) {
        self.slow_tools.lock().unwrap().insert(tool.to_string(), delay);
    }

    /// Queue outcomes returned (in order) by the next calls, ahead of the
    /// default behaviour.
    pub fn script(&self, outcomes: Vec<Result<Value>>) {
        self.script.lock().unwrap().extend(outcomes);
    }
}

#[derive(Debug)]
pub(crate) struct FakeTransport {
    name: String,
    plugin: Arc<FakePlugin>,
}

#[async_trait]
impl TransportClient for FakeTransport {
    async fn connect(&self) -> Result<()> {
        self.plugin.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.plugin.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.plugin.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} refused connection", self.name)));
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.plugin.lists.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            ToolDefinition::new("search", "Search items"),
            ToolDefinition::new("create", "Create an item"),
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let plugin = &self.plugin;
        plugin.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = plugin.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        plugin.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = plugin.slow_tools.lock().unwrap().get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = plugin.script.lock().unwrap().pop_front();
        let failing = plugin.failing_tools.lock().unwrap().contains(name);
        let result = match scripted {
            Some(outcome) => outcome,
            None if failing => Err(Error::tool(&self.name, name, "tool exploded")),
            None => Ok(json!({ "plugin": self.name, "tool": name, "arguments": arguments })),
        };
        plugin.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        Ok(json!({ "uri": uri, "plugin": self.name }))
    }

    async fn close(&self) -> Result<()> {
        self.plugin.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeTransport`]s keyed by plugin name.
#[derive(Debug, Default)]
pub(crate) struct FakeFactory {
    plugins: DashMap<String, Arc<FakePlugin>>,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plugin(&self, name: &str) -> Arc<FakePlugin> {
        self.plugins.entry(name.to_string()).or_default().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn TransportClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            name: config.plugin_name.clone(),
            plugin: self.plugin(&config.plugin_name),
        }))
    }
}
