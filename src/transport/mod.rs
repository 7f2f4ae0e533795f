//! Transport client seam.
//!
//! The wire protocol that talks to a remote plugin lives outside this crate.
//! The registry consumes it only through [`TransportClient`] and creates
//! clients through a [`TransportFactory`].

pub mod reconnect;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::types::{Error, PluginConfig, Result};

pub use reconnect::ReconnectingTransport;

/// A tool advertised by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_schema(),
        }
    }
}

/// Result of probing a plugin endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub latency_ms: u64,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTest {
    pub fn failed(latency_ms: u64, error: &Error) -> Self {
        Self {
            ok: false,
            latency_ms,
            tool_count: 0,
            error: Some(error.to_string()),
        }
    }
}

/// One live connection to a remote plugin.
///
/// Implementations use interior mutability: a session's client is shared by
/// every in-flight call on that session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        Err(Error::unsupported(format!("read_resource({uri})")))
    }

    async fn test_connection(&self) -> ConnectionTest {
        let started = Instant::now();
        match self.list_tools().await {
            Ok(tools) => ConnectionTest {
                ok: true,
                latency_ms: started.elapsed().as_millis() as u64,
                tool_count: tools.len(),
                error: None,
            },
            Err(e) => ConnectionTest::failed(started.elapsed().as_millis() as u64, &e),
        }
    }

    async fn close(&self) -> Result<()>;
}

/// Builds an unconnected client for a plugin config.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn TransportClient>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&PluginConfig) -> Result<Arc<dyn TransportClient>> + Send + Sync,
{
    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn TransportClient>> {
        self(config)
    }
}
