//! Reconnect-on-close decorator for transport clients.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use super::{ConnectionTest, ToolDefinition, TransportClient};
use crate::types::Result;

/// Default number of reconnects attempted after a "connection closed" error.
pub const DEFAULT_MAX_RECONNECTS: u32 = 2;

/// Wraps a client so that calls failing with a connection-closed error are
/// retried on a fresh connection a bounded number of times.
pub struct ReconnectingTransport<C> {
    inner: C,
    label: String,
    max_reconnects: u32,
}

impl<C: TransportClient> ReconnectingTransport<C> {
    pub fn new(inner: C, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }

    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn reconnect(&self, attempt: u32) -> Result<()> {
        tracing::warn!(
            "transport_reconnecting: plugin={}, attempt={}/{}",
            self.label,
            attempt,
            self.max_reconnects
        );
        if let Err(e) = self.inner.close().await {
            tracing::debug!("transport_close_before_reconnect_failed: plugin={}, error={}", self.label, e);
        }
        self.inner.connect().await
    }
}

impl<C> fmt::Debug for ReconnectingTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingTransport")
            .field("label", &self.label)
            .field("max_reconnects", &self.max_reconnects)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: TransportClient> TransportClient for ReconnectingTransport<C> {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let mut reconnects = 0;
        loop {
            match self.inner.list_tools().await {
                Err(e) if e.is_connection_closed() && reconnects < self.max_reconnects => {
                    reconnects += 1;
                    self.reconnect(reconnects).await?;
                }
                other => return other,
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let mut reconnects = 0;
        loop {
            match self.inner.call_tool(name, arguments.clone()).await {
                Err(e) if e.is_connection_closed() && reconnects < self.max_reconnects => {
                    reconnects += 1;
                    self.reconnect(reconnects).await?;
                }
                other => return other,
            }
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.inner.read_resource(uri).await
    }

    async fn test_connection(&self) -> ConnectionTest {
        self.inner.test_connection().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransportClient;
    use crate::types::Error;
    use mockall::Sequence;

    #[tokio::test]
    async fn test_reconnects_after_connection_closed() {
        let mut mock = MockTransportClient::new();
        let mut seq = Sequence::new();
        mock.expect_call_tool()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::connection_closed("stream ended")));
        mock.expect_close().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        mock.expect_connect().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        mock.expect_call_tool()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _| Ok(Value::String(name.to_string())));

        let transport = ReconnectingTransport::new(mock, "github");
        let value = transport
            .call_tool("search", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(value, Value::String("search".into()));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_reconnects() {
        let mut mock = MockTransportClient::new();
        mock.expect_call_tool()
            .times(3)
            .returning(|_, _| Err(Error::connection_closed("stream ended")));
        mock.expect_close().times(2).returning(|| Ok(()));
        mock.expect_connect().times(2).returning(|| Ok(()));

        let transport = ReconnectingTransport::new(mock, "github");
        let err = transport
            .call_tool("search", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_other_errors_surface_without_reconnect() {
        let mut mock = MockTransportClient::new();
        mock.expect_call_tool()
            .times(1)
            .returning(|_, _| Err(Error::tool("github", "search", "bad arguments")));
        mock.expect_connect().never();

        let transport = ReconnectingTransport::new(mock, "github").with_max_reconnects(5);
        let err = transport
            .call_tool("search", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }
}
