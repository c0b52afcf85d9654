//! WebSocket distributor
//!
//! Outbound-only client connection carrying JSON text frames. The health
//! probe pings the peer and re-dials a lost connection; plain sends never
//! reconnect, they fail fast and leave recovery to the probe.

use crate::distributor::{DistributionEvent, Distributor};
use crate::manager::DistributorFactory;
use futures::SinkExt;
use sensefuse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Target endpoint (`ws://` or `wss://`)
    pub url: String,

    /// Dial timeout for the initial connection and probe re-dials
    #[serde(default = "default_connect_timeout_ms", alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

pub struct WebSocketDistributor {
    name: String,
    config: WebSocketConfig,
    stream: Mutex<Option<WsStream>>,
}

impl WebSocketDistributor {
    async fn dial(config: &WebSocketConfig) -> Result<WsStream> {
        let connect = connect_async(&config.url);
        let (stream, _response) =
            tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
                .await
                .map_err(|_| {
                    Error::timeout(config.connect_timeout_ms, format!("connect {}", config.url))
                })?
                .map_err(|e| Error::Config(format!("websocket connect {}: {e}", config.url)))?;
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl Distributor for WebSocketDistributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "websocket"
    }

    async fn send(&self, event: &DistributionEvent) -> Result<()> {
        let frame = serde_json::to_string(&json!({
            "event": event.event_name,
            "data": event.payload,
            "timestamp": event.timestamp,
        }))?;

        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::send_failed(&self.name, "connection lost"))?;
        if let Err(e) = stream.send(Message::Text(frame)).await {
            // Drop the broken connection; the health probe re-dials.
            *guard = None;
            return Err(Error::send_failed(&self.name, e.to_string()));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if let Some(stream) = guard.as_mut() {
            match stream.send(Message::Ping(Vec::new())).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(distributor = %self.name, error = %e, "websocket ping failed, re-dialing");
                    *guard = None;
                }
            }
        }
        *guard = Some(Self::dial(&self.config).await?);
        tracing::info!(distributor = %self.name, url = %self.config.url, "websocket reconnected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            // Best effort: the peer may already be gone.
            let _ = stream.send(Message::Close(None)).await;
        }
        Ok(())
    }
}

pub struct WebSocketFactory;

#[async_trait::async_trait]
impl DistributorFactory for WebSocketFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Distributor>> {
        let config: WebSocketConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("websocket distributor '{name}': {e}")))?;
        let stream = WebSocketDistributor::dial(&config).await?;
        Ok(Box::new(WebSocketDistributor {
            name: name.to_string(),
            config,
            stream: Mutex::new(Some(stream)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_aliases() {
        let config: WebSocketConfig = serde_json::from_value(json!({
            "url": "ws://127.0.0.1:9100/events",
            "connectTimeoutMs": 1500,
        }))
        .unwrap();
        assert_eq!(config.connect_timeout_ms, 1_500);

        let config: WebSocketConfig =
            serde_json::from_value(json!({"url": "ws://localhost/ws"})).unwrap();
        assert_eq!(config.connect_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn create_rejects_invalid_config() {
        let err = WebSocketFactory
            .create("ws-main", &json!({"connectTimeoutMs": 10}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
