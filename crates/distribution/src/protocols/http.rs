//! HTTP distributor
//!
//! Posts the JSON payload to a fixed endpoint with optional static headers.
//! The routing key travels in an `x-sensefuse-event` header so the body
//! stays the bare payload. The health probe issues a HEAD request and only
//! fails on transport errors, not status codes.

use crate::distributor::{DistributionEvent, Distributor};
use crate::manager::DistributorFactory;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sensefuse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const EVENT_HEADER: &str = "x-sensefuse-event";

/// HTTP distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Target endpoint
    pub url: String,

    /// Static headers attached to every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

pub struct HttpDistributor {
    name: String,
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

#[async_trait::async_trait]
impl Distributor for HttpDistributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "http"
    }

    async fn send(&self, event: &DistributionEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(EVENT_HEADER, &event.event_name)
            .json(&event.payload)
            .send()
            .await
            .map_err(|e| Error::send_failed(&self.name, e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| Error::send_failed(&self.name, e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        // Any response means the endpoint is reachable; a 405 on HEAD is
        // still a live server.
        self.client
            .head(&self.url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Error::send_failed(&self.name, e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct HttpFactory;

#[async_trait::async_trait]
impl DistributorFactory for HttpFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Distributor>> {
        let config: HttpConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("http distributor '{name}': {e}")))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let key = HeaderName::try_from(key.as_str())
                .map_err(|e| Error::Config(format!("http distributor '{name}': header '{key}': {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| Error::Config(format!("http distributor '{name}': header value: {e}")))?;
            headers.insert(key, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("http distributor '{name}': {e}")))?;

        Ok(Box::new(HttpDistributor {
            name: name.to_string(),
            client,
            url: config.url.clone(),
            headers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_validates_headers() {
        let err = HttpFactory
            .create(
                "http-hook",
                &json!({
                    "url": "http://127.0.0.1:9/hook",
                    "headers": {"bad header name": "v"},
                }),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn send_to_unreachable_endpoint_is_isolated() {
        // Port 9 (discard) is closed; the failure must be a send error,
        // never a panic or a config error.
        let distributor = HttpFactory
            .create(
                "http-hook",
                &json!({"url": "http://127.0.0.1:9/hook", "timeoutMs": 200}),
            )
            .await
            .unwrap();
        let err = distributor
            .send(&DistributionEvent::new("s-1", "gaze", json!({"x": 0.1})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DistributorSend { .. }));
    }
}
