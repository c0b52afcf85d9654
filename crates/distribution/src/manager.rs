//! Distributor factory registry
//!
//! Protocol kinds map to factories that validate a JSON config and construct
//! a live distributor. The built-in kinds cover the shipped protocols;
//! embedders (and tests) register additional kinds at runtime.

use crate::distributor::Distributor;
use crate::protocols;
use parking_lot::RwLock;
use sensefuse_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructs distributors of one protocol kind
#[async_trait::async_trait]
pub trait DistributorFactory: Send + Sync {
    /// Validate `config` and build a live distributor named `name`
    ///
    /// Construction may perform I/O (connect, bind); a failure here aborts
    /// session creation atomically.
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Distributor>>;
}

/// Registry of distributor factories keyed by protocol kind
pub struct DistributionManager {
    factories: RwLock<HashMap<String, Arc<dyn DistributorFactory>>>,
}

impl DistributionManager {
    /// An empty registry with no kinds
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry preloaded with the built-in protocol kinds
    pub fn with_builtins() -> Self {
        let manager = Self::new();
        manager.register_factory("websocket", Arc::new(protocols::websocket::WebSocketFactory));
        manager.register_factory("udp", Arc::new(protocols::udp::UdpFactory));
        manager.register_factory("mqtt", Arc::new(protocols::mqtt::MqttFactory));
        manager.register_factory("sse", Arc::new(protocols::sse::SseFactory));
        manager.register_factory("http", Arc::new(protocols::http::HttpFactory));
        manager
    }

    /// Register (or replace) the factory for `kind`
    pub fn register_factory(&self, kind: &str, factory: Arc<dyn DistributorFactory>) {
        let replaced = self
            .factories
            .write()
            .insert(kind.to_string(), factory)
            .is_some();
        if replaced {
            tracing::info!(kind, "replaced distributor factory");
        } else {
            tracing::debug!(kind, "registered distributor factory");
        }
    }

    /// Registered protocol kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build a live distributor of `kind` named `name` from `config`
    pub async fn create(
        &self,
        kind: &str,
        name: &str,
        config: &Value,
    ) -> Result<Box<dyn Distributor>> {
        let factory = self
            .factories
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("distributor kind '{kind}'")))?;
        factory.create(name, config).await
    }
}

impl Default for DistributionManager {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let manager = DistributionManager::with_builtins();
        assert_eq!(manager.kinds(), vec!["http", "mqtt", "sse", "udp", "websocket"]);
    }

    #[tokio::test]
    async fn unknown_kind_is_not_found() {
        let manager = DistributionManager::new();
        let err = manager
            .create("carrier-pigeon", "p1", &Value::Null)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
