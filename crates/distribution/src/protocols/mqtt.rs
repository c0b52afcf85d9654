//! MQTT distributor
//!
//! Publishes the bare JSON payload to a fixed topic through `rumqttc`. The
//! client's event loop runs on a background task that also tracks broker
//! connectivity for the health probe; rumqttc reconnects on its own, so the
//! probe only reports state.

use crate::distributor::{DistributionEvent, Distributor};
use crate::manager::DistributorFactory;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use sensefuse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// MQTT distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Publish topic
    pub topic: String,

    /// Client identifier; generated when absent
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,

    /// Quality of service level (0, 1, or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Keep-alive interval, seconds
    #[serde(default = "default_keep_alive_secs", alias = "keepAliveSecs")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn qos_from(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Config(format!("invalid mqtt qos {other}, expected 0..=2"))),
    }
}

pub struct MqttDistributor {
    name: String,
    client: AsyncClient,
    topic: String,
    qos: QoS,
    connected: Arc<AtomicBool>,
    eventloop_task: JoinHandle<()>,
}

#[async_trait::async_trait]
impl Distributor for MqttDistributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "mqtt"
    }

    async fn send(&self, event: &DistributionEvent) -> Result<()> {
        let body = serde_json::to_vec(&event.payload)?;
        self.client
            .publish(self.topic.as_str(), self.qos, false, body)
            .await
            .map_err(|e| Error::send_failed(&self.name, e.to_string()))
    }

    async fn health_check(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::send_failed(&self.name, "broker disconnected"))
        }
    }

    async fn close(&self) -> Result<()> {
        // Best effort: the event loop may already be gone.
        let _ = self.client.disconnect().await;
        self.eventloop_task.abort();
        Ok(())
    }
}

pub struct MqttFactory;

#[async_trait::async_trait]
impl DistributorFactory for MqttFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Distributor>> {
        let config: MqttConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("mqtt distributor '{name}': {e}")))?;
        let qos = qos_from(config.qos)?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("sensefuse-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let task_name = name.to_string();
        let eventloop_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(distributor = %task_name, "mqtt broker connected");
                        flag.store(true, Ordering::Release);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::AcqRel) {
                            tracing::warn!(distributor = %task_name, error = %e, "mqtt broker connection lost");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Box::new(MqttDistributor {
            name: name.to_string(),
            client,
            topic: config.topic,
            qos,
            connected,
            eventloop_task,
        }))
    }
}
