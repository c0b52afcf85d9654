//! UDP distributor
//!
//! Fire-and-forget JSON datagrams to a fixed peer. Framing is either a
//! 4-byte big-endian length prefix (default) or the raw JSON body; payloads
//! over the datagram guard are rejected before hitting the socket.

use crate::distributor::{DistributionEvent, Distributor};
use crate::manager::DistributorFactory;
use bytes::{BufMut, BytesMut};
use sensefuse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;

/// Datagram framing variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// 4-byte big-endian payload length, then the JSON body
    LengthPrefixed,
    /// Bare JSON body
    Raw,
}

/// UDP distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Peer host
    pub host: String,

    /// Peer port
    pub port: u16,

    /// Datagram framing
    #[serde(default = "default_framing")]
    pub framing: Framing,

    /// Upper bound on the serialized payload size
    #[serde(default = "default_max_datagram_bytes", alias = "maxDatagramBytes")]
    pub max_datagram_bytes: usize,
}

fn default_framing() -> Framing {
    Framing::LengthPrefixed
}

fn default_max_datagram_bytes() -> usize {
    60_000
}

pub struct UdpDistributor {
    name: String,
    config: UdpConfig,
    socket: UdpSocket,
}

#[async_trait::async_trait]
impl Distributor for UdpDistributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "udp"
    }

    async fn send(&self, event: &DistributionEvent) -> Result<()> {
        let body = serde_json::to_vec(&event.payload)?;
        if body.len() > self.config.max_datagram_bytes {
            return Err(Error::send_failed(
                &self.name,
                format!(
                    "payload {} bytes exceeds datagram limit {}",
                    body.len(),
                    self.config.max_datagram_bytes
                ),
            ));
        }

        let datagram = match self.config.framing {
            Framing::LengthPrefixed => {
                let mut buf = BytesMut::with_capacity(4 + body.len());
                buf.put_u32(body.len() as u32);
                buf.put_slice(&body);
                buf.freeze()
            }
            Framing::Raw => body.into(),
        };
        self.socket
            .send(&datagram)
            .await
            .map_err(|e| Error::send_failed(&self.name, e.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        // Connectionless; the connected socket surfaced any resolution
        // problem at creation, so there is nothing to probe.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct UdpFactory;

#[async_trait::async_trait]
impl DistributorFactory for UdpFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Distributor>> {
        let config: UdpConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("udp distributor '{name}': {e}")))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "udp distributor '{name}': cannot reach {}:{}: {e}",
                    config.host, config.port
                ))
            })?;
        Ok(Box::new(UdpDistributor {
            name: name.to_string(),
            config,
            socket,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn distributor_to(port: u16, framing: Framing) -> UdpDistributor {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(("127.0.0.1", port)).await.unwrap();
        UdpDistributor {
            name: "udp-lab".to_string(),
            config: UdpConfig {
                host: "127.0.0.1".to_string(),
                port,
                framing,
                max_datagram_bytes: default_max_datagram_bytes(),
            },
            socket,
        }
    }

    #[tokio::test]
    async fn length_prefixed_framing_on_the_wire() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let distributor = distributor_to(port, Framing::LengthPrefixed).await;

        let event = DistributionEvent::new("s-1", "gaze", json!({"x": 0.1}));
        distributor.send(&event).await.unwrap();

        let mut buf = [0u8; 1500];
        let n = receiver.recv(&mut buf).await.unwrap();
        let body = serde_json::to_vec(&event.payload).unwrap();
        assert_eq!(n, 4 + body.len());
        assert_eq!(&buf[..4], (body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..n], &body[..]);
    }

    #[tokio::test]
    async fn raw_framing_is_bare_json() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let distributor = distributor_to(port, Framing::Raw).await;

        distributor
            .send(&DistributionEvent::new("s-1", "gaze", json!({"x": 0.1})))
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let n = receiver.recv(&mut buf).await.unwrap();
        let value: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value, json!({"x": 0.1}));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mut distributor = distributor_to(port, Framing::Raw).await;
        distributor.config.max_datagram_bytes = 16;

        let big = json!({"blob": "x".repeat(64)});
        let err = distributor
            .send(&DistributionEvent::new("s-1", "gaze", big))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DistributorSend { .. }));
    }
}
