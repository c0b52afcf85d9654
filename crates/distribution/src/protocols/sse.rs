//! Server-Sent Events distributor
//!
//! Runs an embedded axum server exposing one `text/event-stream` route.
//! Events fan out to subscribers through a broadcast channel; with zero
//! subscribers a send is a successful no-op, the event is simply not
//! retained.

use crate::distributor::{DistributionEvent, Distributor};
use crate::manager::DistributorFactory;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use sensefuse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// SSE distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; 0 picks an ephemeral port
    pub port: u16,

    /// Route serving the event stream
    #[serde(default = "default_path")]
    pub path: String,

    /// Broadcast buffer per subscriber; slow subscribers lose oldest events
    #[serde(default = "default_channel_capacity", alias = "channelCapacity")]
    pub channel_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_path() -> String {
    "/events".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

/// One frame on the broadcast bus, already serialized
#[derive(Debug, Clone)]
struct SseFrame {
    event: String,
    data: String,
}

pub struct SseDistributor {
    name: String,
    tx: broadcast::Sender<SseFrame>,
    local_addr: std::net::SocketAddr,
    server_task: JoinHandle<()>,
}

impl SseDistributor {
    /// Address the embedded server actually bound (resolves port 0)
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

async fn subscribe(
    State(tx): State<broadcast::Sender<SseFrame>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(tx.subscribe()).filter_map(|item| async move {
        // Lagged subscribers skip ahead rather than ending the stream.
        item.ok()
            .map(|frame| Ok(Event::default().event(frame.event).data(frame.data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait::async_trait]
impl Distributor for SseDistributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "sse"
    }

    async fn send(&self, event: &DistributionEvent) -> Result<()> {
        if self.tx.receiver_count() == 0 {
            tracing::debug!(distributor = %self.name, event = %event.event_name, "no sse subscribers");
            return Ok(());
        }
        let frame = SseFrame {
            event: event.event_name.clone(),
            data: serde_json::to_string(&event.payload)?,
        };
        // A subscriber may disconnect between the count check and the send.
        let _ = self.tx.send(frame);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        if self.server_task.is_finished() {
            Err(Error::send_failed(&self.name, "sse server task exited"))
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<()> {
        self.server_task.abort();
        Ok(())
    }
}

pub struct SseFactory;

#[async_trait::async_trait]
impl DistributorFactory for SseFactory {
    async fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Distributor>> {
        let config: SseConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("sse distributor '{name}': {e}")))?;
        if !config.path.starts_with('/') {
            return Err(Error::Config(format!(
                "sse distributor '{name}': path must start with '/'"
            )));
        }

        let (tx, _rx) = broadcast::channel(config.channel_capacity.max(1));
        let router = Router::new()
            .route(&config.path, get(subscribe))
            .with_state(tx.clone());

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(distributor = %name, %local_addr, path = %config.path, "sse server listening");

        let task_name = name.to_string();
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::warn!(distributor = %task_name, error = %e, "sse server exited");
            }
        });

        Ok(Box::new(SseDistributor {
            name: name.to_string(),
            tx,
            local_addr,
            server_task,
        }))
    }
}
