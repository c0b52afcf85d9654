//! Built-in protocol distributors
//!
//! Each module pairs a serde config struct with a [`Distributor`] impl and a
//! factory registered by `DistributionManager::with_builtins`. Wire framing
//! is each protocol's internal concern: WebSocket and SSE carry JSON text,
//! UDP carries length-prefixed or raw JSON datagrams, MQTT publishes the
//! bare payload per topic, HTTP posts JSON bodies.
//!
//! [`Distributor`]: crate::distributor::Distributor

pub mod http;
pub mod mqtt;
pub mod sse;
pub mod udp;
pub mod websocket;
