//! Distributor contract and delivery reporting
//!
//! A distributor owns one outbound channel (a socket, an MQTT client, an
//! embedded SSE server) exclusively; instances are never shared across
//! sessions. Send failures stay inside the channel and surface through
//! [`DeliveryReport`] entries rather than errors to the caller.

use chrono::{DateTime, Utc};
use sensefuse_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One event handed to the distribution layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionEvent {
    /// Routing key (`gaze`, `speech.partial`, ...)
    #[serde(alias = "eventName")]
    pub event_name: String,

    /// Application payload, forwarded unmodified
    pub payload: Value,

    /// Wall-clock time the event entered the distribution layer
    pub timestamp: DateTime<Utc>,

    /// Owning session
    #[serde(alias = "sessionId")]
    pub session_id: String,
}

impl DistributionEvent {
    /// A timestamped event for the given session and routing key
    pub fn new(session_id: impl Into<String>, event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            timestamp: Utc::now(),
            session_id: session_id.into(),
        }
    }
}

/// Outcome of one event on one distributor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The distributor accepted the event
    Delivered,
    /// The distributor's `send` failed; siblings are unaffected
    Failed {
        /// Channel-local failure description
        reason: String,
    },
    /// The channel is degraded (health-probe breaker open); the event was
    /// not attempted
    Suppressed,
    /// The event never reached the distributor (worker gone, queue closed)
    Dropped,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Per-distributor outcomes for one routed event
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    /// Routing key of the event
    pub event_name: String,
    /// Outcome per targeted distributor; empty when the event was unrouted
    pub outcomes: HashMap<String, DeliveryOutcome>,
}

impl DeliveryReport {
    pub fn empty(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            outcomes: HashMap::new(),
        }
    }

    /// True when at least one distributor was targeted and all delivered
    pub fn all_delivered(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(DeliveryOutcome::is_delivered)
    }

    /// True when the routing table had no entry for this event
    pub fn unrouted(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// One outbound delivery channel
///
/// `send` and `health_check` run on the channel's dedicated worker task, so
/// implementations may hold `&mut`-style interior state behind a lock without
/// contention. `close` flushes and releases the underlying transport; the
/// instance is discarded afterwards.
#[async_trait::async_trait]
pub trait Distributor: Send + Sync {
    /// Instance name within its session (the routing-table key)
    fn name(&self) -> &str;

    /// Protocol kind (`websocket`, `udp`, `mqtt`, `sse`, `http`, or a custom
    /// registered kind)
    fn kind(&self) -> &str;

    /// Deliver one event over the underlying transport
    async fn send(&self, event: &DistributionEvent) -> Result<()>;

    /// Probe the underlying transport; `Err` marks the channel unhealthy
    async fn health_check(&self) -> Result<()>;

    /// Flush and release the underlying transport
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_aggregation() {
        let mut report = DeliveryReport::empty("gaze");
        assert!(report.unrouted());
        assert!(!report.all_delivered());

        report
            .outcomes
            .insert("ws-main".to_string(), DeliveryOutcome::Delivered);
        assert!(report.all_delivered());

        report.outcomes.insert(
            "udp-lab".to_string(),
            DeliveryOutcome::Failed {
                reason: "connection refused".to_string(),
            },
        );
        assert!(!report.all_delivered());
        assert!(!report.unrouted());
    }

    #[test]
    fn event_accepts_camel_case_aliases() {
        let event: DistributionEvent = serde_json::from_value(json!({
            "eventName": "gaze",
            "payload": {"x": 0.1},
            "timestamp": "2026-08-28T12:00:00Z",
            "sessionId": "s-1",
        }))
        .unwrap();
        assert_eq!(event.event_name, "gaze");
        assert_eq!(event.session_id, "s-1");
    }
}
