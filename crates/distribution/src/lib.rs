//! SenseFuse distribution: session-scoped multi-protocol event fan-out
//!
//! Analysis results leave the system through sessions: each session owns a
//! set of live distributors (WebSocket, UDP, MQTT, SSE, HTTP, or custom
//! registered kinds) and an event-routing table mapping routing keys to
//! distributor names. Channels are failure-isolated: one distributor's
//! trouble never blocks its siblings, and degraded channels are suppressed
//! by health-probe breakers until a probe succeeds.
//!
//! - [`distributor`] — the `Distributor` contract, events, delivery reports
//! - [`manager`] — factory registry mapping protocol kinds to constructors
//! - [`protocols`] — the built-in protocol distributors
//! - [`session`] — session lifecycle, routing, hot reconfiguration

pub mod distributor;
pub mod manager;
pub mod protocols;
pub mod session;

pub use distributor::{DeliveryOutcome, DeliveryReport, DistributionEvent, Distributor};
pub use manager::{DistributionManager, DistributorFactory};
pub use session::{
    EndSessionOutcome, SessionConfig, SessionManager, SessionManagerConfig, SessionStatus,
};
