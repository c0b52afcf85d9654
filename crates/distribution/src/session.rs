//! Session-scoped distribution
//!
//! A session owns a set of live distributors and an event-routing table.
//! Each distributor runs behind a dedicated worker task with an ordered
//! send queue, so events sharing a routing key reach one distributor in
//! submission order; fan-out across distributors is concurrent and
//! unordered. Health-probe breakers suppress sends to degraded channels
//! until a probe succeeds again.

use crate::distributor::{DeliveryOutcome, DeliveryReport, DistributionEvent, Distributor};
use crate::manager::DistributionManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sensefuse_core::orchestrator::BreakerSnapshot;
use sensefuse_core::{BreakerConfig, BreakerRegistry, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Session configuration schema
///
/// Distributors are keyed by protocol kind; the key doubles as the
/// distributor's name in the routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session id; generated when absent
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,

    /// Distributor configs keyed by kind
    #[serde(default)]
    pub distributors: HashMap<String, Value>,

    /// Event-routing table: routing key to ordered distributor names
    #[serde(default, alias = "eventRouting")]
    pub event_routing: HashMap<String, Vec<String>>,
}

impl SessionConfig {
    /// Reject routing entries that target unconfigured distributors
    pub fn validate(&self) -> Result<()> {
        for (event, targets) in &self.event_routing {
            for target in targets {
                if !self.distributors.contains_key(target) {
                    return Err(Error::Config(format!(
                        "event '{event}' routes to unconfigured distributor '{target}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Session manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManagerConfig {
    /// Teardown drain grace period before pending sends are discarded
    #[serde(default = "default_drain_grace_ms", alias = "drainGraceMs")]
    pub drain_grace_ms: u64,

    /// Health-probe period per distributor
    #[serde(default = "default_probe_interval_ms", alias = "probeIntervalMs")]
    pub probe_interval_ms: u64,

    /// Health-probe breaker tuning
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_drain_grace_ms() -> u64 {
    2_000
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: default_drain_grace_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Result of `end_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndSessionOutcome {
    /// The session was live and has been torn down
    Ended,
    /// The session had already been torn down
    AlreadyEnded,
}

/// Most recent health-probe result for one distributor
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// When the probe ran
    pub at: DateTime<Utc>,
    /// Whether it succeeded
    pub healthy: bool,
}

/// Per-distributor view in a [`SessionStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct DistributorStatus {
    /// Name within the session
    pub name: String,
    /// Protocol kind
    pub kind: String,
    /// Events delivered
    pub sent: u64,
    /// Send attempts that failed
    pub failed: u64,
    /// Events suppressed while degraded
    pub suppressed: u64,
    /// Health-probe breaker state
    pub breaker: BreakerSnapshot,
    /// Most recent completed health probe
    pub last_health_check: Option<HealthCheck>,
}

/// Snapshot of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Session id
    pub session_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Whether the session has been torn down
    pub ended: bool,
    /// Per-distributor state
    pub distributors: Vec<DistributorStatus>,
    /// Routing table in effect
    pub event_routing: HashMap<String, Vec<String>>,
    /// Events that matched no routing entry
    pub unrouted_events: u64,
}

struct ChannelStats {
    sent: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
    last_health: parking_lot::Mutex<Option<HealthCheck>>,
}

impl ChannelStats {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            last_health: parking_lot::Mutex::new(None),
        }
    }
}

enum ChannelCommand {
    Send {
        event: DistributionEvent,
        reply: oneshot::Sender<DeliveryOutcome>,
    },
    Probe,
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// One live distributor behind its worker task
struct Channel {
    kind: String,
    tx: mpsc::UnboundedSender<ChannelCommand>,
    stats: Arc<ChannelStats>,
    worker: JoinHandle<()>,
    probe: JoinHandle<()>,
}

struct SessionState {
    config: SessionConfig,
    channels: HashMap<String, Channel>,
    breakers: Arc<BreakerRegistry>,
    created_at: DateTime<Utc>,
    ended: bool,
    unrouted: u64,
}

struct SessionHandle {
    ended: AtomicBool,
    state: Mutex<SessionState>,
}

/// Registry of live distribution sessions
pub struct SessionManager {
    manager: Arc<DistributionManager>,
    config: SessionManagerConfig,
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionManager {
    /// A session manager over the given factory registry
    pub fn new(manager: Arc<DistributionManager>, config: SessionManagerConfig) -> Self {
        Self {
            manager,
            config,
            sessions: DashMap::new(),
        }
    }

    /// A session manager with built-in protocol factories and defaults
    pub fn with_builtins() -> Self {
        Self::new(
            Arc::new(DistributionManager::with_builtins()),
            SessionManagerConfig::default(),
        )
    }

    /// The underlying factory registry
    pub fn distribution_manager(&self) -> &Arc<DistributionManager> {
        &self.manager
    }

    /// Create a session: all-or-nothing distributor construction
    ///
    /// Any construction failure closes the distributors built so far and
    /// leaves no partial session behind. Returns the session id.
    pub async fn create_session(&self, config: SessionConfig) -> Result<String> {
        config.validate()?;
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = self.sessions.get(&session_id) {
            if !existing.ended.load(Ordering::Acquire) {
                return Err(Error::DuplicateName(format!("session '{session_id}'")));
            }
        }

        // Deterministic construction order keeps failures reproducible.
        let mut names: Vec<&String> = config.distributors.keys().collect();
        names.sort();

        let mut built: Vec<Box<dyn Distributor>> = Vec::with_capacity(names.len());
        for name in names {
            let dist_config = &config.distributors[name];
            match self.manager.create(name, name, dist_config).await {
                Ok(distributor) => built.push(distributor),
                Err(e) => {
                    tracing::warn!(
                        session = %session_id,
                        distributor = %name,
                        error = %e,
                        "session creation aborted, closing partial distributors"
                    );
                    for d in built {
                        if let Err(close_err) = d.close().await {
                            tracing::debug!(error = %close_err, "close during rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let breakers = Arc::new(BreakerRegistry::new(self.config.breaker));
        let mut channels = HashMap::new();
        for distributor in built {
            let name = distributor.name().to_string();
            let channel = self.spawn_channel(&session_id, distributor, breakers.clone());
            channels.insert(name, channel);
        }

        let handle = Arc::new(SessionHandle {
            ended: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                config: SessionConfig {
                    session_id: Some(session_id.clone()),
                    ..config
                },
                channels,
                breakers,
                created_at: Utc::now(),
                ended: false,
                unrouted: 0,
            }),
        });

        // An ended tombstone under the same id is replaced.
        self.sessions.insert(session_id.clone(), handle);
        tracing::info!(session = %session_id, "session created");
        Ok(session_id)
    }

    /// Route one event per the session's routing table
    ///
    /// Targets receive the event concurrently; a failure on one channel
    /// never blocks or fails siblings. Unrouted events are dropped with a
    /// log line and counted.
    pub async fn route_event(
        &self,
        session_id: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<DeliveryReport> {
        let handle = self.live_handle(session_id)?;
        let event = DistributionEvent::new(session_id, event_name, payload);

        // Enqueue under the session lock so concurrent callers keep a total
        // submission order per channel; replies are awaited lock-free.
        let pending: Vec<(String, oneshot::Receiver<DeliveryOutcome>)> = {
            let mut state = handle.state.lock().await;
            let Some(targets) = state.config.event_routing.get(event_name).cloned() else {
                state.unrouted += 1;
                tracing::debug!(session = %session_id, event = %event_name, "event matched no route, dropped");
                return Ok(DeliveryReport::empty(event_name));
            };

            targets
                .iter()
                .map(|target| {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    let accepted = state
                        .channels
                        .get(target)
                        .map(|channel| {
                            channel
                                .tx
                                .send(ChannelCommand::Send {
                                    event: event.clone(),
                                    reply: reply_tx,
                                })
                                .is_ok()
                        })
                        .unwrap_or(false);
                    if !accepted {
                        // Dropping reply_tx surfaces as Dropped below.
                        tracing::warn!(session = %session_id, distributor = %target, "send queue unavailable");
                    }
                    (target.clone(), reply_rx)
                })
                .collect()
        };

        let mut report = DeliveryReport::empty(event_name);
        for (name, reply_rx) in pending {
            let outcome = reply_rx.await.unwrap_or(DeliveryOutcome::Dropped);
            report.outcomes.insert(name, outcome);
        }
        Ok(report)
    }

    /// Reconcile a session against a new configuration
    ///
    /// Newly added distributors are started, removed ones closed, changed
    /// ones recreated; untouched distributors keep their live connection
    /// and queue. New distributors are built before anything is torn down,
    /// so a construction failure leaves the session unchanged.
    pub async fn update_session(&self, session_id: &str, new_config: SessionConfig) -> Result<()> {
        new_config.validate()?;
        let handle = self.live_handle(session_id)?;
        let mut state = handle.state.lock().await;

        let mut added_or_changed: Vec<String> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        for (name, dist_config) in &new_config.distributors {
            match state.config.distributors.get(name) {
                None => added_or_changed.push(name.clone()),
                Some(previous) if previous != dist_config => added_or_changed.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in state.config.distributors.keys() {
            if !new_config.distributors.contains_key(name) {
                removed.push(name.clone());
            }
        }
        added_or_changed.sort();
        removed.sort();

        let mut built: Vec<Box<dyn Distributor>> = Vec::new();
        for name in &added_or_changed {
            match self.manager.create(name, name, &new_config.distributors[name]).await {
                Ok(distributor) => built.push(distributor),
                Err(e) => {
                    for d in built {
                        if let Err(close_err) = d.close().await {
                            tracing::debug!(error = %close_err, "close during rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        // Tear down removed and replaced channels, then install the new ones.
        let grace = Duration::from_millis(self.config.drain_grace_ms);
        for name in removed.iter().chain(&added_or_changed) {
            if let Some(channel) = state.channels.remove(name) {
                close_channel(session_id, name, channel, grace).await;
                state.breakers.reset(name);
            }
        }
        for distributor in built {
            let name = distributor.name().to_string();
            let breakers = state.breakers.clone();
            let channel = self.spawn_channel(session_id, distributor, breakers);
            state.channels.insert(name, channel);
        }

        tracing::info!(
            session = %session_id,
            started = added_or_changed.len(),
            closed = removed.len(),
            "session reconciled"
        );
        state.config = SessionConfig {
            session_id: Some(session_id.to_string()),
            ..new_config
        };
        Ok(())
    }

    /// Tear down a session with a bounded drain grace period; idempotent
    pub async fn end_session(&self, session_id: &str) -> Result<EndSessionOutcome> {
        let handle = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;

        let mut state = handle.state.lock().await;
        if state.ended {
            return Ok(EndSessionOutcome::AlreadyEnded);
        }

        let grace = Duration::from_millis(self.config.drain_grace_ms);
        let channels = std::mem::take(&mut state.channels);
        for (name, channel) in channels {
            close_channel(session_id, &name, channel, grace).await;
        }
        state.ended = true;
        handle.ended.store(true, Ordering::Release);
        tracing::info!(session = %session_id, "session ended");
        Ok(EndSessionOutcome::Ended)
    }

    /// Snapshot one session's distributors, counters, and routing table
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let handle = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;
        let state = handle.state.lock().await;

        let mut distributors: Vec<DistributorStatus> = state
            .channels
            .iter()
            .map(|(name, channel)| DistributorStatus {
                name: name.clone(),
                kind: channel.kind.clone(),
                sent: channel.stats.sent.load(Ordering::Relaxed),
                failed: channel.stats.failed.load(Ordering::Relaxed),
                suppressed: channel.stats.suppressed.load(Ordering::Relaxed),
                breaker: state.breakers.snapshot(name),
                last_health_check: channel.stats.last_health.lock().clone(),
            })
            .collect();
        distributors.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(SessionStatus {
            session_id: session_id.to_string(),
            created_at: state.created_at,
            ended: state.ended,
            distributors,
            event_routing: state.config.event_routing.clone(),
            unrouted_events: state.unrouted,
        })
    }

    /// Ids of live (non-ended) sessions, sorted
    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().ended.load(Ordering::Acquire))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    fn live_handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        let handle = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;
        if handle.ended.load(Ordering::Acquire) {
            return Err(Error::NotFound(format!("session '{session_id}' has ended")));
        }
        Ok(handle)
    }

    fn spawn_channel(
        &self,
        session_id: &str,
        distributor: Box<dyn Distributor>,
        breakers: Arc<BreakerRegistry>,
    ) -> Channel {
        let name = distributor.name().to_string();
        let kind = distributor.kind().to_string();
        let stats = Arc::new(ChannelStats::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_channel(
            session_id.to_string(),
            name.clone(),
            distributor,
            rx,
            stats.clone(),
            breakers,
        ));

        let probe_tx = tx.clone();
        let probe_interval = Duration::from_millis(self.config.probe_interval_ms.max(1));
        let probe = tokio::spawn(async move {
            let mut interval = tokio::time::interval(probe_interval);
            loop {
                interval.tick().await;
                if probe_tx.send(ChannelCommand::Probe).is_err() {
                    break;
                }
            }
        });

        Channel {
            kind,
            tx,
            stats,
            worker,
            probe,
        }
    }
}

/// Drain and close one channel: the close command queues behind pending
/// sends, so the grace period bounds a full drain.
async fn close_channel(session_id: &str, name: &str, channel: Channel, grace: Duration) {
    channel.probe.abort();

    let (reply_tx, reply_rx) = oneshot::channel();
    let closing = channel.tx.send(ChannelCommand::Close { reply: reply_tx }).is_ok();
    if closing {
        if tokio::time::timeout(grace, reply_rx).await.is_err() {
            tracing::warn!(
                session = %session_id,
                distributor = %name,
                "drain grace elapsed, discarding pending sends"
            );
            channel.worker.abort();
        }
    } else {
        channel.worker.abort();
    }
}

async fn run_channel(
    session_id: String,
    name: String,
    distributor: Box<dyn Distributor>,
    mut rx: mpsc::UnboundedReceiver<ChannelCommand>,
    stats: Arc<ChannelStats>,
    breakers: Arc<BreakerRegistry>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ChannelCommand::Send { event, reply } => {
                let outcome = if breakers.is_open(&name) {
                    stats.suppressed.fetch_add(1, Ordering::Relaxed);
                    DeliveryOutcome::Suppressed
                } else {
                    match distributor.send(&event).await {
                        Ok(()) => {
                            stats.sent.fetch_add(1, Ordering::Relaxed);
                            DeliveryOutcome::Delivered
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                session = %session_id,
                                distributor = %name,
                                event = %event.event_name,
                                error = %e,
                                "send failed"
                            );
                            DeliveryOutcome::Failed {
                                reason: e.to_string(),
                            }
                        }
                    }
                };
                // The router may have given up waiting; that is fine.
                let _ = reply.send(outcome);
            }
            ChannelCommand::Probe => {
                let result = breakers
                    .execute(&name, || async { distributor.health_check().await })
                    .await;
                match &result {
                    Err(Error::CircuitOpen { .. }) => {
                        // Cooldown still running, probe not performed.
                    }
                    outcome => {
                        *stats.last_health.lock() = Some(HealthCheck {
                            at: Utc::now(),
                            healthy: outcome.is_ok(),
                        });
                    }
                }
            }
            ChannelCommand::Close { reply } => {
                if let Err(e) = distributor.close().await {
                    tracing::debug!(
                        session = %session_id,
                        distributor = %name,
                        error = %e,
                        "close failed"
                    );
                }
                let _ = reply.send(());
                return;
            }
        }
    }
    // All senders gone without an explicit close.
    if let Err(e) = distributor.close().await {
        tracing::debug!(session = %session_id, distributor = %name, error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_rejects_dangling_route_targets() {
        let config: SessionConfig = serde_json::from_value(json!({
            "sessionId": "s-1",
            "distributors": {"udp": {"host": "127.0.0.1", "port": 9000}},
            "eventRouting": {"gaze": ["udp", "mqtt"]},
        }))
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn config_accepts_camel_case_schema() {
        let config: SessionConfig = serde_json::from_value(json!({
            "sessionId": "s-1",
            "distributors": {"udp": {"host": "127.0.0.1", "port": 9000}},
            "eventRouting": {"gaze": ["udp"]},
        }))
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.session_id.as_deref(), Some("s-1"));
        assert_eq!(config.event_routing["gaze"], vec!["udp"]);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let manager = SessionManager::with_builtins();
        let err = manager
            .route_event("ghost", "gaze", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = manager.end_session("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
