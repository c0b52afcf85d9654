//! Per-pipeline circuit breakers
//!
//! Each pipeline gets an independent failure-isolation state machine:
//! closed → open after a configurable run of consecutive failures,
//! open → half-open once the cooldown elapses, half-open → closed on a
//! successful probe or back to open (cooldown reset) on a failed one.
//! While half-open, exactly one probe is admitted, guarded by an atomic
//! compare-and-swap flag on the breaker entry.

use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls flow through
    Closed,
    /// Calls blocked until the cooldown elapses
    Open,
    /// One probe call allowed; success → closed, failure → open
    HalfOpen,
}

/// Breaker tuning shared by all pipelines in one registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold", alias = "failureThreshold")]
    pub failure_threshold: u32,

    /// Cooldown before an open circuit admits a half-open probe, milliseconds
    #[serde(default = "default_cooldown_ms", alias = "cooldownMs")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    /// Cooldown as a `Duration`
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Mutable breaker bookkeeping, guarded by the entry mutex
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// One pipeline's breaker: state machine plus the half-open probe latch
struct BreakerEntry {
    core: Mutex<BreakerCore>,
    probe_in_flight: AtomicBool,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            core: Mutex::new(BreakerCore::new()),
            probe_in_flight: AtomicBool::new(false),
        }
    }
}

/// Read-only view of one breaker's state
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Current run of consecutive failures
    pub consecutive_failures: u32,
    /// Current run of consecutive successes
    pub consecutive_successes: u32,
    /// Milliseconds since the circuit last opened, if open or half-open
    pub open_for_ms: Option<u64>,
}

/// Outcome of an admission check
enum Admission {
    /// Call may proceed; `probe` marks a half-open trial
    Allowed { probe: bool },
    /// Call rejected; cooldown remaining before the next probe window
    Rejected(Duration),
}

/// Keyed map of independent per-pipeline breakers
///
/// All mutation is scoped to a single key and applied atomically per key;
/// there is no cross-key contention and no global lock.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<BreakerEntry>>,
}

impl BreakerRegistry {
    /// Create a registry with the given shared tuning
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// The shared breaker tuning
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn entry(&self, pipeline_id: &str) -> Arc<BreakerEntry> {
        self.breakers
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(BreakerEntry::new()))
            .clone()
    }

    /// Whether calls to `pipeline_id` would currently be rejected
    ///
    /// Does not mutate state: an open circuit past its cooldown reports
    /// closed-enough here but transitions to half-open only on admission.
    pub fn is_open(&self, pipeline_id: &str) -> bool {
        let Some(entry) = self.breakers.get(pipeline_id) else {
            return false;
        };
        let core = entry.core.lock();
        match core.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => core
                .opened_at
                .map(|t| t.elapsed() < self.config.cooldown())
                .unwrap_or(true),
        }
    }

    /// Snapshot one breaker's state (closed default for unknown ids)
    pub fn snapshot(&self, pipeline_id: &str) -> BreakerSnapshot {
        let Some(entry) = self.breakers.get(pipeline_id) else {
            return BreakerSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                open_for_ms: None,
            };
        };
        let core = entry.core.lock();
        BreakerSnapshot {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            open_for_ms: core.opened_at.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Record a success: resets the failure run, closes a half-open circuit
    pub fn record_success(&self, pipeline_id: &str) {
        let entry = self.entry(pipeline_id);
        let mut core = entry.core.lock();
        core.consecutive_failures = 0;
        core.consecutive_successes += 1;
        if core.state != CircuitState::Closed {
            tracing::info!(pipeline = pipeline_id, "circuit closed after successful probe");
        }
        core.state = CircuitState::Closed;
        core.opened_at = None;
    }

    /// Record a failure: increments the run, opens at threshold, re-opens half-open
    pub fn record_failure(&self, pipeline_id: &str) {
        let entry = self.entry(pipeline_id);
        let mut core = entry.core.lock();
        core.consecutive_successes = 0;
        core.consecutive_failures += 1;
        match core.state {
            CircuitState::Closed => {
                if core.consecutive_failures >= self.config.failure_threshold {
                    core.state = CircuitState::Open;
                    core.opened_at = Some(Instant::now());
                    tracing::warn!(
                        pipeline = pipeline_id,
                        failures = core.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                core.state = CircuitState::Open;
                core.opened_at = Some(Instant::now());
                tracing::warn!(pipeline = pipeline_id, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Reset one breaker to closed
    pub fn reset(&self, pipeline_id: &str) {
        if let Some(entry) = self.breakers.get(pipeline_id) {
            let mut core = entry.core.lock();
            *core = BreakerCore::new();
            entry.probe_in_flight.store(false, Ordering::Release);
        }
    }

    /// Ids of every pipeline that has breaker state
    pub fn tracked(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    fn try_admit(&self, entry: &BreakerEntry) -> Admission {
        let mut core = entry.core.lock();
        match core.state {
            CircuitState::Closed => return Admission::Allowed { probe: false },
            CircuitState::Open => {
                let elapsed = core.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                let cooldown = self.config.cooldown();
                if elapsed < cooldown {
                    return Admission::Rejected(cooldown - elapsed);
                }
                core.state = CircuitState::HalfOpen;
                tracing::info!("circuit half-open after {:?} cooldown", cooldown);
            }
            CircuitState::HalfOpen => {}
        }
        // Half-open: exactly one probe wins the CAS, everyone else fails fast.
        drop(core);
        if entry
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Admission::Allowed { probe: true }
        } else {
            Admission::Rejected(Duration::ZERO)
        }
    }

    /// Run `op` under this pipeline's breaker
    ///
    /// Fails fast with `Error::CircuitOpen` (without invoking `op`) while the
    /// circuit is open and the cooldown has not elapsed, or while another
    /// half-open probe is in flight. Otherwise executes `op`, records the
    /// outcome, and returns the original result unchanged.
    pub async fn execute<F, Fut, T>(&self, pipeline_id: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let entry = self.entry(pipeline_id);
        let probe = match self.try_admit(&entry) {
            Admission::Allowed { probe } => probe,
            Admission::Rejected(cooldown_remaining) => {
                return Err(Error::CircuitOpen {
                    pipeline: pipeline_id.to_string(),
                    cooldown_remaining,
                })
            }
        };

        let result = op().await;

        match &result {
            Ok(_) => self.record_success(pipeline_id),
            Err(_) => self.record_failure(pipeline_id),
        }
        if probe {
            entry.probe_in_flight.store(false, Ordering::Release);
        }
        result
    }
}
