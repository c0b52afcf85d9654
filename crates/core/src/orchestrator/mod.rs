//! Strategy-driven analysis orchestrator
//!
//! Composes the pipeline registry, a ranking strategy, and per-pipeline
//! circuit breakers to answer analysis requests. `process` always returns a
//! discriminated [`AnalysisResult`]; pipeline failures are converted at this
//! boundary and never propagated as `Err` to callers.

pub mod breaker;
pub mod stats;
pub mod strategy;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitState};
pub use stats::{RuntimeStats, StatsSnapshot};
pub use strategy::{Candidate, QualityRequirements, StrategyKind};

use crate::pipeline::{PipelineFactory, PipelineMetadata, PipelineRegistry};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One analysis request against the orchestrator
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisRequest {
    /// Capabilities the answering pipeline must provide
    pub capabilities: Vec<String>,

    /// Sensor frame to analyze (single-modal payload or a synchronized frame)
    pub frame: Value,

    /// Latency budget and partial-result tolerance
    #[serde(default)]
    pub requirements: QualityRequirements,

    /// Strategy override for this request
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
}

impl AnalysisRequest {
    /// A request for the given capabilities over `frame`, default requirements
    pub fn new(capabilities: Vec<String>, frame: Value) -> Self {
        Self {
            capabilities,
            frame,
            requirements: QualityRequirements::default(),
            strategy: None,
        }
    }
}

/// Discriminated outcome of `Orchestrator::process`
///
/// Exactly one variant per call; the orchestrator never returns `Err`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnalysisResult {
    /// A pipeline produced a complete result
    Success {
        /// Pipeline that answered
        pipeline: String,
        /// Analysis payload
        data: Value,
        /// Observed processing latency, milliseconds
        latency_ms: u64,
    },
    /// A pipeline produced a partial result within the request's tolerance
    Partial {
        /// Pipeline that answered
        pipeline: String,
        /// Analysis payload
        data: Value,
        /// Expected output fields that are absent
        missing: Vec<String>,
        /// Observed processing latency, milliseconds
        latency_ms: u64,
    },
    /// Every candidate was skipped or failed
    Failed {
        /// Aggregated description of the last observed errors
        error: String,
    },
    /// Every attempted candidate exceeded the latency budget
    Timeout {
        /// Aggregated description of the timeouts
        error: String,
    },
    /// No registered pipeline provides the requested capabilities
    Unsupported {
        /// Description of the unmatched capabilities
        error: String,
    },
}

/// Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Strategy used when a request carries no override
    #[serde(default, alias = "defaultStrategy")]
    pub default_strategy: StrategyKind,

    /// Shared circuit-breaker tuning
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Rolling-window size for runtime statistics
    #[serde(default = "default_stats_window", alias = "statsWindow")]
    pub stats_window: usize,
}

fn default_stats_window() -> usize {
    50
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::default(),
            breaker: BreakerConfig::default(),
            stats_window: default_stats_window(),
        }
    }
}

/// Per-pipeline entry in a [`SystemStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Registered name
    pub name: String,
    /// Whether a live instance exists
    pub instantiated: bool,
    /// Breaker state
    pub breaker: BreakerSnapshot,
    /// Rolling runtime statistics
    pub stats: StatsSnapshot,
}

/// Snapshot of the orchestrator's registry, breakers, and statistics
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Number of registered pipelines
    pub registered: usize,
    /// Default strategy in effect
    pub default_strategy: StrategyKind,
    /// Per-pipeline state
    pub pipelines: Vec<PipelineStatus>,
}

/// Strategy-driven orchestrator over the pipeline registry
pub struct Orchestrator {
    registry: Arc<PipelineRegistry>,
    breakers: BreakerRegistry,
    stats: RuntimeStats,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh registry and default config
    pub fn new() -> Self {
        Self::with_config(Arc::new(PipelineRegistry::new()), OrchestratorConfig::default())
    }

    /// Create an orchestrator over an existing registry
    pub fn with_config(registry: Arc<PipelineRegistry>, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            breakers: BreakerRegistry::new(config.breaker),
            stats: RuntimeStats::with_window(config.stats_window),
            config,
        }
    }

    /// The underlying pipeline registry
    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    /// Rolling runtime statistics (read-only strategy input)
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Register a pipeline factory (convenience passthrough)
    pub fn register_pipeline(
        &self,
        name: &str,
        factory: Arc<dyn PipelineFactory>,
        metadata: PipelineMetadata,
    ) -> Result<()> {
        self.registry.register(name, factory, metadata, false)
    }

    /// Answer one analysis request
    ///
    /// Resolves capability-matched candidates, ranks them with the selected
    /// strategy, and iterates in rank order: open breakers are skipped, each
    /// attempt runs under the remaining latency budget, and the first
    /// complete result (or partial within tolerance) wins.
    pub async fn process(&self, request: &AnalysisRequest) -> AnalysisResult {
        let candidate_names = self.registry.find_by_capabilities(&request.capabilities);
        if candidate_names.is_empty() {
            return AnalysisResult::Unsupported {
                error: format!(
                    "no registered pipeline provides {:?}",
                    request.capabilities
                ),
            };
        }

        let candidates: Vec<Candidate> = candidate_names
            .iter()
            .filter_map(|name| {
                self.registry.metadata(name).map(|m| Candidate {
                    name: name.clone(),
                    profile: m.profile,
                })
            })
            .collect();

        let kind = request.strategy.unwrap_or(self.config.default_strategy);
        let ranked = strategy::rank(kind, candidates, &request.requirements, &self.stats);
        if ranked.is_empty() {
            return AnalysisResult::Failed {
                error: format!(
                    "no candidate satisfies the {}ms latency budget",
                    request.requirements.latency_budget_ms
                ),
            };
        }

        let budget = Duration::from_millis(request.requirements.latency_budget_ms);
        let deadline = Instant::now() + budget;
        let mut errors: Vec<String> = Vec::new();
        let mut attempted = 0usize;
        let mut attempt_timeouts = 0usize;

        for candidate in &ranked {
            let name = candidate.name.as_str();
            if self.breakers.is_open(name) {
                tracing::debug!(pipeline = name, "skipping open circuit");
                errors.push(format!("{name}: circuit open"));
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // A skip, not an attempt: it must not sway the
                // timeout-versus-failure classification below.
                errors.push(format!("{name}: latency budget exhausted"));
                break;
            }

            let pipeline = match self.registry.get_or_create(name, &Value::Null) {
                Ok(p) => p,
                Err(e) => {
                    self.breakers.record_failure(name);
                    errors.push(format!("{name}: instantiation failed: {e}"));
                    continue;
                }
            };

            attempted += 1;
            let started = Instant::now();
            let frame = &request.frame;
            let outcome = self
                .breakers
                .execute(name, || async {
                    tokio::time::timeout(remaining, pipeline.process(frame))
                        .await
                        .map_err(|_| {
                            Error::timeout(remaining.as_millis() as u64, format!("pipeline {name}"))
                        })?
                })
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(output) => {
                    self.stats.record(name, true, latency_ms);
                    if !output.is_partial() {
                        return AnalysisResult::Success {
                            pipeline: name.to_string(),
                            data: output.data,
                            latency_ms,
                        };
                    }
                    let completeness = output.effective_completeness();
                    if completeness >= request.requirements.min_completeness {
                        return AnalysisResult::Partial {
                            pipeline: name.to_string(),
                            data: output.data,
                            missing: output.missing,
                            latency_ms,
                        };
                    }
                    errors.push(format!(
                        "{name}: partial result below tolerance ({completeness:.2} < {:.2})",
                        request.requirements.min_completeness
                    ));
                }
                Err(Error::CircuitOpen { .. }) => {
                    // Lost a probe race after the earlier check; treated as a skip.
                    attempted -= 1;
                    errors.push(format!("{name}: circuit open"));
                }
                Err(e @ Error::Timeout { .. }) => {
                    attempt_timeouts += 1;
                    self.stats.record(name, false, latency_ms);
                    tracing::warn!(pipeline = name, error = %e, "pipeline timed out");
                    errors.push(format!("{name}: {e}"));
                }
                Err(e) => {
                    self.stats.record(name, false, latency_ms);
                    tracing::warn!(pipeline = name, error = %e, "pipeline failed");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        let aggregated = if errors.is_empty() {
            "no candidate produced a result".to_string()
        } else {
            errors.join("; ")
        };
        if attempted > 0 && attempt_timeouts == attempted {
            AnalysisResult::Timeout { error: aggregated }
        } else {
            AnalysisResult::Failed { error: aggregated }
        }
    }

    /// Snapshot registry, breaker, and statistics state
    pub fn system_status(&self) -> SystemStatus {
        let pipelines = self
            .registry
            .list()
            .into_iter()
            .map(|name| {
                let instantiated = self
                    .registry
                    .get_info(&name)
                    .map(|i| i.instantiated)
                    .unwrap_or(false);
                PipelineStatus {
                    breaker: self.breakers.snapshot(&name),
                    stats: self.stats.snapshot(&name),
                    instantiated,
                    name,
                }
            })
            .collect();
        SystemStatus {
            registered: self.registry.len(),
            default_strategy: self.config.default_strategy,
            pipelines,
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
