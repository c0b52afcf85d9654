//! Pipeline contract and registry
//!
//! A pipeline is a pluggable, capability-tagged analysis unit (face landmarks,
//! gaze vectors, speech transcription, ...) processing one frame of sensor
//! data. Implementations live outside this crate; the core only sees the
//! `Pipeline` trait and the factory that constructs instances on demand.

pub mod registry;

pub use registry::{PipelineInfo, PipelineRegistry, SearchHit};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A single analysis unit processing one frame of sensor data
///
/// `process` may suspend on model inference or I/O. Failures are returned as
/// `Err` and converted into a discriminated `AnalysisResult` at the
/// orchestrator boundary; they are never propagated to orchestrator callers.
#[async_trait::async_trait]
pub trait Pipeline: Send + Sync {
    /// Unique pipeline name (matches its registry entry)
    fn name(&self) -> &str;

    /// Capabilities this pipeline provides (e.g. "gaze", "emotion")
    fn capabilities(&self) -> &[String];

    /// Process one frame of sensor data
    async fn process(&self, frame: &Value) -> Result<PipelineOutput>;

    /// Release any resources held by this instance
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory constructing pipeline instances from a JSON config
///
/// Registered in the `PipelineRegistry`; instances are created lazily on the
/// first `get_or_create` and cached for the lifetime of the registration.
pub trait PipelineFactory: Send + Sync {
    /// Construct a new pipeline instance
    fn create(&self, config: &Value) -> Result<Arc<dyn Pipeline>>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&Value) -> Result<Arc<dyn Pipeline>> + Send + Sync,
{
    fn create(&self, config: &Value) -> Result<Arc<dyn Pipeline>> {
        self(config)
    }
}

/// Static performance profile used by ranking strategies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    /// Expected result accuracy in [0,1]
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,

    /// Expected processing latency in milliseconds
    #[serde(default = "default_latency_ms", alias = "expectedLatencyMs")]
    pub expected_latency_ms: u64,

    /// Relative resource cost in [0,1] (CPU/GPU/memory blend)
    #[serde(default = "default_resource_cost", alias = "resourceCost")]
    pub resource_cost: f64,
}

fn default_accuracy() -> f64 {
    0.5
}

fn default_latency_ms() -> u64 {
    100
}

fn default_resource_cost() -> f64 {
    0.5
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self {
            accuracy: default_accuracy(),
            expected_latency_ms: default_latency_ms(),
            resource_cost: default_resource_cost(),
        }
    }
}

/// Immutable metadata attached to a registered pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineMetadata {
    /// Broad category (e.g. "vision", "audio")
    #[serde(default)]
    pub category: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Capabilities provided (e.g. "face-landmarks", "gaze")
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Free-form tags for discovery
    #[serde(default)]
    pub tags: Vec<String>,

    /// Semantic version of the implementation
    #[serde(default)]
    pub version: String,

    /// Author or owning team
    #[serde(default)]
    pub author: String,

    /// Names of pipelines or external services this pipeline depends on
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Static performance profile consumed by ranking strategies
    #[serde(default)]
    pub profile: PerformanceProfile,
}

impl PipelineMetadata {
    /// Whether this pipeline provides every capability in `required`
    pub fn provides_all(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities.iter().any(|c| c == cap))
    }
}

/// Output of a single pipeline invocation
///
/// An empty `missing` list means a complete result. A non-empty list marks a
/// partial result; `completeness` lets the pipeline report how much of the
/// expected output it produced (derived from `missing` when absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    /// Analysis payload
    pub data: Value,

    /// Expected output fields the pipeline could not produce
    #[serde(default)]
    pub missing: Vec<String>,

    /// Fraction of the expected output present, in [0,1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness: Option<f64>,
}

impl PipelineOutput {
    /// A complete result wrapping `data`
    pub fn complete(data: Value) -> Self {
        Self {
            data,
            missing: Vec::new(),
            completeness: None,
        }
    }

    /// A partial result with the named fields missing
    pub fn partial(data: Value, missing: Vec<String>) -> Self {
        Self {
            data,
            missing,
            completeness: None,
        }
    }

    /// Effective completeness in [0,1]
    pub fn effective_completeness(&self) -> f64 {
        if let Some(c) = self.completeness {
            return c.clamp(0.0, 1.0);
        }
        if self.missing.is_empty() {
            return 1.0;
        }
        let present = self
            .data
            .as_object()
            .map(|o| o.len())
            .unwrap_or(1)
            .max(1);
        present as f64 / (present + self.missing.len()) as f64
    }

    /// Whether this output is partial
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty() || self.completeness.map(|c| c < 1.0).unwrap_or(false)
    }
}

/// Validate a pipeline name for registration
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("pipeline name must not be empty".into()));
    }
    Ok(())
}
