//! SenseFuse core: orchestration and synchronization for multimodal
//! sensor-analysis pipelines
//!
//! The core coordinates pluggable analysis pipelines (face, gaze, speech,
//! ...) behind three layers:
//!
//! - [`pipeline`] — the `Pipeline` contract, a factory-based registry, and
//!   capability/category/tag discovery with weighted search
//! - [`orchestrator`] — strategy-ranked selection with per-pipeline circuit
//!   breakers, per-request latency budgets, and rolling runtime statistics
//! - [`sync`] — a multi-stream temporal synchronizer aligning independently
//!   clocked sample streams into scored frames
//!
//! Event distribution to external consumers lives in the sibling
//! `sensefuse-distribution` crate.

pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod sync;

pub use error::{Error, Result};
pub use orchestrator::{
    AnalysisRequest, AnalysisResult, BreakerConfig, BreakerRegistry, CircuitState, Orchestrator,
    OrchestratorConfig, QualityRequirements, RuntimeStats, StrategyKind, SystemStatus,
};
pub use pipeline::{
    Pipeline, PipelineFactory, PipelineMetadata, PipelineOutput, PipelineRegistry,
};
pub use sync::{StreamSample, StreamSynchronizer, SyncConfig, SyncMode, SynchronizedFrame};
