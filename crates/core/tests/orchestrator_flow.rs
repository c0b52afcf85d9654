//! End-to-end orchestration and synchronization behavior

use sensefuse_core::orchestrator::{
    AnalysisRequest, AnalysisResult, CircuitState, Orchestrator, OrchestratorConfig,
};
use sensefuse_core::pipeline::{
    Pipeline, PipelineFactory, PipelineMetadata, PipelineOutput, PipelineRegistry,
};
use sensefuse_core::sync::{StreamSample, StreamSynchronizer, SyncConfig, SyncMode};
use sensefuse_core::{BreakerConfig, QualityRequirements, Result, StrategyKind};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail,
    Partial { completeness: f64 },
    Sleep(Duration),
    // Blocks without yielding, then fails. The timeout wrapper only fires
    // at an await point, so this always registers as a genuine failure.
    BlockThenFail(Duration),
}

struct MockPipeline {
    name: String,
    capabilities: Vec<String>,
    behavior: Behavior,
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Pipeline for MockPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn process(&self, _frame: &Value) -> Result<PipelineOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => Ok(PipelineOutput::complete(json!({"by": self.name}))),
            Behavior::Fail => Err(sensefuse_core::Error::execution("inference failed")),
            Behavior::Partial { completeness } => Ok(PipelineOutput {
                data: json!({"by": self.name}),
                missing: vec!["landmarks".to_string()],
                completeness: Some(*completeness),
            }),
            Behavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(PipelineOutput::complete(json!({"by": self.name})))
            }
            Behavior::BlockThenFail(d) => {
                std::thread::sleep(*d);
                Err(sensefuse_core::Error::execution("inference failed"))
            }
        }
    }
}

fn register(
    orchestrator: &Orchestrator,
    name: &str,
    capability: &str,
    accuracy: f64,
    behavior: Behavior,
) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let metadata = PipelineMetadata {
        category: "vision".to_string(),
        capabilities: vec![capability.to_string()],
        profile: sensefuse_core::pipeline::PerformanceProfile {
            accuracy,
            expected_latency_ms: 10,
            resource_cost: 0.5,
        },
        ..Default::default()
    };
    let pipeline_name = name.to_string();
    let capability = capability.to_string();
    let call_counter = calls.clone();
    let factory: Arc<dyn PipelineFactory> =
        Arc::new(move |_config: &Value| -> Result<Arc<dyn Pipeline>> {
            Ok(Arc::new(MockPipeline {
                name: pipeline_name.clone(),
                capabilities: vec![capability.clone()],
                behavior: behavior.clone(),
                calls: call_counter.clone(),
            }))
        });
    orchestrator
        .register_pipeline(name, factory, metadata)
        .unwrap();
    calls
}

fn quality_request(capability: &str) -> AnalysisRequest {
    AnalysisRequest {
        capabilities: vec![capability.to_string()],
        frame: json!({"pixels": []}),
        requirements: QualityRequirements::default(),
        strategy: Some(StrategyKind::Quality),
    }
}

#[tokio::test]
async fn unmatched_capability_invokes_nothing() {
    let orchestrator = Orchestrator::new();
    let calls = register(&orchestrator, "gaze", "gaze", 0.9, Behavior::Succeed);

    let result = orchestrator.process(&quality_request("thermal")).await;
    assert!(matches!(result, AnalysisResult::Unsupported { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // No breaker was touched either.
    let status = orchestrator.system_status();
    assert_eq!(status.pipelines[0].breaker.consecutive_failures, 0);
}

#[tokio::test]
async fn failover_returns_lower_ranked_success() {
    let orchestrator = Orchestrator::new();
    // "sharp" ranks first under the quality strategy but fails.
    let sharp_calls = register(&orchestrator, "sharp", "gaze", 0.95, Behavior::Fail);
    let steady_calls = register(&orchestrator, "steady", "gaze", 0.7, Behavior::Succeed);

    let result = orchestrator.process(&quality_request("gaze")).await;
    match result {
        AnalysisResult::Success { pipeline, data, .. } => {
            assert_eq!(pipeline, "steady");
            assert_eq!(data["by"], "steady");
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(sharp_calls.load(Ordering::SeqCst), 1);
    assert_eq!(steady_calls.load(Ordering::SeqCst), 1);

    let status = orchestrator.system_status();
    let sharp = status
        .pipelines
        .iter()
        .find(|p| p.name == "sharp")
        .unwrap();
    assert_eq!(sharp.breaker.consecutive_failures, 1);
}

#[tokio::test]
async fn repeated_failures_open_the_circuit_and_skip() {
    init_tracing();
    let config = OrchestratorConfig {
        breaker: BreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 60_000,
        },
        ..Default::default()
    };
    let orchestrator = Orchestrator::with_config(Arc::new(PipelineRegistry::new()), config);
    let calls = register(&orchestrator, "flaky", "gaze", 0.9, Behavior::Fail);

    for _ in 0..2 {
        let result = orchestrator.process(&quality_request("gaze")).await;
        assert!(matches!(result, AnalysisResult::Failed { .. }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let status = orchestrator.system_status();
    assert_eq!(status.pipelines[0].breaker.state, CircuitState::Open);

    // Circuit open: the pipeline is skipped, not invoked.
    let result = orchestrator.process(&quality_request("gaze")).await;
    assert!(matches!(result, AnalysisResult::Failed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn latency_budget_produces_timeout() {
    let orchestrator = Orchestrator::new();
    register(
        &orchestrator,
        "slow",
        "gaze",
        0.9,
        Behavior::Sleep(Duration::from_millis(500)),
    );

    let request = AnalysisRequest {
        requirements: QualityRequirements {
            latency_budget_ms: 30,
            ..Default::default()
        },
        ..quality_request("gaze")
    };
    let result = orchestrator.process(&request).await;
    assert!(matches!(result, AnalysisResult::Timeout { .. }));
}

#[tokio::test]
async fn partial_results_respect_tolerance() {
    let orchestrator = Orchestrator::new();
    register(
        &orchestrator,
        "half",
        "gaze",
        0.9,
        Behavior::Partial { completeness: 0.8 },
    );

    let mut request = quality_request("gaze");
    request.requirements.min_completeness = 0.6;
    match orchestrator.process(&request).await {
        AnalysisResult::Partial { missing, .. } => {
            assert_eq!(missing, vec!["landmarks".to_string()]);
        }
        other => panic!("expected partial, got {other:?}"),
    }

    request.requirements.min_completeness = 0.9;
    let result = orchestrator.process(&request).await;
    assert!(matches!(result, AnalysisResult::Failed { .. }));
}

#[tokio::test]
async fn genuine_failure_past_budget_reports_failed_not_timeout() {
    let orchestrator = Orchestrator::new();
    // "heavy" fails genuinely while eating the whole budget; "spare" is
    // then skipped with the budget exhausted. The outcome classifies on
    // the real failure, not the skip.
    register(
        &orchestrator,
        "heavy",
        "gaze",
        0.9,
        Behavior::BlockThenFail(Duration::from_millis(60)),
    );
    register(&orchestrator, "spare", "gaze", 0.8, Behavior::Succeed);

    let request = AnalysisRequest {
        requirements: QualityRequirements {
            latency_budget_ms: 30,
            ..Default::default()
        },
        ..quality_request("gaze")
    };
    match orchestrator.process(&request).await {
        AnalysisResult::Failed { error } => {
            assert!(error.contains("heavy:"));
            assert!(error.contains("latency budget exhausted"));
        }
        other => panic!("expected failed, got {other:?}"),
    }
}

#[tokio::test]
async fn process_never_errors_even_when_everything_fails() {
    let orchestrator = Orchestrator::new();
    register(&orchestrator, "a", "gaze", 0.9, Behavior::Fail);
    register(&orchestrator, "b", "gaze", 0.8, Behavior::Fail);

    match orchestrator.process(&quality_request("gaze")).await {
        AnalysisResult::Failed { error } => {
            assert!(error.contains("a:"));
            assert!(error.contains("b:"));
        }
        other => panic!("expected failed, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Synchronizer convergence
// ---------------------------------------------------------------------------

/// Two sources at fixed rates with bounded jitter: the emitted-frame count
/// converges to the slowest source's rate, give or take one frame.
#[tokio::test]
async fn frame_rate_converges_to_slowest_source() {
    init_tracing();
    let mut config = SyncConfig::for_sources(["camera", "mic"]);
    config.mode = SyncMode::HardwareTimestamp;
    config.tolerance_ms = 50;
    let (sync, mut rx) = StreamSynchronizer::new(config).unwrap();

    // camera: 10 Hz, mic: 25 Hz, 1 second of traffic, deterministic ±4ms
    // jitter (well inside the 50ms window). Interleaved by timestamp.
    let mut samples: Vec<StreamSample> = Vec::new();
    for i in 0..10u64 {
        let jitter = if i % 2 == 0 { 4 } else { 0 };
        samples.push(StreamSample {
            source_id: "camera".to_string(),
            payload: json!({}),
            timestamp_us: (i * 100 + jitter) * 1_000,
            sequence: i,
        });
    }
    for i in 0..25u64 {
        let jitter = if i % 3 == 0 { 3 } else { 0 };
        samples.push(StreamSample {
            source_id: "mic".to_string(),
            payload: json!({}),
            timestamp_us: (i * 40 + jitter) * 1_000,
            sequence: i,
        });
    }
    samples.sort_by_key(|s| s.timestamp_us);
    for sample in samples {
        sync.ingest(sample).unwrap();
    }

    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    let count = frames.len() as i64;
    assert!(
        (count - 10).abs() <= 1,
        "expected ~10 frames (slowest source rate), got {count}"
    );
    for frame in &frames {
        assert!(frame.is_complete());
    }
}

/// Quality scores are monotonically non-increasing as injected jitter grows.
#[tokio::test]
async fn quality_degrades_monotonically_with_jitter() {
    let mean_quality = |jitter_ms: u64| {
        let mut config = SyncConfig::for_sources(["a", "b"]);
        config.mode = SyncMode::HardwareTimestamp;
        config.tolerance_ms = 50;
        let (sync, mut rx) = StreamSynchronizer::new(config).unwrap();
        for i in 0..20u64 {
            sync.ingest(StreamSample {
                source_id: "a".to_string(),
                payload: json!({}),
                timestamp_us: i * 100_000,
                sequence: i,
            })
            .unwrap();
            sync.ingest(StreamSample {
                source_id: "b".to_string(),
                payload: json!({}),
                timestamp_us: i * 100_000 + jitter_ms * 1_000,
                sequence: i,
            })
            .unwrap();
        }
        let mut total = 0.0;
        let mut n = 0;
        while let Ok(frame) = rx.try_recv() {
            total += frame.quality;
            n += 1;
        }
        assert!(n > 0);
        total / n as f64
    };

    let q0 = mean_quality(0);
    let q10 = mean_quality(10);
    let q25 = mean_quality(25);
    let q45 = mean_quality(45);
    assert!(q0 >= q10);
    assert!(q10 >= q25);
    assert!(q25 >= q45);
    assert!(q0 > q45);
}
