//! Rolling per-pipeline runtime statistics
//!
//! Feeds the `adaptive` strategy and the system status surface: a bounded
//! window of recent outcomes per pipeline (success rate, mean latency) plus
//! an HDR histogram for latency percentiles.

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default rolling-window size (recent invocations per pipeline)
const DEFAULT_WINDOW: usize = 50;

/// Histogram range: 1ms to 60s, 3 significant figures
const HISTOGRAM_MAX_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: u64,
}

/// Rolling statistics for one pipeline
pub struct PipelineStats {
    window: Mutex<VecDeque<Sample>>,
    histogram: Mutex<Histogram<u64>>,
    window_size: usize,
    total: AtomicU64,
    failures: AtomicU64,
}

impl PipelineStats {
    fn new(window_size: usize) -> Self {
        // The construction parameters are static and in range; fall back to
        // a histogram over the full u64 range if they ever are not.
        let histogram = Histogram::<u64>::new_with_max(HISTOGRAM_MAX_MS, 3)
            .unwrap_or_else(|_| Histogram::<u64>::new(3).expect("sigfigs in 0..=5"));
        Self {
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            histogram: Mutex::new(histogram),
            window_size,
            total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Record one invocation outcome
    pub fn record(&self, success: bool, latency_ms: u64) {
        {
            let mut window = self.window.lock();
            if window.len() == self.window_size {
                window.pop_front();
            }
            window.push_back(Sample {
                success,
                latency_ms,
            });
        }
        {
            let mut histogram = self.histogram.lock();
            let clamped = latency_ms.clamp(1, HISTOGRAM_MAX_MS);
            let _ = histogram.record(clamped);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Windowed success rate in [0,1]; 1.0 with no samples
    pub fn success_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 1.0;
        }
        let ok = window.iter().filter(|s| s.success).count();
        ok as f64 / window.len() as f64
    }

    /// Windowed mean latency in milliseconds; `None` with no samples
    pub fn mean_latency_ms(&self) -> Option<f64> {
        let window = self.window.lock();
        if window.is_empty() {
            return None;
        }
        let sum: u64 = window.iter().map(|s| s.latency_ms).sum();
        Some(sum as f64 / window.len() as f64)
    }

    /// Latency at the given quantile (0.0-1.0) over all recorded samples
    pub fn latency_at_quantile(&self, q: f64) -> u64 {
        self.histogram.lock().value_at_quantile(q)
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        // One lock acquisition for the whole window view; the accessor
        // methods each take the same non-reentrant mutex.
        let (samples, success_rate, mean_latency_ms) = {
            let window = self.window.lock();
            if window.is_empty() {
                (0, 1.0, None)
            } else {
                let ok = window.iter().filter(|s| s.success).count();
                let sum: u64 = window.iter().map(|s| s.latency_ms).sum();
                let len = window.len();
                (
                    len,
                    ok as f64 / len as f64,
                    Some(sum as f64 / len as f64),
                )
            }
        };
        StatsSnapshot {
            samples,
            success_rate,
            mean_latency_ms,
            p95_latency_ms: self.latency_at_quantile(0.95),
            total_invocations: self.total.load(Ordering::Relaxed),
            total_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one pipeline's runtime statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Samples currently in the rolling window
    pub samples: usize,
    /// Windowed success rate in [0,1]
    pub success_rate: f64,
    /// Windowed mean latency, milliseconds
    pub mean_latency_ms: Option<f64>,
    /// P95 latency over all recorded samples, milliseconds
    pub p95_latency_ms: u64,
    /// Lifetime invocation count
    pub total_invocations: u64,
    /// Lifetime failure count
    pub total_failures: u64,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            samples: 0,
            success_rate: 1.0,
            mean_latency_ms: None,
            p95_latency_ms: 0,
            total_invocations: 0,
            total_failures: 0,
        }
    }
}

/// Keyed rolling statistics for every invoked pipeline
pub struct RuntimeStats {
    per_pipeline: DashMap<String, Arc<PipelineStats>>,
    window_size: usize,
}

impl RuntimeStats {
    /// Create with the default window size
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Create with a custom rolling-window size
    pub fn with_window(window_size: usize) -> Self {
        Self {
            per_pipeline: DashMap::new(),
            window_size: window_size.max(1),
        }
    }

    /// Record one invocation outcome for a pipeline
    pub fn record(&self, pipeline_id: &str, success: bool, latency_ms: u64) {
        self.pipeline(pipeline_id).record(success, latency_ms);
    }

    fn pipeline(&self, pipeline_id: &str) -> Arc<PipelineStats> {
        self.per_pipeline
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(PipelineStats::new(self.window_size)))
            .clone()
    }

    /// Snapshot for one pipeline (defaults for never-invoked ids)
    pub fn snapshot(&self, pipeline_id: &str) -> StatsSnapshot {
        self.per_pipeline
            .get(pipeline_id)
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Snapshots for every pipeline with recorded samples
    pub fn all(&self) -> Vec<(String, StatsSnapshot)> {
        self.per_pipeline
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_report_full_success() {
        let stats = RuntimeStats::new();
        let snap = stats.snapshot("never");
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.samples, 0);
        assert!(snap.mean_latency_ms.is_none());
    }

    #[test]
    fn window_evicts_oldest() {
        let stats = RuntimeStats::with_window(3);
        stats.record("p", false, 10);
        stats.record("p", true, 10);
        stats.record("p", true, 10);
        stats.record("p", true, 10); // evicts the failure

        let snap = stats.snapshot("p");
        assert_eq!(snap.samples, 3);
        assert_eq!(snap.success_rate, 1.0);
        assert_eq!(snap.total_invocations, 4);
        assert_eq!(snap.total_failures, 1);
    }

    #[test]
    fn mean_and_quantile_track_latency() {
        let stats = RuntimeStats::new();
        for latency in [10, 20, 30] {
            stats.record("p", true, latency);
        }
        let snap = stats.snapshot("p");
        assert!((snap.mean_latency_ms.unwrap() - 20.0).abs() < 1e-9);
        assert!(snap.p95_latency_ms >= 29);
    }
}
