//! Pipeline selection strategies
//!
//! A strategy is a pure ranking function over the candidate list: it never
//! mutates registry or breaker state, and runtime statistics are read-only
//! input. Strategies form a closed enumeration dispatching to plain
//! functions rather than trait objects.

use crate::orchestrator::stats::RuntimeStats;
use crate::pipeline::PerformanceProfile;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Closed set of built-in ranking strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Descending accuracy profile
    Quality,
    /// Ascending expected latency
    Performance,
    /// Weighted blend of accuracy and latency
    Balanced,
    /// Ascending resource cost
    PowerSaving,
    /// Drops candidates over the latency budget, then ranks by latency
    RealTime,
    /// Re-weights using windowed success rate and observed latency
    Adaptive,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::Balanced
    }
}

/// A ranked selection candidate
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Registered pipeline name
    pub name: String,
    /// Static performance profile from the registry metadata
    pub profile: PerformanceProfile,
}

/// Quality requirements carried by an analysis request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityRequirements {
    /// Per-request latency budget, milliseconds
    #[serde(default = "default_latency_budget_ms", alias = "latencyBudgetMs")]
    pub latency_budget_ms: u64,

    /// Minimum acceptable result completeness for partial results, [0,1]
    #[serde(default = "default_min_completeness", alias = "minCompleteness")]
    pub min_completeness: f64,
}

fn default_latency_budget_ms() -> u64 {
    1_000
}

fn default_min_completeness() -> f64 {
    0.6
}

impl Default for QualityRequirements {
    fn default() -> Self {
        Self {
            latency_budget_ms: default_latency_budget_ms(),
            min_completeness: default_min_completeness(),
        }
    }
}

/// Rank candidates with the given strategy, producing a total order
pub fn rank(
    kind: StrategyKind,
    candidates: Vec<Candidate>,
    requirements: &QualityRequirements,
    stats: &RuntimeStats,
) -> Vec<Candidate> {
    match kind {
        StrategyKind::Quality => sort_by_score(candidates, |c| c.profile.accuracy),
        StrategyKind::Performance => {
            sort_by_score(candidates, |c| -(c.profile.expected_latency_ms as f64))
        }
        StrategyKind::Balanced => {
            let max_latency = max_latency(&candidates);
            sort_by_score(candidates, move |c| {
                0.5 * c.profile.accuracy
                    + 0.5 * (1.0 - c.profile.expected_latency_ms as f64 / max_latency)
            })
        }
        StrategyKind::PowerSaving => sort_by_score(candidates, |c| -c.profile.resource_cost),
        StrategyKind::RealTime => {
            let budget = requirements.latency_budget_ms;
            let eligible: Vec<Candidate> = candidates
                .into_iter()
                .filter(|c| c.profile.expected_latency_ms <= budget)
                .collect();
            sort_by_score(eligible, |c| -(c.profile.expected_latency_ms as f64))
        }
        StrategyKind::Adaptive => {
            let max_latency = max_latency(&candidates);
            let scored: Vec<(Candidate, f64)> = candidates
                .into_iter()
                .map(|c| {
                    let observed = stats.snapshot(&c.name);
                    let latency = observed
                        .mean_latency_ms
                        .unwrap_or(c.profile.expected_latency_ms as f64);
                    let score = 0.4 * observed.success_rate
                        + 0.3 * c.profile.accuracy
                        + 0.3 * (1.0 - latency / max_latency).max(0.0);
                    (c, score)
                })
                .collect();
            sort_scored(scored)
        }
    }
}

fn max_latency(candidates: &[Candidate]) -> f64 {
    candidates
        .iter()
        .map(|c| c.profile.expected_latency_ms)
        .max()
        .unwrap_or(1)
        .max(1) as f64
}

fn sort_by_score<F: Fn(&Candidate) -> f64>(candidates: Vec<Candidate>, score: F) -> Vec<Candidate> {
    let scored: Vec<(Candidate, f64)> = candidates
        .into_iter()
        .map(|c| {
            let s = score(&c);
            (c, s)
        })
        .collect();
    sort_scored(scored)
}

fn sort_scored(mut scored: Vec<(Candidate, f64)>) -> Vec<Candidate> {
    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    scored.into_iter().map(|(c, _)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, accuracy: f64, latency_ms: u64, cost: f64) -> Candidate {
        Candidate {
            name: name.to_string(),
            profile: PerformanceProfile {
                accuracy,
                expected_latency_ms: latency_ms,
                resource_cost: cost,
            },
        }
    }

    fn names(ranked: &[Candidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn quality_ranks_by_accuracy_desc() {
        let ranked = rank(
            StrategyKind::Quality,
            vec![
                candidate("fast", 0.6, 20, 0.3),
                candidate("accurate", 0.95, 200, 0.8),
            ],
            &QualityRequirements::default(),
            &RuntimeStats::new(),
        );
        assert_eq!(names(&ranked), vec!["accurate", "fast"]);
    }

    #[test]
    fn performance_ranks_by_latency_asc() {
        let ranked = rank(
            StrategyKind::Performance,
            vec![
                candidate("accurate", 0.95, 200, 0.8),
                candidate("fast", 0.6, 20, 0.3),
            ],
            &QualityRequirements::default(),
            &RuntimeStats::new(),
        );
        assert_eq!(names(&ranked), vec!["fast", "accurate"]);
    }

    #[test]
    fn power_saving_ranks_by_cost_asc() {
        let ranked = rank(
            StrategyKind::PowerSaving,
            vec![
                candidate("heavy", 0.9, 50, 0.9),
                candidate("light", 0.7, 50, 0.2),
            ],
            &QualityRequirements::default(),
            &RuntimeStats::new(),
        );
        assert_eq!(names(&ranked), vec!["light", "heavy"]);
    }

    #[test]
    fn real_time_filters_over_budget() {
        let requirements = QualityRequirements {
            latency_budget_ms: 100,
            ..Default::default()
        };
        let ranked = rank(
            StrategyKind::RealTime,
            vec![
                candidate("slow", 0.95, 500, 0.5),
                candidate("fast", 0.6, 20, 0.3),
                candidate("medium", 0.8, 80, 0.4),
            ],
            &requirements,
            &RuntimeStats::new(),
        );
        assert_eq!(names(&ranked), vec!["fast", "medium"]);
    }

    #[test]
    fn adaptive_penalizes_failing_pipelines() {
        let stats = RuntimeStats::new();
        // "flaky" has an identical profile but a poor recent record.
        for _ in 0..10 {
            stats.record("flaky", false, 50);
            stats.record("steady", true, 50);
        }
        let ranked = rank(
            StrategyKind::Adaptive,
            vec![
                candidate("flaky", 0.8, 50, 0.5),
                candidate("steady", 0.8, 50, 0.5),
            ],
            &QualityRequirements::default(),
            &stats,
        );
        assert_eq!(names(&ranked), vec!["steady", "flaky"]);
    }

    #[test]
    fn ties_break_by_ascending_name() {
        let ranked = rank(
            StrategyKind::Quality,
            vec![
                candidate("b", 0.8, 50, 0.5),
                candidate("a", 0.8, 50, 0.5),
            ],
            &QualityRequirements::default(),
            &RuntimeStats::new(),
        );
        assert_eq!(names(&ranked), vec!["a", "b"]);
    }
}
