//! Latency statistics over a benchmark run.
//!
//! Tracks, per strategy and per strategy kind:
//! - how often the change was detected, missed (timeout), or undetectable
//! - the mean detection time over successful observations only
//! - min / median / max of the successful samples
//!
//! A strategy without a single success reports `Aggregate::NoData` rather
//! than averaging an empty set.

use crate::harness::{Outcome, RaceResult, StrategyKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Mean over a set of samples, or an explicit marker for "no samples".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregate {
    Mean { ms: f64, samples: usize },
    NoData,
}

impl Aggregate {
    fn of(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::NoData;
        }
        Self::Mean {
            ms: samples.iter().sum::<f64>() / samples.len() as f64,
            samples: samples.len(),
        }
    }

    pub fn ms(&self) -> Option<f64> {
        match self {
            Self::Mean { ms, .. } => Some(*ms),
            Self::NoData => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean { ms, .. } => write!(f, "{:.1}ms", ms),
            Self::NoData => write!(f, "no data"),
        }
    }
}

/// Aggregate for one named strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategySummary {
    pub strategy: String,
    pub kind: StrategyKind,
    /// Trials in which this strategy was launched.
    pub trials: usize,
    pub successes: usize,
    pub timeouts: usize,
    pub errors: usize,
    pub mean: Aggregate,
    pub min_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

impl StrategySummary {
    pub fn success_rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.successes as f64 / self.trials as f64
        }
    }
}

/// Aggregate over every strategy of one kind (all polling vs all streaming).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub kind: StrategyKind,
    pub strategies: Vec<String>,
    pub mean: Aggregate,
}

/// How much faster strategy `a` is than strategy `b`.
///
/// `delta_ms = mean(b) - mean(a)`, `percent = delta_ms / mean(b) * 100`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub a: String,
    pub b: String,
    pub delta_ms: Option<f64>,
    pub percent: Option<f64>,
}

impl Comparison {
    fn between(a: &str, mean_a: Aggregate, b: &str, mean_b: Aggregate) -> Self {
        let delta_ms = match (mean_a.ms(), mean_b.ms()) {
            (Some(ma), Some(mb)) => Some(mb - ma),
            _ => None,
        };
        let percent = match (delta_ms, mean_b.ms()) {
            (Some(delta), Some(mb)) if mb != 0.0 => Some(delta / mb * 100.0),
            _ => None,
        };
        Self {
            a: a.to_string(),
            b: b.to_string(),
            delta_ms,
            percent,
        }
    }
}

/// Read-only aggregate over a sequence of `RaceResult`s.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStatistics {
    pub trials: usize,
    /// Strategies in first-seen order.
    pub strategies: Vec<StrategySummary>,
    pub groups: Vec<GroupSummary>,
    pub comparison: Option<Comparison>,
}

impl SummaryStatistics {
    pub fn get(&self, strategy: &str) -> Option<&StrategySummary> {
        self.strategies.iter().find(|s| s.strategy == strategy)
    }

    pub fn group(&self, kind: StrategyKind) -> Option<&GroupSummary> {
        self.groups.iter().find(|g| g.kind == kind)
    }

    /// Compare any two strategies. Unknown names compare as `NoData`.
    pub fn compare(&self, a: &str, b: &str) -> Comparison {
        let mean_of = |name: &str| {
            self.get(name)
                .map(|s| s.mean)
                .unwrap_or(Aggregate::NoData)
        };
        Comparison::between(a, mean_of(a), b, mean_of(b))
    }
}

#[derive(Default)]
struct Samples {
    kind: Option<StrategyKind>,
    trials: usize,
    timeouts: usize,
    errors: usize,
    detected_ms: Vec<f64>,
}

/// Summarise a run. When `pair` is given, the comparison of `pair.0`
/// against `pair.1` is included.
pub fn summarize(results: &[RaceResult], pair: Option<(&str, &str)>) -> SummaryStatistics {
    let mut order: Vec<String> = Vec::new();
    let mut by_strategy: BTreeMap<String, Samples> = BTreeMap::new();

    for result in results {
        for obs in result.observations() {
            let entry = by_strategy.entry(obs.strategy.clone()).or_insert_with(|| {
                order.push(obs.strategy.clone());
                Samples::default()
            });
            entry.kind.get_or_insert(obs.kind);
            entry.trials += 1;
            match &obs.outcome {
                Outcome::Detected => entry.detected_ms.push(obs.elapsed_ms()),
                Outcome::TimedOut => entry.timeouts += 1,
                Outcome::Errored(_) => entry.errors += 1,
            }
        }
    }

    let mut group_samples: BTreeMap<StrategyKind, (Vec<String>, Vec<f64>)> = BTreeMap::new();

    let strategies: Vec<StrategySummary> = order
        .iter()
        .filter_map(|name| by_strategy.get(name).map(|s| (name, s)))
        .map(|(name, s)| {
            let kind = s.kind.unwrap_or(StrategyKind::Polling);
            let group = group_samples.entry(kind).or_default();
            group.0.push(name.clone());
            group.1.extend_from_slice(&s.detected_ms);

            let mut sorted = s.detected_ms.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));

            StrategySummary {
                strategy: name.clone(),
                kind,
                trials: s.trials,
                successes: sorted.len(),
                timeouts: s.timeouts,
                errors: s.errors,
                mean: Aggregate::of(&sorted),
                min_ms: sorted.first().copied(),
                median_ms: median(&sorted),
                max_ms: sorted.last().copied(),
            }
        })
        .collect();

    let groups = group_samples
        .into_iter()
        .map(|(kind, (strategies, samples))| GroupSummary {
            kind,
            strategies,
            mean: Aggregate::of(&samples),
        })
        .collect();

    let mut summary = SummaryStatistics {
        trials: results.len(),
        strategies,
        groups,
        comparison: None,
    };
    summary.comparison = pair.map(|(a, b)| summary.compare(a, b));
    summary
}

fn median(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
