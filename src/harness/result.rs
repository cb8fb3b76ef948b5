//! Per-trial results.

use crate::harness::{StrategyKind, Submission};
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Terminal state of one observer within one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Detected,
    /// Never detected before the deadline.
    TimedOut,
    /// Detection was impossible (e.g. the subscription could not be set up).
    Errored(String),
}

/// Outcome of one observer within one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub strategy: String,
    pub kind: StrategyKind,
    pub outcome: Outcome,
    /// Time from the trial's start to detection, or to the deadline.
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Observation {
    pub fn detected(
        strategy: &str,
        kind: StrategyKind,
        elapsed: Duration,
        value: Option<serde_json::Value>,
    ) -> Self {
        Self {
            strategy: strategy.to_string(),
            kind,
            outcome: Outcome::Detected,
            elapsed,
            value,
        }
    }

    /// A timeout always reports the full budget, never the overshoot.
    pub fn timed_out(strategy: &str, kind: StrategyKind, timeout: Duration) -> Self {
        Self {
            strategy: strategy.to_string(),
            kind,
            outcome: Outcome::TimedOut,
            elapsed: timeout,
            value: None,
        }
    }

    pub fn errored(
        strategy: &str,
        kind: StrategyKind,
        elapsed: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            strategy: strategy.to_string(),
            kind,
            outcome: Outcome::Errored(reason.into()),
            elapsed,
            value: None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, Outcome::Detected)
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// All observations of one trial, one per launched observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceResult {
    pub trial: u64,
    pub submission: Submission,
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
    observations: Vec<Observation>,
}

impl RaceResult {
    /// Strategy names must be unique; `run_trial` checks this before any
    /// observer runs.
    pub(crate) fn new(
        trial: u64,
        submission: Submission,
        timeout: Duration,
        observations: Vec<Observation>,
    ) -> Self {
        Self {
            trial,
            submission,
            timeout,
            observations,
        }
    }

    pub fn get(&self, strategy: &str) -> Option<&Observation> {
        self.observations.iter().find(|o| o.strategy == strategy)
    }

    /// Observations in the order the observers were supplied.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// The strategy that detected the change first, if any did.
    pub fn fastest(&self) -> Option<&Observation> {
        self.observations
            .iter()
            .filter(|o| o.success())
            .min_by_key(|o| o.elapsed)
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}
