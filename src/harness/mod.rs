//! Latency race harness.
//!
//! Races several observation strategies against a single state-changing
//! action and reports how long each took to notice the change:
//! - every observer in a trial shares one start `Instant` and one baseline
//! - the start instant is fixed before the trigger fires, so submission
//!   latency is part of every measurement
//! - one observer failing or timing out never cancels the others
//!
//! Architecture:
//! - `Observer`: the capability each strategy implements (`arm` before the
//!   trigger, `observe` until the deadline, `disarm` afterwards)
//! - `run_trial`: fixes the start instant, fires the trigger, joins all
//!   observers under a shared deadline and collects a `RaceResult`
//! - `summarize`: folds many `RaceResult`s into `SummaryStatistics`
//!
//! All timing goes through `tokio::time`, so tests drive the harness with a
//! paused clock instead of real waiting.

pub mod race;
pub mod result;
pub mod summary;

pub use race::{run_trial, BenchmarkRun, RaceError, TrialFailure};
pub use result::{Observation, Outcome, RaceResult};
pub use summary::{summarize, Aggregate, Comparison, GroupSummary, StrategySummary, SummaryStatistics};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Duration, Instant};

/// The identifier and sender of a submitted triggering action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// Transaction hash.
    pub id: B256,
    /// Address whose state the action changes.
    pub sender: Address,
}

/// How a strategy learns about a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Actively re-queries a request/response endpoint.
    Polling,
    /// Passively waits for pushed notifications.
    Streaming,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Everything an observer needs to know about the trial it is racing in.
#[derive(Debug)]
pub struct TrialContext<'a, B> {
    pub trial: u64,
    pub baseline: &'a B,
    pub submission: &'a Submission,
    /// Shared reference point for every elapsed time in this trial.
    pub start: Instant,
    pub deadline: Instant,
}

impl<B> TrialContext<'_, B> {
    pub fn timeout(&self) -> Duration {
        self.deadline.saturating_duration_since(self.start)
    }
}

/// What an observer reports back when it stops watching.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The change was seen at `at`, optionally with the value that proved it.
    Found {
        at: Instant,
        value: Option<serde_json::Value>,
    },
    /// The deadline passed without a change being seen.
    Deadline,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObserverError {
    #[error("state query failed: {0}")]
    Query(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("observer was not armed for trial {0}")]
    NotArmed(u64),
}

/// One observation strategy.
///
/// `B` is the baseline type shared by every observer in a trial (the prior
/// nonce for the benchmark binary).
#[async_trait]
pub trait Observer<B: Sync>: Send + Sync {
    /// Unique strategy name within a trial.
    fn name(&self) -> &str;

    fn kind(&self) -> StrategyKind;

    /// Called before the trigger fires. Listeners must attach here so an
    /// early event cannot be missed.
    async fn arm(&self, _trial: u64) -> Result<(), ObserverError> {
        Ok(())
    }

    /// Watch for the change until `ctx.deadline`.
    async fn observe(&self, ctx: &TrialContext<'_, B>) -> Result<Detection, ObserverError>;

    /// Called once the trial is over, whatever its outcome.
    async fn disarm(&self, _trial: u64) {}
}
