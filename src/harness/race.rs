//! Trial orchestration: one trigger, many observers, one shared clock.

use crate::harness::summary::{summarize, SummaryStatistics};
use crate::harness::{
    Detection, Observation, Observer, ObserverError, RaceResult, Submission, TrialContext,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum RaceError {
    /// The state-changing action could not be submitted. No observer ran.
    #[error("trigger failed: {0:#}")]
    TriggerFailed(anyhow::Error),
    #[error("a trial needs at least one observer")]
    NoObservers,
    #[error("duplicate strategy name: {0}")]
    DuplicateStrategy(String),
    #[error("trial timeout must be positive")]
    InvalidTimeout,
}

/// Run one trial.
///
/// Every observer is armed, then the start instant is fixed and `trigger`
/// is awaited. If the trigger fails (or does not return within `timeout`)
/// the trial aborts with `RaceError::TriggerFailed`. Otherwise all observers
/// race concurrently until `start + timeout`; each produces exactly one
/// `Observation`, whatever happens to the others.
pub async fn run_trial<B, F, Fut>(
    trial: u64,
    baseline: &B,
    trigger: F,
    observers: &[Arc<dyn Observer<B>>],
    timeout: Duration,
) -> Result<RaceResult, RaceError>
where
    B: Sync,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Submission>>,
{
    if observers.is_empty() {
        return Err(RaceError::NoObservers);
    }
    if timeout.is_zero() {
        return Err(RaceError::InvalidTimeout);
    }
    let mut names = HashSet::with_capacity(observers.len());
    for observer in observers {
        if !names.insert(observer.name()) {
            return Err(RaceError::DuplicateStrategy(observer.name().to_string()));
        }
    }

    // Listeners attach before anything can happen on chain.
    let mut arm_errors: Vec<Option<ObserverError>> = Vec::with_capacity(observers.len());
    for observer in observers {
        match observer.arm(trial).await {
            Ok(()) => arm_errors.push(None),
            Err(e) => {
                warn!(trial, strategy = observer.name(), error = %e, "observer failed to arm");
                arm_errors.push(Some(e));
            }
        }
    }

    let start = Instant::now();
    let Some(deadline) = start.checked_add(timeout) else {
        disarm_all(trial, observers).await;
        return Err(RaceError::InvalidTimeout);
    };

    let submission = match timeout_at(deadline, trigger()).await {
        Ok(Ok(submission)) => submission,
        Ok(Err(cause)) => {
            error!(trial, error = %cause, "trigger failed, no observers will run");
            disarm_all(trial, observers).await;
            return Err(RaceError::TriggerFailed(cause));
        }
        Err(_) => {
            error!(trial, timeout_ms = timeout.as_millis() as u64, "trigger did not complete before the deadline");
            disarm_all(trial, observers).await;
            return Err(RaceError::TriggerFailed(anyhow::anyhow!(
                "submission did not complete within {}ms",
                timeout.as_millis()
            )));
        }
    };

    info!(
        trial,
        tx = %submission.id,
        submit_ms = start.elapsed().as_millis() as u64,
        "trigger submitted"
    );

    let ctx = TrialContext {
        trial,
        baseline,
        submission: &submission,
        start,
        deadline,
    };
    let ctx = &ctx;

    // join_all polls every future once before any of them can complete, so
    // all observers start within the same tick.
    let races = observers
        .iter()
        .zip(arm_errors.iter())
        .map(|(observer, arm_error)| async move {
            let name = observer.name();
            let kind = observer.kind();

            if let Some(e) = arm_error {
                return Observation::errored(name, kind, Duration::ZERO, e.to_string());
            }

            match timeout_at(deadline, observer.observe(ctx)).await {
                Ok(Ok(Detection::Found { at, value })) if at <= deadline => {
                    let elapsed = at.saturating_duration_since(start);
                    debug!(trial, strategy = name, elapsed_ms = elapsed.as_millis() as u64, "detected");
                    Observation::detected(name, kind, elapsed, value)
                }
                Ok(Ok(_)) | Err(_) => {
                    debug!(trial, strategy = name, "timed out");
                    Observation::timed_out(name, kind, timeout)
                }
                Ok(Err(e)) => {
                    warn!(trial, strategy = name, error = %e, "observer errored");
                    let elapsed = start.elapsed().min(timeout);
                    Observation::errored(name, kind, elapsed, e.to_string())
                }
            }
        });

    let observations = join_all(races).await;

    disarm_all(trial, observers).await;

    let result = RaceResult::new(trial, submission, timeout, observations);
    if let Some(fastest) = result.fastest() {
        info!(
            trial,
            winner = %fastest.strategy,
            elapsed_ms = fastest.elapsed.as_millis() as u64,
            detected = result.observations().iter().filter(|o| o.success()).count(),
            total = result.len(),
            "trial complete"
        );
    } else {
        warn!(trial, total = result.len(), "trial complete, no strategy detected the change");
    }

    Ok(result)
}

async fn disarm_all<B: Sync>(trial: u64, observers: &[Arc<dyn Observer<B>>]) {
    join_all(observers.iter().map(|o| o.disarm(trial))).await;
}

/// A trial that produced no `RaceResult`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialFailure {
    pub trial: u64,
    pub reason: String,
}

/// Accumulates the trials of one benchmark run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchmarkRun {
    results: Vec<RaceResult>,
    failures: Vec<TrialFailure>,
}

impl BenchmarkRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, trial: u64, outcome: Result<RaceResult, RaceError>) {
        match outcome {
            Ok(result) => self.results.push(result),
            Err(e) => self.record_failure(trial, e.to_string()),
        }
    }

    pub fn record_failure(&mut self, trial: u64, reason: impl Into<String>) {
        self.failures.push(TrialFailure {
            trial,
            reason: reason.into(),
        });
    }

    pub fn results(&self) -> &[RaceResult] {
        &self.results
    }

    pub fn failures(&self) -> &[TrialFailure] {
        &self.failures
    }

    /// Trials attempted, successful or not.
    pub fn trials(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    pub fn summarize(&self, pair: Option<(&str, &str)>) -> SummaryStatistics {
        summarize(&self.results, pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{Outcome, StrategyKind};
    use alloy::primitives::{Address, B256};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Detects after a fixed delay, or never.
    struct Scripted {
        name: &'static str,
        after: Option<Duration>,
        fail_arm: bool,
        fail_observe: bool,
        observed: AtomicUsize,
        disarmed: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, after: Option<u64>) -> Self {
            Self {
                name,
                after: after.map(Duration::from_millis),
                fail_arm: false,
                fail_observe: false,
                observed: AtomicUsize::new(0),
                disarmed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Observer<u64> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> StrategyKind {
            StrategyKind::Polling
        }

        async fn arm(&self, _trial: u64) -> Result<(), ObserverError> {
            if self.fail_arm {
                return Err(ObserverError::Subscribe("no ack".into()));
            }
            Ok(())
        }

        async fn observe(&self, ctx: &TrialContext<'_, u64>) -> Result<Detection, ObserverError> {
            self.observed.fetch_add(1, Ordering::SeqCst);
            if self.fail_observe {
                return Err(ObserverError::ChannelClosed);
            }
            match self.after {
                Some(after) => {
                    sleep(after).await;
                    Ok(Detection::Found {
                        at: Instant::now(),
                        value: Some(serde_json::json!(*ctx.baseline + 1)),
                    })
                }
                None => {
                    tokio::time::sleep_until(ctx.deadline).await;
                    Ok(Detection::Deadline)
                }
            }
        }

        async fn disarm(&self, _trial: u64) {
            self.disarmed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn submission() -> Submission {
        Submission {
            id: B256::repeat_byte(0xab),
            sender: Address::repeat_byte(0x01),
        }
    }

    fn as_observers(list: &[Arc<Scripted>]) -> Vec<Arc<dyn Observer<u64>>> {
        list.iter().map(|o| o.clone() as Arc<dyn Observer<u64>>).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_observers_settle_independently() {
        let fast = Arc::new(Scripted::new("pending", Some(360)));
        let slow = Arc::new(Scripted::new("latest", None));
        let mut broken = Scripted::new("push", None);
        broken.fail_observe = true;
        let broken = Arc::new(broken);
        let observers = as_observers(&[fast.clone(), slow.clone(), broken.clone()]);

        let result = run_trial(
            7,
            &41u64,
            || async { Ok(submission()) },
            &observers,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();

        assert_eq!(result.trial, 7);
        assert_eq!(result.len(), 3);

        let pending = result.get("pending").unwrap();
        assert!(pending.success());
        assert_eq!(pending.elapsed, Duration::from_millis(360));
        assert_eq!(pending.value, Some(serde_json::json!(42)));

        let latest = result.get("latest").unwrap();
        assert_eq!(latest.outcome, Outcome::TimedOut);
        assert_eq!(latest.elapsed, Duration::from_millis(1000));

        assert!(matches!(result.get("push").unwrap().outcome, Outcome::Errored(_)));

        for o in [&fast, &slow, &broken] {
            assert_eq!(o.disarmed.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_failure_runs_no_observers() {
        let observer = Arc::new(Scripted::new("pending", Some(10)));
        let observers = as_observers(&[observer.clone()]);

        let outcome = run_trial(
            0,
            &0u64,
            || async { Err(anyhow::anyhow!("insufficient funds")) },
            &observers,
            Duration::from_millis(500),
        )
        .await;

        match outcome {
            Err(RaceError::TriggerFailed(cause)) => {
                assert!(cause.to_string().contains("insufficient funds"))
            }
            other => panic!("expected TriggerFailed, got {other:?}"),
        }
        assert_eq!(observer.observed.load(Ordering::SeqCst), 0);
        assert_eq!(observer.disarmed.load(Ordering::SeqCst), 1);

        let mut run = BenchmarkRun::new();
        run.record(
            0,
            Err(RaceError::TriggerFailed(anyhow::anyhow!("insufficient funds"))),
        );
        assert!(run.results().is_empty());
        assert_eq!(run.failures().len(), 1);
        assert_eq!(run.trials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_trigger_is_a_trigger_failure() {
        let observers = as_observers(&[Arc::new(Scripted::new("pending", Some(10)))]);
        let outcome = run_trial(
            0,
            &0u64,
            || async {
                sleep(Duration::from_secs(60)).await;
                Ok(submission())
            },
            &observers,
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(outcome, Err(RaceError::TriggerFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_includes_submission_latency() {
        let observers = as_observers(&[Arc::new(Scripted::new("pending", Some(100)))]);
        let result = run_trial(
            0,
            &0u64,
            || async {
                sleep(Duration::from_millis(50)).await;
                Ok(submission())
            },
            &observers,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();
        assert_eq!(result.get("pending").unwrap().elapsed, Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_detection_is_capped_at_timeout() {
        let observers = as_observers(&[Arc::new(Scripted::new("slow", Some(5_000)))]);
        let result = run_trial(
            0,
            &0u64,
            || async { Ok(submission()) },
            &observers,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();
        let obs = result.get("slow").unwrap();
        assert!(!obs.success());
        assert_eq!(obs.elapsed, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_failure_is_contained() {
        let mut unarmed = Scripted::new("push", Some(1));
        unarmed.fail_arm = true;
        let unarmed = Arc::new(unarmed);
        let ok = Arc::new(Scripted::new("pending", Some(20)));
        let observers = as_observers(&[unarmed.clone(), ok]);

        let result = run_trial(
            1,
            &0u64,
            || async { Ok(submission()) },
            &observers,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();

        assert!(matches!(result.get("push").unwrap().outcome, Outcome::Errored(_)));
        assert!(result.get("pending").unwrap().success());
        assert_eq!(unarmed.observed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_trials() {
        let ok = || async { Ok(submission()) };
        let none: Vec<Arc<dyn Observer<u64>>> = Vec::new();
        assert!(matches!(
            run_trial(0, &0u64, ok, &none, Duration::from_millis(10)).await,
            Err(RaceError::NoObservers)
        ));

        let dupes = as_observers(&[
            Arc::new(Scripted::new("pending", Some(1))),
            Arc::new(Scripted::new("pending", Some(2))),
        ]);
        assert!(matches!(
            run_trial(0, &0u64, ok, &dupes, Duration::from_millis(10)).await,
            Err(RaceError::DuplicateStrategy(name)) if name == "pending"
        ));

        let single = as_observers(&[Arc::new(Scripted::new("pending", Some(1)))]);
        assert!(matches!(
            run_trial(0, &0u64, ok, &single, Duration::ZERO).await,
            Err(RaceError::InvalidTimeout)
        ));
        assert!(matches!(
            run_trial(0, &0u64, ok, &single, Duration::MAX).await,
            Err(RaceError::InvalidTimeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_always_within_budget() {
        let observers = as_observers(&[
            Arc::new(Scripted::new("a", Some(0))),
            Arc::new(Scripted::new("b", Some(999))),
            Arc::new(Scripted::new("c", Some(1000))),
            Arc::new(Scripted::new("d", Some(1001))),
            Arc::new(Scripted::new("e", None)),
        ]);
        let timeout = Duration::from_millis(1000);
        let result = run_trial(0, &0u64, || async { Ok(submission()) }, &observers, timeout)
            .await
            .unwrap();
        for obs in result.observations() {
            assert!(obs.elapsed <= timeout, "{} exceeded budget", obs.strategy);
        }
        assert_eq!(result.get("a").unwrap().elapsed, Duration::ZERO);
    }
}
