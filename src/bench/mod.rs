//! Benchmark runner: one test transfer per trial, every strategy racing to
//! see it.
//!
//! Per trial:
//! 1. read the baseline nonce at `pending`
//! 2. run the trial (observers arm, the transfer is sent, observers race)
//! 3. record the result, wait out the cooldown
//!
//! A failure in any step is recorded against that trial and the run moves
//! on; the run always completes with whatever it gathered.

use crate::chain::{ReceiptQuery, StateQuery, TransactionSubmitter};
use crate::config::Config;
use crate::harness::{run_trial, BenchmarkRun, Observer};
use crate::observers::{NonceProbe, PollingObserver, ReceiptProbe, SubscriptionObserver};
use crate::ws::NotificationSource;
use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub trials: u64,
    pub timeout: Duration,
    pub cooldown: Duration,
    /// `None` sends to the sender itself.
    pub recipient: Option<Address>,
    pub amount_wei: U256,
}

impl RunPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trials: config.bench.trials,
            timeout: Duration::from_millis(config.bench.timeout_ms),
            cooldown: Duration::from_millis(config.bench.cooldown_ms),
            recipient: config.wallet.recipient,
            amount_wei: config.wallet.amount_wei,
        }
    }
}

/// Name of the subscription strategy in reports.
pub const PUSH_STRATEGY: &str = "push";

/// Strategies in report order: one nonce poller per configured tag, the
/// receipt poller, then the subscription observer when a source is given.
pub fn build_observers(
    config: &Config,
    state: Arc<dyn StateQuery>,
    receipts: Arc<dyn ReceiptQuery>,
    source: Option<Arc<dyn NotificationSource>>,
) -> Vec<Arc<dyn Observer<u64>>> {
    let cadence = Duration::from_millis(config.bench.poll_interval_ms);
    let mut observers: Vec<Arc<dyn Observer<u64>>> = Vec::new();

    for tag in &config.bench.nonce_tags {
        let probe = NonceProbe::new(state.clone(), *tag);
        observers.push(Arc::new(PollingObserver::new(probe.strategy_name(), probe, cadence)));
    }
    if config.bench.receipt_poll {
        observers.push(Arc::new(PollingObserver::new(
            "receipt",
            ReceiptProbe::new(receipts),
            cadence,
        )));
    }
    if let Some(source) = source {
        observers.push(Arc::new(SubscriptionObserver::new(
            PUSH_STRATEGY,
            source,
            config.subscription.params.clone(),
            config.subscription.matcher,
        )));
    }
    observers
}

pub struct Benchmark {
    plan: RunPlan,
    submitter: Arc<dyn TransactionSubmitter>,
    state: Arc<dyn StateQuery>,
    observers: Vec<Arc<dyn Observer<u64>>>,
}

impl Benchmark {
    pub fn new(
        plan: RunPlan,
        submitter: Arc<dyn TransactionSubmitter>,
        state: Arc<dyn StateQuery>,
        observers: Vec<Arc<dyn Observer<u64>>>,
    ) -> Self {
        Self {
            plan,
            submitter,
            state,
            observers,
        }
    }

    pub fn strategies(&self) -> Vec<&str> {
        self.observers.iter().map(|o| o.name()).collect()
    }

    pub async fn run(&self) -> BenchmarkRun {
        let sender = self.submitter.sender();
        let to = self.plan.recipient.unwrap_or(sender);
        let mut run = BenchmarkRun::new();

        info!(
            trials = self.plan.trials,
            timeout_ms = self.plan.timeout.as_millis() as u64,
            strategies = ?self.strategies(),
            sender = %sender,
            to = %to,
            "benchmark starting"
        );

        for trial in 0..self.plan.trials {
            let baseline = match self.state.nonce(sender, BlockNumberOrTag::Pending).await {
                Ok(nonce) => nonce,
                Err(e) => {
                    error!(trial, error = %e, "could not read baseline nonce");
                    run.record_failure(trial, format!("baseline query failed: {e}"));
                    self.cooldown(trial).await;
                    continue;
                }
            };
            info!(trial, baseline, "trial starting");

            let submitter = self.submitter.clone();
            let amount = self.plan.amount_wei;
            let outcome = run_trial(
                trial,
                &baseline,
                move || async move { submitter.submit(to, amount).await.map_err(anyhow::Error::from) },
                &self.observers,
                self.plan.timeout,
            )
            .await;
            run.record(trial, outcome);

            self.cooldown(trial).await;
        }

        info!(
            completed = run.results().len(),
            failed = run.failures().len(),
            "benchmark finished"
        );
        run
    }

    async fn cooldown(&self, trial: u64) {
        if trial + 1 < self.plan.trials && !self.plan.cooldown.is_zero() {
            tokio::time::sleep(self.plan.cooldown).await;
        }
    }
}
