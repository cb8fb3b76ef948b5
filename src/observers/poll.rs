//! Fixed-cadence polling observers.

use crate::chain::{tag_label, ReceiptQuery, StateQuery};
use crate::harness::{Detection, Observer, ObserverError, StrategyKind, TrialContext};
use alloy::eips::BlockNumberOrTag;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, warn};

/// Reference polling cadence.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(100);

/// One query against the current state.
///
/// Returns `Ok(Some(value))` once the state differs from the baseline,
/// `Ok(None)` while it does not.
#[async_trait]
pub trait Probe<B: Sync>: Send + Sync {
    async fn probe(&self, ctx: &TrialContext<'_, B>) -> Result<Option<serde_json::Value>, ObserverError>;
}

/// Re-runs a `Probe` every `cadence` until it reports a change or the
/// trial's deadline passes.
pub struct PollingObserver<P> {
    name: String,
    probe: P,
    cadence: Duration,
}

impl<P> PollingObserver<P> {
    pub fn new(name: impl Into<String>, probe: P, cadence: Duration) -> Self {
        Self {
            name: name.into(),
            probe,
            cadence,
        }
    }
}

#[async_trait]
impl<B, P> Observer<B> for PollingObserver<P>
where
    B: Sync,
    P: Probe<B>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Polling
    }

    async fn observe(&self, ctx: &TrialContext<'_, B>) -> Result<Detection, ObserverError> {
        let mut attempts: u32 = 0;
        let mut failures: u32 = 0;

        loop {
            attempts += 1;
            match self.probe.probe(ctx).await {
                Ok(Some(value)) => {
                    debug!(trial = ctx.trial, strategy = %self.name, attempts, failures, "state changed");
                    return Ok(Detection::Found {
                        at: Instant::now(),
                        value: Some(value),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    // Transient: retried on the next tick.
                    failures += 1;
                    warn!(trial = ctx.trial, strategy = %self.name, attempt = attempts, error = %e, "poll failed");
                }
            }

            let next = Instant::now() + self.cadence;
            if next >= ctx.deadline {
                sleep_until(ctx.deadline).await;
                debug!(trial = ctx.trial, strategy = %self.name, attempts, failures, "deadline reached");
                return Ok(Detection::Deadline);
            }
            sleep_until(next).await;
        }
    }
}

/// Detects a nonce above the baseline nonce at a given tag. A lower nonce
/// (an earlier transfer not yet visible at this tag) is not a change.
pub struct NonceProbe {
    query: Arc<dyn StateQuery>,
    tag: BlockNumberOrTag,
}

impl NonceProbe {
    pub fn new(query: Arc<dyn StateQuery>, tag: BlockNumberOrTag) -> Self {
        Self { query, tag }
    }

    /// `nonce-<tag>`, e.g. `nonce-pending`.
    pub fn strategy_name(&self) -> String {
        format!("nonce-{}", tag_label(&self.tag))
    }
}

#[async_trait]
impl Probe<u64> for NonceProbe {
    async fn probe(&self, ctx: &TrialContext<'_, u64>) -> Result<Option<serde_json::Value>, ObserverError> {
        let nonce = self
            .query
            .nonce(ctx.submission.sender, self.tag)
            .await
            .map_err(|e| ObserverError::Query(e.to_string()))?;
        if nonce > *ctx.baseline {
            Ok(Some(serde_json::json!(nonce)))
        } else {
            Ok(None)
        }
    }
}

/// Detects that a receipt for the submitted transaction exists.
pub struct ReceiptProbe {
    query: Arc<dyn ReceiptQuery>,
}

impl ReceiptProbe {
    pub fn new(query: Arc<dyn ReceiptQuery>) -> Self {
        Self { query }
    }
}

#[async_trait]
impl<B: Sync> Probe<B> for ReceiptProbe {
    async fn probe(&self, ctx: &TrialContext<'_, B>) -> Result<Option<serde_json::Value>, ObserverError> {
        self.query
            .receipt(ctx.submission.id)
            .await
            .map_err(|e| ObserverError::Query(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::harness::Submission;
    use alloy::primitives::{Address, B256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves one scripted nonce per call; the last one repeats.
    struct ScriptedNonces {
        script: Mutex<Vec<Result<u64, &'static str>>>,
        calls: AtomicUsize,
        tags: Mutex<Vec<BlockNumberOrTag>>,
    }

    impl ScriptedNonces {
        fn new(script: Vec<Result<u64, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                tags: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StateQuery for ScriptedNonces {
        async fn nonce(&self, _address: Address, tag: BlockNumberOrTag) -> Result<u64, ChainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tags.lock().unwrap().push(tag);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 { script.remove(0) } else { script[0] };
            next.map_err(|e| ChainError::Key(e.to_string()))
        }
    }

    struct ReceiptAfter {
        calls: AtomicUsize,
        available_from: usize,
    }

    #[async_trait]
    impl ReceiptQuery for ReceiptAfter {
        async fn receipt(&self, id: B256) -> Result<Option<serde_json::Value>, ChainError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.available_from {
                Ok(Some(serde_json::json!({ "transactionHash": id.to_string(), "status": "0x1" })))
            } else {
                Ok(None)
            }
        }
    }

    fn submission() -> Submission {
        Submission {
            id: B256::repeat_byte(0x42),
            sender: Address::repeat_byte(0x07),
        }
    }

    async fn observe_nonces(
        script: Vec<Result<u64, &'static str>>,
        baseline: u64,
        timeout: Duration,
    ) -> (Detection, Instant, Arc<ScriptedNonces>) {
        let query = ScriptedNonces::new(script);
        let observer = PollingObserver::new(
            "nonce-pending",
            NonceProbe::new(query.clone(), BlockNumberOrTag::Pending),
            DEFAULT_CADENCE,
        );
        let submission = submission();
        let start = Instant::now();
        let ctx = TrialContext {
            trial: 0,
            baseline: &baseline,
            submission: &submission,
            start,
            deadline: start + timeout,
        };
        let detection = Observer::<u64>::observe(&observer, &ctx).await.unwrap();
        (detection, start, query)
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_change_is_near_zero() {
        let (detection, start, query) =
            observe_nonces(vec![Ok(6)], 5, Duration::from_secs(5)).await;
        match detection {
            Detection::Found { at, value } => {
                assert!(at.duration_since(start) < DEFAULT_CADENCE);
                assert_eq!(value, Some(serde_json::json!(6)));
            }
            other => panic!("expected detection, got {other:?}"),
        }
        assert_eq!(query.calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.tags.lock().unwrap()[0], BlockNumberOrTag::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_after_three_ticks() {
        let (detection, start, _) =
            observe_nonces(vec![Ok(5), Ok(5), Ok(5), Ok(6)], 5, Duration::from_secs(5)).await;
        match detection {
            Detection::Found { at, .. } => {
                assert_eq!(at.duration_since(start), Duration::from_millis(300))
            }
            other => panic!("expected detection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_times_out_at_deadline() {
        let timeout = Duration::from_millis(1000);
        let (detection, start, query) = observe_nonces(vec![Ok(5)], 5, timeout).await;
        assert_eq!(detection, Detection::Deadline);
        assert_eq!(Instant::now().duration_since(start), timeout);
        // Probes at 0, 100, .., 900ms.
        assert_eq!(query.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_nonce_is_not_a_change() {
        let timeout = Duration::from_millis(500);
        let (detection, start, _) = observe_nonces(vec![Ok(4), Ok(4), Ok(5), Ok(6)], 5, timeout).await;
        match detection {
            Detection::Found { at, value } => {
                assert_eq!(at.duration_since(start), Duration::from_millis(300));
                assert_eq!(value, Some(serde_json::json!(6)));
            }
            other => panic!("expected detection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_errors_are_retried() {
        let (detection, start, query) = observe_nonces(
            vec![Err("connection reset"), Err("429 Too Many Requests"), Ok(6)],
            5,
            Duration::from_secs(5),
        )
        .await;
        match detection {
            Detection::Found { at, .. } => {
                assert_eq!(at.duration_since(start), Duration::from_millis(200))
            }
            other => panic!("expected detection, got {other:?}"),
        }
        assert_eq!(query.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_errors_end_in_deadline() {
        let timeout = Duration::from_millis(450);
        let (detection, _, _) = observe_nonces(vec![Err("connection refused")], 5, timeout).await;
        assert_eq!(detection, Detection::Deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_probe_detects_receipt() {
        let query = Arc::new(ReceiptAfter {
            calls: AtomicUsize::new(0),
            available_from: 2,
        });
        let observer = PollingObserver::new("receipt", ReceiptProbe::new(query), DEFAULT_CADENCE);
        let submission = submission();
        let start = Instant::now();
        let ctx = TrialContext {
            trial: 0,
            baseline: &(),
            submission: &submission,
            start,
            deadline: start + Duration::from_secs(2),
        };

        match Observer::<()>::observe(&observer, &ctx).await.unwrap() {
            Detection::Found { at, value } => {
                assert_eq!(at.duration_since(start), Duration::from_millis(200));
                assert_eq!(value.unwrap()["status"], "0x1");
            }
            other => panic!("expected detection, got {other:?}"),
        }
    }

    #[test]
    fn test_nonce_strategy_names() {
        let query = ScriptedNonces::new(vec![Ok(0)]);
        assert_eq!(
            NonceProbe::new(query.clone(), BlockNumberOrTag::Pending).strategy_name(),
            "nonce-pending"
        );
        assert_eq!(
            NonceProbe::new(query, BlockNumberOrTag::Latest).strategy_name(),
            "nonce-latest"
        );
    }
}
