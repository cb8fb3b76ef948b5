//! Push-subscription observer.
//!
//! Subscribes when armed (before the trigger fires), then waits for the
//! first notification that refers to the trial's submission. Arrival time is
//! the reader's receive stamp, not the time this observer dequeued it.

use crate::harness::{Detection, Observer, ObserverError, StrategyKind, Submission, TrialContext};
use crate::ws::{Notification, NotificationSource};
use alloy::primitives::B256;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

/// Which notifications count as detecting the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMatch {
    /// The payload carries the submission's transaction hash, either as a
    /// bare string (`newPendingTransactions`) or as `hash`,
    /// `transactionHash` or `transaction.hash` of an object.
    TxHash,
    /// Any notification received after the trial started (`newHeads`).
    Any,
}

impl NotificationMatch {
    pub fn matches(&self, payload: &Value, submission: &Submission) -> bool {
        match self {
            Self::Any => true,
            Self::TxHash => payload_tx_hash(payload) == Some(submission.id),
        }
    }
}

fn payload_tx_hash(payload: &Value) -> Option<B256> {
    let hash = match payload {
        Value::String(s) => s.as_str(),
        Value::Object(_) => payload
            .get("hash")
            .or_else(|| payload.get("transactionHash"))
            .or_else(|| payload.pointer("/transaction/hash"))
            .and_then(Value::as_str)?,
        _ => return None,
    };
    hash.parse().ok()
}

/// Records the first detection of a trial. Later notifications are kept in
/// a secondary log and never move the first timestamp.
#[derive(Debug, Default)]
pub struct FirstDetection {
    first: Option<(Instant, Value)>,
    late: Vec<(Instant, Value)>,
}

impl FirstDetection {
    /// Returns `true` only for the call that set the first detection.
    pub fn record(&mut self, at: Instant, payload: Value) -> bool {
        if self.first.is_none() {
            self.first = Some((at, payload));
            true
        } else {
            self.late.push((at, payload));
            false
        }
    }

    pub fn first(&self) -> Option<(Instant, &Value)> {
        self.first.as_ref().map(|(at, payload)| (*at, payload))
    }

    pub fn elapsed_since(&self, start: Instant) -> Option<Duration> {
        self.first.as_ref().map(|(at, _)| at.saturating_duration_since(start))
    }

    pub fn late(&self) -> &[(Instant, Value)] {
        &self.late
    }
}

struct Armed {
    subscription: String,
    notifications: Mutex<mpsc::UnboundedReceiver<Notification>>,
    detection: std::sync::Mutex<FirstDetection>,
}

impl Armed {
    fn record(&self, notification: &Notification) -> bool {
        self.detection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(notification.received_at, notification.payload.clone())
    }
}

/// Streaming strategy over a shared notification source.
pub struct SubscriptionObserver {
    name: String,
    source: Arc<dyn NotificationSource>,
    params: Value,
    matcher: NotificationMatch,
    armed: DashMap<u64, Arc<Armed>>,
}

impl SubscriptionObserver {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn NotificationSource>,
        params: Value,
        matcher: NotificationMatch,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            params,
            matcher,
            armed: DashMap::new(),
        }
    }
}

#[async_trait]
impl<B: Sync> Observer<B> for SubscriptionObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Streaming
    }

    async fn arm(&self, trial: u64) -> Result<(), ObserverError> {
        let sub = self
            .source
            .subscribe(self.params.clone())
            .await
            .map_err(|e| ObserverError::Subscribe(e.to_string()))?;
        debug!(trial, strategy = %self.name, subscription = %sub.id, "armed");
        self.armed.insert(
            trial,
            Arc::new(Armed {
                subscription: sub.id,
                notifications: Mutex::new(sub.notifications),
                detection: std::sync::Mutex::new(FirstDetection::default()),
            }),
        );
        Ok(())
    }

    async fn observe(&self, ctx: &TrialContext<'_, B>) -> Result<Detection, ObserverError> {
        let armed = self
            .armed
            .get(&ctx.trial)
            .map(|entry| entry.value().clone())
            .ok_or(ObserverError::NotArmed(ctx.trial))?;
        let mut notifications = armed.notifications.lock().await;
        let mut ignored: u64 = 0;

        loop {
            let notification = match timeout_at(ctx.deadline, notifications.recv()).await {
                Err(_) => {
                    debug!(trial = ctx.trial, strategy = %self.name, ignored, "deadline reached");
                    return Ok(Detection::Deadline);
                }
                Ok(None) => return Err(ObserverError::ChannelClosed),
                Ok(Some(notification)) => notification,
            };

            // Anything that arrived before the trial started belongs to no trial.
            if notification.received_at < ctx.start
                || !self.matcher.matches(&notification.payload, ctx.submission)
            {
                ignored += 1;
                continue;
            }

            if armed.record(&notification) {
                return Ok(Detection::Found {
                    at: notification.received_at,
                    value: Some(notification.payload),
                });
            }
        }
    }

    async fn disarm(&self, trial: u64) {
        let Some((_, armed)) = self.armed.remove(&trial) else {
            return;
        };

        // Whatever is still queued arrived after the first detection or the deadline.
        let mut late = armed
            .detection
            .lock()
            .map(|d| d.late().len())
            .unwrap_or_default();
        if let Ok(mut queued) = armed.notifications.try_lock() {
            while queued.try_recv().is_ok() {
                late += 1;
            }
        }

        match self.source.unsubscribe(&armed.subscription).await {
            Ok(removed) => info!(
                trial,
                strategy = %self.name,
                subscription = %armed.subscription,
                removed,
                late,
                "disarmed"
            ),
            Err(e) => warn!(
                trial,
                strategy = %self.name,
                subscription = %armed.subscription,
                error = %e,
                "unsubscribe failed"
            ),
        }
    }
}
