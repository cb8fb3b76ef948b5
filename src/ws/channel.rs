//! JSON-RPC subscription channel over one persistent WebSocket.
//!
//! Speaks `eth_subscribe` / `eth_unsubscribe` to an Ethereum node and fans
//! `eth_subscription` notifications out to per-subscription receivers.
//!
//! Subscribing is a handshake: the request is sent, the reader task receives
//! the provider's acknowledgement, registers the handler for the returned
//! subscription id and only then reads the next frame. A notification that
//! immediately follows the acknowledgement therefore always finds its
//! handler. Notifications for ids with no handler are logged and counted,
//! never silently discarded.
//!
//! Every notification is stamped with the `Instant` the reader received it,
//! so consumers measure arrival time rather than the time they got around to
//! reading their queue.

use crate::ws::ChannelError;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, error, info, warn};

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// How long to wait for the provider to acknowledge a request.
    pub ack_timeout: Duration,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// One pushed notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subscription: String,
    pub payload: Value,
    pub received_at: Instant,
}

/// A live subscription. Dropping it does not unsubscribe; call
/// `NotificationChannel::unsubscribe` with `id`.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value, String>>,
    /// Registered under the acknowledged subscription id.
    handler: Option<mpsc::UnboundedSender<Notification>>,
}

#[derive(Default)]
struct Dispatch {
    pending: DashMap<u64, PendingRequest>,
    subscriptions: DashMap<String, mpsc::UnboundedSender<Notification>>,
    /// Requests abandoned after an ack timeout, by request id.
    expired: DashMap<u64, String>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Dispatch {
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Dispatch one frame. Returns the ids of subscriptions the provider
    /// acknowledged after their request had already timed out; nobody
    /// listens on those, so the caller cancels them.
    fn handle_text(&self, text: &str, received_at: Instant) -> Vec<String> {
        let mut orphans = Vec::new();
        let val: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unparseable frame");
                return orphans;
            }
        };

        match val {
            Value::Array(items) => {
                for item in items {
                    self.handle_value(item, received_at, &mut orphans);
                }
            }
            other => self.handle_value(other, received_at, &mut orphans),
        }
        orphans
    }

    fn handle_value(&self, val: Value, received_at: Instant, orphans: &mut Vec<String>) {
        if val.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            let params = val.get("params");
            let subscription = params
                .and_then(|p| p.get("subscription"))
                .and_then(Value::as_str);
            let payload = params
                .and_then(|p| p.get("result"))
                .cloned()
                .unwrap_or(Value::Null);
            match subscription {
                Some(sub) => self.deliver(sub, payload, received_at),
                None => {
                    let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(dropped, "notification without subscription id");
                }
            }
            return;
        }

        let Some(id) = val.get("id").and_then(Value::as_u64) else {
            debug!(frame = %val, "unhandled frame");
            return;
        };
        let Some((_, pending)) = self.pending.remove(&id) else {
            match self.expired.remove(&id) {
                Some((_, method)) if method == "eth_subscribe" => {
                    if let Some(sub) = val.get("result").and_then(Value::as_str) {
                        warn!(id, subscription = sub, "subscription acknowledged after timeout, cancelling");
                        orphans.push(sub.to_string());
                    }
                }
                _ => debug!(id, "response for unknown or expired request"),
            }
            return;
        };

        if let Some(err) = val.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            warn!(id, method = %pending.method, error = %message, "request rejected");
            let _ = pending.reply.send(Err(message));
            return;
        }

        let result = val.get("result").cloned().unwrap_or(Value::Null);
        if let (Some(handler), Some(sub)) = (pending.handler, result.as_str()) {
            self.subscriptions.insert(sub.to_string(), handler);
            debug!(id, subscription = sub, "handler registered");
        }
        let _ = pending.reply.send(Ok(result));
    }

    fn deliver(&self, sub: &str, payload: Value, received_at: Instant) {
        let delivered = match self.subscriptions.get(sub) {
            Some(handler) => handler
                .send(Notification {
                    subscription: sub.to_string(),
                    payload,
                    received_at,
                })
                .is_ok(),
            None => {
                let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(subscription = sub, dropped, "notification for unregistered subscription");
                return;
            }
        };

        if !delivered {
            self.subscriptions.remove(sub);
            debug!(subscription = sub, "listener gone, handler removed");
        }
    }

    /// Fail every waiter once the connection is gone.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the reply senders wakes every pending request with `Closed`.
        self.pending.clear();
        // Dropping the handlers ends every subscription stream.
        self.subscriptions.clear();
        self.expired.clear();
    }
}

/// The process-wide notification connection.
pub struct NotificationChannel {
    url: String,
    options: ChannelOptions,
    outbound: mpsc::UnboundedSender<Message>,
    dispatch: Arc<Dispatch>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl NotificationChannel {
    pub async fn connect(url: &str, options: ChannelOptions) -> Result<Self, ChannelError> {
        let (ws_stream, _response) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        let dispatch = Arc::new(Dispatch::default());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(run_writer(write, outbound_rx, options.ping_interval));
        let reader = tokio::spawn(run_reader(read, dispatch.clone(), outbound.clone()));

        info!(url = %url, "notification channel connected");

        Ok(Self {
            url: url.to_string(),
            options,
            outbound,
            dispatch,
            tasks: Mutex::new(Some((reader, writer))),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Subscribe with raw `eth_subscribe` params, e.g.
    /// `["newPendingTransactions"]` or `["newHeads"]`.
    pub async fn subscribe(&self, params: Value) -> Result<Subscription, ChannelError> {
        let (handler, notifications) = mpsc::unbounded_channel();
        let ack = self.request("eth_subscribe", params, Some(handler)).await?;
        let id = ack
            .as_str()
            .ok_or_else(|| ChannelError::BadAck(ack.to_string()))?
            .to_string();
        info!(subscription = %id, "subscribed");
        Ok(Subscription { id, notifications })
    }

    /// Detach the handler, then tell the provider. Notifications that arrive
    /// in between are counted as dropped.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool, ChannelError> {
        self.dispatch.subscriptions.remove(id);
        let ack = self.request("eth_unsubscribe", json!([id]), None).await?;
        let removed = ack.as_bool().unwrap_or(false);
        debug!(subscription = id, removed, "unsubscribed");
        Ok(removed)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        handler: Option<mpsc::UnboundedSender<Notification>>,
    ) -> Result<Value, ChannelError> {
        let id = self.dispatch.next_request_id();
        let (reply, reply_rx) = oneshot::channel();
        self.dispatch.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                reply,
                handler,
            },
        );
        if self.is_closed() {
            self.dispatch.pending.remove(&id);
            return Err(ChannelError::Closed);
        }

        if self.outbound.send(request_frame(id, method, params)).is_err() {
            self.dispatch.pending.remove(&id);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(self.options.ack_timeout, reply_rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ChannelError::Rejected {
                method: method.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                if self.dispatch.pending.remove(&id).is_some() {
                    self.dispatch.expired.insert(id, method.to_string());
                }
                Err(ChannelError::AckTimeout {
                    method: method.to_string(),
                    timeout_ms: self.options.ack_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.dispatch.closed.load(Ordering::SeqCst)
    }

    /// Notifications that arrived with no registered handler.
    pub fn dropped(&self) -> u64 {
        self.dispatch.dropped.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.dispatch.subscriptions.len()
    }

    /// Send a close frame and wait briefly for the peer to finish.
    pub async fn close(&self) {
        let Some((reader, writer)) = self.tasks.lock().await.take() else {
            return;
        };
        let _ = self.outbound.send(Message::Close(None));

        let reader_abort = reader.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, reader).await.is_err() {
            reader_abort.abort();
        }
        writer.abort();
        self.dispatch.shutdown();
        info!(url = %self.url, dropped = self.dropped(), "notification channel closed");
    }
}

async fn run_writer<S>(mut write: S, mut outbound: mpsc::UnboundedReceiver<Message>, ping_every: Duration)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping = interval(ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately.
    ping.tick().await;

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "failed to send frame");
                    break;
                }
                if closing {
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    warn!(error = %e, "failed to send ping");
                    break;
                }
            }
        }
    }
}

fn request_frame(id: u64, method: &str, params: Value) -> Message {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    Message::Text(body.to_string())
}

async fn run_reader<S>(mut read: S, dispatch: Arc<Dispatch>, outbound: mpsc::UnboundedSender<Message>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let received_at = Instant::now();
        match msg {
            Ok(Message::Text(text)) => {
                for orphan in dispatch.handle_text(&text, received_at) {
                    let id = dispatch.next_request_id();
                    let _ = outbound.send(request_frame(id, "eth_unsubscribe", json!([orphan])));
                }
            }
            Ok(Message::Pong(_)) => debug!("pong received"),
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "received close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "notification channel read error");
                break;
            }
        }
    }
    dispatch.shutdown();
}
