pub mod channel;

pub use channel::{ChannelOptions, Notification, NotificationChannel, Subscription};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("no acknowledgement for {method} within {timeout_ms}ms")]
    AckTimeout { method: String, timeout_ms: u64 },
    #[error("provider rejected {method}: {message}")]
    Rejected { method: String, message: String },
    #[error("unexpected acknowledgement: {0}")]
    BadAck(String),
}

/// Subscribe / unsubscribe capability consumed by streaming observers.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self, params: Value) -> Result<Subscription, ChannelError>;
    async fn unsubscribe(&self, id: &str) -> Result<bool, ChannelError>;
}

#[async_trait]
impl NotificationSource for NotificationChannel {
    async fn subscribe(&self, params: Value) -> Result<Subscription, ChannelError> {
        NotificationChannel::subscribe(self, params).await
    }

    async fn unsubscribe(&self, id: &str) -> Result<bool, ChannelError> {
        NotificationChannel::unsubscribe(self, id).await
    }
}
