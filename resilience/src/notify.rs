//! Fire-and-forget notifications to UI subscribers.
//!
//! Delivery is never allowed to influence retry or reconnection control
//! flow: [`notify`] is the only call site used by the engine, and it logs and
//! drops every failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::NotifyError;
use crate::store::SessionStatus;

/// Hint attached to terminal reconnection failures.
pub const MANUAL_RECONNECT_HINT: &str =
    "Automatic reconnection gave up. Reconnect the account manually to resume.";

/// Events published by the reconnection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectionEvent {
    /// An attempt is about to start (after its backoff sleep, if any).
    Reconnecting {
        account_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// The chain finished with a live session.
    Reconnected {
        account_id: String,
        account_name: Option<String>,
        status: SessionStatus,
        attempts: u32,
    },
    /// The chain gave up; a manual reconnect is required.
    ReconnectionFailed {
        account_id: String,
        account_name: Option<String>,
        reason: String,
        attempts: u32,
        hint: String,
    },
}

impl ReconnectionEvent {
    pub fn account_id(&self) -> &str {
        match self {
            ReconnectionEvent::Reconnecting { account_id, .. }
            | ReconnectionEvent::Reconnected { account_id, .. }
            | ReconnectionEvent::ReconnectionFailed { account_id, .. } => account_id,
        }
    }
}

/// A published event together with the channel it went to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub event: ReconnectionEvent,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, channel: &str, event: &ReconnectionEvent) -> Result<(), NotifyError>;
}

/// Publish `event`, logging instead of returning any failure.
pub async fn notify(sink: &dyn NotificationSink, channel: &str, event: &ReconnectionEvent) {
    match sink.publish(channel, event).await {
        Ok(()) => {}
        Err(NotifyError::NoSubscribers { .. }) => {
            tracing::debug!(channel, account_id = event.account_id(), "no subscribers for event");
        }
        Err(e) => {
            tracing::warn!(
                channel,
                account_id = event.account_id(),
                "failed to publish reconnection event: {e}"
            );
        }
    }
}

/// Channel naming: owner-scoped when the owner is known.
pub fn channel_for(account_id: &str, owner_id: Option<&str>) -> String {
    match owner_id {
        Some(owner) => format!("owner:{owner}"),
        None => format!("account:{account_id}"),
    }
}

/// In-process sink backed by a `tokio::sync::broadcast` channel.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn publish(&self, channel: &str, event: &ReconnectionEvent) -> Result<(), NotifyError> {
        self.tx
            .send(Envelope {
                channel: channel.to_string(),
                event: event.clone(),
            })
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers {
                channel: channel.to_string(),
            })
    }
}
