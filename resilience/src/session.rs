//! Session abstraction shared by the pool and the retry executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Observed health of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliveState {
    Alive,
    /// Transport is up but the handle outlived the pool's connection timeout.
    Stale,
    /// Transport closed or destroyed.
    Dead,
}

impl AliveState {
    /// Combine the transport probe with the staleness timer.
    pub fn evaluate(transport_alive: bool, age: Duration, max_age: Duration) -> Self {
        if !transport_alive {
            AliveState::Dead
        } else if age > max_age {
            AliveState::Stale
        } else {
            AliveState::Alive
        }
    }
}

/// A live handle to an established protocol connection.
///
/// Implemented by the chat and mailbox protocol layers. `is_alive` must be a
/// cheap, non-blocking probe of the underlying transport (closed or destroyed
/// socket means dead); `close` must be idempotent.
#[async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    fn account_id(&self) -> &str;

    fn is_alive(&self) -> bool;

    async fn close(&self);
}
