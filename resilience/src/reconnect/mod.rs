//! Chat-session reconnection
//!
//! - `circuit_breaker`: per-account consecutive-failure breaker
//! - `registry`: attempt records and circuits, injected into the manager
//! - `manager`: the reconnection state machine

pub mod circuit_breaker;
pub mod manager;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use manager::{ChatConnector, ConnectOutcome, ReconnectOutcome, ReconnectionManager};
pub use registry::{ChainTicket, ReconnectionRegistry, ReconnectionStatus};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Reconnection manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before attempt 2, doubling for later attempts
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_breaker_timeout_ms")]
    pub circuit_breaker_timeout_ms: u64,

    /// A heartbeat younger than this means another instance owns the account
    #[serde(default = "default_heartbeat_freshness_ms")]
    pub heartbeat_freshness_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    2_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_timeout_ms() -> u64 {
    60_000
}
fn default_heartbeat_freshness_ms() -> u64 {
    45_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout_ms: default_circuit_breaker_timeout_ms(),
            heartbeat_freshness_ms: default_heartbeat_freshness_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    pub fn heartbeat_freshness(&self) -> Duration {
        Duration::from_millis(self.heartbeat_freshness_ms)
    }
}
