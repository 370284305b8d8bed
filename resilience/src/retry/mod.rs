//! Retry logic with exponential backoff
//!
//! This module provides:
//! - Stateless bounded retry (`retry`, `retry_with_hook`)
//! - Cancellable retry for long-lived callers (`retry_cancellable`)
//! - Retry with connection re-acquisition (`retry_with_reconnect`) for
//!   ad-hoc, non-pooled call sites
//!
//! Classification comes from the error type's [`RetryClassifiable`] impl.
//! Permanent errors return immediately; terminal errors are always the
//! operation's own error, unmodified.
//!
//! [`RetryClassifiable`]: crate::classifier::RetryClassifiable

pub mod reconnect;
pub mod strategy;

pub use reconnect::retry_with_reconnect;
pub use strategy::{retry, retry_cancellable, retry_with_hook};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (before jitter and throttle scaling)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Extra factor applied to the delay when the error is throttling.
    #[serde(default = "default_throttle_multiplier")]
    pub throttle_multiplier: u32,
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_throttle_multiplier() -> u32 {
    2
}

impl RetryConfig {
    /// Defaults for the stateless `retry` path: 5 retries, 2s base, 60s cap.
    pub fn stateless() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            throttle_multiplier: default_throttle_multiplier(),
        }
    }

    /// Defaults for `retry_with_reconnect`: 3 retries, 3s base, 30s cap, 3x on throttling.
    pub fn with_reconnect() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 3_000,
            max_delay_ms: 30_000,
            backoff_multiplier: default_backoff_multiplier(),
            throttle_multiplier: 3,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::stateless()
    }
}

/// Outcome of a cancellable retry that did not succeed.
#[derive(Debug)]
pub enum RetryAbort<E> {
    /// The token fired; no further attempts were scheduled.
    Cancelled,
    /// The operation's own terminal error.
    Failed(E),
}

impl<E> RetryAbort<E> {
    pub fn into_failure(self) -> Option<E> {
        match self {
            RetryAbort::Cancelled => None,
            RetryAbort::Failed(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryAbort<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryAbort::Cancelled => f.write_str("retry aborted by cancellation"),
            RetryAbort::Failed(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryAbort<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryAbort::Cancelled => None,
            RetryAbort::Failed(e) => e.source(),
        }
    }
}
