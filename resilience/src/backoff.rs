//! Exponential backoff with additive jitter.
//!
//! Stateless: every delay is computed from the attempt number alone, so the
//! same policy can be shared by retry loops, the reconnection manager, and
//! tests. Throttle multipliers are a caller concern.

use rand::Rng;
use std::time::Duration;

/// Upper bound of the jitter added on top of the computed delay (20%).
pub const JITTER_FACTOR: f64 = 0.2;

/// Exponent ceiling; `2^40` ms is far beyond any sane cap already.
const MAX_EXPONENT: i32 = 40;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, multiplier: f64) -> Self {
        Self {
            base,
            cap,
            multiplier,
        }
    }

    /// `min(base * multiplier^attempt, cap)` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX).min(MAX_EXPONENT);
        let scaled = self.base.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let cap_ms = self.cap.as_millis() as f64;
        Duration::from_millis(scaled.min(cap_ms).floor() as u64)
    }

    /// Jittered delay for `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay(attempt))
    }
}

/// `delay(attempt, base, cap, multiplier)` as a free function.
pub fn delay(attempt: u32, base: Duration, cap: Duration, multiplier: f64) -> Duration {
    BackoffPolicy::new(base, cap, multiplier).delay(attempt)
}

/// Add uniform jitter in `[0, JITTER_FACTOR]` of `duration`, floored to whole
/// milliseconds. Jitter only ever lengthens a delay.
pub fn apply_jitter(duration: Duration) -> Duration {
    let base_ms = duration.as_millis() as f64;
    let jitter = rand::rng().random_range(0.0..=JITTER_FACTOR);
    Duration::from_millis((base_ms * (1.0 + jitter)).floor() as u64)
}

/// Scale a delay by a throttle multiplier.
pub fn scale(duration: Duration, factor: u32) -> Duration {
    duration.saturating_mul(factor.max(1))
}
