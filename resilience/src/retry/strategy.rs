//! Bounded retry loops
//!
//! Every loop follows the same shape: run the operation, classify the
//! failure, return it untouched if it is permanent or attempts are spent,
//! otherwise back off (scaled when throttled) and go again.

use relink_async_utils::sleep_or_cancel;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{RetryAbort, RetryConfig};
use crate::backoff::{self, BackoffPolicy};
use crate::classifier::RetryClassifiable;
use crate::error::BoxError;

/// Decide whether a failed attempt should be retried and after how long.
///
/// `attempt` is the 1-indexed number of the attempt that just failed.
pub(crate) fn next_delay<E: RetryClassifiable>(
    err: &E,
    attempt: u32,
    config: &RetryConfig,
    policy: &BackoffPolicy,
) -> Option<Duration> {
    let classification = err.classify();
    if !classification.retryable {
        tracing::debug!(
            attempt,
            class = %classification.class,
            "not retrying permanent error: {err}"
        );
        return None;
    }
    if attempt > config.max_retries {
        tracing::warn!(attempt, "retries exhausted: {err}");
        return None;
    }

    let mut delay = policy.delay(attempt - 1);
    if classification.throttled {
        delay = backoff::scale(delay, config.throttle_multiplier);
    }
    tracing::info!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        throttled = classification.throttled,
        "retrying after error: {err}"
    );
    Some(delay)
}

/// Run the `on_retry` hook; a failing hook is logged and otherwise ignored.
fn run_hook<E, H>(hook: &mut H, err: &E, attempt: u32, delay: Duration)
where
    H: FnMut(&E, u32, Duration) -> Result<(), BoxError>,
{
    if let Err(hook_err) = hook(err, attempt, delay) {
        tracing::warn!(attempt, "on_retry hook failed: {hook_err}");
    }
}

/// Execute `operation` with bounded retries.
///
/// Total attempts are `config.max_retries + 1`. The returned error is the
/// operation's own last error.
pub async fn retry<F, Fut, T, E>(operation: F, config: &RetryConfig) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassifiable,
{
    retry_with_hook(operation, config, |_: &E, _, _| Ok(())).await
}

/// [`retry`] with an `on_retry(error, attempt, delay)` hook invoked before
/// each backoff sleep.
pub async fn retry_with_hook<F, Fut, T, E, H>(
    mut operation: F,
    config: &RetryConfig,
    mut on_retry: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassifiable,
    H: FnMut(&E, u32, Duration) -> Result<(), BoxError>,
{
    let policy = config.backoff();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(delay) = next_delay(&err, attempt, config, &policy) else {
            return Err(err);
        };
        run_hook(&mut on_retry, &err, attempt, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Execute with retry, stopping as soon as `cancel` fires.
///
/// Cancellation is checked before each attempt and interrupts backoff
/// sleeps; an attempt already running is allowed to finish.
pub async fn retry_cancellable<F, Fut, T, E>(
    mut operation: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<T, RetryAbort<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassifiable,
{
    let policy = config.backoff();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryAbort::Cancelled);
        }

        attempt = attempt.saturating_add(1);
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(delay) = next_delay(&err, attempt, config, &policy) else {
            return Err(RetryAbort::Failed(err));
        };
        if sleep_or_cancel(delay, cancel).await.is_err() {
            tracing::debug!(attempt, "retry cancelled during backoff");
            return Err(RetryAbort::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            throttle_multiplier: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_calls_once() {
        let calls = AtomicU32::new(0);

        let result = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SessionError>(42)
            },
            &RetryConfig::default(),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_fails_fast_without_sleeping() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SessionError::new("Invalid credentials"))
            },
            &RetryConfig::default(),
        )
        .await;

        assert_eq!(result.unwrap_err().message, "Invalid credentials");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SessionError::new("unexpected payload shape"))
            },
            &fast_config(5),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_then_success_takes_four_calls() {
        let calls = AtomicU32::new(0);

        let result = retry(
            || async {
                let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if current <= 3 {
                    Err(SessionError::new("read ECONNRESET"))
                } else {
                    Ok("synced")
                }
            },
            &RetryConfig {
                max_retries: 5,
                ..RetryConfig::default()
            },
        )
        .await;

        assert_eq!(result.unwrap(), "synced");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error_after_max_retries_plus_one() {
        let calls = AtomicU32::new(0);

        let result = retry(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(SessionError::new(format!("socket hang up #{n}")))
            },
            &fast_config(3),
        )
        .await;

        assert_eq!(result.unwrap_err().message, "socket hang up #4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_between_attempts() {
        let times = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let _ = retry(
            || {
                let times = Arc::clone(&times);
                async move {
                    times.lock().unwrap().push(start.elapsed());
                    Err::<(), _>(SessionError::new("timed out"))
                }
            },
            &fast_config(3),
        )
        .await;

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 4);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        // 10ms, 20ms, 40ms plus up to 20% jitter each
        for (gap, floor) in gaps.iter().zip([10u64, 20, 40]) {
            assert!(*gap >= Duration::from_millis(floor), "gap {gap:?} < {floor}ms");
            assert!(*gap <= Duration::from_millis(floor * 12 / 10 + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_errors_wait_longer() {
        let times = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let _ = retry(
            || {
                let times = Arc::clone(&times);
                async move {
                    times.lock().unwrap().push(start.elapsed());
                    Err::<(), _>(SessionError::new("429 Too Many Requests"))
                }
            },
            &fast_config(1),
        )
        .await;

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn hook_sees_each_retry_and_its_failures_are_swallowed() {
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());

        let result = retry_with_hook(
            || async {
                let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if current < 3 {
                    Err(SessionError::new("connection lost"))
                } else {
                    Ok(7)
                }
            },
            &fast_config(5),
            |err: &SessionError, attempt, delay| {
                seen.lock().unwrap().push((attempt, err.message.clone(), delay));
                Err("hook exploded".into())
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        let seen = seen.lock().unwrap();
        let attempts: Vec<u32> = seen.iter().map(|(a, _, _)| *a).collect();
        assert_eq!(attempts, vec![1, 2]);
        assert!(seen.iter().all(|(_, msg, _)| msg == "connection lost"));
        assert!(seen[1].2 >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_stops_before_first_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = retry_cancellable(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SessionError>(1)
            },
            &RetryConfig::default(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(RetryAbort::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_interrupts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let counter = Arc::clone(&calls);
        let result = retry_cancellable(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SessionError::new("socket closed"))
                }
            },
            &RetryConfig::default(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(RetryAbort::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellable_surfaces_permanent_errors_unmodified() {
        let cancel = CancellationToken::new();

        let result = retry_cancellable(
            || async { Err::<(), _>(SessionError::new("NO [NONEXISTENT] Unknown Mailbox")) },
            &RetryConfig::default(),
            &cancel,
        )
        .await;

        let err = result.unwrap_err().into_failure().unwrap();
        assert_eq!(err.message, "NO [NONEXISTENT] Unknown Mailbox");
    }
}
