//! Cancellation helpers shared by the retry and reconnection loops.
//!
//! Reconnection chains and retry loops suspend in exactly two kinds of
//! places: backoff sleeps and session I/O. Both need to stop promptly when
//! the chain is cancelled, so everything here races a future against a
//! `CancellationToken`.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Error returned when the token fired before the future finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

impl std::fmt::Display for CancelErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for CancelErr {}

/// Extension trait for making futures cancellable.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against `token`.
    ///
    /// An already-cancelled token wins even if the future is immediately
    /// ready, so callers can rely on "cancelled means nothing new started".
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// A zero duration still observes a cancelled token.
pub async fn sleep_or_cancel(
    duration: Duration,
    token: &CancellationToken,
) -> Result<(), CancelErr> {
    if token.is_cancelled() {
        return Err(CancelErr::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::time::sleep(duration).or_cancel(token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::task;
    use tokio::time::{Instant, sleep};

    #[tokio::test]
    async fn returns_ok_when_future_completes_first() {
        let token = CancellationToken::new();

        let result = async { "session-ready" }.or_cancel(&token).await;

        assert_eq!(Ok("session-ready"), result);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_sleep_wakes_the_waiter() {
        let token = CancellationToken::new();
        let canceller = token.clone();

        let cancel_handle = task::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = sleep_or_cancel(Duration::from_secs(60), &token).await;

        cancel_handle.await.ok();
        assert_eq!(Err(CancelErr::Cancelled), result);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn pre_cancelled_token_wins_over_ready_future() {
        let token = CancellationToken::new();
        token.cancel();

        let result = async { 5 }.or_cancel(&token).await;

        assert_eq!(Err(CancelErr::Cancelled), result);
    }

    #[tokio::test]
    async fn zero_sleep_still_observes_cancellation() {
        let token = CancellationToken::new();
        assert_eq!(Ok(()), sleep_or_cancel(Duration::ZERO, &token).await);

        token.cancel();
        assert_eq!(
            Err(CancelErr::Cancelled),
            sleep_or_cancel(Duration::ZERO, &token).await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn uncancelled_sleep_runs_full_duration() {
        let token = CancellationToken::new();
        let started = Instant::now();

        sleep_or_cancel(Duration::from_secs(2), &token)
            .await
            .expect("not cancelled");

        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
