//! Retry with connection re-acquisition.
//!
//! Used by call sites that open a dedicated connection instead of leasing
//! one from the pool. A connection-class failure discards the current
//! connection and the next attempt starts on a fresh one; any other
//! retryable failure reuses it.

use std::future::Future;
use std::sync::Arc;

use super::RetryConfig;
use super::strategy::next_delay;
use crate::classifier::RetryClassifiable;
use crate::session::ManagedSession;

/// Owns the connection currently in use. Whatever is still held when the
/// guard goes away is closed, including when the caller drops the future.
struct ConnectionGuard<C: ManagedSession> {
    conn: Option<Arc<C>>,
}

impl<C: ManagedSession> ConnectionGuard<C> {
    fn empty() -> Self {
        Self { conn: None }
    }

    fn current(&self) -> Option<Arc<C>> {
        self.conn.clone()
    }

    fn set(&mut self, conn: C) -> Arc<C> {
        let conn = Arc::new(conn);
        self.conn = Some(Arc::clone(&conn));
        conn
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

impl<C: ManagedSession> Drop for ConnectionGuard<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { conn.close().await });
            }
            Err(_) => {
                tracing::warn!(
                    account_id = conn.account_id(),
                    "dropping connection outside a runtime; close skipped"
                );
            }
        }
    }
}

/// Run `operation` against a connection from `get_connection`, retrying
/// with backoff.
///
/// The first attempt always acquires a connection. Later attempts acquire a
/// new one only after a connection-class failure (or a failed acquisition).
/// Throttled failures wait `config.throttle_multiplier` times longer. The
/// connection in use is closed on every exit path.
pub async fn retry_with_reconnect<C, G, GFut, F, Fut, T, E>(
    mut get_connection: G,
    mut operation: F,
    config: &RetryConfig,
) -> Result<T, E>
where
    C: ManagedSession,
    G: FnMut() -> GFut,
    GFut: Future<Output = Result<C, E>>,
    F: FnMut(Arc<C>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassifiable,
{
    let policy = config.backoff();
    let mut guard = ConnectionGuard::empty();
    let mut needs_connection = true;
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);

        let connection = match guard.current() {
            Some(conn) if !needs_connection => Ok(conn),
            _ => {
                guard.close().await;
                get_connection().await.map(|conn| guard.set(conn))
            }
        };
        let result = match connection {
            Ok(conn) => operation(conn).await,
            Err(err) => Err(err),
        };

        let err = match result {
            Ok(value) => {
                guard.close().await;
                return Ok(value);
            }
            Err(err) => err,
        };

        let Some(delay) = next_delay(&err, attempt, config, &policy) else {
            guard.close().await;
            return Err(err);
        };
        needs_connection = err.classify().connection_issue || guard.current().is_none();
        if needs_connection {
            tracing::debug!(attempt, "discarding connection before next attempt");
            guard.close().await;
        }
        tokio::time::sleep(delay).await;
    }
}
