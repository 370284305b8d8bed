//! Process shutdown wiring.
//!
//! On Ctrl+C, SIGTERM or an explicit cancel, every reconnection chain is
//! cancelled and the pool closes every session it tracks.

use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;
use crate::reconnect::ReconnectionManager;
use crate::session::ManagedSession;

/// Resolve on Ctrl+C, SIGTERM (unix), or when `cancel` fires.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = cancel.cancelled() => tracing::info!("Shutdown requested"),
    }
}

/// Spawn a task that tears down `pool` (and `manager`, if given) once a
/// shutdown signal arrives.
pub fn spawn_shutdown_hook<S: ManagedSession>(
    pool: Arc<ConnectionPool<S>>,
    manager: Option<Arc<ReconnectionManager>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal(cancel).await;
        if let Some(manager) = manager {
            let cancelled = manager.cancel_all();
            tracing::info!(cancelled, "cancelled reconnection chains");
        }
        pool.close_all().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::pool::PoolConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Conn(AtomicBool);

    #[async_trait]
    impl ManagedSession for Conn {
        fn account_id(&self) -> &str {
            "a1"
        }

        fn is_alive(&self) -> bool {
            !self.0.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cancel_closes_pool() {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let conn = pool
            .acquire("a1", || async { Ok::<_, SessionError>(Conn(AtomicBool::new(false))) })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let hook = spawn_shutdown_hook(Arc::clone(&pool), None, cancel.clone());
        cancel.cancel();
        hook.await.unwrap();

        assert!(!conn.is_alive());
        assert!(pool.is_closed());
    }
}
