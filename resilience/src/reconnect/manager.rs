//! Reconnection state machine for long-lived chat sessions.
//!
//! One chain per account: `idle -> reconnecting -> {connected, failed}`. A
//! chain is a bounded loop of attempts; each attempt checks the circuit
//! breaker, checks whether another instance is already serving the account
//! (heartbeat), persists progress, backs off, then asks the connector for a
//! fresh session. Persistence and notification failures are logged and never
//! change the outcome.

use async_trait::async_trait;
use chrono::Utc;
use relink_async_utils::sleep_or_cancel;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::ReconnectConfig;
use super::registry::{ReconnectionRegistry, ReconnectionStatus};
use crate::classifier::{ErrorClass, RetryClassifiable};
use crate::error::SessionError;
use crate::notify::{self, MANUAL_RECONNECT_HINT, NotificationSink, ReconnectionEvent};
use crate::store::{AccountMeta, SessionStatus, SessionStore, StatusFields};

/// Result of a successful `ChatConnector::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Transport is up but the device must be re-paired (QR scan).
    PairingRequired,
}

/// Protocol-layer hooks the manager drives.
#[async_trait]
pub trait ChatConnector: Send + Sync {
    /// Tear down whatever is left of the previous session.
    async fn release(&self, account_id: &str);

    async fn connect(&self, account_id: &str) -> Result<ConnectOutcome, SessionError>;
}

/// How a reconnection chain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected { attempts: u32 },
    PairingRequired { attempts: u32 },
    Failed { attempts: u32, reason: String },
    Cancelled,
}

/// Clears the chain's attempt record however the chain future ends.
struct ChainGuard<'a> {
    registry: &'a ReconnectionRegistry,
    account_id: &'a str,
    chain_id: u64,
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        self.registry.finish(self.account_id, self.chain_id);
    }
}

/// Per-chain context threaded through the attempt loop.
struct Chain<'a> {
    account_id: &'a str,
    reason: &'a str,
    chain_id: u64,
    cancel: CancellationToken,
    channel: String,
    account_name: Option<String>,
}

pub struct ReconnectionManager {
    config: ReconnectConfig,
    registry: Arc<ReconnectionRegistry>,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn NotificationSink>,
    connector: Arc<dyn ChatConnector>,
}

impl ReconnectionManager {
    pub fn new(
        config: ReconnectConfig,
        registry: Arc<ReconnectionRegistry>,
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn NotificationSink>,
        connector: Arc<dyn ChatConnector>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            sink,
            connector,
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Run a reconnection chain for `account_id`.
    ///
    /// Returns `None` without doing anything if a chain is already in
    /// flight for the account, and `None` if another instance turns out to be
    /// serving it (fresh heartbeat).
    pub async fn handle_reconnection(
        &self,
        account_id: &str,
        reason: &str,
    ) -> Option<ReconnectOutcome> {
        let Some(ticket) = self.registry.begin_chain(account_id, reason) else {
            tracing::debug!(account_id, "reconnection already in progress");
            return None;
        };
        let _guard = ChainGuard {
            registry: &self.registry,
            account_id,
            chain_id: ticket.chain_id,
        };

        let meta = self.account_meta(account_id).await;
        let chain = Chain {
            account_id,
            reason,
            chain_id: ticket.chain_id,
            cancel: ticket.cancel,
            channel: notify::channel_for(account_id, meta.as_ref().map(|m| m.owner_id.as_str())),
            account_name: meta.map(|m| m.name),
        };

        tracing::info!(account_id, reason, "starting reconnection");
        let outcome = self.run_chain(&chain).await;
        match &outcome {
            Some(ReconnectOutcome::Cancelled) => {
                tracing::info!(account_id, "reconnection cancelled");
            }
            None => {
                tracing::info!(account_id, "reconnection skipped: account served elsewhere");
            }
            Some(_) => {}
        }
        outcome
    }

    async fn run_chain(&self, chain: &Chain<'_>) -> Option<ReconnectOutcome> {
        let account_id = chain.account_id;
        let max_attempts = self.config.max_attempts.max(1);
        let policy = self.config.backoff();
        let mut attempts = 0;
        let mut last_error = chain.reason.to_string();

        for attempt in 1..=max_attempts {
            if self.registry.circuit_open(account_id) {
                let timeout = self.config.circuit_breaker_timeout();
                tracing::warn!(
                    account_id,
                    attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "circuit open, cooling down before next attempt"
                );
                if sleep_or_cancel(timeout, &chain.cancel).await.is_err() {
                    return Some(ReconnectOutcome::Cancelled);
                }
                self.registry.reset_circuit(account_id);
            }

            if self.heartbeat_is_fresh(account_id).await {
                return None;
            }

            if chain.cancel.is_cancelled() {
                return Some(ReconnectOutcome::Cancelled);
            }
            self.registry.set_attempt(account_id, chain.chain_id, attempt);
            self.persist(
                account_id,
                SessionStatus::Reconnecting,
                StatusFields::now()
                    .with_reason(chain.reason)
                    .with_attempt(attempt),
            )
            .await;

            let delay = if attempt >= 2 {
                policy.delay(attempt - 2)
            } else {
                std::time::Duration::ZERO
            };
            self.publish(
                chain,
                ReconnectionEvent::Reconnecting {
                    account_id: account_id.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                },
            )
            .await;
            if sleep_or_cancel(delay, &chain.cancel).await.is_err() {
                return Some(ReconnectOutcome::Cancelled);
            }

            attempts = attempt;
            tracing::info!(
                account_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnection attempt"
            );
            self.connector.release(account_id).await;
            match self.connector.connect(account_id).await {
                Ok(outcome) => return Some(self.on_connected(chain, outcome, attempt).await),
                Err(err) => {
                    let failures = self.registry.record_failure(account_id);
                    let class = err.classify().class;
                    tracing::warn!(
                        account_id,
                        attempt,
                        failures,
                        class = %class,
                        "reconnection attempt failed: {err}"
                    );
                    last_error = err.to_string();
                    if class == ErrorClass::PermanentAuthFailure {
                        break;
                    }
                }
            }
        }

        if chain.cancel.is_cancelled() {
            return Some(ReconnectOutcome::Cancelled);
        }
        Some(self.on_exhausted(chain, attempts, last_error).await)
    }

    async fn on_connected(
        &self,
        chain: &Chain<'_>,
        outcome: ConnectOutcome,
        attempts: u32,
    ) -> ReconnectOutcome {
        let account_id = chain.account_id;
        self.registry.record_success(account_id);
        self.registry.finish(account_id, chain.chain_id);

        let (status, result) = match outcome {
            ConnectOutcome::Connected => {
                (SessionStatus::Connected, ReconnectOutcome::Connected { attempts })
            }
            ConnectOutcome::PairingRequired => (
                SessionStatus::QrPending,
                ReconnectOutcome::PairingRequired { attempts },
            ),
        };
        tracing::info!(account_id, attempts, status = status.as_str(), "reconnected");

        self.persist(account_id, status, StatusFields::now()).await;
        self.publish(
            chain,
            ReconnectionEvent::Reconnected {
                account_id: account_id.to_string(),
                account_name: chain.account_name.clone(),
                status,
                attempts,
            },
        )
        .await;
        result
    }

    async fn on_exhausted(
        &self,
        chain: &Chain<'_>,
        attempts: u32,
        last_error: String,
    ) -> ReconnectOutcome {
        let account_id = chain.account_id;
        tracing::error!(account_id, attempts, "reconnection failed: {last_error}");

        self.persist(
            account_id,
            SessionStatus::Disconnected,
            StatusFields::now()
                .with_reason(chain.reason)
                .with_attempt(attempts)
                .with_last_error(last_error.clone()),
        )
        .await;
        self.publish(
            chain,
            ReconnectionEvent::ReconnectionFailed {
                account_id: account_id.to_string(),
                account_name: chain.account_name.clone(),
                reason: last_error.clone(),
                attempts,
                hint: MANUAL_RECONNECT_HINT.to_string(),
            },
        )
        .await;
        self.registry.finish(account_id, chain.chain_id);

        ReconnectOutcome::Failed {
            attempts,
            reason: last_error,
        }
    }

    /// Another instance wrote a heartbeat recently enough to own the account.
    async fn heartbeat_is_fresh(&self, account_id: &str) -> bool {
        let last = match self.store.read_heartbeat(account_id).await {
            Ok(Some(last)) => last,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(account_id, "failed to read heartbeat: {e}");
                return false;
            }
        };
        match (Utc::now() - last).to_std() {
            Ok(age) => age < self.config.heartbeat_freshness(),
            // Timestamp ahead of our clock
            Err(_) => true,
        }
    }

    async fn account_meta(&self, account_id: &str) -> Option<AccountMeta> {
        match self.store.read_account_meta(account_id).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(account_id, "failed to read account metadata: {e}");
                None
            }
        }
    }

    async fn persist(&self, account_id: &str, status: SessionStatus, fields: StatusFields) {
        if let Err(e) = self.store.update_status(account_id, status, fields).await {
            tracing::warn!(
                account_id,
                status = status.as_str(),
                "failed to persist session status: {e}"
            );
        }
    }

    async fn publish(&self, chain: &Chain<'_>, event: ReconnectionEvent) {
        notify::notify(self.sink.as_ref(), &chain.channel, &event).await;
    }

    pub fn status(&self, account_id: &str) -> ReconnectionStatus {
        self.registry.status(account_id)
    }

    /// Stop the chain for `account_id`. The in-flight attempt notices before
    /// its next sleep or status write.
    pub fn cancel(&self, account_id: &str) -> bool {
        let cancelled = self.registry.cancel(account_id);
        if cancelled {
            tracing::info!(account_id, "reconnection cancel requested");
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    pub fn reset_circuit(&self, account_id: &str) {
        self.registry.reset_circuit(account_id);
    }
}
