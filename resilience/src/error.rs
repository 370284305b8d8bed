//! Error types shared across the resilience components.

use std::time::Duration;
use thiserror::Error;

use crate::classifier::{
    Classification, ErrorClass, RetryClassifiable, classify_error, classify_message,
};

/// Boxed error accepted from protocol-layer session factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Descriptive failure reported by the chat or mailbox protocol layer.
///
/// The message is what the classifier sees, so protocol adapters should
/// pass through the server or socket wording rather than paraphrasing it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SessionError {
    pub message: String,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for SessionError {
    fn from(message: String) -> Self {
        SessionError { message }
    }
}

impl From<&str> for SessionError {
    fn from(message: &str) -> Self {
        SessionError::new(message)
    }
}

impl RetryClassifiable for SessionError {
    fn classify(&self) -> Classification {
        classify_message(&self.message)
    }
}

/// Connection pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No slot freed up for this account within the pending-request timeout.
    #[error("timed out after {waited:?} waiting for a pooled connection for account {account_id}")]
    Timeout { account_id: String, waited: Duration },

    /// The pool (or this account's sub-pool) was torn down.
    #[error("connection pool closed")]
    Closed,

    /// The session factory failed.
    #[error("failed to open session for account {account_id}: {source}")]
    Factory {
        account_id: String,
        #[source]
        source: BoxError,
    },
}

impl PoolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout { .. })
    }
}

impl RetryClassifiable for PoolError {
    fn classify(&self) -> Classification {
        match self {
            PoolError::Timeout { .. } => Classification::fatal(ErrorClass::PoolTimeout),
            PoolError::Closed => Classification::fatal(ErrorClass::Unknown),
            PoolError::Factory { source, .. } => classify_error(source.as_ref()),
        }
    }
}

/// Session store failures. Always logged and swallowed by the resilience
/// logic; persistence is best-effort.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Notification delivery failures. Never propagated into control flow.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no subscribers on channel {channel}")]
    NoSubscribers { channel: String },

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}
