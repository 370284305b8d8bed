//! Persistence boundary for account/session state.
//!
//! The resilience engine only ever needs three things from storage: write
//! the current connection status, read another instance's heartbeat, and
//! look up who owns an account so notifications reach the right channel.
//! Everything goes through [`SessionStore`]; the backing database is an
//! external collaborator.

mod memory;

pub use memory::{InMemorySessionStore, StatusUpdate};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Persisted connection status of a chat or mailbox account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    /// Connected transport, but the device still has to be paired.
    QrPending,
    Reconnecting,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Connected => "connected",
            SessionStatus::QrPending => "qr_pending",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

/// Extra fields written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusFields {
    pub fn now() -> Self {
        Self {
            updated_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Display metadata for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMeta {
    pub name: String,
    pub owner_id: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn update_status(
        &self,
        account_id: &str,
        status: SessionStatus,
        fields: StatusFields,
    ) -> Result<(), StoreError>;

    /// Last heartbeat written by whichever instance serves `account_id`.
    async fn read_heartbeat(&self, account_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn read_account_meta(&self, account_id: &str) -> Result<Option<AccountMeta>, StoreError>;
}
