//! Process-local [`SessionStore`] used by tests and single-instance setups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{AccountMeta, SessionStatus, SessionStore, StatusFields};
use crate::error::StoreError;

/// One recorded `update_status` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub account_id: String,
    pub status: SessionStatus,
    pub fields: StatusFields,
}

#[derive(Debug, Default)]
struct Inner {
    current: HashMap<String, StatusUpdate>,
    history: Vec<StatusUpdate>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    accounts: HashMap<String, AccountMeta>,
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_account(&self, account_id: &str, meta: AccountMeta) {
        self.lock().accounts.insert(account_id.to_string(), meta);
    }

    pub fn set_heartbeat(&self, account_id: &str, at: DateTime<Utc>) {
        self.lock().heartbeats.insert(account_id.to_string(), at);
    }

    pub fn clear_heartbeat(&self, account_id: &str) {
        self.lock().heartbeats.remove(account_id);
    }

    /// Latest persisted status for `account_id`.
    pub fn status(&self, account_id: &str) -> Option<SessionStatus> {
        self.lock().current.get(account_id).map(|u| u.status)
    }

    /// Every status write for `account_id`, oldest first.
    pub fn history(&self, account_id: &str) -> Vec<StatusUpdate> {
        self.lock()
            .history
            .iter()
            .filter(|u| u.account_id == account_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn update_status(
        &self,
        account_id: &str,
        status: SessionStatus,
        fields: StatusFields,
    ) -> Result<(), StoreError> {
        let update = StatusUpdate {
            account_id: account_id.to_string(),
            status,
            fields,
        };
        let mut inner = self.lock();
        inner.history.push(update.clone());
        inner.current.insert(account_id.to_string(), update);
        Ok(())
    }

    async fn read_heartbeat(&self, account_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.lock().heartbeats.get(account_id).copied())
    }

    async fn read_account_meta(&self, account_id: &str) -> Result<Option<AccountMeta>, StoreError> {
        Ok(self.lock().accounts.get(account_id).cloned())
    }
}
