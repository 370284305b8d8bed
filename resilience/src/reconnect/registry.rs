//! Process-local bookkeeping for reconnection chains.
//!
//! Holds one attempt record per account with a chain in flight and one
//! circuit breaker per account. Both maps sit behind a single
//! `std::sync::Mutex` that is never held across an `.await`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{CircuitBreaker, CircuitState};

#[derive(Debug)]
struct AttemptRecord {
    chain_id: u64,
    attempt: u32,
    reason: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, AttemptRecord>,
    circuits: HashMap<String, CircuitBreaker>,
}

/// Handle returned to the task that owns a chain.
#[derive(Debug, Clone)]
pub struct ChainTicket {
    pub chain_id: u64,
    pub cancel: CancellationToken,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionStatus {
    pub in_progress: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub circuit_open: bool,
    pub circuit_failures: u32,
    pub circuit_state: CircuitState,
}

#[derive(Debug)]
pub struct ReconnectionRegistry {
    threshold: u32,
    next_chain_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl ReconnectionRegistry {
    pub fn new(circuit_breaker_threshold: u32) -> Self {
        Self {
            threshold: circuit_breaker_threshold,
            next_chain_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a chain for `account_id` unless one is already in flight.
    pub fn begin_chain(&self, account_id: &str, reason: &str) -> Option<ChainTicket> {
        let mut inner = self.lock();
        if inner.records.contains_key(account_id) {
            return None;
        }
        let chain_id = self.next_chain_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        inner.records.insert(
            account_id.to_string(),
            AttemptRecord {
                chain_id,
                attempt: 0,
                reason: reason.to_string(),
                cancel: cancel.clone(),
            },
        );
        Some(ChainTicket { chain_id, cancel })
    }

    /// Record the attempt number; ignored if the chain is no longer current.
    pub fn set_attempt(&self, account_id: &str, chain_id: u64, attempt: u32) -> bool {
        match self.lock().records.get_mut(account_id) {
            Some(record) if record.chain_id == chain_id => {
                record.attempt = attempt;
                true
            }
            _ => false,
        }
    }

    /// Drop the record if it still belongs to `chain_id`.
    pub fn finish(&self, account_id: &str, chain_id: u64) -> bool {
        let mut inner = self.lock();
        let current = inner
            .records
            .get(account_id)
            .is_some_and(|record| record.chain_id == chain_id);
        if current {
            inner.records.remove(account_id);
        }
        current
    }

    /// Cancel the chain for `account_id` and clear its record.
    pub fn cancel(&self, account_id: &str) -> bool {
        match self.lock().records.remove(account_id) {
            Some(record) => {
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every chain; returns how many were in flight.
    pub fn cancel_all(&self) -> usize {
        let records: Vec<AttemptRecord> = self.lock().records.drain().map(|(_, r)| r).collect();
        for record in &records {
            record.cancel.cancel();
        }
        records.len()
    }

    pub fn in_progress(&self, account_id: &str) -> bool {
        self.lock().records.contains_key(account_id)
    }

    pub fn record_failure(&self, account_id: &str) -> u32 {
        let threshold = self.threshold;
        self.lock()
            .circuits
            .entry(account_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(threshold))
            .record_failure()
    }

    pub fn record_success(&self, account_id: &str) {
        if let Some(circuit) = self.lock().circuits.get_mut(account_id) {
            circuit.record_success();
        }
    }

    pub fn circuit_open(&self, account_id: &str) -> bool {
        self.lock()
            .circuits
            .get(account_id)
            .is_some_and(CircuitBreaker::is_open)
    }

    pub fn circuit_failures(&self, account_id: &str) -> u32 {
        self.lock()
            .circuits
            .get(account_id)
            .map_or(0, CircuitBreaker::failures)
    }

    pub fn reset_circuit(&self, account_id: &str) {
        if let Some(circuit) = self.lock().circuits.get_mut(account_id) {
            circuit.reset();
        }
    }

    pub fn status(&self, account_id: &str) -> ReconnectionStatus {
        let inner = self.lock();
        let record = inner.records.get(account_id);
        let circuit = inner.circuits.get(account_id);
        ReconnectionStatus {
            in_progress: record.is_some(),
            attempts: record.map_or(0, |r| r.attempt),
            reason: record.map(|r| r.reason.clone()),
            circuit_open: circuit.is_some_and(CircuitBreaker::is_open),
            circuit_failures: circuit.map_or(0, CircuitBreaker::failures),
            circuit_state: circuit.map_or(CircuitState::Closed, CircuitBreaker::state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_one_chain_per_account() {
        let registry = ReconnectionRegistry::new(5);
        let first = registry.begin_chain("a1", "stream:error").unwrap();
        assert!(registry.begin_chain("a1", "stream:error").is_none());
        assert!(registry.begin_chain("a2", "stream:error").is_some());

        assert!(registry.finish("a1", first.chain_id));
        assert!(registry.begin_chain("a1", "again").is_some());
    }

    #[test]
    fn stale_chain_cannot_clear_newer_record() {
        let registry = ReconnectionRegistry::new(5);
        let old = registry.begin_chain("a1", "first").unwrap();
        assert!(registry.cancel("a1"));
        assert!(old.cancel.is_cancelled());

        let new = registry.begin_chain("a1", "second").unwrap();
        assert!(!registry.set_attempt("a1", old.chain_id, 4));
        assert!(!registry.finish("a1", old.chain_id));
        assert!(registry.in_progress("a1"));
        assert!(registry.set_attempt("a1", new.chain_id, 1));
        assert_eq!(registry.status("a1").attempts, 1);
    }

    #[test]
    fn circuit_counts_and_resets() {
        let registry = ReconnectionRegistry::new(2);
        registry.record_failure("a1");
        assert!(!registry.circuit_open("a1"));
        registry.record_failure("a1");
        assert!(registry.circuit_open("a1"));

        let status = registry.status("a1");
        assert_eq!(status.circuit_state, CircuitState::Open);
        assert_eq!(status.circuit_failures, 2);

        registry.reset_circuit("a1");
        assert_eq!(registry.circuit_failures("a1"), 0);
    }

    #[test]
    fn cancel_all_fires_every_token() {
        let registry = ReconnectionRegistry::new(5);
        let a = registry.begin_chain("a1", "x").unwrap();
        let b = registry.begin_chain("a2", "y").unwrap();

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(!registry.in_progress("a1"));
    }

    #[test]
    fn unknown_account_status_is_idle() {
        let registry = ReconnectionRegistry::new(5);
        assert_eq!(
            registry.status("nobody"),
            ReconnectionStatus {
                in_progress: false,
                attempts: 0,
                reason: None,
                circuit_open: false,
                circuit_failures: 0,
                circuit_state: CircuitState::Closed,
            }
        );
    }
}
