//! Per-account pool of live mailbox sessions.
//!
//! Each account owns an LRU-ordered list of entries (idle or leased), a count
//! of slots reserved for sessions still being opened, and a FIFO of waiters.
//! `occupied = entries + creating` never exceeds
//! `max_connections_per_account`.
//!
//! Every account pool carries a generation number. A slot reserved under one
//! generation is only honoured by that same pool, so a session that finishes
//! opening after its account was torn down is closed instead of landing in a
//! fresh pool that may already be full.
//!
//! Waiters are served directly: a release hands the session (or, when the
//! session was evicted, a reserved slot) to the oldest waiter over a oneshot
//! channel while the pool lock is held, so a waiter that times out can tell
//! whether it was served in the meantime.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BoxError, PoolError};
use crate::session::{AliveState, ManagedSession};

/// Pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections_per_account")]
    pub max_connections_per_account: usize,

    /// Sessions older than this are closed instead of handed out
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// How long a queued `acquire` waits for a slot
    #[serde(default = "default_pending_request_timeout_ms")]
    pub pending_request_timeout_ms: u64,
}

fn default_max_connections_per_account() -> usize {
    5
}
fn default_connection_timeout_ms() -> u64 {
    30 * 60 * 1_000
}
fn default_pending_request_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_account: default_max_connections_per_account(),
            connection_timeout_ms: default_connection_timeout_ms(),
            pending_request_timeout_ms: default_pending_request_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn pending_request_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_request_timeout_ms)
    }
}

/// Point-in-time counters across all accounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub accounts: usize,
    pub sessions: usize,
    pub leased: usize,
    pub creating: usize,
    pub pending: usize,
}

struct PoolEntry<S> {
    session: Arc<S>,
    inserted_at: Instant,
    last_used_at: Instant,
    leased: bool,
}

enum Handoff<S> {
    /// An idle session, already marked leased for the receiver.
    Session(Arc<S>),
    /// A slot reserved in the given account generation; the receiver runs
    /// its own factory.
    Slot(u64),
}

struct PendingRequest<S> {
    id: u64,
    tx: oneshot::Sender<Handoff<S>>,
    enqueued_at: Instant,
}

struct AccountPool<S> {
    generation: u64,
    entries: VecDeque<PoolEntry<S>>,
    creating: usize,
    waiters: VecDeque<PendingRequest<S>>,
}

impl<S: ManagedSession> AccountPool<S> {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: VecDeque::new(),
            creating: 0,
            waiters: VecDeque::new(),
        }
    }

    fn occupied(&self) -> usize {
        self.entries.len() + self.creating
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.creating == 0 && self.waiters.is_empty()
    }

    /// Remove idle entries that are stale or dead.
    fn evict_unhealthy(&mut self, now: Instant, max_age: Duration) -> Vec<Arc<S>> {
        let mut evicted = Vec::new();
        self.entries.retain(|entry| {
            if entry.leased {
                return true;
            }
            let age = now.saturating_duration_since(entry.inserted_at);
            match AliveState::evaluate(entry.session.is_alive(), age, max_age) {
                AliveState::Alive => true,
                state => {
                    tracing::debug!(
                        account_id = entry.session.account_id(),
                        ?state,
                        age_ms = age.as_millis() as u64,
                        "evicting pooled session"
                    );
                    evicted.push(Arc::clone(&entry.session));
                    false
                }
            }
        });
        evicted
    }

    /// Take the least recently used idle entry, mark it leased and move it
    /// to the back.
    fn lease_idle(&mut self, now: Instant) -> Option<Arc<S>> {
        let (pos, _) = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.leased)
            .min_by_key(|(_, entry)| entry.last_used_at)?;
        let mut entry = self.entries.remove(pos)?;
        entry.leased = true;
        entry.last_used_at = now;
        let session = Arc::clone(&entry.session);
        self.entries.push_back(entry);
        Some(session)
    }

    fn unlease(&mut self, session: &Arc<S>) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| Arc::ptr_eq(&entry.session, session))
        {
            entry.leased = false;
        }
    }

    /// Serve queued waiters from idle entries or free capacity.
    fn dispatch(&mut self, now: Instant, config: &PoolConfig) -> Vec<Arc<S>> {
        let evicted = self.evict_unhealthy(now, config.connection_timeout());

        while let Some(waiter) = self.waiters.pop_front() {
            let waited_ms = now.saturating_duration_since(waiter.enqueued_at).as_millis() as u64;
            if let Some(session) = self.lease_idle(now) {
                if let Err(Handoff::Session(session)) =
                    waiter.tx.send(Handoff::Session(Arc::clone(&session)))
                {
                    self.unlease(&session);
                    continue;
                }
                tracing::debug!(
                    waiter = waiter.id,
                    waited_ms,
                    "handed pooled session to waiter"
                );
            } else if self.occupied() < config.max_connections_per_account {
                self.creating += 1;
                if waiter.tx.send(Handoff::Slot(self.generation)).is_err() {
                    self.creating -= 1;
                    continue;
                }
                tracing::debug!(waiter = waiter.id, waited_ms, "handed free slot to waiter");
            } else {
                self.waiters.push_front(waiter);
                break;
            }
        }
        evicted
    }

    fn drain_sessions(&mut self) -> Vec<Arc<S>> {
        self.waiters.clear();
        self.entries.drain(..).map(|entry| entry.session).collect()
    }
}

struct PoolState<S> {
    accounts: HashMap<String, AccountPool<S>>,
    next_generation: u64,
    closed: bool,
}

impl<S: ManagedSession> PoolState<S> {
    fn account(&mut self, account_id: &str) -> &mut AccountPool<S> {
        let next_generation = &mut self.next_generation;
        self.accounts
            .entry(account_id.to_string())
            .or_insert_with(|| {
                *next_generation += 1;
                AccountPool::new(*next_generation)
            })
    }

    fn prune(&mut self, account_id: &str) {
        if self
            .accounts
            .get(account_id)
            .is_some_and(AccountPool::is_empty)
        {
            self.accounts.remove(account_id);
        }
    }
}

enum Checkout<S> {
    Reuse(Arc<S>),
    Create(u64),
    Wait(u64, oneshot::Receiver<Handoff<S>>),
}

/// Close sessions from a synchronous context.
fn close_detached<S: ManagedSession>(sessions: Vec<Arc<S>>) {
    if sessions.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for session in sessions {
                    session.close().await;
                }
            });
        }
        Err(_) => {
            tracing::warn!(count = sessions.len(), "no runtime to close evicted sessions");
        }
    }
}

async fn close_sessions<S: ManagedSession>(sessions: Vec<Arc<S>>) {
    for session in sessions {
        session.close().await;
    }
}

pub struct ConnectionPool<S: ManagedSession> {
    config: PoolConfig,
    next_waiter_id: AtomicU64,
    state: Mutex<PoolState<S>>,
}

impl<S: ManagedSession> ConnectionPool<S> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            next_waiter_id: AtomicU64::new(1),
            state: Mutex::new(PoolState {
                accounts: HashMap::new(),
                next_generation: 0,
                closed: false,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a session for `account_id`, opening one with `factory` when the
    /// account has spare capacity.
    ///
    /// When the account is saturated the call queues until a session or slot
    /// is released, failing with [`PoolError::Timeout`] after
    /// `pending_request_timeout`. Factory errors come back as
    /// [`PoolError::Factory`] and free the reserved slot.
    pub async fn acquire<F, Fut, E>(
        &self,
        account_id: &str,
        factory: F,
    ) -> Result<Arc<S>, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, E>>,
        E: Into<BoxError>,
    {
        let (checkout, evicted) = self.checkout(account_id)?;
        close_sessions(evicted).await;

        match checkout {
            Checkout::Reuse(session) => {
                tracing::debug!(account_id, "reusing pooled session");
                Ok(session)
            }
            Checkout::Create(generation) => self.create(account_id, generation, factory).await,
            Checkout::Wait(id, rx) => {
                tracing::debug!(account_id, waiter = id, "pool saturated, queueing request");
                let mut waiter = Waiter {
                    pool: self,
                    account_id,
                    id,
                    rx: Some(rx),
                };
                match waiter.wait(self.config.pending_request_timeout()).await? {
                    Handoff::Session(session) => Ok(session),
                    Handoff::Slot(generation) => self.create(account_id, generation, factory).await,
                }
            }
        }
    }

    fn checkout(&self, account_id: &str) -> Result<(Checkout<S>, Vec<Arc<S>>), PoolError> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let account = state.account(account_id);

        // Eviction may have freed capacity for earlier waiters.
        let evicted = account.dispatch(now, &self.config);

        if account.waiters.is_empty() {
            if let Some(session) = account.lease_idle(now) {
                return Ok((Checkout::Reuse(session), evicted));
            }
            if account.occupied() < self.config.max_connections_per_account {
                account.creating += 1;
                return Ok((Checkout::Create(account.generation), evicted));
            }
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        account.waiters.push_back(PendingRequest {
            id,
            tx,
            enqueued_at: now,
        });
        Ok((Checkout::Wait(id, rx), evicted))
    }

    /// Open a session in a slot already reserved under `generation`.
    async fn create<F, Fut, E>(
        &self,
        account_id: &str,
        generation: u64,
        factory: F,
    ) -> Result<Arc<S>, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, E>>,
        E: Into<BoxError>,
    {
        let mut slot = SlotGuard {
            pool: self,
            account_id,
            generation,
            armed: true,
        };
        let session = match factory().await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                let source: BoxError = e.into();
                tracing::warn!(account_id, "session factory failed: {source}");
                return Err(PoolError::Factory {
                    account_id: account_id.to_string(),
                    source,
                });
            }
        };
        slot.armed = false;

        let accepted = {
            let now = Instant::now();
            let mut state = self.lock();
            let account = if state.closed {
                None
            } else {
                state
                    .accounts
                    .get_mut(account_id)
                    .filter(|account| account.generation == generation)
            };
            match account {
                Some(account) => {
                    account.creating -= 1;
                    account.entries.push_back(PoolEntry {
                        session: Arc::clone(&session),
                        inserted_at: now,
                        last_used_at: now,
                        leased: true,
                    });
                    true
                }
                None => false,
            }
        };
        if !accepted {
            tracing::debug!(account_id, "account torn down while opening, closing session");
            session.close().await;
            return Err(PoolError::Closed);
        }

        tracing::debug!(account_id, "opened new pooled session");
        Ok(session)
    }

    /// Return a leased session.
    ///
    /// With `remove = false` a live session goes back to the pool (straight
    /// to the oldest waiter if any). With `remove = true`, or when the
    /// session is dead or stale, it is closed and its slot passed on.
    pub async fn release(&self, account_id: &str, session: &Arc<S>, remove: bool) {
        let now = Instant::now();
        let mut to_close = Vec::new();
        {
            let mut state = self.lock();
            let tracked = state.accounts.get_mut(account_id).and_then(|account| {
                let pos = account
                    .entries
                    .iter()
                    .position(|entry| Arc::ptr_eq(&entry.session, session))?;
                Some((account, pos))
            });

            match tracked {
                Some((account, pos)) => {
                    let age = account
                        .entries
                        .get(pos)
                        .map(|entry| now.saturating_duration_since(entry.inserted_at))
                        .unwrap_or_default();
                    let health = AliveState::evaluate(
                        session.is_alive(),
                        age,
                        self.config.connection_timeout(),
                    );
                    if remove || health != AliveState::Alive {
                        if let Some(entry) = account.entries.remove(pos) {
                            to_close.push(entry.session);
                        }
                        tracing::debug!(
                            account_id,
                            remove,
                            ?health,
                            "evicting released session"
                        );
                    } else if let Some(entry) = account.entries.get_mut(pos) {
                        entry.leased = false;
                        entry.last_used_at = now;
                    }
                    to_close.extend(account.dispatch(now, &self.config));
                }
                None => {
                    tracing::debug!(account_id, "released session is not tracked, closing it");
                    to_close.push(Arc::clone(session));
                }
            }
            state.prune(account_id);
        }
        close_sessions(to_close).await;
    }

    /// Close every session of one account and reject its waiters.
    pub async fn close_account_connections(&self, account_id: &str) {
        let sessions = match self.lock().accounts.remove(account_id) {
            Some(mut account) => account.drain_sessions(),
            None => return,
        };
        tracing::info!(account_id, count = sessions.len(), "closing account sessions");
        close_sessions(sessions).await;
    }

    /// Close every tracked session, reject all waiters and refuse new
    /// acquisitions.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<S>> = {
            let mut state = self.lock();
            state.closed = true;
            state
                .accounts
                .drain()
                .flat_map(|(_, mut account)| account.drain_sessions())
                .collect()
        };
        tracing::info!(count = sessions.len(), "closing all pooled sessions");
        close_sessions(sessions).await;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        state
            .accounts
            .values()
            .fold(PoolStats::default(), |mut stats, account| {
                stats.accounts += 1;
                stats.sessions += account.entries.len();
                stats.leased += account.entries.iter().filter(|e| e.leased).count();
                stats.creating += account.creating;
                stats.pending += account.waiters.len();
                stats
            })
    }

    pub fn pending_count(&self, account_id: &str) -> usize {
        self.lock()
            .accounts
            .get(account_id)
            .map_or(0, |account| account.waiters.len())
    }

    pub fn session_count(&self, account_id: &str) -> usize {
        self.lock()
            .accounts
            .get(account_id)
            .map_or(0, |account| account.entries.len())
    }

    fn remove_waiter(&self, account_id: &str, id: u64) -> bool {
        let mut state = self.lock();
        let Some(account) = state.accounts.get_mut(account_id) else {
            return false;
        };
        let before = account.waiters.len();
        account.waiters.retain(|waiter| waiter.id != id);
        let removed = account.waiters.len() != before;
        state.prune(account_id);
        removed
    }

    /// Give back a handoff that its receiver will never use.
    fn reclaim(&self, account_id: &str, handoff: Handoff<S>) {
        let now = Instant::now();
        let to_close = {
            let mut state = self.lock();
            let to_close = match state.accounts.get_mut(account_id) {
                Some(account) => match handoff {
                    Handoff::Session(session) => {
                        account.unlease(&session);
                        account.dispatch(now, &self.config)
                    }
                    Handoff::Slot(generation) if generation == account.generation => {
                        account.creating -= 1;
                        account.dispatch(now, &self.config)
                    }
                    // Reserved in a pool that has since been torn down.
                    Handoff::Slot(_) => Vec::new(),
                },
                None => match handoff {
                    Handoff::Session(session) => vec![session],
                    Handoff::Slot(_) => Vec::new(),
                },
            };
            state.prune(account_id);
            to_close
        };
        close_detached(to_close);
    }
}

/// Returns a reserved slot if the factory fails or the future is dropped.
struct SlotGuard<'a, S: ManagedSession> {
    pool: &'a ConnectionPool<S>,
    account_id: &'a str,
    generation: u64,
    armed: bool,
}

impl<S: ManagedSession> Drop for SlotGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.reclaim(self.account_id, Handoff::Slot(self.generation));
        }
    }
}

/// A queued acquisition. Dropping it removes the waiter and returns
/// anything that was handed to it in the meantime.
struct Waiter<'a, S: ManagedSession> {
    pool: &'a ConnectionPool<S>,
    account_id: &'a str,
    id: u64,
    rx: Option<oneshot::Receiver<Handoff<S>>>,
}

impl<S: ManagedSession> Waiter<'_, S> {
    async fn wait(&mut self, timeout: Duration) -> Result<Handoff<S>, PoolError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(PoolError::Closed);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(handoff)) => {
                self.rx = None;
                Ok(handoff)
            }
            // Sender dropped: the pool or this account was torn down.
            Ok(Err(_)) => {
                self.rx = None;
                Err(PoolError::Closed)
            }
            Err(_) => {
                let removed = self.pool.remove_waiter(self.account_id, self.id);
                let late = self.rx.take().and_then(|mut rx| rx.try_recv().ok());
                match late {
                    Some(handoff) => Ok(handoff),
                    None if removed => {
                        tracing::warn!(
                            account_id = self.account_id,
                            waited_ms = timeout.as_millis() as u64,
                            "timed out waiting for pooled session"
                        );
                        Err(PoolError::Timeout {
                            account_id: self.account_id.to_string(),
                            waited: timeout,
                        })
                    }
                    None => Err(PoolError::Closed),
                }
            }
        }
    }
}

impl<S: ManagedSession> Drop for Waiter<'_, S> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        self.pool.remove_waiter(self.account_id, self.id);
        rx.close();
        if let Ok(handoff) = rx.try_recv() {
            self.pool.reclaim(self.account_id, handoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    #[derive(Debug)]
    struct FakeSession {
        account_id: String,
        serial: u32,
        alive: AtomicBool,
        closed: Arc<AtomicBool>,
    }

    impl FakeSession {
        fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ManagedSession for FakeSession {
        fn account_id(&self) -> &str {
            &self.account_id
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst) && !self.is_closed()
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Factory {
        opened: AtomicU32,
    }

    impl Factory {
        fn open(
            &self,
            account_id: &str,
        ) -> impl FnOnce() -> std::future::Ready<Result<FakeSession, SessionError>> {
            let serial = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            let account_id = account_id.to_string();
            move || {
                std::future::ready(Ok(FakeSession {
                    account_id,
                    serial,
                    alive: AtomicBool::new(true),
                    closed: Arc::new(AtomicBool::new(false)),
                }))
            }
        }

        fn opened(&self) -> u32 {
            self.opened.load(Ordering::SeqCst)
        }
    }

    fn pool(max: usize) -> ConnectionPool<FakeSession> {
        ConnectionPool::new(PoolConfig {
            max_connections_per_account: max,
            ..PoolConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn released_session_is_reused() {
        let pool = pool(5);
        let factory = Factory::default();

        let first = pool.acquire("a1", factory.open("a1")).await.unwrap();
        pool.release("a1", &first, false).await;
        let second = pool.acquire("a1", factory.open("a1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.session_count("a1"), 1);
        assert_eq!(pool.stats().leased, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_idle_session_goes_first() {
        let pool = pool(5);
        let factory = Factory::default();

        let a = pool.acquire("a1", factory.open("a1")).await.unwrap();
        let b = pool.acquire("a1", factory.open("a1")).await.unwrap();
        pool.release("a1", &b, false).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.release("a1", &a, false).await;

        let next = pool.acquire("a1", factory.open("a1")).await.unwrap();
        assert_eq!(next.serial, b.serial);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_and_dead_sessions_are_evicted_before_handout() {
        let pool = pool(5);
        let factory = Factory::default();

        let old = pool.acquire("a1", factory.open("a1")).await.unwrap();
        pool.release("a1", &old, false).await;
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;

        let fresh = pool.acquire("a1", factory.open("a1")).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(old.is_closed());

        pool.release("a1", &fresh, false).await;
        fresh.kill();
        let third = pool.acquire("a1", factory.open("a1")).await.unwrap();
        assert_eq!(third.serial, 3);
        assert!(fresh.is_closed());
        assert_eq!(pool.session_count("a1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_queues_and_release_serves_waiter() {
        let pool = Arc::new(pool(1));
        let factory = Arc::new(Factory::default());

        let held = pool.acquire("a1", factory.open("a1")).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { pool.acquire("a1", factory.open("a1")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.pending_count("a1"), 1);

        pool.release("a1", &held, false).await;
        let served = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&held, &served));
        assert_eq!(pool.pending_count("a1"), 0);
        assert_eq!(factory.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn evicting_release_hands_slot_to_waiter_factory() {
        let pool = Arc::new(pool(1));
        let factory = Arc::new(Factory::default());

        let held = pool.acquire("a1", factory.open("a1")).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { pool.acquire("a1", factory.open("a1")).await })
        };
        tokio::task::yield_now().await;

        pool.release("a1", &held, true).await;
        let served = waiter.await.unwrap().unwrap();

        assert!(held.is_closed());
        assert!(!Arc::ptr_eq(&held, &served));
        assert_eq!(served.serial, 2);
        assert_eq!(pool.session_count("a1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_and_leaves_no_trace() {
        let pool = pool(1);
        let factory = Factory::default();
        let _held = pool.acquire("a1", factory.open("a1")).await.unwrap();

        let err = pool.acquire("a1", factory.open("a1")).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(pool.pending_count("a1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn factory_failure_frees_the_slot() {
        let pool = pool(1);
        let factory = Factory::default();

        let err = pool
            .acquire("a1", || async {
                Err::<FakeSession, _>(SessionError::new("connect ETIMEDOUT"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Factory { .. }));
        assert_eq!(pool.stats(), PoolStats::default());

        pool.acquire("a1", factory.open("a1")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_does_not_leak_slot() {
        let pool = Arc::new(pool(1));
        let factory = Arc::new(Factory::default());
        let held = pool.acquire("a1", factory.open("a1")).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { pool.acquire("a1", factory.open("a1")).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(pool.pending_count("a1"), 0);

        pool.release("a1", &held, false).await;
        let again = pool.acquire("a1", factory.open("a1")).await.unwrap();
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_closes_everything_and_rejects_waiters() {
        let pool = Arc::new(pool(1));
        let factory = Arc::new(Factory::default());
        let leased = pool.acquire("a1", factory.open("a1")).await.unwrap();
        let idle = pool.acquire("a2", factory.open("a2")).await.unwrap();
        pool.release("a2", &idle, false).await;

        let waiter = {
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { pool.acquire("a1", factory.open("a1")).await })
        };
        tokio::task::yield_now().await;

        pool.close_all().await;

        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(leased.is_closed());
        assert!(idle.is_closed());
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(matches!(
            pool.acquire("a1", factory.open("a1")).await,
            Err(PoolError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_account_only_touches_that_account() {
        let pool = pool(2);
        let factory = Factory::default();
        let a = pool.acquire("a1", factory.open("a1")).await.unwrap();
        let b = pool.acquire("a2", factory.open("a2")).await.unwrap();

        pool.close_account_connections("a1").await;

        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(pool.session_count("a1"), 0);
        assert_eq!(pool.session_count("a2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_opened_across_teardown_is_closed_not_pooled() {
        let pool = Arc::new(pool(1));
        let factory = Factory::default();
        let late_closed = Arc::new(AtomicBool::new(false));

        let slow = {
            let pool = Arc::clone(&pool);
            let closed = Arc::clone(&late_closed);
            tokio::spawn(async move {
                pool.acquire("a1", move || async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, SessionError>(FakeSession {
                        account_id: "a1".to_string(),
                        serial: 0,
                        alive: AtomicBool::new(true),
                        closed,
                    })
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().creating, 1);

        pool.close_account_connections("a1").await;
        let fresh = pool.acquire("a1", factory.open("a1")).await.unwrap();

        assert!(matches!(slow.await.unwrap(), Err(PoolError::Closed)));
        assert!(late_closed.load(Ordering::SeqCst));
        assert!(!fresh.is_closed());
        assert_eq!(pool.session_count("a1"), 1);
        assert_eq!(pool.stats().creating, 0);
        assert_eq!(pool.stats().leased, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emptied_account_is_pruned() {
        let pool = pool(2);
        let factory = Factory::default();

        let session = pool.acquire("a1", factory.open("a1")).await.unwrap();
        pool.release("a1", &session, true).await;

        assert!(session.is_closed());
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
