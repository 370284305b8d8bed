//! Connection resilience for long-lived chat and mailbox sessions.
//!
//! - [`classifier`] / [`backoff`]: pure error labelling and delay math
//! - [`retry`]: bounded retry loops, with or without connection re-acquisition
//! - [`pool`]: per-account mailbox session pool
//! - [`reconnect`]: chat reconnection state machine with circuit breaker
//! - [`store`] / [`notify`]: persistence and subscriber boundaries
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's job.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod pool;
pub mod reconnect;
pub mod retry;
pub mod session;
pub mod store;

pub use classifier::{Classification, ErrorClass, RetryClassifiable};
pub use config::{ConfigLoader, ResilienceConfig};
pub use error::{BoxError, NotifyError, PoolError, SessionError, StoreError};
pub use notify::{BroadcastNotifier, NotificationSink, ReconnectionEvent};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use reconnect::{
    ChatConnector, ConnectOutcome, ReconnectConfig, ReconnectOutcome, ReconnectionManager,
    ReconnectionRegistry, ReconnectionStatus,
};
pub use retry::{RetryAbort, RetryConfig, retry, retry_cancellable, retry_with_reconnect};
pub use session::{AliveState, ManagedSession};
pub use store::{InMemorySessionStore, SessionStatus, SessionStore, StatusFields};
