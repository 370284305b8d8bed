//! Error classification for retry decisions
//!
//! Errors coming out of the chat and mailbox protocol layers are mostly
//! opaque strings (server responses, socket errors, library messages), so
//! classification is phrase based: a case-insensitive substring match
//! against curated indicator lists. Permanent-failure phrases win over any
//! transient phrase found in the same message, and anything unmatched is
//! treated as not retryable.

use std::error::Error as StdError;
use std::fmt;

/// Remote rate limiting.
const THROTTLE_INDICATORS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "too many connections",
    "too many simultaneous",
    "quota",
    "throttl",
    "try again later",
    "please try again",
    "bandwidth limit",
    "429",
];

/// Transient transport or session failures, including expired sessions.
const CONNECTION_INDICATORS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "econnreset",
    "econnrefused",
    "econnaborted",
    "ehostunreach",
    "enetunreach",
    "epipe",
    "socket",
    "connection reset",
    "connection closed",
    "connection lost",
    "connection refused",
    "connection terminated",
    "closed unexpectedly",
    "unexpected close",
    "broken pipe",
    "hang up",
    "not connected",
    "not authenticated",
    "session expired",
    "session has expired",
    "stream:error",
    "stream errored",
    "network",
    "unexpected eof",
];

/// Wrong or revoked credentials. Retrying only risks an account lockout.
const PERMANENT_AUTH_INDICATORS: &[&str] = &[
    "invalid credentials",
    "wrong password",
    "incorrect password",
    "bad credentials",
    "invalid login",
    "authentication failed",
    "authenticationfailed",
    "application-specific password required",
];

/// Protocol-level answers that will never change on retry.
const PERMANENT_PROTOCOL_INDICATORS: &[&str] = &[
    "[nonexistent]",
    "mailbox does not exist",
    "mailbox doesn't exist",
    "no such mailbox",
    "mailbox not found",
];

/// Top-level error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Remote rate limiting; retry with an extra backoff multiplier.
    Throttled,
    /// Transient transport/session failure; retry after reconnecting.
    ConnectionIssue,
    /// Wrong credentials; never retried.
    PermanentAuthFailure,
    /// Permanent protocol answer (e.g. nonexistent mailbox); never retried.
    PermanentProtocolFailure,
    /// Pool capacity exhausted; callers may retry later, nothing retries internally.
    PoolTimeout,
    /// Nothing matched; treated as not retryable.
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Throttled => "throttled",
            ErrorClass::ConnectionIssue => "connection",
            ErrorClass::PermanentAuthFailure => "auth_failure",
            ErrorClass::PermanentProtocolFailure => "protocol_failure",
            ErrorClass::PoolTimeout => "pool_timeout",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Result of classifying one error.
///
/// `throttled` and `connection_issue` are raw indicator hits and may both be
/// set; `retryable` already accounts for permanent-failure precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub throttled: bool,
    pub connection_issue: bool,
    pub retryable: bool,
    pub class: ErrorClass,
}

impl Classification {
    /// Classification for errors that are known not to be retryable here.
    pub fn fatal(class: ErrorClass) -> Self {
        Self {
            throttled: false,
            connection_issue: false,
            retryable: false,
            class,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Classify a raw error message.
pub fn classify_message(message: &str) -> Classification {
    let lowered = message.to_lowercase();

    let throttled = contains_any(&lowered, THROTTLE_INDICATORS);
    let connection_issue = contains_any(&lowered, CONNECTION_INDICATORS);

    let class = if contains_any(&lowered, PERMANENT_AUTH_INDICATORS) {
        ErrorClass::PermanentAuthFailure
    } else if contains_any(&lowered, PERMANENT_PROTOCOL_INDICATORS) {
        ErrorClass::PermanentProtocolFailure
    } else if throttled {
        ErrorClass::Throttled
    } else if connection_issue {
        ErrorClass::ConnectionIssue
    } else {
        ErrorClass::Unknown
    };

    Classification {
        throttled,
        connection_issue,
        retryable: matches!(class, ErrorClass::Throttled | ErrorClass::ConnectionIssue),
        class,
    }
}

/// Classify an error together with its `source()` chain.
///
/// Wrappers frequently hide the useful phrase ("socket hang up") one level
/// down, so every message in the chain takes part in the match.
pub fn classify_error(err: &(dyn StdError + 'static)) -> Classification {
    let mut combined = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        combined.push_str(" | ");
        combined.push_str(&inner.to_string());
        source = inner.source();
    }
    classify_message(&combined)
}

/// Trait for error classification
///
/// The default method classifies the rendered message, so any `Display`
/// error can opt in with an empty impl. Typed errors override it.
pub trait RetryClassifiable: fmt::Display {
    fn classify(&self) -> Classification {
        classify_message(&self.to_string())
    }

    fn is_retryable(&self) -> bool {
        self.classify().retryable
    }
}

impl RetryClassifiable for std::io::Error {
    fn classify(&self) -> Classification {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Classification {
                throttled: false,
                connection_issue: true,
                retryable: true,
                class: ErrorClass::ConnectionIssue,
            },
            _ => classify_error(self),
        }
    }
}

impl RetryClassifiable for Box<dyn StdError + Send + Sync> {
    fn classify(&self) -> Classification {
        classify_error(self.as_ref())
    }
}
