//! Messaging module: reply threads, revision tracking, notifications, unread
//! index and identity retention.
//!
//! # Transaction pattern
//!
//! Every logical write (send, edit, account deletion) runs as one SQLite
//! transaction opened by [`MessagingService`](service::MessagingService). The
//! component modules ([`revisions`], [`notifications`], [`retention`]) never open
//! transactions themselves; they take the transaction's connection and perform
//! their derived writes on it, so the primary row and its side effects commit or
//! roll back together.
//!
//! SQLite has no `SELECT ... FOR UPDATE`. Write paths that read before writing
//! first issue a no-op `UPDATE` on the row they depend on, which takes the
//! database write lock before the read (see [`store::lock_message`]).
//!
//! Read paths ([`thread`], [`unread`]) use a plain pooled connection.

pub mod model;
pub mod notifications;
pub mod retention;
pub mod revisions;
pub mod service;
pub mod store;
pub mod thread;
pub mod unread;

use std::fmt;

use serde::Serialize;

pub use self::model::{
    Identity, InboxEntry, Message, Notification, Participant, Revision, ThreadNode,
};
pub use self::retention::RemovalReport;
pub use self::service::{Caller, EditMessage, EditResult, MessagingService, RetryPolicy, SendMessage};
pub use self::store::MessageStore;

/// SQLite primary result codes that signal lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Stable, machine-readable error codes for calling layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A message, identity or parent does not exist.
    NotFound,
    /// The caller does not participate in the thread or message.
    Forbidden,
    /// The request is malformed (empty content, duplicate username, ...).
    Validation,
    /// Stored data breaks a structural invariant (cycle, dangling ancestor).
    ConsistencyViolation,
    /// The atomic write could not commit; the whole operation may be retried.
    TransactionFailure,
    /// Any other storage failure.
    Storage,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Validation => "validation",
            Self::ConsistencyViolation => "consistency_violation",
            Self::TransactionFailure => "transaction_failure",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the messaging subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The referenced message, identity or parent does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to act on the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Stored data violates a structural invariant. Callers must not retry blindly.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The transaction could not commit because of contention.
    #[error("transaction failed: {0}")]
    TransactionFailure(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl MessagingError {
    /// The stable code for this error kind.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Validation(_) => ErrorCode::Validation,
            Self::ConsistencyViolation(_) => ErrorCode::ConsistencyViolation,
            Self::TransactionFailure(_) => ErrorCode::TransactionFailure,
            Self::Database(_) => ErrorCode::Storage,
        }
    }

    /// Whether repeating the whole logical operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionFailure(_))
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        if is_contention(&err) {
            Self::TransactionFailure(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

/// Busy/locked database errors and pool exhaustion are transient.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff)
            .is_some_and(|primary| primary == SQLITE_BUSY || primary == SQLITE_LOCKED),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
