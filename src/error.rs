//! Error taxonomy for the subscription streaming engine.
//!
//! Two enums, matching the two failure domains named in the design: [`CoordinationError`]
//! is what the coordination store adapter (C3) can return, and [`SessionError`] is what the
//! session loop itself surfaces on its way into `Closing`. Dropped-event and client-facing
//! errors are not modelled here: they never reach the loop as a `Result::Err` (see
//! `pipeline` and `commit` respectively).

use thiserror::Error;

use crate::types::{PartitionKey, SessionId};

/// Failures reported by a [`crate::coordination::CoordinationClient`] implementation.
#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    /// Transient: the coordination store could not be reached or timed out.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// Fatal: the session row is gone, most likely expired or deleted by another actor.
    #[error("session {0} not found in coordination store")]
    SessionNotFound(SessionId),

    /// A distributed lock could not be acquired within the call's budget.
    #[error("failed to acquire lock for subscription {0}: {1}")]
    LockFailed(String, String),
}

/// Reasons a session transitions to `Closing`, carried as the optional payload of that state.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("session no longer registered")]
    SessionNotFound,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("invalid starting cursor for partition {0:?}: {1}")]
    InvalidCursor(PartitionKey, String),

    #[error("commit timeout exceeded on partition {0:?}")]
    CommitTimeout(PartitionKey),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("output write failed: {0}")]
    OutputFailed(String),

    #[error("unprocessable event policy aborted the session: {0}")]
    Unprocessable(String),

    #[error("terminate() requested by caller")]
    Terminated,

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

impl From<CoordinationError> for SessionError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::Unavailable(msg) => SessionError::CoordinationUnavailable(msg),
            CoordinationError::SessionNotFound(_) => SessionError::SessionNotFound,
            CoordinationError::LockFailed(sub, msg) => {
                SessionError::CoordinationUnavailable(format!("lock on {sub}: {msg}"))
            }
        }
    }
}

/// Raised by [`crate::config::SessionBuilder::build`] when a mandatory field is missing or a
/// stream parameter is out of range. Never a panic: configuration errors are always
/// recoverable by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{field} must be greater than zero, got {value}")]
    MustBePositive { field: &'static str, value: u64 },
}

pub type Result<T> = std::result::Result<T, SessionError>;
