//! Session error taxonomy
//!
//! The typed failures handed back to request-handling code. Storage and infrastructure
//! failures arrive wrapped in [`SessionError::Core`].

use stasis_core::{Revision, SessionId, StasisError};
use std::time::Duration;
use thiserror::Error;

/// Session operation result type
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend has no session with this id
    #[error("Session not found: {session_id}")]
    NotFound { session_id: SessionId },

    /// A ReadWrite acquisition could not get the session lock in time
    #[error("Timed out after {waited:?} waiting for the lock on session {session_id}")]
    LockTimeout {
        session_id: SessionId,
        waited: Duration,
    },

    /// An optimistic commit lost the race; nothing was written
    #[error("Session {session_id} changed since it was read (expected {expected:?}, found {actual:?})")]
    Conflict {
        session_id: SessionId,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },

    /// A mutation or commit was attempted through a ReadOnly handle
    #[error("Session {session_id} was opened read-only; cannot {attempted}")]
    ReadOnlyViolation {
        session_id: SessionId,
        attempted: String,
    },

    /// The watchdog broke this handle's lock; its state can no longer be trusted
    #[error("Lock on session {session_id} was lost before the handle closed")]
    LockLost { session_id: SessionId },

    /// A granular operation was malformed or did not fit the stored data
    #[error("Invalid operation on session {session_id}: {reason}")]
    InvalidOperation {
        session_id: SessionId,
        reason: String,
    },

    /// A path could not be parsed or passes through a non-map value
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Unlock was requested by someone who does not hold the lock
    #[error("Lock on session {session_id} is not held by {holder}")]
    NotHeld { session_id: SessionId, holder: String },

    #[error("Core error: {0}")]
    Core(#[source] StasisError),
}

impl SessionError {
    /// Lift a core error into the session taxonomy
    pub fn from_core(session_id: &SessionId, error: StasisError) -> Self {
        match error {
            StasisError::NotFound { .. } => SessionError::NotFound {
                session_id: session_id.clone(),
            },
            StasisError::InvalidOperation { message, .. } => SessionError::InvalidOperation {
                session_id: session_id.clone(),
                reason: message,
            },
            StasisError::InvalidPath { path, message, .. } => SessionError::InvalidPath {
                path,
                reason: message,
            },
            other => SessionError::Core(other),
        }
    }

    /// Check if the error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Conflict { .. } => true,
            Self::LockLost { .. } => true,
            Self::Core(inner) => inner.is_recoverable(),
            Self::NotFound { .. } => false,
            Self::ReadOnlyViolation { .. } => false,
            Self::InvalidOperation { .. } => false,
            Self::InvalidPath { .. } => false,
            Self::NotHeld { .. } => false,
        }
    }

    /// Suggested backoff before the caller starts over from a fresh `acquire`
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::LockTimeout { .. } => Some(Duration::from_millis(100)),
            Self::Conflict { .. } => Some(Duration::from_millis(10)),
            Self::LockLost { .. } => Some(Duration::from_millis(50)),
            Self::Core(inner) => inner.retry_delay_ms().map(Duration::from_millis),
            _ => None,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Conflict { .. } => "conflict",
            Self::ReadOnlyViolation { .. } => "read_only",
            Self::LockLost { .. } => "lock_lost",
            Self::InvalidOperation { .. } => "invalid_operation",
            Self::InvalidPath { .. } => "invalid_path",
            Self::NotHeld { .. } => "not_held",
            Self::Core(_) => "storage",
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { .. } => "Your session has expired. Please start again.".to_string(),
            Self::LockTimeout { .. } => {
                "The session is busy with another request. Please try again.".to_string()
            }
            Self::Conflict { .. } | Self::LockLost { .. } => {
                "The session was changed by another request. Please retry.".to_string()
            }
            Self::InvalidOperation { reason, .. } => format!("Invalid request: {}", reason),
            Self::InvalidPath { path, .. } => format!("Invalid session key: {}", path),
            _ => "An internal error occurred. Please contact support if this persists."
                .to_string(),
        }
    }
}
