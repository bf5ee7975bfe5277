//! Engine error types.
//!
//! The variants follow how an operator reacts: a `Precondition` means the
//! tenant cannot be moved as asked and nothing was written; `Transport`
//! carries the failing tool's diagnostic text and is safe to retry;
//! `Cancelled` and `TimedOut` mean the child process group was killed.

use std::time::Duration;

use thiserror::Error;

pub type ShiftResult<T> = Result<T, ShiftError>;

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{tool} exited with code {code}: {stderr}")]
    Transport {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("{tool} timed out after {after:?}")]
    TimedOut { tool: String, after: Duration },

    #[error("environment lookup failed for {env}: {message}")]
    Lookup { env: String, message: String },

    #[error("database error on {env}: {message}")]
    Database { env: String, message: String },

    #[error("invalid sync transition {from:?} -> {to:?}")]
    Phase {
        from: crate::sync::SyncPhase,
        to: crate::sync::SyncPhase,
    },

    #[error(transparent)]
    Core(#[from] shift_core::CoreError),

    #[error("ledger error: {0}")]
    State(#[from] shift_state::StateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShiftError {
    /// True when re-running the same operation is expected to be safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShiftError::Transport { .. }
                | ShiftError::TimedOut { .. }
                | ShiftError::Lookup { .. }
                | ShiftError::Database { .. }
        )
    }
}
