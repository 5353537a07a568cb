//! Store-specific error types.

use enrolld_core::charge::ChargeError;
use enrolld_core::interrupt::InterruptError;
use enrolld_core::request::RequestError;
use enrolld_core::session::SessionError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The per-session allocation transaction could not be obtained; the
    /// session is skipped this cycle and retried next cycle.
    #[error("allocation transaction contended for session {session_id}")]
    Contended {
        /// The session being allocated.
        session_id: String,
    },

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("request", "interrupt", "charge").
        entity: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// A resume was attempted for a request that is not suspended.
    #[error("request {request_id} is not suspended (status: {status})")]
    NotSuspended {
        /// The request ID.
        request_id: String,
        /// Its current status.
        status: &'static str,
    },

    /// The connection mutex was poisoned by a panicking thread.
    #[error("store connection lock poisoned")]
    LockPoisoned,

    /// Request lifecycle violation.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Interrupt lifecycle violation (including a reused resume token).
    #[error(transparent)]
    Interrupt(#[from] InterruptError),

    /// Charge lifecycle violation (including a double capture).
    #[error(transparent)]
    Charge(#[from] ChargeError),

    /// Corrupt session row.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Maps `SQLITE_BUSY`/`SQLITE_LOCKED` on the allocation path to
    /// [`StoreError::Contended`]; anything else passes through.
    pub(crate) fn contended_or(session_id: &str, err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            Self::Contended {
                session_id: session_id.to_string(),
            }
        } else {
            Self::Sqlite(err)
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
