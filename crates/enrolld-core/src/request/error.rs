//! Request-specific error types.

use thiserror::Error;

/// Errors that can occur during request lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The attempted lifecycle transition is not part of the state machine.
    #[error("request {request_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// The request ID.
        request_id: String,
        /// Current status.
        from: &'static str,
        /// Attempted status.
        to: &'static str,
    },

    /// Unknown stored status value.
    #[error("invalid request status: {value}")]
    InvalidStatus {
        /// The invalid value provided.
        value: String,
    },
}
