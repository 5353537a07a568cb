//! Charge-specific error types.

use thiserror::Error;

/// Errors that can occur during charge record operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChargeError {
    /// The request already has a captured charge.
    #[error("request {request_id} already has a captured charge")]
    AlreadyCaptured {
        /// The request ID.
        request_id: String,
    },

    /// Unknown stored status value.
    #[error("invalid charge status: {value}")]
    InvalidStatus {
        /// The invalid value provided.
        value: String,
    },
}
