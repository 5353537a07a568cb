//! Interrupt-specific error types.

use thiserror::Error;

/// Errors that can occur during interrupt record operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InterruptError {
    /// The record already left `pending`; its token was consumed.
    #[error("interrupt {interrupt_id} already resolved: {status}")]
    AlreadyResolved {
        /// The interrupt ID.
        interrupt_id: String,
        /// The resolved status it holds.
        status: &'static str,
    },

    /// Unknown stored status value.
    #[error("invalid interrupt status: {value}")]
    InvalidStatus {
        /// The invalid value provided.
        value: String,
    },
}
