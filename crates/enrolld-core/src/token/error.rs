//! Token-specific error types.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced when constructing the service or verifying a token.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The configured secret is unusable.
    #[error("invalid token secret: {reason}")]
    InvalidSecret {
        /// Why the secret was rejected.
        reason: &'static str,
    },

    /// The token is structurally invalid (encoding, framing, claims shape).
    #[error("malformed resume token")]
    Malformed,

    /// The MAC did not verify under the server secret.
    #[error("resume token signature mismatch")]
    SignatureMismatch,

    /// The token's expiry has passed.
    #[error("resume token expired at {expired_at}")]
    Expired {
        /// When the token expired.
        expired_at: DateTime<Utc>,
    },
}
