//! External collaborator seams.
//!
//! The engine never talks to the outside world directly; it goes through
//! these traits. Production wiring uses the HTTP adapters in
//! [`super::http`]; tests inject scripted fakes. Implementations must be
//! `Send + Sync` so the finalization worker pool can share them.

use async_trait::async_trait;
use enrolld_core::request::RegistrationRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Transport-level collaborator failure (network, decoding, 5xx).
///
/// Domain outcomes travel in the outcome enums below; this error means the
/// call itself did not complete.
#[derive(Debug, Error)]
#[error("collaborator call failed: {message}")]
pub struct CollaboratorError {
    /// Human-readable cause, kept out of user-facing output.
    pub message: String,
}

impl CollaboratorError {
    /// Creates an error from any displayable cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the submission collaborator reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// The registration form was submitted and the seat is secured.
    Confirmed,
    /// Submission is blocked on a human-verification challenge.
    VerificationRequired {
        /// Which verification system blocked the attempt.
        provider: String,
    },
    /// Submission failed for a non-verification reason.
    Failed {
        /// Collaborator-reported cause, logged but never shown to users.
        reason: String,
    },
}

/// What the payment processor reports for one capture call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// The charge was captured.
    Captured {
        /// Processor reference for the captured charge.
        reference: String,
    },
    /// The charge was declined or errored.
    Failed {
        /// Processor-reported cause, logged but never shown to users.
        reason: String,
    },
}

/// Automated registration submission (browser automation provider).
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// Attempts to submit the registration form for an accepted request.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the call itself fails; the engine
    /// treats that like a failed attempt under the retry budget.
    async fn submit(
        &self,
        request: &RegistrationRequest,
    ) -> Result<SubmissionOutcome, CollaboratorError>;
}

/// Payment capture (external processor).
#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Captures payment for a secured seat.
    ///
    /// `idempotency_key` is the request id; the processor must treat a
    /// repeated key as the same capture.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the call itself fails; the engine
    /// treats that as a capture failure (never an ambiguous retry).
    async fn capture(
        &self,
        idempotency_key: &str,
        amount_cents: i64,
    ) -> Result<PaymentOutcome, CollaboratorError>;
}

/// Notification delivery (email/SMS service). Fire-and-forget.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification to a user.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on delivery failure; callers log and
    /// move on.
    async fn notify(
        &self,
        user_id: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_outcome_wire_shape() {
        let confirmed: SubmissionOutcome = serde_json::from_str(r#"{"result":"confirmed"}"#).unwrap();
        assert_eq!(confirmed, SubmissionOutcome::Confirmed);

        let blocked: SubmissionOutcome = serde_json::from_str(
            r#"{"result":"verification_required","provider":"captcha"}"#,
        )
        .unwrap();
        assert_eq!(
            blocked,
            SubmissionOutcome::VerificationRequired {
                provider: "captcha".to_string()
            }
        );

        // Unknown tags are rejected at the boundary.
        assert!(serde_json::from_str::<SubmissionOutcome>(r#"{"result":"maybe"}"#).is_err());
    }

    #[test]
    fn test_payment_outcome_wire_shape() {
        let captured: PaymentOutcome =
            serde_json::from_str(r#"{"result":"captured","reference":"psp_1"}"#).unwrap();
        assert_eq!(
            captured,
            PaymentOutcome::Captured {
                reference: "psp_1".to_string()
            }
        );
    }
}
