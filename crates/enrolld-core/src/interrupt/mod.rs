//! Human-verification interrupt records.
//!
//! When automated submission is blocked by a human-verification challenge,
//! the attempt is suspended and an `InterruptRecord` is created to track the
//! outstanding human action.
//!
//! # State Machine
//!
//! ```text
//! (none) --suspend--> pending
//! pending --resume(solved)--> solved    [request re-enters finalization]
//! pending --resume(failed)--> failed    [request fails]
//! pending --expiry sweep-----> expired  [request fails]
//! ```
//!
//! # Key Invariants
//!
//! - Exactly one `pending` record may exist per request at a time;
//!   suspending an already-suspended request returns the existing token.
//! - A record leaves `pending` exactly once. The status flip is the
//!   single-use enforcement for the resume token: the token service itself
//!   is stateless (see [`crate::token`]).

mod error;

pub use error::InterruptError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an interrupt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptStatus {
    /// Awaiting the human action; the resume token is live.
    Pending,
    /// The verification was solved; the request went back to finalization.
    Solved,
    /// The window lapsed before resolution.
    Expired,
    /// The verification was attempted and declined/failed.
    Failed,
}

impl InterruptStatus {
    /// Returns the canonical string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Solved => "solved",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status string.
    ///
    /// # Errors
    ///
    /// Returns [`InterruptError::InvalidStatus`] for unknown values
    /// (fail-closed).
    pub fn parse(value: &str) -> Result<Self, InterruptError> {
        match value {
            "pending" => Ok(Self::Pending),
            "solved" => Ok(Self::Solved),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            _ => Err(InterruptError::InvalidStatus {
                value: value.to_string(),
            }),
        }
    }

    /// Whether the record has been resolved one way or another.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The human-reported outcome carried by a resume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// The verification challenge was solved.
    Solved,
    /// The verification challenge failed or was abandoned.
    Failed,
}

/// One outstanding (or resolved) human-verification interrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRecord {
    /// Interrupt identifier.
    pub interrupt_id: String,

    /// The suspended registration request.
    pub request_id: String,

    /// Provider/context label reported by the submission collaborator
    /// (which verification system blocked the attempt).
    pub provider: String,

    /// Current status.
    pub status: InterruptStatus,

    /// The opaque resume token issued for this record.
    pub resume_token: String,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// Hard deadline for the human action; past it the sweep fails the
    /// request.
    pub expires_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl InterruptRecord {
    /// Creates a new `pending` record.
    #[must_use]
    pub fn new(
        interrupt_id: impl Into<String>,
        request_id: impl Into<String>,
        provider: impl Into<String>,
        resume_token: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            interrupt_id: interrupt_id.into(),
            request_id: request_id.into(),
            provider: provider.into(),
            status: InterruptStatus::Pending,
            resume_token: resume_token.into(),
            created_at,
            expires_at,
            updated_at: created_at,
        }
    }

    /// Whether the record's deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Marks the verification solved. Consumes the token.
    ///
    /// # Errors
    ///
    /// Returns [`InterruptError::AlreadyResolved`] if the record already
    /// left `pending`.
    pub fn solve(&mut self, now: DateTime<Utc>) -> Result<(), InterruptError> {
        self.resolve(InterruptStatus::Solved, now)
    }

    /// Marks the verification failed/declined. Consumes the token.
    ///
    /// # Errors
    ///
    /// Returns [`InterruptError::AlreadyResolved`] if the record already
    /// left `pending`.
    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<(), InterruptError> {
        self.resolve(InterruptStatus::Failed, now)
    }

    /// Marks the record expired (sweep path). Consumes the token.
    ///
    /// # Errors
    ///
    /// Returns [`InterruptError::AlreadyResolved`] if the record already
    /// left `pending`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), InterruptError> {
        self.resolve(InterruptStatus::Expired, now)
    }

    fn resolve(&mut self, to: InterruptStatus, now: DateTime<Utc>) -> Result<(), InterruptError> {
        if self.status.is_resolved() {
            return Err(InterruptError::AlreadyResolved {
                interrupt_id: self.interrupt_id.clone(),
                status: self.status.as_str(),
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn record() -> InterruptRecord {
        InterruptRecord::new(
            "int-1",
            "req-1",
            "captcha",
            "token-opaque",
            t0(),
            t0() + chrono::Duration::minutes(30),
        )
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            InterruptStatus::Pending,
            InterruptStatus::Solved,
            InterruptStatus::Expired,
            InterruptStatus::Failed,
        ] {
            assert_eq!(InterruptStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(InterruptStatus::parse("waiting").is_err());
    }

    #[test]
    fn test_resolve_consumes_exactly_once() {
        let mut record = record();
        record.solve(t0()).unwrap();
        assert_eq!(record.status, InterruptStatus::Solved);

        // A second resolution attempt reports the already-resolved status,
        // regardless of the outcome it carries.
        let err = record.fail(t0()).unwrap_err();
        assert!(matches!(
            err,
            InterruptError::AlreadyResolved { status: "solved", .. }
        ));
    }

    #[test]
    fn test_expiry_window() {
        let record = record();
        assert!(!record.is_expired_at(t0()));
        assert!(!record.is_expired_at(record.expires_at - chrono::Duration::seconds(1)));
        assert!(record.is_expired_at(record.expires_at));
    }

    #[test]
    fn test_expire_then_resume_rejected() {
        let mut record = record();
        record.expire(record.expires_at).unwrap();
        assert_eq!(record.status, InterruptStatus::Expired);
        assert!(record.solve(record.expires_at).is_err());
    }
}
