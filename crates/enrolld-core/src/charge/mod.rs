//! Payment capture records with exactly-once semantics.
//!
//! A `ChargeRecord` exists only for requests whose automated submission was
//! confirmed; payment is deferred until a spot is actually secured. Records
//! are keyed by request id (one record per request, enforced with a UNIQUE
//! constraint by the store), and capture is idempotent: once a record is
//! `captured` it stays captured, and re-dispatching the charge is a no-op
//! success rather than a second capture.
//!
//! A capture failure or timeout is terminal for both the record and the
//! request. The seat is deliberately not released back to the pool: the
//! external registration already succeeded, and reassigning a seat that was
//! communicated as secured is worse than holding an unused one.

mod error;

pub use error::ChargeError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a charge record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    /// Capture is being attempted.
    Pending,
    /// Payment captured; never repeated.
    Captured,
    /// Capture failed or timed out; terminal.
    Failed,
}

impl ChargeStatus {
    /// Returns the canonical string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Captured => "captured",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status string.
    ///
    /// # Errors
    ///
    /// Returns [`ChargeError::InvalidStatus`] for unknown values
    /// (fail-closed).
    pub fn parse(value: &str) -> Result<Self, ChargeError> {
        match value {
            "pending" => Ok(Self::Pending),
            "captured" => Ok(Self::Captured),
            "failed" => Ok(Self::Failed),
            _ => Err(ChargeError::InvalidStatus {
                value: value.to_string(),
            }),
        }
    }
}

/// One payment capture attempt for one registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRecord {
    /// Charge identifier.
    pub charge_id: String,

    /// The registration request being charged. Doubles as the idempotency
    /// key sent to the payment processor.
    pub request_id: String,

    /// Amount in cents.
    pub amount_cents: i64,

    /// Current status.
    pub status: ChargeStatus,

    /// Processor reference for a captured charge.
    pub external_ref: Option<String>,

    /// Row audit timestamps.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl ChargeRecord {
    /// Creates a new `pending` record.
    #[must_use]
    pub fn new(
        charge_id: impl Into<String>,
        request_id: impl Into<String>,
        amount_cents: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            charge_id: charge_id.into(),
            request_id: request_id.into(),
            amount_cents,
            status: ChargeStatus::Pending,
            external_ref: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Marks the charge captured with the processor's reference.
    ///
    /// # Errors
    ///
    /// Returns [`ChargeError::AlreadyCaptured`] if the record is already
    /// captured, since a second capture must never happen.
    pub fn capture(
        &mut self,
        external_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ChargeError> {
        if self.status == ChargeStatus::Captured {
            return Err(ChargeError::AlreadyCaptured {
                request_id: self.request_id.clone(),
            });
        }
        self.status = ChargeStatus::Captured;
        self.external_ref = Some(external_ref.into());
        self.updated_at = now;
        Ok(())
    }

    /// Marks the capture failed.
    ///
    /// # Errors
    ///
    /// Returns [`ChargeError::AlreadyCaptured`] if the record is already
    /// captured, since a captured charge can never be downgraded.
    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<(), ChargeError> {
        if self.status == ChargeStatus::Captured {
            return Err(ChargeError::AlreadyCaptured {
                request_id: self.request_id.clone(),
            });
        }
        self.status = ChargeStatus::Failed;
        self.updated_at = now;
        Ok(())
    }
}
