//! Registration request record and lifecycle state machine.
//!
//! A `RegistrationRequest` is one parent's attempt to register one dependent
//! for one session. Requests are created by the requester-facing collaborator
//! in `pending`; from there every mutation belongs to the engine.
//!
//! # State Machine
//!
//! ```text
//! pending --> scheduled --> allocating --> accepted --> confirmed
//!    |            |             |             |    \
//!    |            |             |             |     --> suspended
//!    |            |             |             |             |
//!    v            v             v             v             v
//! rejected     rejected      rejected      failed    accepted | failed
//! ```
//!
//! Terminal states are `confirmed`, `rejected`, and `failed`; no automated
//! transition ever leaves them. `allocating` is the transient in-transaction
//! status: a crash can strand a row there, so it stays eligible for the next
//! allocation cycle.
//!
//! # Key Invariant
//!
//! At most one request per (session, dependent) pair ever reaches
//! `confirmed`. Duplicate collapse happens in [`crate::resolver`] before any
//! seat is handed out.

mod error;

pub use error::RequestError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User-facing rejection/failure reasons (the error taxonomy).
///
/// These strings are the only failure text ever surfaced to a requester;
/// internal error detail stays in logs.
pub mod reason {
    /// A second request for the same (session, dependent) pair.
    pub const DUPLICATE: &str = "duplicate";
    /// The user exceeded the per-session pending request cap.
    pub const QUOTA_EXCEEDED: &str = "quota exceeded";
    /// Capacity was exhausted before this request's turn.
    pub const NO_SPOT: &str = "no spot";
    /// The human-verification window lapsed unresolved.
    pub const VERIFICATION_EXPIRED: &str = "verification expired";
    /// The human verification was attempted and did not succeed.
    pub const VERIFICATION_DECLINED: &str = "verification declined";
    /// Automated submission failed after exhausting its retry budget.
    pub const SUBMISSION_FAILED: &str = "submission failed";
    /// Payment capture failed or timed out.
    pub const PAYMENT_FAILED: &str = "payment failed";
}

/// Lifecycle status of a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created, session window not yet reached or not yet queued.
    Pending,
    /// Queued for allocation once the session window opens.
    Scheduled,
    /// Owned by an in-flight allocation transaction.
    Allocating,
    /// Won a seat; finalization (submission, charge) still outstanding.
    Accepted,
    /// Lost before allocation or to capacity; terminal.
    Rejected,
    /// Submission blocked on a human-verification challenge.
    Suspended,
    /// Seat secured and payment captured; terminal.
    Confirmed,
    /// Finalization failed; terminal.
    Failed,
}

impl RequestStatus {
    /// Returns the canonical string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Allocating => "allocating",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Suspended => "suspended",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status string.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidStatus`] for unknown values
    /// (fail-closed).
    pub fn parse(value: &str) -> Result<Self, RequestError> {
        match value {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "allocating" => Ok(Self::Allocating),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "suspended" => Ok(Self::Suspended),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(RequestError::InvalidStatus {
                value: value.to_string(),
            }),
        }
    }

    /// Whether no further automated transition leaves this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::Failed)
    }

    /// Whether a request in this status is eligible for allocation.
    ///
    /// `allocating` is included so rows stranded by a crash mid-transaction
    /// are picked up again on the next cycle.
    #[must_use]
    pub const fn is_allocatable(self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled | Self::Allocating)
    }

    /// Whether a request in this status holds a seat against capacity.
    ///
    /// Charge-failed requests also retain their seat; that case needs the
    /// charge record and is decided by the store, not here.
    #[must_use]
    pub const fn holds_seat(self) -> bool {
        matches!(self, Self::Accepted | Self::Suspended | Self::Confirmed)
    }

    /// Whether `self -> to` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Scheduled | Self::Allocating | Self::Rejected),
            Self::Scheduled => matches!(to, Self::Allocating | Self::Rejected),
            // allocating -> allocating covers crash re-pickup.
            Self::Allocating => matches!(
                to,
                Self::Allocating | Self::Accepted | Self::Rejected
            ),
            Self::Accepted => matches!(to, Self::Confirmed | Self::Suspended | Self::Failed),
            Self::Suspended => matches!(to, Self::Accepted | Self::Failed),
            Self::Confirmed | Self::Rejected | Self::Failed => false,
        }
    }
}

/// One parent's registration attempt for one dependent and one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Request identifier.
    pub request_id: String,

    /// Owning user (the parent account).
    pub user_id: String,

    /// Dependent (child) the seat is for.
    pub dependent_id: String,

    /// Target session.
    pub session_id: String,

    /// Priority requests order ahead of all non-priority requests.
    pub priority: bool,

    /// When the requester submitted the request. FIFO tie-break key.
    pub requested_at: DateTime<Utc>,

    /// Current lifecycle status.
    pub status: RequestStatus,

    /// Finalization attempts consumed so far.
    pub retry_count: u32,

    /// Earliest time the next finalization attempt may run (backoff gate).
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Taxonomy reason for the latest rejection/failure, if any.
    pub last_error: Option<String>,

    /// Row audit timestamps.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl RegistrationRequest {
    /// Creates a new request in `pending`.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        user_id: impl Into<String>,
        dependent_id: impl Into<String>,
        session_id: impl Into<String>,
        priority: bool,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            dependent_id: dependent_id.into(),
            session_id: session_id.into(),
            priority,
            requested_at,
            status: RequestStatus::Pending,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: requested_at,
            updated_at: requested_at,
        }
    }

    /// Applies a validated lifecycle transition.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidTransition`] if the edge is not part of
    /// the state machine. Terminal states reject every transition.
    pub fn transition(&mut self, to: RequestStatus, now: DateTime<Utc>) -> Result<(), RequestError> {
        if !self.status.can_transition_to(to) {
            return Err(RequestError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Transitions to `rejected` with a taxonomy reason.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidTransition`] if the request already
    /// left the allocatable statuses.
    pub fn reject(&mut self, why: &str, now: DateTime<Utc>) -> Result<(), RequestError> {
        self.transition(RequestStatus::Rejected, now)?;
        self.last_error = Some(why.to_string());
        Ok(())
    }

    /// Transitions to `failed` with a taxonomy reason.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidTransition`] if the current status has
    /// no edge to `failed`.
    pub fn fail(&mut self, why: &str, now: DateTime<Utc>) -> Result<(), RequestError> {
        self.transition(RequestStatus::Failed, now)?;
        self.last_error = Some(why.to_string());
        Ok(())
    }

    /// Records a failed finalization attempt and gates the next one.
    ///
    /// The request stays `accepted` (the seat is kept, its FIFO place never
    /// lost); callers decide beforehand whether budget remains.
    pub fn record_attempt_failure(&mut self, next_attempt_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
    }

    /// Whether a finalization attempt is due at `now`.
    #[must_use]
    pub fn attempt_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Accepted
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}
