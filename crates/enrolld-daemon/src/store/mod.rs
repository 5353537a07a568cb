//! Persistent stores backed by `SQLite`.
//!
//! This module owns every row the engine mutates: registration requests,
//! interrupt records, charge records, the notification audit log, and the
//! read-only session catalog mirror.
//!
//! # Schema
//!
//! The `sessions` table mirrors the catalog (`session_id`, `capacity`,
//! `opens_at`, `price_cents`, `status`). The `registration_requests`,
//! `interrupt_records`, and `charge_records` tables carry the lifecycle
//! state defined in `enrolld-core`, each with created/updated audit
//! timestamps stored as Unix milliseconds. `notification_log` records one
//! row per user-visible transition.
//!
//! # Concurrency
//!
//! The connection sits behind a mutex; every multi-step mutation runs in a
//! `BEGIN IMMEDIATE` transaction. The allocation critical section
//! ([`Store::allocate_session`]) is one such transaction per session, so a
//! concurrent cycle invocation (same process or another) always observes the
//! committed accepted/confirmed counts before deciding. `SQLITE_BUSY` is
//! surfaced as [`StoreError::Contended`] and callers skip the session for
//! the cycle; no partial accept is ever persisted.
//!
//! # Invariants enforced here
//!
//! - At most one `pending` interrupt per request (partial unique index +
//!   idempotent suspend).
//! - At most one charge record per request (unique key), captured at most
//!   once (state-machine guard in `enrolld-core`).
//! - Seat occupancy counts `accepted`/`suspended`/`confirmed` rows plus
//!   `failed` rows that own a charge record (a charge-failed seat is kept).

mod error;
#[cfg(test)]
mod tests;

pub use error::StoreError;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use enrolld_core::allocator::{self, AllocationPlan};
use enrolld_core::charge::{ChargeRecord, ChargeStatus};
use enrolld_core::interrupt::{InterruptRecord, InterruptStatus, ResumeOutcome};
use enrolld_core::request::{RegistrationRequest, RequestStatus, reason};
use enrolld_core::resolver::{self, Rejection};
use enrolld_core::retry::RetryPolicy;
use enrolld_core::session::{Session, SessionStatus};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id   TEXT PRIMARY KEY,
    capacity     INTEGER NOT NULL,
    opens_at     INTEGER NOT NULL,
    price_cents  INTEGER NOT NULL DEFAULT 0,
    status       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS registration_requests (
    request_id      TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    dependent_id    TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    requested_at    INTEGER NOT NULL,
    status          TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER,
    last_error      TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_session_status
    ON registration_requests (session_id, status);
CREATE INDEX IF NOT EXISTS idx_requests_status
    ON registration_requests (status);

CREATE TABLE IF NOT EXISTS interrupt_records (
    interrupt_id TEXT PRIMARY KEY,
    request_id   TEXT NOT NULL REFERENCES registration_requests (request_id),
    provider     TEXT NOT NULL,
    status       TEXT NOT NULL,
    resume_token TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_interrupts_one_pending
    ON interrupt_records (request_id) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_interrupts_status_expiry
    ON interrupt_records (status, expires_at);

CREATE TABLE IF NOT EXISTS charge_records (
    charge_id    TEXT PRIMARY KEY,
    request_id   TEXT NOT NULL UNIQUE REFERENCES registration_requests (request_id),
    amount_cents INTEGER NOT NULL,
    status       TEXT NOT NULL,
    external_ref TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    kind       TEXT NOT NULL,
    reason     TEXT,
    delivered  INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
";

const REQUEST_COLUMNS: &str = "request_id, user_id, dependent_id, session_id, priority, \
     requested_at, status, retry_count, next_attempt_at, last_error, created_at, updated_at";

const INTERRUPT_COLUMNS: &str =
    "interrupt_id, request_id, provider, status, resume_token, created_at, expires_at, updated_at";

const CHARGE_COLUMNS: &str =
    "charge_id, request_id, amount_cents, status, external_ref, created_at, updated_at";

/// The accept/reject outcome of one session's allocation transaction.
#[derive(Debug, Clone, Default)]
pub struct SessionDecisions {
    /// Session the decisions belong to.
    pub session_id: String,
    /// Requests that won a seat, in allocation order.
    pub accepted: Vec<RegistrationRequest>,
    /// Requests turned away (duplicate, quota, no spot).
    pub rejections: Vec<Rejection>,
}

/// What the store did with a suspend call.
#[derive(Debug, Clone)]
pub enum SuspendDisposition {
    /// The request was suspended and the new record stored.
    Created(InterruptRecord),
    /// A `pending` record already existed; its token stands.
    Existing(InterruptRecord),
}

impl SuspendDisposition {
    /// The record in effect, created or pre-existing.
    #[must_use]
    pub const fn record(&self) -> &InterruptRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }
}

/// How a failed submission attempt was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Budget remains; the request stays `accepted`, gated until the given
    /// time.
    Retrying {
        /// Earliest next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Budget exhausted; the request is now terminally `failed`.
    Exhausted,
}

/// A swept interrupt, returned for notification fan-out.
#[derive(Debug, Clone)]
pub struct ExpiredInterrupt {
    /// The expired record.
    pub interrupt_id: String,
    /// The request that was failed.
    pub request_id: String,
    /// Owning user.
    pub user_id: String,
}

/// SQLite-backed store shared by the engine and the control plane.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the database cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        Self::init(conn)
    }

    /// Opens an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Fail fast on cross-process lock contention; the cycle skips the
        // session and retries next cycle.
        conn.busy_timeout(Duration::from_millis(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // ------------------------------------------------------------------
    // Session catalog mirror
    // ------------------------------------------------------------------

    /// Inserts or replaces a session row (catalog sync path, test seeding).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (session_id, capacity, opens_at, price_cents, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (session_id) DO UPDATE SET
                 capacity = excluded.capacity,
                 opens_at = excluded.opens_at,
                 price_cents = excluded.price_cents,
                 status = excluded.status",
            params![
                session.session_id,
                session.capacity,
                session.opens_at.timestamp_millis(),
                session.price_cents,
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Loads one session.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.lock()?;
        session_row(&conn, session_id)
    }

    /// Sessions whose window is open at `now` and that still have eligible
    /// requests, oldest `opens_at` first, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn open_session_ids(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.session_id FROM sessions s
             WHERE s.status = 'open' AND s.opens_at <= ?1
               AND EXISTS (
                   SELECT 1 FROM registration_requests r
                   WHERE r.session_id = s.session_id
                     AND r.status IN ('pending', 'scheduled', 'allocating'))
             ORDER BY s.opens_at ASC, s.session_id ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![now.timestamp_millis(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Registration requests
    // ------------------------------------------------------------------

    /// Inserts a new request row (intake path, test seeding).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure (including a duplicate
    /// request id).
    pub fn insert_request(&self, request: &RegistrationRequest) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO registration_requests ({REQUEST_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                request.request_id,
                request.user_id,
                request.dependent_id,
                request.session_id,
                request.priority,
                request.requested_at.timestamp_millis(),
                request.status.as_str(),
                request.retry_count,
                request.next_attempt_at.map(|at| at.timestamp_millis()),
                request.last_error,
                request.created_at.timestamp_millis(),
                request.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Loads one request.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn request(&self, request_id: &str) -> Result<Option<RegistrationRequest>, StoreError> {
        let conn = self.lock()?;
        request_row(&conn, request_id)
    }

    /// All requests targeting a session (diagnostics, tests).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn requests_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<RegistrationRequest>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM registration_requests
             WHERE session_id = ?1 ORDER BY requested_at ASC, request_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_id], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Seats currently held against a session's capacity.
    ///
    /// Counts `accepted`, `suspended`, and `confirmed` rows, plus `failed`
    /// rows owning a charge record: a charge-failed registration keeps its
    /// seat rather than silently reassigning a success already communicated.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn occupied_seats(&self, session_id: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        occupied_seats_on(&conn, session_id)
    }

    // ------------------------------------------------------------------
    // Allocation critical section
    // ------------------------------------------------------------------

    /// Runs one session's allocation transaction: resolve duplicates and
    /// quota, order candidates, accept up to the free capacity, reject the
    /// rest.
    ///
    /// The whole read-then-decide runs inside `BEGIN IMMEDIATE`, so two
    /// overlapping cycles serialize here and can never both accept past
    /// capacity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contended`] if the transaction cannot be
    /// obtained (the caller skips the session this cycle), or another
    /// [`StoreError`] on storage failure.
    pub fn allocate_session(
        &self,
        session_id: &str,
        per_user_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<SessionDecisions, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::contended_or(session_id, err))?;

        let mut decisions = SessionDecisions {
            session_id: session_id.to_string(),
            ..SessionDecisions::default()
        };

        let Some(session) = session_row(&txn, session_id)? else {
            return Ok(decisions);
        };
        if !session.is_open_at(now) {
            return Ok(decisions);
        }

        let mut eligible = {
            let mut stmt = txn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM registration_requests
                 WHERE session_id = ?1 AND status IN ('pending', 'scheduled', 'allocating')"
            ))?;
            let rows = stmt
                .query_map(params![session_id], request_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        // Walk each row through `allocating` so every accept/reject below is
        // a validated lifecycle edge.
        for request in &mut eligible {
            request.transition(RequestStatus::Allocating, now)?;
        }

        let occupied = occupied_seats_on(&txn, session_id)?;
        let resolution = resolver::resolve_session(eligible, per_user_cap);
        let plan: AllocationPlan =
            allocator::plan(&resolution.candidates, session.capacity, occupied);

        for rejection in resolution.rejections.iter().chain(plan.rejected.iter()) {
            txn.execute(
                "UPDATE registration_requests
                 SET status = 'rejected', last_error = ?2, updated_at = ?3
                 WHERE request_id = ?1",
                params![rejection.request_id, rejection.reason, now.timestamp_millis()],
            )?;
        }

        let mut accepted = Vec::with_capacity(plan.accepted.len());
        let mut candidates_by_id: std::collections::HashMap<String, RegistrationRequest> =
            resolution
                .candidates
                .into_iter()
                .map(|request| (request.request_id.clone(), request))
                .collect();
        for request_id in &plan.accepted {
            txn.execute(
                "UPDATE registration_requests
                 SET status = 'accepted', next_attempt_at = ?2, updated_at = ?2
                 WHERE request_id = ?1",
                params![request_id, now.timestamp_millis()],
            )?;
            if let Some(mut request) = candidates_by_id.remove(request_id) {
                request.transition(RequestStatus::Accepted, now)?;
                request.next_attempt_at = Some(now);
                accepted.push(request);
            }
        }

        txn.commit()?;

        decisions.accepted = accepted;
        decisions.rejections = resolution
            .rejections
            .into_iter()
            .chain(plan.rejected)
            .collect();
        Ok(decisions)
    }

    // ------------------------------------------------------------------
    // Finalization support
    // ------------------------------------------------------------------

    /// Accepted requests whose next attempt is due at `now`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn due_for_finalization(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RegistrationRequest>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM registration_requests
             WHERE status = 'accepted'
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY requested_at ASC, request_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![now.timestamp_millis()], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Claims the due accepted requests for one finalization pass.
    ///
    /// The claim moves each row's attempt gate to `claim_until` inside one
    /// transaction, so an overlapping cycle invocation scanning at the same
    /// time finds nothing to finalize: at most one worker drives a request
    /// at a time. If the worker dies mid-flight the claim lapses and a later
    /// cycle picks the request up again.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn claim_due_for_finalization(
        &self,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> Result<Vec<RegistrationRequest>, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut due: Vec<RegistrationRequest> = {
            let mut stmt = txn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM registration_requests
                 WHERE status = 'accepted'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY requested_at ASC, request_id ASC"
            ))?;
            let rows = stmt
                .query_map(params![now.timestamp_millis()], request_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for request in &mut due {
            txn.execute(
                "UPDATE registration_requests SET next_attempt_at = ?2, updated_at = ?3
                 WHERE request_id = ?1",
                params![
                    request.request_id,
                    claim_until.timestamp_millis(),
                    now.timestamp_millis(),
                ],
            )?;
            request.next_attempt_at = Some(claim_until);
        }

        txn.commit()?;
        Ok(due)
    }

    /// Absorbs a failed (or timed-out) submission attempt under the retry
    /// policy: either gates the next attempt or fails the request
    /// terminally.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure, a missing request, or an
    /// illegal lifecycle state.
    pub fn record_submission_failure(
        &self,
        request_id: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut request = request_row(&txn, request_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "request",
            id: request_id.to_string(),
        })?;

        let attempts_used = request.retry_count + 1;
        let disposition = if policy.attempts_remain(attempts_used) {
            let next_attempt_at = now
                + chrono::Duration::from_std(policy.next_delay(attempts_used))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            request.record_attempt_failure(next_attempt_at, now);
            txn.execute(
                "UPDATE registration_requests
                 SET retry_count = ?2, next_attempt_at = ?3, updated_at = ?4
                 WHERE request_id = ?1",
                params![
                    request_id,
                    request.retry_count,
                    next_attempt_at.timestamp_millis(),
                    now.timestamp_millis(),
                ],
            )?;
            FailureDisposition::Retrying { next_attempt_at }
        } else {
            request.fail(reason::SUBMISSION_FAILED, now)?;
            txn.execute(
                "UPDATE registration_requests
                 SET status = 'failed', retry_count = ?2, last_error = ?3, updated_at = ?4
                 WHERE request_id = ?1",
                params![
                    request_id,
                    attempts_used,
                    reason::SUBMISSION_FAILED,
                    now.timestamp_millis(),
                ],
            )?;
            FailureDisposition::Exhausted
        };

        txn.commit()?;
        Ok(disposition)
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    /// Suspends an accepted request behind a human-verification interrupt.
    ///
    /// Idempotent: if a `pending` record already exists for the request, it
    /// is returned unchanged (same token) and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure, a missing request, or an
    /// illegal lifecycle state.
    pub fn suspend_request(
        &self,
        candidate: InterruptRecord,
        now: DateTime<Utc>,
    ) -> Result<SuspendDisposition, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = pending_interrupt_row(&txn, &candidate.request_id)? {
            return Ok(SuspendDisposition::Existing(existing));
        }

        let mut request =
            request_row(&txn, &candidate.request_id)?.ok_or_else(|| StoreError::NotFound {
                entity: "request",
                id: candidate.request_id.clone(),
            })?;
        request.transition(RequestStatus::Suspended, now)?;

        txn.execute(
            &format!(
                "INSERT INTO interrupt_records ({INTERRUPT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                candidate.interrupt_id,
                candidate.request_id,
                candidate.provider,
                candidate.status.as_str(),
                candidate.resume_token,
                candidate.created_at.timestamp_millis(),
                candidate.expires_at.timestamp_millis(),
                candidate.updated_at.timestamp_millis(),
            ],
        )?;
        txn.execute(
            "UPDATE registration_requests SET status = 'suspended', updated_at = ?2
             WHERE request_id = ?1",
            params![candidate.request_id, now.timestamp_millis()],
        )?;

        txn.commit()?;
        Ok(SuspendDisposition::Created(candidate))
    }

    /// Loads one interrupt record.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn interrupt(&self, interrupt_id: &str) -> Result<Option<InterruptRecord>, StoreError> {
        let conn = self.lock()?;
        interrupt_row(&conn, interrupt_id)
    }

    /// Consumes a verified resume token: flips the interrupt record out of
    /// `pending` and moves the request accordingly, atomically.
    ///
    /// This status flip is the single-use enforcement for resume tokens: the
    /// first call wins, every later call sees the resolved record.
    ///
    /// `expected_request_id` comes from the verified token claims and must
    /// match the record's owner; a mismatch is treated as an unknown
    /// interrupt.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the interrupt does not exist (or is
    ///   bound to a different request than the token claims)
    /// - [`StoreError::Interrupt`] (`AlreadyResolved`) if the token was
    ///   already consumed
    /// - [`StoreError::NotSuspended`] if the request has moved on
    /// - any other [`StoreError`] on storage failure
    pub fn resume_request(
        &self,
        interrupt_id: &str,
        expected_request_id: &str,
        outcome: ResumeOutcome,
        now: DateTime<Utc>,
    ) -> Result<RegistrationRequest, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut interrupt =
            interrupt_row(&txn, interrupt_id)?.ok_or_else(|| StoreError::NotFound {
                entity: "interrupt",
                id: interrupt_id.to_string(),
            })?;
        if interrupt.request_id != expected_request_id {
            return Err(StoreError::NotFound {
                entity: "interrupt",
                id: interrupt_id.to_string(),
            });
        }

        let mut request =
            request_row(&txn, &interrupt.request_id)?.ok_or_else(|| StoreError::NotFound {
                entity: "request",
                id: interrupt.request_id.clone(),
            })?;

        // Consume-once check first: a reused token always reports "already
        // resolved", regardless of request state or outcome.
        match outcome {
            ResumeOutcome::Solved => interrupt.solve(now)?,
            ResumeOutcome::Failed => interrupt.fail(now)?,
        }

        if request.status != RequestStatus::Suspended {
            return Err(StoreError::NotSuspended {
                request_id: request.request_id,
                status: request.status.as_str(),
            });
        }

        match outcome {
            ResumeOutcome::Solved => {
                request.transition(RequestStatus::Accepted, now)?;
                request.next_attempt_at = Some(now);
                txn.execute(
                    "UPDATE registration_requests
                     SET status = 'accepted', next_attempt_at = ?2, updated_at = ?2
                     WHERE request_id = ?1",
                    params![request.request_id, now.timestamp_millis()],
                )?;
            },
            ResumeOutcome::Failed => {
                request.fail(reason::VERIFICATION_DECLINED, now)?;
                txn.execute(
                    "UPDATE registration_requests
                     SET status = 'failed', last_error = ?2, updated_at = ?3
                     WHERE request_id = ?1",
                    params![
                        request.request_id,
                        reason::VERIFICATION_DECLINED,
                        now.timestamp_millis(),
                    ],
                )?;
            },
        }

        txn.execute(
            "UPDATE interrupt_records SET status = ?2, updated_at = ?3 WHERE interrupt_id = ?1",
            params![interrupt_id, interrupt.status.as_str(), now.timestamp_millis()],
        )?;

        txn.commit()?;
        Ok(request)
    }

    /// Expires every `pending` interrupt past its deadline and fails the
    /// owning requests. Returns the swept records for notification fan-out.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn sweep_expired_interrupts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiredInterrupt>, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let due: Vec<InterruptRecord> = {
            let mut stmt = txn.prepare(&format!(
                "SELECT {INTERRUPT_COLUMNS} FROM interrupt_records
                 WHERE status = 'pending' AND expires_at <= ?1"
            ))?;
            let rows = stmt
                .query_map(params![now.timestamp_millis()], interrupt_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut swept = Vec::with_capacity(due.len());
        for mut interrupt in due {
            interrupt.expire(now)?;
            txn.execute(
                "UPDATE interrupt_records SET status = 'expired', updated_at = ?2
                 WHERE interrupt_id = ?1",
                params![interrupt.interrupt_id, now.timestamp_millis()],
            )?;

            let Some(mut request) = request_row(&txn, &interrupt.request_id)? else {
                continue;
            };
            if request.status == RequestStatus::Suspended {
                request.fail(reason::VERIFICATION_EXPIRED, now)?;
                txn.execute(
                    "UPDATE registration_requests
                     SET status = 'failed', last_error = ?2, updated_at = ?3
                     WHERE request_id = ?1",
                    params![
                        request.request_id,
                        reason::VERIFICATION_EXPIRED,
                        now.timestamp_millis(),
                    ],
                )?;
            } else {
                // The record was pending but the request moved on; nothing to
                // fail, the sweep still retires the record.
                warn!(
                    request_id = %request.request_id,
                    status = request.status.as_str(),
                    "expired interrupt found on non-suspended request"
                );
            }
            swept.push(ExpiredInterrupt {
                interrupt_id: interrupt.interrupt_id,
                request_id: request.request_id,
                user_id: request.user_id,
            });
        }

        txn.commit()?;
        Ok(swept)
    }

    // ------------------------------------------------------------------
    // Charges
    // ------------------------------------------------------------------

    /// Loads the charge record for a request, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure or a corrupt row.
    pub fn charge_for_request(
        &self,
        request_id: &str,
    ) -> Result<Option<ChargeRecord>, StoreError> {
        let conn = self.lock()?;
        charge_row(&conn, request_id)
    }

    /// Looks up or creates the charge record for a request (idempotency key
    /// = request id). An already-`captured` record is returned as-is; the
    /// dispatcher treats that as success without a second capture.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn begin_charge(
        &self,
        request_id: &str,
        charge_id: &str,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<ChargeRecord, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = charge_row(&txn, request_id)? {
            return Ok(existing);
        }

        let record = ChargeRecord::new(charge_id, request_id, amount_cents, now);
        txn.execute(
            &format!(
                "INSERT INTO charge_records ({CHARGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                record.charge_id,
                record.request_id,
                record.amount_cents,
                record.status.as_str(),
                record.external_ref,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        txn.commit()?;
        Ok(record)
    }

    /// Marks the charge captured and the request confirmed, atomically.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure, a missing row, or an
    /// illegal state (double capture).
    pub fn complete_charge_captured(
        &self,
        request_id: &str,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<RegistrationRequest, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut charge = charge_row(&txn, request_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "charge",
            id: request_id.to_string(),
        })?;
        charge.capture(external_ref, now)?;

        let mut request = request_row(&txn, request_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "request",
            id: request_id.to_string(),
        })?;
        request.transition(RequestStatus::Confirmed, now)?;

        txn.execute(
            "UPDATE charge_records
             SET status = 'captured', external_ref = ?2, updated_at = ?3
             WHERE request_id = ?1",
            params![request_id, external_ref, now.timestamp_millis()],
        )?;
        txn.execute(
            "UPDATE registration_requests SET status = 'confirmed', updated_at = ?2
             WHERE request_id = ?1",
            params![request_id, now.timestamp_millis()],
        )?;

        txn.commit()?;
        Ok(request)
    }

    /// Marks the charge failed and the request failed, atomically. The seat
    /// is retained (see [`Store::occupied_seats`]).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure, a missing row, or an
    /// attempt to downgrade a captured charge.
    pub fn complete_charge_failed(
        &self,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RegistrationRequest, StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut charge = charge_row(&txn, request_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "charge",
            id: request_id.to_string(),
        })?;
        charge.fail(now)?;

        let mut request = request_row(&txn, request_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "request",
            id: request_id.to_string(),
        })?;
        request.fail(reason::PAYMENT_FAILED, now)?;

        txn.execute(
            "UPDATE charge_records SET status = 'failed', updated_at = ?2 WHERE request_id = ?1",
            params![request_id, now.timestamp_millis()],
        )?;
        txn.execute(
            "UPDATE registration_requests
             SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE request_id = ?1",
            params![request_id, reason::PAYMENT_FAILED, now.timestamp_millis()],
        )?;

        txn.commit()?;
        Ok(request)
    }

    /// Confirms a request whose charge is already captured (crash recovery
    /// between capture and confirm).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure, a missing row, or an
    /// illegal lifecycle state.
    pub fn confirm_request(&self, request_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut request = request_row(&txn, request_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "request",
            id: request_id.to_string(),
        })?;
        request.transition(RequestStatus::Confirmed, now)?;

        txn.execute(
            "UPDATE registration_requests SET status = 'confirmed', updated_at = ?2
             WHERE request_id = ?1",
            params![request_id, now.timestamp_millis()],
        )?;
        txn.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Notification log
    // ------------------------------------------------------------------

    /// Records a user-visible transition in the notification log.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn log_notification(
        &self,
        request_id: &str,
        user_id: &str,
        kind: &str,
        why: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notification_log (request_id, user_id, kind, reason, delivered, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![request_id, user_id, kind, why, now.timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Flags a logged notification as delivered.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn mark_notification_delivered(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE notification_log SET delivered = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// (kind, delivered) pairs logged for one request, oldest first (tests,
    /// diagnostics).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on storage failure.
    pub fn notifications_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<(String, bool)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT kind, delivered FROM notification_log WHERE request_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![request_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("timestamp out of range: {0}")]
struct BadTimestamp(i64);

fn corrupt(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| corrupt(BadTimestamp(ms)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| corrupt(BadTimestamp(ms)))
    })
    .transpose()
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<RegistrationRequest> {
    let status: String = row.get(6)?;
    Ok(RegistrationRequest {
        request_id: row.get(0)?,
        user_id: row.get(1)?,
        dependent_id: row.get(2)?,
        session_id: row.get(3)?,
        priority: row.get(4)?,
        requested_at: ts_col(row, 5)?,
        status: RequestStatus::parse(&status).map_err(corrupt)?,
        retry_count: row.get(7)?,
        next_attempt_at: opt_ts_col(row, 8)?,
        last_error: row.get(9)?,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
    })
}

fn interrupt_from_row(row: &Row<'_>) -> rusqlite::Result<InterruptRecord> {
    let status: String = row.get(3)?;
    Ok(InterruptRecord {
        interrupt_id: row.get(0)?,
        request_id: row.get(1)?,
        provider: row.get(2)?,
        status: InterruptStatus::parse(&status).map_err(corrupt)?,
        resume_token: row.get(4)?,
        created_at: ts_col(row, 5)?,
        expires_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}

fn charge_from_row(row: &Row<'_>) -> rusqlite::Result<ChargeRecord> {
    let status: String = row.get(3)?;
    Ok(ChargeRecord {
        charge_id: row.get(0)?,
        request_id: row.get(1)?,
        amount_cents: row.get(2)?,
        status: ChargeStatus::parse(&status).map_err(corrupt)?,
        external_ref: row.get(4)?,
        created_at: ts_col(row, 5)?,
        updated_at: ts_col(row, 6)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(4)?;
    Ok(Session {
        session_id: row.get(0)?,
        capacity: row.get(1)?,
        opens_at: ts_col(row, 2)?,
        price_cents: row.get(3)?,
        status: SessionStatus::parse(&status).map_err(corrupt)?,
    })
}

fn session_row(conn: &Connection, session_id: &str) -> Result<Option<Session>, StoreError> {
    conn.query_row(
        "SELECT session_id, capacity, opens_at, price_cents, status
         FROM sessions WHERE session_id = ?1",
        params![session_id],
        session_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn request_row(
    conn: &Connection,
    request_id: &str,
) -> Result<Option<RegistrationRequest>, StoreError> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM registration_requests WHERE request_id = ?1"),
        params![request_id],
        request_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn interrupt_row(
    conn: &Connection,
    interrupt_id: &str,
) -> Result<Option<InterruptRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {INTERRUPT_COLUMNS} FROM interrupt_records WHERE interrupt_id = ?1"),
        params![interrupt_id],
        interrupt_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn pending_interrupt_row(
    conn: &Connection,
    request_id: &str,
) -> Result<Option<InterruptRecord>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {INTERRUPT_COLUMNS} FROM interrupt_records
             WHERE request_id = ?1 AND status = 'pending'"
        ),
        params![request_id],
        interrupt_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn charge_row(conn: &Connection, request_id: &str) -> Result<Option<ChargeRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {CHARGE_COLUMNS} FROM charge_records WHERE request_id = ?1"),
        params![request_id],
        charge_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn occupied_seats_on(conn: &Connection, session_id: &str) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM registration_requests r
         WHERE r.session_id = ?1
           AND (r.status IN ('accepted', 'suspended', 'confirmed')
                OR (r.status = 'failed' AND EXISTS (
                        SELECT 1 FROM charge_records c
                        WHERE c.request_id = r.request_id)))",
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}
