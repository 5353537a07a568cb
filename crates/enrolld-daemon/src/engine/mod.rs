//! Cycle orchestration and finalization.
//!
//! One allocation cycle runs in three phases:
//!
//! ```text
//! expiry sweep --> per-session allocation --> finalization worker pool
//! (fail overdue     (BEGIN IMMEDIATE txn        (submission, suspend,
//!  suspensions)      per session, skip on        charge capture, notify)
//!                    contention)
//! ```
//!
//! Phase boundaries matter: allocation decisions are transactional and
//! synchronous; finalization does network I/O and runs outside any database
//! transaction, bounded by the worker pool and hard per-call timeouts.
//! Errors are absorbed per request so one failure never aborts the rest of
//! a cycle.
//!
//! The resume flow re-enters finalization from the control plane: a
//! verified, unconsumed token moves the suspended request back to
//! `accepted` and finalization is re-invoked once, still under the
//! request's retry budget.

pub mod collaborators;
pub mod http;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use enrolld_core::config::EngineConfig;
use enrolld_core::interrupt::{InterruptError, InterruptRecord, ResumeOutcome};
use enrolld_core::request::{RegistrationRequest, reason};
use enrolld_core::token::{TokenError, TokenService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::collaborators::{
    Notifier, PaymentClient, PaymentOutcome, SubmissionClient, SubmissionOutcome,
};
use crate::notify::{NotificationDispatcher, NotificationKind};
use crate::store::{FailureDisposition, Store, StoreError, SuspendDisposition};

/// Counts reported by one allocation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Sessions whose allocation transaction committed this cycle.
    pub sessions_processed: usize,
    /// Requests accepted this cycle.
    pub accepted: usize,
    /// Requests rejected this cycle (duplicate, quota, no spot).
    pub rejected: usize,
    /// Requests confirmed (charge captured) this cycle.
    pub confirmed: usize,
    /// Requests suspended behind a verification interrupt this cycle.
    pub suspended: usize,
    /// Requests terminally failed this cycle.
    pub failed: usize,
    /// Interrupts expired by the sweep this cycle.
    pub interrupts_expired: usize,
}

/// Resume endpoint status, mirroring the control-plane contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeStatus {
    /// The token was consumed and the request moved on.
    Resumed,
    /// Invalid, expired, or already-used token; no state changed.
    InvalidToken,
    /// The token was fine but the request is not suspended.
    NotSuspended,
}

impl ResumeStatus {
    /// Equivalent HTTP-style status code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Resumed => 200,
            Self::InvalidToken => 400,
            Self::NotSuspended => 409,
        }
    }
}

/// Resume endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeResponse {
    /// Outcome status.
    pub status: ResumeStatus,
    /// Boundary-safe reason for non-success statuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResumeResponse {
    fn resumed() -> Self {
        Self {
            status: ResumeStatus::Resumed,
            reason: None,
        }
    }

    fn invalid(why: &str) -> Self {
        Self {
            status: ResumeStatus::InvalidToken,
            reason: Some(why.to_string()),
        }
    }

    fn not_suspended() -> Self {
        Self {
            status: ResumeStatus::NotSuspended,
            reason: Some("request is not suspended".to_string()),
        }
    }
}

/// What finalization did with one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeResult {
    Confirmed,
    Suspended,
    Retrying,
    Failed,
    /// Storage trouble; nothing transitioned, the request is retried by a
    /// later cycle.
    Skipped,
}

/// The allocation/finalization engine. Stateless apart from injected
/// collaborators; cloning is cheap (shared store and collaborator handles),
/// so cycles, finalization workers, and the control plane all hold their
/// own copy.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    tokens: TokenService,
    config: EngineConfig,
    submission: Arc<dyn SubmissionClient>,
    payment: Arc<dyn PaymentClient>,
    notifications: NotificationDispatcher,
}

impl Engine {
    /// Wires an engine over its store and collaborators.
    #[must_use]
    pub fn new(
        store: Store,
        tokens: TokenService,
        config: EngineConfig,
        submission: Arc<dyn SubmissionClient>,
        payment: Arc<dyn PaymentClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let notifications = NotificationDispatcher::new(store.clone(), notifier);
        Self {
            store,
            tokens,
            config,
            submission,
            payment,
            notifications,
        }
    }

    /// Engine configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one allocation cycle at the current wall-clock time.
    pub async fn run_cycle(&self, max_sessions: Option<usize>) -> CycleReport {
        self.run_cycle_at(Utc::now(), max_sessions).await
    }

    /// Runs one allocation cycle with an explicit clock (deterministic
    /// tests, catch-up runs).
    pub async fn run_cycle_at(
        &self,
        now: DateTime<Utc>,
        max_sessions: Option<usize>,
    ) -> CycleReport {
        let mut report = CycleReport::default();

        // Phase 1: fail suspensions whose verification window lapsed.
        match self.store.sweep_expired_interrupts(now) {
            Ok(swept) => {
                report.interrupts_expired = swept.len();
                report.failed += swept.len();
                for expired in swept {
                    self.notifications
                        .dispatch(
                            &expired.request_id,
                            &expired.user_id,
                            NotificationKind::Failed,
                            Some(reason::VERIFICATION_EXPIRED),
                            json!({
                                "request_id": expired.request_id,
                                "reason": reason::VERIFICATION_EXPIRED,
                            }),
                            now,
                        )
                        .await;
                }
            },
            Err(err) => error!(%err, "interrupt expiry sweep failed"),
        }

        // Phase 2: allocation, one transaction per session.
        let limit = max_sessions.unwrap_or(self.config.max_sessions_per_cycle);
        let session_ids = match self.store.open_session_ids(now, limit) {
            Ok(ids) => ids,
            Err(err) => {
                error!(%err, "session scan failed; cycle aborted after sweep");
                return report;
            },
        };

        for session_id in session_ids {
            match self
                .store
                .allocate_session(&session_id, self.config.per_user_session_cap, now)
            {
                Ok(decisions) => {
                    report.sessions_processed += 1;
                    report.accepted += decisions.accepted.len();
                    report.rejected += decisions.rejections.len();
                    for request in &decisions.accepted {
                        debug!(
                            request_id = %request.request_id,
                            session_id = %session_id,
                            "request accepted"
                        );
                        self.notifications
                            .dispatch(
                                &request.request_id,
                                &request.user_id,
                                NotificationKind::Accepted,
                                None,
                                json!({
                                    "request_id": request.request_id,
                                    "session_id": session_id,
                                }),
                                now,
                            )
                            .await;
                    }
                    for rejection in &decisions.rejections {
                        self.notifications
                            .dispatch(
                                &rejection.request_id,
                                &rejection.user_id,
                                NotificationKind::Rejected,
                                Some(&rejection.reason),
                                json!({
                                    "request_id": rejection.request_id,
                                    "session_id": session_id,
                                    "reason": rejection.reason,
                                }),
                                now,
                            )
                            .await;
                    }
                },
                Err(StoreError::Contended { .. }) => {
                    // Another invocation owns this session; retried next
                    // cycle with no partial state.
                    warn!(%session_id, "allocation contended; session skipped this cycle");
                },
                Err(err) => {
                    error!(%session_id, %err, "allocation failed; session skipped this cycle");
                },
            }
        }

        // Phase 3: finalize due accepted requests through the worker pool.
        // The claim keeps an overlapping invocation from driving the same
        // request; it lapses after the worst-case pipeline duration.
        let claim_until = now
            + chrono::Duration::from_std(self.config.submission_timeout + self.config.charge_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60))
            + chrono::Duration::seconds(60);
        let due = match self.store.claim_due_for_finalization(now, claim_until) {
            Ok(due) => due,
            Err(err) => {
                error!(%err, "finalization scan failed");
                Vec::new()
            },
        };

        let pool = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let mut workers: JoinSet<FinalizeResult> = JoinSet::new();
        for request in due {
            let engine = self.clone();
            let pool = Arc::clone(&pool);
            workers.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return FinalizeResult::Skipped;
                };
                engine.finalize_request(request, now).await
            });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(FinalizeResult::Confirmed) => report.confirmed += 1,
                Ok(FinalizeResult::Suspended) => report.suspended += 1,
                Ok(FinalizeResult::Failed) => report.failed += 1,
                Ok(FinalizeResult::Retrying | FinalizeResult::Skipped) => {},
                Err(err) => error!(%err, "finalization worker panicked"),
            }
        }

        info!(
            sessions = report.sessions_processed,
            accepted = report.accepted,
            rejected = report.rejected,
            confirmed = report.confirmed,
            suspended = report.suspended,
            failed = report.failed,
            interrupts_expired = report.interrupts_expired,
            "allocation cycle complete"
        );
        report
    }

    /// Resumes a suspended request with the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] only on storage failure; every contract
    /// outcome (invalid token, already used, not suspended) is a
    /// [`ResumeResponse`].
    pub async fn resume(
        &self,
        token: &str,
        outcome: ResumeOutcome,
    ) -> Result<ResumeResponse, StoreError> {
        self.resume_at(token, outcome, Utc::now()).await
    }

    /// Resume with an explicit clock (deterministic tests).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] only on storage failure.
    pub async fn resume_at(
        &self,
        token: &str,
        outcome: ResumeOutcome,
        now: DateTime<Utc>,
    ) -> Result<ResumeResponse, StoreError> {
        // Boundary check: signature and expiry, no state touched.
        let claims = match self.tokens.verify(token, now) {
            Ok(claims) => claims,
            Err(TokenError::Expired { .. }) => return Ok(ResumeResponse::invalid("token expired")),
            Err(_) => return Ok(ResumeResponse::invalid("invalid token")),
        };

        // Consume the token: atomic flip of interrupt + request.
        let request = match self.store.resume_request(
            &claims.interrupt_id,
            &claims.request_id,
            outcome,
            now,
        ) {
            Ok(request) => request,
            Err(StoreError::Interrupt(InterruptError::AlreadyResolved { .. })) => {
                return Ok(ResumeResponse::invalid("already resolved"));
            },
            Err(StoreError::NotFound { entity: "interrupt", .. }) => {
                return Ok(ResumeResponse::invalid("invalid token"));
            },
            Err(StoreError::NotSuspended { .. }) => return Ok(ResumeResponse::not_suspended()),
            Err(err) => return Err(err),
        };

        match outcome {
            ResumeOutcome::Solved => {
                info!(request_id = %request.request_id, "verification solved; resuming");
                self.notifications
                    .dispatch(
                        &request.request_id,
                        &request.user_id,
                        NotificationKind::Accepted,
                        None,
                        json!({
                            "request_id": request.request_id,
                            "session_id": request.session_id,
                        }),
                        now,
                    )
                    .await;
                // Re-enter finalization exactly once; further attempts stay
                // under the retry budget on later cycles.
                self.finalize_request(request, now).await;
            },
            ResumeOutcome::Failed => {
                info!(request_id = %request.request_id, "verification declined; request failed");
                self.notifications
                    .dispatch(
                        &request.request_id,
                        &request.user_id,
                        NotificationKind::Failed,
                        Some(reason::VERIFICATION_DECLINED),
                        json!({
                            "request_id": request.request_id,
                            "reason": reason::VERIFICATION_DECLINED,
                        }),
                        now,
                    )
                    .await;
            },
        }

        Ok(ResumeResponse::resumed())
    }

    /// One finalization attempt: submission, then suspend / charge / retry
    /// bookkeeping depending on the outcome.
    async fn finalize_request(
        &self,
        request: RegistrationRequest,
        now: DateTime<Utc>,
    ) -> FinalizeResult {
        let outcome = match timeout(
            self.config.submission_timeout,
            self.submission.submit(&request),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(request_id = %request.request_id, %err, "submission call failed");
                return self.absorb_submission_failure(&request, now).await;
            },
            Err(_elapsed) => {
                warn!(request_id = %request.request_id, "submission call timed out");
                return self.absorb_submission_failure(&request, now).await;
            },
        };

        match outcome {
            SubmissionOutcome::Confirmed => self.dispatch_charge(&request, now).await,
            SubmissionOutcome::VerificationRequired { provider } => {
                self.suspend_for_verification(&request, &provider, now).await
            },
            SubmissionOutcome::Failed { reason: cause } => {
                debug!(request_id = %request.request_id, %cause, "submission reported failure");
                self.absorb_submission_failure(&request, now).await
            },
        }
    }

    /// Suspends an accepted request behind a fresh interrupt + resume token.
    async fn suspend_for_verification(
        &self,
        request: &RegistrationRequest,
        provider: &str,
        now: DateTime<Utc>,
    ) -> FinalizeResult {
        let interrupt_id = Uuid::new_v4().to_string();
        let expires_at = now
            + chrono::Duration::from_std(self.config.interrupt_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let token = self.tokens.issue(&request.request_id, &interrupt_id, expires_at);
        let candidate = InterruptRecord::new(
            interrupt_id,
            &request.request_id,
            provider,
            token,
            now,
            expires_at,
        );

        match self.store.suspend_request(candidate, now) {
            Ok(SuspendDisposition::Created(record)) => {
                info!(
                    request_id = %request.request_id,
                    interrupt_id = %record.interrupt_id,
                    provider,
                    "request suspended pending human verification"
                );
                self.notifications
                    .dispatch(
                        &request.request_id,
                        &request.user_id,
                        NotificationKind::ActionRequired,
                        None,
                        json!({
                            "request_id": request.request_id,
                            "session_id": request.session_id,
                            "provider": record.provider,
                            "resume_token": record.resume_token,
                            "expires_at": record.expires_at.to_rfc3339(),
                        }),
                        now,
                    )
                    .await;
                FinalizeResult::Suspended
            },
            Ok(SuspendDisposition::Existing(record)) => {
                // Already suspended with a live token; nothing new to say.
                debug!(
                    request_id = %request.request_id,
                    interrupt_id = %record.interrupt_id,
                    "suspend requested while an interrupt is already pending"
                );
                FinalizeResult::Suspended
            },
            Err(err) => {
                error!(request_id = %request.request_id, %err, "failed to suspend request");
                FinalizeResult::Skipped
            },
        }
    }

    /// Captures payment for a secured seat; idempotent per request id.
    async fn dispatch_charge(
        &self,
        request: &RegistrationRequest,
        now: DateTime<Utc>,
    ) -> FinalizeResult {
        let amount_cents = match self.store.session(&request.session_id) {
            Ok(Some(session)) => session.price_cents,
            Ok(None) => {
                error!(
                    request_id = %request.request_id,
                    session_id = %request.session_id,
                    "session disappeared from the catalog mirror"
                );
                return FinalizeResult::Skipped;
            },
            Err(err) => {
                error!(request_id = %request.request_id, %err, "session lookup failed");
                return FinalizeResult::Skipped;
            },
        };

        let charge_id = Uuid::new_v4().to_string();
        let record = match self
            .store
            .begin_charge(&request.request_id, &charge_id, amount_cents, now)
        {
            Ok(record) => record,
            Err(err) => {
                error!(request_id = %request.request_id, %err, "failed to open charge record");
                return FinalizeResult::Skipped;
            },
        };

        if record.status == enrolld_core::charge::ChargeStatus::Captured {
            // Idempotent no-op: the money already moved. Only the request row
            // can be behind (crash between capture and confirm).
            return self.settle_confirmed(request, record.external_ref.as_deref(), now).await;
        }

        let capture = timeout(
            self.config.charge_timeout,
            self.payment.capture(&request.request_id, amount_cents),
        )
        .await;

        match capture {
            Ok(Ok(PaymentOutcome::Captured { reference })) => {
                match self
                    .store
                    .complete_charge_captured(&request.request_id, &reference, now)
                {
                    Ok(_) => {
                        info!(request_id = %request.request_id, %reference, "charge captured");
                        self.notify_confirmed(request, Some(&reference), now).await;
                        FinalizeResult::Confirmed
                    },
                    Err(err) => {
                        error!(request_id = %request.request_id, %err, "failed to record capture");
                        FinalizeResult::Skipped
                    },
                }
            },
            Ok(Ok(PaymentOutcome::Failed { reason: cause })) => {
                warn!(request_id = %request.request_id, %cause, "charge declined");
                self.settle_charge_failed(request, now).await
            },
            Ok(Err(err)) => {
                warn!(request_id = %request.request_id, %err, "charge call failed");
                self.settle_charge_failed(request, now).await
            },
            Err(_elapsed) => {
                // A timed-out capture is a failure, never an ambiguous retry;
                // the idempotency key protects a manual re-drive.
                warn!(request_id = %request.request_id, "charge call timed out");
                self.settle_charge_failed(request, now).await
            },
        }
    }

    /// Confirms a request whose charge is already captured.
    async fn settle_confirmed(
        &self,
        request: &RegistrationRequest,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> FinalizeResult {
        match self.store.request(&request.request_id) {
            Ok(Some(current))
                if current.status == enrolld_core::request::RequestStatus::Confirmed =>
            {
                FinalizeResult::Confirmed
            },
            Ok(_) => match self.store.confirm_request(&request.request_id, now) {
                Ok(()) => {
                    self.notify_confirmed(request, reference, now).await;
                    FinalizeResult::Confirmed
                },
                Err(err) => {
                    error!(request_id = %request.request_id, %err, "failed to confirm request");
                    FinalizeResult::Skipped
                },
            },
            Err(err) => {
                error!(request_id = %request.request_id, %err, "request lookup failed");
                FinalizeResult::Skipped
            },
        }
    }

    async fn settle_charge_failed(
        &self,
        request: &RegistrationRequest,
        now: DateTime<Utc>,
    ) -> FinalizeResult {
        match self.store.complete_charge_failed(&request.request_id, now) {
            Ok(_) => {
                self.notifications
                    .dispatch(
                        &request.request_id,
                        &request.user_id,
                        NotificationKind::Failed,
                        Some(reason::PAYMENT_FAILED),
                        json!({
                            "request_id": request.request_id,
                            "reason": reason::PAYMENT_FAILED,
                        }),
                        now,
                    )
                    .await;
                FinalizeResult::Failed
            },
            Err(err) => {
                error!(request_id = %request.request_id, %err, "failed to record charge failure");
                FinalizeResult::Skipped
            },
        }
    }

    async fn notify_confirmed(
        &self,
        request: &RegistrationRequest,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.notifications
            .dispatch(
                &request.request_id,
                &request.user_id,
                NotificationKind::Confirmed,
                None,
                json!({
                    "request_id": request.request_id,
                    "session_id": request.session_id,
                    "reference": reference,
                }),
                now,
            )
            .await;
    }

    /// Books a failed/timed-out submission attempt against the retry budget.
    async fn absorb_submission_failure(
        &self,
        request: &RegistrationRequest,
        now: DateTime<Utc>,
    ) -> FinalizeResult {
        match self
            .store
            .record_submission_failure(&request.request_id, &self.config.retry, now)
        {
            Ok(FailureDisposition::Retrying { next_attempt_at }) => {
                debug!(
                    request_id = %request.request_id,
                    retry_at = %next_attempt_at,
                    "submission attempt failed; retrying"
                );
                FinalizeResult::Retrying
            },
            Ok(FailureDisposition::Exhausted) => {
                self.notifications
                    .dispatch(
                        &request.request_id,
                        &request.user_id,
                        NotificationKind::Failed,
                        Some(reason::SUBMISSION_FAILED),
                        json!({
                            "request_id": request.request_id,
                            "reason": reason::SUBMISSION_FAILED,
                        }),
                        now,
                    )
                    .await;
                FinalizeResult::Failed
            },
            Err(err) => {
                error!(request_id = %request.request_id, %err, "failed to record attempt failure");
                FinalizeResult::Skipped
            },
        }
    }
}
