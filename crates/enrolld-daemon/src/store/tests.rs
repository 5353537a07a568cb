//! Unit tests for the SQLite store.

use chrono::{DateTime, TimeZone, Utc};
use enrolld_core::interrupt::{InterruptRecord, InterruptStatus, ResumeOutcome};
use enrolld_core::request::{RegistrationRequest, RequestStatus, reason};
use enrolld_core::retry::{BackoffConfig, RetryPolicy};
use enrolld_core::session::{Session, SessionStatus};

use super::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

fn store() -> Store {
    Store::open_in_memory().unwrap()
}

fn seed_session(store: &Store, session_id: &str, capacity: u32) {
    store
        .upsert_session(&Session {
            session_id: session_id.to_string(),
            capacity,
            opens_at: t0(),
            price_cents: 10_000,
            status: SessionStatus::Open,
        })
        .unwrap();
}

fn seed_request(
    store: &Store,
    request_id: &str,
    user_id: &str,
    dependent_id: &str,
    priority: bool,
    offset_secs: i64,
) {
    let request = RegistrationRequest::new(
        request_id,
        user_id,
        dependent_id,
        "sess-1",
        priority,
        t0() + chrono::Duration::seconds(offset_secs),
    );
    store.insert_request(&request).unwrap();
}

fn accept_one(store: &Store, request_id: &str) -> RegistrationRequest {
    let decisions = store.allocate_session("sess-1", 1, t0()).unwrap();
    decisions
        .accepted
        .into_iter()
        .find(|r| r.request_id == request_id)
        .expect("request should be accepted")
}

fn suspend_one(store: &Store, request_id: &str, token: &str) -> InterruptRecord {
    let candidate = InterruptRecord::new(
        format!("int-{request_id}"),
        request_id,
        "captcha",
        token,
        t0(),
        t0() + chrono::Duration::minutes(30),
    );
    match store.suspend_request(candidate, t0()).unwrap() {
        SuspendDisposition::Created(record) => record,
        SuspendDisposition::Existing(_) => panic!("expected a fresh interrupt"),
    }
}

#[test]
fn test_allocation_priority_then_fifo() {
    let store = store();
    seed_session(&store, "sess-1", 2);
    seed_request(&store, "req-a", "user-a", "child-a", true, 1);
    seed_request(&store, "req-b", "user-b", "child-b", false, 0);
    seed_request(&store, "req-c", "user-c", "child-c", false, 2);

    let decisions = store.allocate_session("sess-1", 1, t0()).unwrap();
    let accepted: Vec<&str> = decisions
        .accepted
        .iter()
        .map(|r| r.request_id.as_str())
        .collect();
    assert_eq!(accepted, ["req-a", "req-b"]);
    assert_eq!(decisions.rejections.len(), 1);
    assert_eq!(decisions.rejections[0].request_id, "req-c");
    assert_eq!(decisions.rejections[0].reason, reason::NO_SPOT);

    let rejected = store.request("req-c").unwrap().unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.last_error.as_deref(), Some("no spot"));
}

#[test]
fn test_allocation_collapses_duplicates() {
    let store = store();
    seed_session(&store, "sess-1", 5);
    seed_request(&store, "req-late", "user-a", "child-a", false, 5);
    seed_request(&store, "req-early", "user-a", "child-a", false, 3);

    let decisions = store.allocate_session("sess-1", 2, t0()).unwrap();
    assert_eq!(decisions.accepted.len(), 1);
    assert_eq!(decisions.accepted[0].request_id, "req-early");

    let loser = store.request("req-late").unwrap().unwrap();
    assert_eq!(loser.status, RequestStatus::Rejected);
    assert_eq!(loser.last_error.as_deref(), Some("duplicate"));
}

#[test]
fn test_allocation_rerun_is_idempotent() {
    let store = store();
    seed_session(&store, "sess-1", 2);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);

    let first = store.allocate_session("sess-1", 1, t0()).unwrap();
    assert_eq!(first.accepted.len(), 1);

    // No new requests: the second run decides nothing.
    let second = store.allocate_session("sess-1", 1, t0()).unwrap();
    assert!(second.accepted.is_empty());
    assert!(second.rejections.is_empty());
}

#[test]
fn test_occupied_seats_block_later_requests() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    store.allocate_session("sess-1", 1, t0()).unwrap();
    assert_eq!(store.occupied_seats("sess-1").unwrap(), 1);

    seed_request(&store, "req-b", "user-b", "child-b", false, 1);
    let decisions = store.allocate_session("sess-1", 1, t0()).unwrap();
    assert!(decisions.accepted.is_empty());
    assert_eq!(decisions.rejections[0].reason, reason::NO_SPOT);
}

#[test]
fn test_charge_failed_seat_stays_occupied() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");

    store.begin_charge("req-a", "chg-1", 10_000, t0()).unwrap();
    store.complete_charge_failed("req-a", t0()).unwrap();

    let request = store.request("req-a").unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Failed);
    assert_eq!(request.last_error.as_deref(), Some("payment failed"));
    // The seat is not released back to the pool.
    assert_eq!(store.occupied_seats("sess-1").unwrap(), 1);

    seed_request(&store, "req-b", "user-b", "child-b", false, 1);
    let decisions = store.allocate_session("sess-1", 1, t0()).unwrap();
    assert!(decisions.accepted.is_empty());
}

#[test]
fn test_closed_or_future_sessions_not_allocated() {
    let store = store();
    store
        .upsert_session(&Session {
            session_id: "sess-1".to_string(),
            capacity: 3,
            opens_at: t0() + chrono::Duration::hours(1),
            price_cents: 10_000,
            status: SessionStatus::Open,
        })
        .unwrap();
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);

    // Window not yet open: no decisions, request untouched.
    let decisions = store.allocate_session("sess-1", 1, t0()).unwrap();
    assert!(decisions.accepted.is_empty() && decisions.rejections.is_empty());
    assert_eq!(
        store.request("req-a").unwrap().unwrap().status,
        RequestStatus::Pending
    );

    assert!(store.open_session_ids(t0(), 10).unwrap().is_empty());
    let later = t0() + chrono::Duration::hours(2);
    assert_eq!(store.open_session_ids(later, 10).unwrap(), ["sess-1"]);
}

#[test]
fn test_suspend_is_idempotent_per_request() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");

    let first = suspend_one(&store, "req-a", "token-1");
    assert_eq!(first.status, InterruptStatus::Pending);
    assert_eq!(
        store.request("req-a").unwrap().unwrap().status,
        RequestStatus::Suspended
    );

    // A second suspend returns the existing record and token unchanged.
    let candidate = InterruptRecord::new(
        "int-other",
        "req-a",
        "captcha",
        "token-2",
        t0(),
        t0() + chrono::Duration::minutes(30),
    );
    match store.suspend_request(candidate, t0()).unwrap() {
        SuspendDisposition::Existing(record) => {
            assert_eq!(record.interrupt_id, first.interrupt_id);
            assert_eq!(record.resume_token, "token-1");
        },
        SuspendDisposition::Created(_) => panic!("suspend must be idempotent"),
    }
}

#[test]
fn test_resume_solved_consumes_token_once() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");
    let interrupt = suspend_one(&store, "req-a", "token-1");

    let request = store
        .resume_request(&interrupt.interrupt_id, "req-a", ResumeOutcome::Solved, t0())
        .unwrap();
    assert_eq!(request.status, RequestStatus::Accepted);
    assert_eq!(
        store.interrupt(&interrupt.interrupt_id).unwrap().unwrap().status,
        InterruptStatus::Solved
    );

    // Second consume fails as already resolved even with the other outcome.
    let err = store
        .resume_request(&interrupt.interrupt_id, "req-a", ResumeOutcome::Failed, t0())
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Interrupt(enrolld_core::interrupt::InterruptError::AlreadyResolved { .. })
    ));
    // And the state did not change.
    assert_eq!(
        store.request("req-a").unwrap().unwrap().status,
        RequestStatus::Accepted
    );
}

#[test]
fn test_resume_failed_fails_request() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");
    let interrupt = suspend_one(&store, "req-a", "token-1");

    let request = store
        .resume_request(&interrupt.interrupt_id, "req-a", ResumeOutcome::Failed, t0())
        .unwrap();
    assert_eq!(request.status, RequestStatus::Failed);
    assert_eq!(
        request.last_error.as_deref(),
        Some(reason::VERIFICATION_DECLINED)
    );
}

#[test]
fn test_sweep_expires_overdue_interrupts() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");
    let interrupt = suspend_one(&store, "req-a", "token-1");

    // Before the deadline nothing is swept.
    assert!(store.sweep_expired_interrupts(t0()).unwrap().is_empty());

    let past_deadline = t0() + chrono::Duration::minutes(31);
    let swept = store.sweep_expired_interrupts(past_deadline).unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].request_id, "req-a");

    assert_eq!(
        store.interrupt(&interrupt.interrupt_id).unwrap().unwrap().status,
        InterruptStatus::Expired
    );
    let request = store.request("req-a").unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Failed);
    assert_eq!(
        request.last_error.as_deref(),
        Some(reason::VERIFICATION_EXPIRED)
    );

    // The sweep is idempotent.
    assert!(store
        .sweep_expired_interrupts(past_deadline)
        .unwrap()
        .is_empty());
}

#[test]
fn test_charge_capture_is_exactly_once() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");

    let record = store.begin_charge("req-a", "chg-1", 10_000, t0()).unwrap();
    assert_eq!(record.charge_id, "chg-1");
    store
        .complete_charge_captured("req-a", "psp_ref_001", t0())
        .unwrap();

    // A retried dispatch finds the captured record instead of creating a
    // second one.
    let again = store.begin_charge("req-a", "chg-2", 10_000, t0()).unwrap();
    assert_eq!(again.charge_id, "chg-1");
    assert_eq!(again.status, enrolld_core::charge::ChargeStatus::Captured);

    // Forcing a second capture is a state-machine violation.
    let err = store
        .complete_charge_captured("req-a", "psp_ref_002", t0())
        .unwrap_err();
    assert!(matches!(err, StoreError::Charge(_)));
}

#[test]
fn test_submission_failure_retries_then_exhausts() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");

    let policy = RetryPolicy {
        max_attempts: 2,
        backoff: BackoffConfig::Fixed {
            delay: std::time::Duration::from_secs(120),
        },
    };

    let disposition = store
        .record_submission_failure("req-a", &policy, t0())
        .unwrap();
    let expected_gate = t0() + chrono::Duration::seconds(120);
    assert_eq!(
        disposition,
        FailureDisposition::Retrying {
            next_attempt_at: expected_gate
        }
    );
    let request = store.request("req-a").unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Accepted);
    assert_eq!(request.retry_count, 1);

    // Not due until the backoff gate passes.
    assert!(store.due_for_finalization(t0()).unwrap().is_empty());
    assert_eq!(store.due_for_finalization(expected_gate).unwrap().len(), 1);

    let disposition = store
        .record_submission_failure("req-a", &policy, expected_gate)
        .unwrap();
    assert_eq!(disposition, FailureDisposition::Exhausted);
    let request = store.request("req-a").unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Failed);
    assert_eq!(
        request.last_error.as_deref(),
        Some(reason::SUBMISSION_FAILED)
    );
}

#[test]
fn test_finalization_claim_is_exclusive() {
    let store = store();
    seed_session(&store, "sess-1", 1);
    seed_request(&store, "req-a", "user-a", "child-a", false, 0);
    accept_one(&store, "req-a");

    let claim_until = t0() + chrono::Duration::minutes(2);
    let claimed = store.claim_due_for_finalization(t0(), claim_until).unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].next_attempt_at, Some(claim_until));

    // A second scan at the same time finds nothing: the claim holds.
    assert!(store
        .claim_due_for_finalization(t0(), claim_until)
        .unwrap()
        .is_empty());

    // A lapsed claim is picked up again.
    let later = claim_until + chrono::Duration::seconds(1);
    assert_eq!(
        store
            .claim_due_for_finalization(later, later + chrono::Duration::minutes(2))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_reopen_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("enrolld.db");
    {
        let store = Store::open(&path).unwrap();
        seed_session(&store, "sess-1", 2);
        seed_request(&store, "req-a", "user-a", "child-a", false, 0);
        store.allocate_session("sess-1", 1, t0()).unwrap();
    }

    let store = Store::open(&path).unwrap();
    let request = store.request("req-a").unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Accepted);
    assert_eq!(store.occupied_seats("sess-1").unwrap(), 1);
}

#[test]
fn test_notification_log_round_trip() {
    let store = store();
    let id = store
        .log_notification("req-a", "user-a", "accepted", None, t0())
        .unwrap();
    store.mark_notification_delivered(id).unwrap();
    let rows = store.notifications_for_request("req-a").unwrap();
    assert_eq!(rows, vec![("accepted".to_string(), true)]);
}

#[test]
fn test_session_batch_limit_rolls_over() {
    let store = store();
    for i in 0..3 {
        store
            .upsert_session(&Session {
                session_id: format!("sess-{i}"),
                capacity: 1,
                opens_at: t0() + chrono::Duration::seconds(i),
                price_cents: 10_000,
                status: SessionStatus::Open,
            })
            .unwrap();
        let request = RegistrationRequest::new(
            format!("req-{i}"),
            "user-a",
            format!("child-{i}"),
            format!("sess-{i}"),
            false,
            t0(),
        );
        store.insert_request(&request).unwrap();
    }

    let now = t0() + chrono::Duration::minutes(1);
    // Oldest opens_at first, capped at two.
    assert_eq!(store.open_session_ids(now, 2).unwrap(), ["sess-0", "sess-1"]);

    // Once a session's requests are decided it drops out of the scan.
    store.allocate_session("sess-0", 1, now).unwrap();
    assert_eq!(store.open_session_ids(now, 2).unwrap(), ["sess-1", "sess-2"]);
}
