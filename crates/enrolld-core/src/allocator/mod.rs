//! Greedy capacity planning for one session.
//!
//! The planner consumes the resolver's ordered candidate list and the
//! session's current seat occupancy, accepts candidates greedily until
//! capacity is exhausted, and rejects the remainder with reason `no spot`.
//!
//! The planner is pure. Serializing the read-then-decide against concurrent
//! cycle invocations is the caller's job: the daemon runs resolve + plan +
//! status writes inside one per-session allocation transaction, so two
//! overlapping cycles can never both accept past capacity.

use serde::{Deserialize, Serialize};

use crate::request::{RegistrationRequest, reason};
use crate::resolver::Rejection;

/// Accept/reject decisions for one session, in allocation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    /// Candidates that won a seat this cycle.
    pub accepted: Vec<String>,
    /// Candidates turned away for capacity.
    pub rejected: Vec<Rejection>,
}

impl AllocationPlan {
    /// Returns `true` if the plan contains no decisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }
}

/// Plans accepts and rejects for one session.
///
/// `occupied` counts every request currently holding a seat: `accepted`,
/// `suspended`, `confirmed`, and charge-failed requests whose seat is
/// retained. Candidates beyond `capacity - occupied` are rejected with
/// reason `no spot`.
#[must_use]
pub fn plan(candidates: &[RegistrationRequest], capacity: u32, occupied: u32) -> AllocationPlan {
    let available = capacity.saturating_sub(occupied) as usize;

    let mut plan = AllocationPlan::default();
    for (index, candidate) in candidates.iter().enumerate() {
        if index < available {
            plan.accepted.push(candidate.request_id.clone());
        } else {
            plan.rejected.push(Rejection {
                request_id: candidate.request_id.clone(),
                user_id: candidate.user_id.clone(),
                reason: reason::NO_SPOT.to_string(),
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn candidates(n: usize) -> Vec<RegistrationRequest> {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                RegistrationRequest::new(
                    format!("req-{i}"),
                    format!("user-{i}"),
                    format!("child-{i}"),
                    "sess-1",
                    false,
                    t0 + chrono::Duration::seconds(i as i64),
                )
            })
            .collect()
    }

    #[test]
    fn test_accepts_up_to_capacity() {
        let plan = plan(&candidates(3), 2, 0);
        assert_eq!(plan.accepted, ["req-0", "req-1"]);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].request_id, "req-2");
        assert_eq!(plan.rejected[0].reason, reason::NO_SPOT);
    }

    #[test]
    fn test_occupied_seats_reduce_availability() {
        let plan = plan(&candidates(3), 4, 3);
        assert_eq!(plan.accepted, ["req-0"]);
        assert_eq!(plan.rejected.len(), 2);
    }

    #[test]
    fn test_full_session_rejects_everyone() {
        let plan = plan(&candidates(2), 2, 2);
        assert!(plan.accepted.is_empty());
        assert_eq!(plan.rejected.len(), 2);
    }

    #[test]
    fn test_overfull_session_saturates() {
        // Occupancy above capacity (charge-failed seats still held) must not
        // underflow into a huge availability.
        let plan = plan(&candidates(1), 2, 5);
        assert!(plan.accepted.is_empty());
        assert_eq!(plan.rejected.len(), 1);
    }

    #[test]
    fn test_no_candidates_is_empty_plan() {
        let plan = plan(&[], 10, 0);
        assert!(plan.is_empty());
    }
}
