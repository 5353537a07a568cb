//! Duplicate collapse, per-user quota, and fairness ordering.
//!
//! The resolver turns one session's eligible requests into an ordered
//! candidate list the allocator can consume greedily:
//!
//! 1. **Collapse**: requests sharing (session, dependent) merge into one;
//!    the earliest `requested_at` survives, the rest are rejected with
//!    reason `duplicate`.
//! 2. **Quota**: each user keeps at most `per_user_cap` requests per
//!    session; excess is rejected with reason `quota exceeded`.
//! 3. **Order**: priority-flagged requests first, then ascending
//!    `requested_at`, then ascending request id. No other field affects
//!    order, which makes allocation deterministic and independent of cycle
//!    timing.
//!
//! The resolver is pure: it never touches storage and decides nothing about
//! capacity. Rejections it emits are final; the surviving candidates go to
//! [`crate::allocator`].

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::request::{RegistrationRequest, reason};

/// A request the resolver (or allocator) turned away, with its taxonomy
/// reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// The rejected request.
    pub request_id: String,
    /// Owning user, for notification fan-out.
    pub user_id: String,
    /// Taxonomy reason (see [`crate::request::reason`]).
    pub reason: String,
}

impl Rejection {
    fn new(request: &RegistrationRequest, why: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            user_id: request.user_id.clone(),
            reason: why.to_string(),
        }
    }
}

/// Resolver output for one session: ordered candidates plus rejections.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Eligible candidates in allocation order.
    pub candidates: Vec<RegistrationRequest>,
    /// Requests rejected before allocation (duplicate, quota).
    pub rejections: Vec<Rejection>,
}

/// Allocation order: priority first, then FIFO, then request id.
///
/// The request id tie-break exists only so equal timestamps still produce a
/// total order.
#[must_use]
pub fn allocation_order(a: &RegistrationRequest, b: &RegistrationRequest) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.requested_at.cmp(&b.requested_at))
        .then_with(|| a.request_id.cmp(&b.request_id))
}

/// Duplicate-collapse order: the earliest request for a dependent survives.
fn collapse_order(a: &RegistrationRequest, b: &RegistrationRequest) -> Ordering {
    a.requested_at
        .cmp(&b.requested_at)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.request_id.cmp(&b.request_id))
}

/// Resolves one session's eligible requests into an ordered candidate list.
///
/// `requests` must all target the same session; rows whose status is no
/// longer allocatable are ignored. `per_user_cap` is the configured maximum
/// of pending requests one user may hold for the session (default 1).
#[must_use]
pub fn resolve_session(requests: Vec<RegistrationRequest>, per_user_cap: usize) -> Resolution {
    let mut eligible: Vec<RegistrationRequest> = requests
        .into_iter()
        .filter(|r| r.status.is_allocatable())
        .collect();
    let mut rejections = Vec::new();

    // Collapse duplicates per dependent: earliest requested_at survives.
    eligible.sort_by(collapse_order);
    let mut seen_dependents: HashSet<String> = HashSet::new();
    let mut survivors = Vec::with_capacity(eligible.len());
    for request in eligible {
        if seen_dependents.insert(request.dependent_id.clone()) {
            survivors.push(request);
        } else {
            rejections.push(Rejection::new(&request, reason::DUPLICATE));
        }
    }

    // Per-user quota, counted in allocation order so a user's best requests
    // are the ones kept.
    survivors.sort_by(allocation_order);
    let mut per_user: HashMap<String, usize> = HashMap::new();
    let mut candidates = Vec::with_capacity(survivors.len());
    for request in survivors {
        let count = per_user.entry(request.user_id.clone()).or_insert(0);
        if *count >= per_user_cap {
            rejections.push(Rejection::new(&request, reason::QUOTA_EXCEEDED));
        } else {
            *count += 1;
            candidates.push(request);
        }
    }

    Resolution {
        candidates,
        rejections,
    }
}
