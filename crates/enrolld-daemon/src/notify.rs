//! Best-effort notification dispatch.
//!
//! One notification is dispatched per user-visible request transition:
//! `accepted`, `confirmed`, `rejected`, `action_required` (verification
//! needed, carries the resume token), and `failed`. Each dispatch writes an
//! audit row first, then attempts delivery; a delivery failure is logged and
//! never rolls back the state transition that triggered it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::engine::collaborators::Notifier;
use crate::store::Store;

/// User-visible notification kinds, one per reportable transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A seat was won; confirmation still outstanding.
    Accepted,
    /// Seat secured and payment captured.
    Confirmed,
    /// Turned away before or at allocation.
    Rejected,
    /// Human verification needed; payload carries the resume token.
    ActionRequired,
    /// Finalization failed terminally.
    Failed,
}

impl NotificationKind {
    /// Canonical wire/storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::ActionRequired => "action_required",
            Self::Failed => "failed",
        }
    }
}

/// Dispatches notifications through the external delivery collaborator,
/// keeping an audit log row per dispatch.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher over the given store and delivery collaborator.
    #[must_use]
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Dispatches one notification. Best-effort: storage or delivery
    /// problems are logged and swallowed, the caller's state transition
    /// stands either way.
    pub async fn dispatch(
        &self,
        request_id: &str,
        user_id: &str,
        kind: NotificationKind,
        why: Option<&str>,
        payload: Value,
        now: DateTime<Utc>,
    ) {
        let log_id = match self
            .store
            .log_notification(request_id, user_id, kind.as_str(), why, now)
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(request_id, kind = kind.as_str(), %err, "failed to log notification");
                None
            },
        };

        match self.notifier.notify(user_id, kind.as_str(), &payload).await {
            Ok(()) => {
                if let Some(id) = log_id {
                    if let Err(err) = self.store.mark_notification_delivered(id) {
                        warn!(request_id, %err, "failed to flag notification delivered");
                    }
                }
            },
            Err(err) => {
                // Delivery is decoupled from state machine correctness.
                warn!(
                    request_id,
                    user_id,
                    kind = kind.as_str(),
                    %err,
                    "notification delivery failed"
                );
            },
        }
    }
}
