//! Session catalog mirror.
//!
//! Sessions are owned by the catalog subsystem; the engine only reads them.
//! Capacity is fixed once a session opens and is never reduced below the
//! number of seats already held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Catalog status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registration window is (or will be) open.
    Open,
    /// Registration window is closed; the session is never allocated.
    Closed,
}

impl SessionStatus {
    /// Returns the canonical string form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Parses a stored status string.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidStatus`] for unknown values
    /// (fail-closed).
    pub fn parse(value: &str) -> Result<Self, SessionError> {
        match value {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(SessionError::InvalidStatus {
                value: value.to_string(),
            }),
        }
    }
}

/// A camp/activity session with scarce registration capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Catalog identifier.
    pub session_id: String,

    /// Maximum number of confirmed registrations this session may hold.
    pub capacity: u32,

    /// When the registration window opens.
    pub opens_at: DateTime<Utc>,

    /// Price of one seat in cents; charged only once a seat is secured.
    pub price_cents: i64,

    /// Catalog status.
    pub status: SessionStatus,
}

impl Session {
    /// Whether the registration window is open at `now`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Open && self.opens_at <= now
    }
}

/// Errors for session record handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Unknown stored status value.
    #[error("invalid session status: {value}")]
    InvalidStatus {
        /// The invalid value provided.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [SessionStatus::Open, SessionStatus::Closed] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::parse("draft").is_err());
    }

    #[test]
    fn test_open_window() {
        let opens_at = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let session = Session {
            session_id: "sess-1".to_string(),
            capacity: 10,
            opens_at,
            price_cents: 12_500,
            status: SessionStatus::Open,
        };

        assert!(!session.is_open_at(opens_at - chrono::Duration::seconds(1)));
        assert!(session.is_open_at(opens_at));

        let closed = Session {
            status: SessionStatus::Closed,
            ..session
        };
        assert!(!closed.is_open_at(opens_at + chrono::Duration::days(1)));
    }
}
