//! Control-plane message types.
//!
//! The control plane speaks newline-delimited JSON over a Unix socket. Every
//! request is a tagged variant validated at the boundary; unknown operations
//! are rejected before any state is touched.

use enrolld_core::interrupt::ResumeOutcome;
use serde::{Deserialize, Serialize};

use crate::engine::{CycleReport, ResumeResponse};

/// A control-plane request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Run one allocation cycle now.
    TriggerCycle {
        /// Overrides the configured session cap for this cycle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_sessions: Option<usize>,
    },

    /// Resume a suspended registration with a human-verification outcome.
    Resume {
        /// The resume token from the verification notification.
        token: String,
        /// What the human action produced.
        outcome: ResumeOutcome,
    },
}

/// A control-plane response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ControlResponse {
    /// Counts from the triggered cycle.
    Cycle(CycleReport),

    /// Resume outcome; `status` maps to 200/400/409.
    Resume(ResumeResponse),

    /// The request could not be served.
    Error {
        /// Boundary-safe message.
        message: String,
    },
}
