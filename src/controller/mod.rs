//! Polling controller: submits a deployment, tracks it to a terminal state
//! and reconciles progress into the user's counters.
//!
//! ```text
//! Idle ── submit ──▶ Submitting ──▶ Polling ──▶ Completed | Failed | Abandoned
//!  ▲                     │             ▲                     │
//!  └──── error ──────────┘   resume ───┘                     │
//!  └──────────────────────── next interaction ◀──────────────┘
//! ```

mod cursor;
mod poller;


use serde::{Deserialize, Serialize};

use crate::error::ErrorPresentation;

pub use cursor::ProgressCursor;
pub use poller::PollingController;

// ─────────────────────────────────────────────────────────────────────────────
// Phase
// ─────────────────────────────────────────────────────────────────────────────

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Submitting,
    Polling,
    Completed,
    Failed,
    /// Polling gave up at the time ceiling. The backend job may still finish.
    Abandoned,
}

impl Phase {
    /// Returns true while a submission or polling session owns the controller.
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Submitting | Phase::Polling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Submitting => "submitting",
            Phase::Polling => "polling",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Abandoned => "abandoned",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Progress counts as last reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub requested: u64,
    pub created: u64,
    pub failed: u64,
}

impl Progress {
    pub fn processed(&self) -> u64 {
        self.created + self.failed
    }
}

/// Everything a UI needs to render the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub phase: Phase,
    pub job_id: Option<String>,
    pub progress: Progress,
    pub last_error: Option<ErrorPresentation>,
    /// A job persisted by another controller instance is still running.
    pub owned_elsewhere: bool,
}

impl Default for ControllerSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            job_id: None,
            progress: Progress::default(),
            last_error: None,
            owned_elsewhere: false,
        }
    }
}

impl ControllerSnapshot {
    /// Whether the submit action should be enabled.
    pub fn can_submit(&self) -> bool {
        !self.phase.is_busy() && !self.owned_elsewhere
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests / outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// A deployment request as entered by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub count: u32,
    pub region: String,
    pub currency: String,
}

/// What `resume()` found in the job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// No descriptor, or one that is not polling.
    NothingToResume,
    /// This controller is already submitting or polling.
    AlreadyActive,
    /// The job is gone or finished; the descriptor was discarded.
    Cleared { job_id: String },
    /// Polling restarted for a job that is still running.
    Resumed { job_id: String },
    /// Another instance owns the job; it is left alone.
    OwnedElsewhere { job_id: String },
}

#[cfg(test)]
mod snapshot_tests {
    use super::*;

    #[test]
    fn can_submit_follows_phase() {
        let mut snapshot = ControllerSnapshot::default();
        assert!(snapshot.can_submit());

        for phase in [Phase::Submitting, Phase::Polling] {
            snapshot.phase = phase;
            assert!(!snapshot.can_submit());
        }
        for phase in [Phase::Completed, Phase::Failed, Phase::Abandoned] {
            snapshot.phase = phase;
            assert!(snapshot.can_submit(), "{} should accept a new submit", phase.as_str());
        }

        snapshot.phase = Phase::Idle;
        snapshot.owned_elsewhere = true;
        assert!(!snapshot.can_submit());
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Abandoned).unwrap(), "\"abandoned\"");
    }
}
