//! External collaborators of the job controller.
//!
//! The job-processing backend, the credit ledger and the statistics store are
//! black boxes to this crate. This module fixes their JSON shapes and exposes
//! each one as a trait so the controller can be driven by fakes in tests and
//! by [`HttpBackend`] in production.

pub mod client;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub use client::HttpBackend;

/// Error code reported for failures the backend did not label.
pub const DEFAULT_FAILURE_CODE: &str = "UNKNOWN_ERROR";

// ─────────────────────────────────────────────────────────────────────────────
// JobState
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Anything the backend adds later. Treated as still running.
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        }
    }

    /// Returns true if the backend will not change this job any further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job status snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// One account the backend created.
///
/// Credentials stay in the vault; only identifying fields are read here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedAccount {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl CreatedAccount {
    /// Human-readable label for log lines.
    pub fn label(&self) -> &str {
        self.email
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("(unnamed account)")
    }
}

/// One account the backend failed to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FailureRecord {
    pub fn code(&self) -> &str {
        self.error_code.as_deref().unwrap_or(DEFAULT_FAILURE_CODE)
    }
}

/// How the backend settled credits for a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSettlement {
    pub deducted: bool,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub new_balance: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Snapshot of a job as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(rename = "status")]
    pub state: JobState,
    #[serde(default)]
    pub total_requested: u64,
    #[serde(default)]
    pub total_created: u64,
    #[serde(default)]
    pub total_failed: u64,
    /// Accounts created so far, in creation order.
    #[serde(default)]
    pub accounts: Vec<CreatedAccount>,
    /// Failures so far, in order. Some backends only list these at completion.
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    #[serde(default)]
    pub credits: Option<CreditSettlement>,
    /// Failure reason when `state` is `failed`.
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatus {
    /// Created count, trusting whichever of the total and the list is larger.
    pub fn created(&self) -> u64 {
        self.total_created.max(self.accounts.len() as u64)
    }

    /// Failed count, trusting whichever of the total and the list is larger.
    pub fn failed(&self) -> u64 {
        self.total_failed.max(self.failures.len() as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests / responses
// ─────────────────────────────────────────────────────────────────────────────

/// Body of a job creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateJobRequest {
    pub count: u32,
    pub region: String,
    pub currency: String,
}

/// Result of an advisory credit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditCheck {
    pub has_enough: bool,
    pub current_credits: i64,
    pub required_credits: i64,
}

/// One reconciliation increment sent to the statistics store.
///
/// `delta_id` is stable for the same range of progress, so the store can drop
/// a re-delivered delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsDelta {
    pub delta_id: String,
    pub job_id: String,
    pub successes: u64,
    pub failures: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator traits
// ─────────────────────────────────────────────────────────────────────────────

/// The job-processing backend.
pub trait JobBackend: Send + Sync {
    /// Creates a job and returns its id.
    fn create_job<'a>(
        &'a self,
        req: &'a CreateJobRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, AppError>> + Send + 'a>>;

    /// Fetches the current job snapshot.
    fn get_job_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, AppError>> + Send + 'a>>;
}

/// The user's credit balance.
pub trait CreditLedger: Send + Sync {
    /// Current balance. `AppError::NotAuthenticated` without a session.
    fn balance(&self) -> Pin<Box<dyn Future<Output = Result<i64, AppError>> + Send + '_>>;

    /// Charges `amount` credits for `job_id`, returning the new balance if known.
    fn deduct<'a>(
        &'a self,
        amount: i64,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, AppError>> + Send + 'a>>;
}

/// The durable success/failure counters shown to the user.
pub trait StatsApi: Send + Sync {
    fn increment<'a>(
        &'a self,
        delta: &'a StatsDelta,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Redacts a job ID for logging (shows first 8 chars).
pub(crate) fn redact_id(id: &str) -> String {
    match id.char_indices().nth(8) {
        Some((idx, _)) => format!("{}...", &id[..idx]),
        None => id.to_string(),
    }
}
