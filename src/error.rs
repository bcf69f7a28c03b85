use serde::Serialize;
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for UI display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "authorization:",
    "password",
    "api_key",
    "access_token",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for UI display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-friendly error presentation for the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ErrorKind
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse classification the polling loop branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally before reaching the backend.
    Validation,
    /// Insufficient credits or a job already in flight.
    Precondition,
    /// The job no longer exists on the backend. Stop polling.
    NotFound,
    /// Backend asked us to slow down. Retry after the extended back-off.
    RateLimited,
    /// Network hiccup or generic backend failure. Retry at the normal interval.
    Transient,
    /// Nothing to retry.
    Fatal,
}

impl ErrorKind {
    /// Classifies a free-text backend error.
    ///
    /// The job backend only reports failures as text, so this is the single
    /// place where message content is inspected.
    pub fn from_message(msg: &str) -> Self {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("not found") {
            ErrorKind::NotFound
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            ErrorKind::RateLimited
        } else {
            ErrorKind::Transient
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AppError
// ─────────────────────────────────────────────────────────────────────────────

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Validation / preconditions ────────────────────────────────────────────
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Insufficient credits: have {current}, need {required}")]
    InsufficientCredits { current: i64, required: i64 },

    #[error("A job is already in progress")]
    JobInProgress,

    #[error("Not authenticated")]
    NotAuthenticated,

    // ── Backend ───────────────────────────────────────────────────────────────
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    // ── Job lifecycle ─────────────────────────────────────────────────────────
    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Job {job_id} did not finish within {minutes} minutes")]
    PollingTimeout { job_id: String, minutes: u64 },

    #[error("Job {job_id} was created but credit deduction failed: {message}")]
    CreditDeductionFailed { job_id: String, message: String },

    // ── Local ─────────────────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Builds the error for a backend that answered with `success: false`.
    pub fn from_backend_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match ErrorKind::from_message(&msg) {
            ErrorKind::NotFound => AppError::NotFound(msg),
            ErrorKind::RateLimited => AppError::RateLimited {
                retry_after_secs: None,
            },
            _ => AppError::Backend(msg),
        }
    }

    /// Returns the retry classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::InsufficientCredits { .. }
            | AppError::JobInProgress
            | AppError::NotAuthenticated => ErrorKind::Precondition,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::RateLimited { .. } => ErrorKind::RateLimited,
            AppError::ConnectionFailed(_) | AppError::Backend(_) => ErrorKind::Transient,
            AppError::JobFailed { .. }
            | AppError::PollingTimeout { .. }
            | AppError::CreditDeductionFailed { .. }
            | AppError::Storage(_)
            | AppError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Converts the error into a user-friendly presentation suitable for UI display.
    /// Never leaks tokens or account secrets.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            AppError::Validation(msg) => ErrorPresentation {
                title: "Invalid Request".into(),
                message: sanitize_message(msg, "The request is not valid."),
                action: Some("Correct the form and try again".into()),
            },

            AppError::InsufficientCredits { current, required } => ErrorPresentation {
                title: "Not Enough Credits".into(),
                message: format!(
                    "This deployment needs {} credits but you have {}.",
                    required, current
                ),
                action: Some("Buy more credits or request fewer accounts".into()),
            },

            AppError::JobInProgress => ErrorPresentation {
                title: "Deployment Running".into(),
                message: "A deployment is already in progress.".into(),
                action: Some("Wait for the current deployment to finish".into()),
            },

            AppError::NotAuthenticated => ErrorPresentation {
                title: "Not Logged In".into(),
                message: "You need to log in to continue.".into(),
                action: Some("Log in again".into()),
            },

            AppError::NotFound(_) => ErrorPresentation {
                title: "Job Not Found".into(),
                message: "The deployment could not be found on the server.".into(),
                action: Some("Start a new deployment".into()),
            },

            AppError::RateLimited { retry_after_secs } => {
                let wait_msg = match retry_after_secs {
                    Some(secs) => format!("Please wait {} seconds before trying again.", secs),
                    None => "Please wait a moment before trying again.".into(),
                };
                ErrorPresentation {
                    title: "Too Many Requests".into(),
                    message: format!("The server is limiting requests. {}", wait_msg),
                    action: Some("Wait and retry".into()),
                }
            }

            AppError::ConnectionFailed(_) => ErrorPresentation {
                title: "Connection Failed".into(),
                message: "Could not reach the server. Please check your internet connection."
                    .into(),
                action: Some("Check network and retry".into()),
            },

            AppError::Backend(msg) => ErrorPresentation {
                title: "Server Error".into(),
                message: sanitize_message(msg, "The server reported an error."),
                action: None,
            },

            AppError::JobFailed { job_id: _, message } => ErrorPresentation {
                title: "Deployment Failed".into(),
                message: sanitize_message(message, "The deployment failed."),
                action: Some("Review the error and try again".into()),
            },

            AppError::PollingTimeout { minutes, .. } => ErrorPresentation {
                title: "Deployment Timed Out".into(),
                message: format!(
                    "Stopped tracking the deployment after {} minutes. It may still finish on the server.",
                    minutes
                ),
                action: Some("Check your vault later".into()),
            },

            AppError::CreditDeductionFailed { job_id, .. } => ErrorPresentation {
                title: "Billing Problem".into(),
                message: format!(
                    "Deployment {} was created but your credits could not be charged.",
                    job_id
                ),
                action: Some("Contact support with the deployment id".into()),
            },

            AppError::Storage(_) | AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}
