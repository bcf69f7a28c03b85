//! Job client: credit pre-check, job submission and status reads.
//!
//! `create_job` performs its own credit check against the ledger before it
//! submits anything. The check made by the controller beforehand is only
//! advisory, since the balance can change between the two.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::backend::{
    redact_id, CreateJobRequest, CreditCheck, CreditLedger, JobBackend, JobStatus,
};
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// JobOps
// ─────────────────────────────────────────────────────────────────────────────

/// Operations the polling controller needs, allowing test fakes.
pub trait JobOps: Send + Sync {
    /// Advisory credit check. Never fails; problems read as "not enough".
    fn check_credits(&self, requested: u32) -> Pin<Box<dyn Future<Output = CreditCheck> + Send + '_>>;

    /// Submits a job and charges for it. Returns the job id.
    fn create_job<'a>(
        &'a self,
        req: &'a CreateJobRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, AppError>> + Send + 'a>>;

    /// Reads the current job snapshot.
    fn get_job_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, AppError>> + Send + 'a>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JobClient
// ─────────────────────────────────────────────────────────────────────────────

/// Typed wrapper over the job backend and the credit ledger.
pub struct JobClient<B: JobBackend, L: CreditLedger> {
    backend: B,
    ledger: L,
    credits_per_account: i64,
}

impl<B: JobBackend, L: CreditLedger> JobClient<B, L> {
    pub fn new(backend: B, ledger: L, credits_per_account: i64) -> Self {
        Self {
            backend,
            ledger,
            credits_per_account,
        }
    }

    fn required_credits(&self, requested: u32) -> i64 {
        i64::from(requested).saturating_mul(self.credits_per_account)
    }

    /// Compares the balance with the price of `requested` accounts.
    ///
    /// Fails closed: an unauthenticated caller or a ledger error yields
    /// `has_enough = false` with a current balance of 0.
    pub async fn check_credits(&self, requested: u32) -> CreditCheck {
        let required = self.required_credits(requested);

        match self.ledger.balance().await {
            Ok(current) => CreditCheck {
                has_enough: current >= required,
                current_credits: current,
                required_credits: required,
            },
            Err(e) => {
                warn!("[JOB-CLIENT] Credit lookup failed, treating as insufficient: {}", e);
                CreditCheck {
                    has_enough: false,
                    current_credits: 0,
                    required_credits: required,
                }
            }
        }
    }

    /// Re-checks credits, creates the job, then deducts credits.
    ///
    /// # Errors
    ///
    /// - `AppError::InsufficientCredits` - Balance too low at submission time
    /// - any backend error from job creation (nothing was charged)
    /// - `AppError::CreditDeductionFailed` - The job exists but was not charged
    pub async fn create_job(&self, req: &CreateJobRequest) -> Result<String, AppError> {
        let required = self.required_credits(req.count);
        let current = self.ledger.balance().await?;
        if current < required {
            return Err(AppError::InsufficientCredits { current, required });
        }

        let job_id = self.backend.create_job(req).await?;
        info!(
            "[JOB-CLIENT] Created job {} for {} accounts",
            redact_id(&job_id),
            req.count
        );

        match self.ledger.deduct(required, &job_id).await {
            Ok(new_balance) => {
                info!(
                    "[JOB-CLIENT] Deducted {} credits for job {} (balance: {:?})",
                    required,
                    redact_id(&job_id),
                    new_balance
                );
                Ok(job_id)
            }
            Err(e) => {
                warn!(
                    "[JOB-CLIENT] Job {} created but credit deduction failed: {}",
                    redact_id(&job_id),
                    e
                );
                Err(AppError::CreditDeductionFailed {
                    job_id,
                    message: e.to_string(),
                })
            }
        }
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, AppError> {
        self.backend.get_job_status(job_id).await
    }
}

impl<B: JobBackend, L: CreditLedger> JobOps for JobClient<B, L> {
    fn check_credits(&self, requested: u32) -> Pin<Box<dyn Future<Output = CreditCheck> + Send + '_>> {
        Box::pin(JobClient::check_credits(self, requested))
    }

    fn create_job<'a>(
        &'a self,
        req: &'a CreateJobRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, AppError>> + Send + 'a>> {
        Box::pin(JobClient::create_job(self, req))
    }

    fn get_job_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, AppError>> + Send + 'a>> {
        Box::pin(JobClient::get_job_status(self, job_id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
