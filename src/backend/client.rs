//! HTTP client for the job, credit and statistics endpoints.
//!
//! # Security
//!
//! - Bearer tokens are held as `SecretString` and never logged
//! - Job ids are redacted in log lines
//! - Only HTTP method, path, and status codes are logged

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::backend::{
    redact_id, CreateJobRequest, CreditLedger, JobBackend, JobStatus, StatsApi, StatsDelta,
};
use crate::config::BackendConfig;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    success: bool,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    credits: i64,
}

#[derive(Debug, Serialize)]
struct DeductRequest<'a> {
    amount: i64,
    job_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeductResponse {
    success: bool,
    #[serde(default)]
    new_balance: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// Error body shape shared by all endpoints.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpBackend
// ─────────────────────────────────────────────────────────────────────────────

/// Client for the hosted job, credit and statistics API.
#[derive(Clone)]
pub struct HttpBackend {
    /// Shared HTTP client.
    client: Arc<Client>,
    /// Base URL; endpoint paths are appended as segments.
    base_url: Url,
    /// Session token, if the user is logged in.
    auth_token: Option<SecretString>,
}

impl HttpBackend {
    /// Creates a backend client sharing an existing HTTP client.
    pub fn new(client: Arc<Client>, base_url: Url, auth_token: Option<SecretString>) -> Self {
        Self {
            client,
            base_url,
            auth_token,
        }
    }

    /// Builds a dedicated HTTP client from config.
    pub fn from_config(config: &BackendConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::new(
            Arc::new(client),
            config.base_url.clone(),
            config.auth_token.clone(),
        ))
    }

    /// Creates a job.
    ///
    /// # Errors
    ///
    /// - `AppError::NotAuthenticated` - No session token
    /// - `AppError::RateLimited` - Rate limit exceeded
    /// - `AppError::Backend` - Backend refused the job
    /// - `AppError::ConnectionFailed` - Network error
    pub async fn create_job(&self, req: &CreateJobRequest) -> Result<String, AppError> {
        let token = self.auth_token.as_ref().ok_or(AppError::NotAuthenticated)?;
        let url = self.build_url(&["jobs"])?;

        info!(
            "[JOB-API] POST /jobs (count={}, region={})",
            req.count, req.region
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(token.expose_secret())
            .json(req)
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Job creation failed: {}", e)))?;

        let status = response.status();
        info!("[JOB-API] POST /jobs -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let body: CreateJobResponse = response.json().await.map_err(|e| {
            AppError::Backend(format!("Failed to parse job creation response: {}", e))
        })?;

        if !body.success {
            return Err(AppError::from_backend_message(
                body.error.unwrap_or_else(|| "Job creation failed".to_string()),
            ));
        }

        body.job_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Backend("Job creation response had no job id".to_string()))
    }

    /// Gets the current status of a job.
    ///
    /// Works without a session; the token is attached when present.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` - Job does not exist
    /// - `AppError::RateLimited` - Rate limit exceeded
    /// - `AppError::Backend` - Other backend error
    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, AppError> {
        let url = self.build_url(&["jobs", job_id])?;

        info!("[JOB-API] GET /jobs/{} (status)", redact_id(job_id));

        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Job status check failed: {}", e)))?;

        let status = response.status();
        info!(
            "[JOB-API] GET /jobs/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            AppError::Backend(format!("Failed to parse job status response: {}", e))
        })?;

        // Some deployments answer 200 with {"success": false, "error": "..."}
        if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let msg = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("Job status request failed")
                .to_string();
            return Err(AppError::from_backend_message(msg));
        }

        serde_json::from_value(body)
            .map_err(|e| AppError::Backend(format!("Unexpected job status shape: {}", e)))
    }

    /// Reads the user's credit balance.
    pub async fn get_balance(&self) -> Result<i64, AppError> {
        let token = self.auth_token.as_ref().ok_or(AppError::NotAuthenticated)?;
        let url = self.build_url(&["credits"])?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Credit lookup failed: {}", e)))?;

        let status = response.status();
        info!("[JOB-API] GET /credits -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let body: BalanceResponse = response
            .json()
            .await
            .map_err(|e| AppError::Backend(format!("Failed to parse credit balance: {}", e)))?;

        Ok(body.credits)
    }

    /// Charges credits for a job.
    pub async fn deduct_credits(&self, amount: i64, job_id: &str) -> Result<Option<i64>, AppError> {
        let token = self.auth_token.as_ref().ok_or(AppError::NotAuthenticated)?;
        let url = self.build_url(&["credits", "deduct"])?;

        info!(
            "[JOB-API] POST /credits/deduct (amount={}, job={})",
            amount,
            redact_id(job_id)
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(token.expose_secret())
            .json(&DeductRequest { amount, job_id })
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Credit deduction failed: {}", e)))?;

        let status = response.status();
        info!("[JOB-API] POST /credits/deduct -> {}", status.as_u16());

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let body: DeductResponse = response.json().await.map_err(|e| {
            AppError::Backend(format!("Failed to parse deduction response: {}", e))
        })?;

        if !body.success {
            return Err(AppError::Backend(
                body.error
                    .unwrap_or_else(|| "Credit deduction rejected".to_string()),
            ));
        }

        Ok(body.new_balance)
    }

    /// Sends one statistics increment. `delta_id` doubles as the idempotency key.
    pub async fn increment_stats(&self, delta: &StatsDelta) -> Result<(), AppError> {
        let url = self.build_url(&["stats", "increment"])?;

        let response = self
            .authorized(self.client.post(url))
            .header("Idempotency-Key", &delta.delta_id)
            .json(delta)
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Stats update failed: {}", e)))?;

        let status = response.status();
        info!(
            "[JOB-API] POST /stats/increment (+{}/+{}) -> {}",
            delta.successes,
            delta.failures,
            status.as_u16()
        );

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Appends path segments to the base URL, percent-encoding each one.
    fn build_url(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Internal("Base URL cannot have path segments".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Handling
// ─────────────────────────────────────────────────────────────────────────────

/// Parses an error response and maps to appropriate AppError.
async fn parse_error_response(response: reqwest::Response, status: StatusCode) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        return AppError::RateLimited {
            retry_after_secs: retry_after,
        };
    }

    if status == StatusCode::NOT_FOUND {
        return AppError::NotFound("Job not found".to_string());
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return AppError::NotAuthenticated;
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Unable to read error body"));

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body) {
        if let Some(msg) = parsed.error.or(parsed.message) {
            return AppError::from_backend_message(msg);
        }
    }

    AppError::Backend(format!(
        "HTTP {} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown error")
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator trait implementations
// ─────────────────────────────────────────────────────────────────────────────

impl JobBackend for HttpBackend {
    fn create_job<'a>(
        &'a self,
        req: &'a CreateJobRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, AppError>> + Send + 'a>> {
        Box::pin(HttpBackend::create_job(self, req))
    }

    fn get_job_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, AppError>> + Send + 'a>> {
        Box::pin(HttpBackend::get_job_status(self, job_id))
    }
}

impl CreditLedger for HttpBackend {
    fn balance(&self) -> Pin<Box<dyn Future<Output = Result<i64, AppError>> + Send + '_>> {
        Box::pin(HttpBackend::get_balance(self))
    }

    fn deduct<'a>(
        &'a self,
        amount: i64,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, AppError>> + Send + 'a>> {
        Box::pin(HttpBackend::deduct_credits(self, amount, job_id))
    }
}

impl StatsApi for HttpBackend {
    fn increment<'a>(
        &'a self,
        delta: &'a StatsDelta,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        Box::pin(HttpBackend::increment_stats(self, delta))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
