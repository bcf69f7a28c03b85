//! Runtime configuration for the polling controller and the HTTP backend.
//!
//! Every value has a default; `from_env()` overrides individual values from
//! `VAULT_*` environment variables and ignores anything it cannot parse.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::AppError;

/// Default interval between status polls (10 seconds).
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default delay after a rate-limited status poll (60 seconds).
const DEFAULT_RATE_LIMIT_BACKOFF_SECS: u64 = 60;

/// Maximum polling duration before a job is abandoned (10 minutes).
const DEFAULT_MAX_POLLING_SECS: u64 = 10 * 60;

/// Minimum spacing between heartbeat log lines (10 seconds).
const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// Largest number of accounts a single job may request.
const DEFAULT_MAX_ACCOUNTS_PER_JOB: u32 = 100;

/// Default HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// ControllerConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Timing and limits for the polling controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay between status polls.
    pub poll_interval: Duration,

    /// Delay used instead of `poll_interval` after a rate-limited response.
    pub rate_limit_backoff: Duration,

    /// Hard ceiling on one polling session.
    pub max_polling_duration: Duration,

    /// Minimum spacing between progress heartbeat log lines.
    pub heartbeat_interval: Duration,

    /// Requests above this are clamped.
    pub max_accounts_per_job: u32,

    /// Price of one account in credits.
    pub credits_per_account: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            rate_limit_backoff: Duration::from_secs(DEFAULT_RATE_LIMIT_BACKOFF_SECS),
            max_polling_duration: Duration::from_secs(DEFAULT_MAX_POLLING_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_accounts_per_job: DEFAULT_MAX_ACCOUNTS_PER_JOB,
            credits_per_account: 1,
        }
    }
}

impl ControllerConfig {
    /// Reads overrides from the environment.
    ///
    /// - `VAULT_POLL_INTERVAL_SECS`
    /// - `VAULT_RATE_LIMIT_BACKOFF_SECS`
    /// - `VAULT_MAX_POLLING_MINS`
    /// - `VAULT_MAX_ACCOUNTS_PER_JOB`
    /// - `VAULT_CREDITS_PER_ACCOUNT`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            poll_interval: env_u64("VAULT_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            rate_limit_backoff: env_u64("VAULT_RATE_LIMIT_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_backoff),
            max_polling_duration: env_u64("VAULT_MAX_POLLING_MINS")
                .map(minutes)
                .unwrap_or(defaults.max_polling_duration),
            max_accounts_per_job: env_u64("VAULT_MAX_ACCOUNTS_PER_JOB")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_accounts_per_job),
            credits_per_account: env_u64("VAULT_CREDITS_PER_ACCOUNT")
                .and_then(|v| i64::try_from(v).ok())
                .unwrap_or(defaults.credits_per_account),
            ..defaults
        }
    }

    /// Polling ceiling in whole minutes, for user-facing messages.
    pub fn max_polling_minutes(&self) -> u64 {
        self.max_polling_duration.as_secs() / 60
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BackendConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Connection settings for the job/credit/stats HTTP backend.
#[derive(Clone)]
pub struct BackendConfig {
    /// Base URL every endpoint is joined onto.
    pub base_url: Url,
    /// Session token. `None` means the user is not logged in.
    pub auth_token: Option<SecretString>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url.as_str())
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl BackendConfig {
    /// Creates a config with the default timeout.
    pub fn new(base_url: Url, auth_token: Option<SecretString>) -> Self {
        Self {
            base_url,
            auth_token,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Reads `VAULT_API_URL` (required), `VAULT_API_TOKEN` and
    /// `VAULT_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, AppError> {
        let raw = std::env::var("VAULT_API_URL")
            .map_err(|_| AppError::Validation("VAULT_API_URL is not set".into()))?;
        let base_url = Url::parse(&raw)
            .map_err(|e| AppError::Validation(format!("Invalid VAULT_API_URL: {}", e)))?;

        let auth_token = std::env::var("VAULT_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);

        let mut config = Self::new(base_url, auth_token);
        if let Some(secs) = env_u64("VAULT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

/// Minutes as a duration, saturating instead of overflowing.
fn minutes(mins: u64) -> Duration {
    Duration::from_secs(mins.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_polling_contract() {
        let config = ControllerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.rate_limit_backoff, Duration::from_secs(60));
        assert_eq!(config.max_polling_duration, Duration::from_secs(600));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.max_polling_minutes(), 10);
    }

    #[test]
    fn polling_ceiling_minutes_saturate() {
        assert_eq!(minutes(15), Duration::from_secs(900));
        assert_eq!(minutes(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn backend_config_debug_redacts_token() {
        let config = BackendConfig::new(
            Url::parse("https://api.example.com/").unwrap(),
            Some(SecretString::from("super-secret".to_string())),
        );
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
