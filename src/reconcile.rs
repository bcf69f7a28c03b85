//! Reconciliation client: idempotent increments of the user's success/failure
//! counters.
//!
//! Every increment is named by the job id and the cursor ranges it covers
//! (`job:ok3-4:fail0-0`). The same range always produces the same id, so the
//! statistics store can drop a re-delivered delta, and this client skips ids it
//! has already seen acknowledged.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::backend::{redact_id, StatsApi, StatsDelta};
use crate::error::AppError;

/// Builds the stable id for a delta covering `accounts` and `failures`.
pub fn delta_id(job_id: &str, accounts: &Range<u64>, failures: &Range<u64>) -> String {
    format!(
        "{}:ok{}-{}:fail{}-{}",
        job_id, accounts.start, accounts.end, failures.start, failures.end
    )
}

/// Idempotent wrapper around a [`StatsApi`].
pub struct ReconciliationClient<S: StatsApi> {
    api: S,
    /// Ids the store has acknowledged, kept until the job is forgotten.
    acknowledged: Mutex<HashSet<String>>,
}

impl<S: StatsApi> ReconciliationClient<S> {
    pub fn new(api: S) -> Self {
        Self {
            api,
            acknowledged: Mutex::new(HashSet::new()),
        }
    }

    /// Adds `accounts.len()` successes and `failures.len()` failures for `job_id`.
    ///
    /// The ranges are positions in the job's account and failure lists. Returns
    /// `Ok` without a network call for an empty delta or one already
    /// acknowledged. On error nothing is recorded and the caller may retry with
    /// the same ranges.
    pub async fn add(
        &self,
        job_id: &str,
        accounts: Range<u64>,
        failures: Range<u64>,
    ) -> Result<(), AppError> {
        let successes = accounts.end.saturating_sub(accounts.start);
        let failed = failures.end.saturating_sub(failures.start);
        if successes == 0 && failed == 0 {
            return Ok(());
        }

        let id = delta_id(job_id, &accounts, &failures);
        if self.is_acknowledged(&id) {
            debug!("[RECONCILE] Skipping already acknowledged delta {}", id);
            return Ok(());
        }

        let delta = StatsDelta {
            delta_id: id.clone(),
            job_id: job_id.to_string(),
            successes,
            failures: failed,
        };

        match self.api.increment(&delta).await {
            Ok(()) => {
                self.lock_acknowledged().insert(id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "[RECONCILE] Increment (+{}/+{}) for job {} failed: {}",
                    successes,
                    failed,
                    redact_id(job_id),
                    e
                );
                Err(e)
            }
        }
    }

    /// Drops acknowledged ids for a job that reached a terminal state.
    pub fn forget_job(&self, job_id: &str) {
        let prefix = format!("{}:", job_id);
        self.lock_acknowledged().retain(|id| !id.starts_with(&prefix));
    }

    fn is_acknowledged(&self, id: &str) -> bool {
        self.lock_acknowledged().contains(id)
    }

    fn lock_acknowledged(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set of ids.
        self.acknowledged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingStats {
        deltas: Mutex<Vec<StatsDelta>>,
        fail: AtomicBool,
    }

    impl StatsApi for RecordingStats {
        fn increment<'a>(
            &'a self,
            delta: &'a StatsDelta,
        ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(AppError::ConnectionFailed("reset".into()));
                }
                self.deltas.lock().unwrap().push(delta.clone());
                Ok(())
            })
        }
    }

    #[test]
    fn test_delta_id_is_stable() {
        assert_eq!(delta_id("job-1", &(3..4), &(0..0)), "job-1:ok3-4:fail0-0");
        assert_eq!(
            delta_id("job-1", &(3..4), &(0..0)),
            delta_id("job-1", &(3..4), &(0..0))
        );
    }

    #[tokio::test]
    async fn test_empty_delta_is_noop() {
        let client = ReconciliationClient::new(RecordingStats::default());
        client.add("job-1", 2..2, 5..5).await.unwrap();
        assert!(client.api.deltas.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_sends_counts() {
        let client = ReconciliationClient::new(RecordingStats::default());
        client.add("job-1", 1..5, 0..2).await.unwrap();

        let deltas = client.api.deltas.lock().unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].successes, 4);
        assert_eq!(deltas[0].failures, 2);
        assert_eq!(deltas[0].delta_id, "job-1:ok1-5:fail0-2");
    }

    #[tokio::test]
    async fn test_repeated_delta_is_sent_once() {
        let client = ReconciliationClient::new(RecordingStats::default());
        client.add("job-1", 0..1, 0..0).await.unwrap();
        client.add("job-1", 0..1, 0..0).await.unwrap();
        assert_eq!(client.api.deltas.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delta_can_be_retried() {
        let client = ReconciliationClient::new(RecordingStats::default());
        client.api.fail.store(true, Ordering::SeqCst);
        assert!(client.add("job-1", 0..1, 0..0).await.is_err());

        client.api.fail.store(false, Ordering::SeqCst);
        client.add("job-1", 0..1, 0..0).await.unwrap();
        assert_eq!(client.api.deltas.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forget_job_only_drops_that_job() {
        let client = ReconciliationClient::new(RecordingStats::default());
        client.add("job-1", 0..1, 0..0).await.unwrap();
        client.add("job-10", 0..1, 0..0).await.unwrap();

        client.forget_job("job-1");
        assert!(!client.is_acknowledged("job-1:ok0-1:fail0-0"));
        assert!(client.is_acknowledged("job-10:ok0-1:fail0-0"));
    }
}
