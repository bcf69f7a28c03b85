use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControllerSnapshot, Phase, Progress, ProgressCursor, ResumeOutcome, SubmitRequest};
use crate::backend::{redact_id, CreateJobRequest, FailureRecord, JobState, JobStatus, StatsApi};
use crate::config::ControllerConfig;
use crate::error::{AppError, ErrorKind};
use crate::jobs::JobOps;
use crate::reconcile::ReconciliationClient;
use crate::storage::{JobDescriptor, JobStore, StatusLog};

// ─────────────────────────────────────────────────────────────────────────────
// Internal state
// ─────────────────────────────────────────────────────────────────────────────

struct ControlState {
    phase: Phase,
    /// Incremented whenever a polling session starts or is detached. A task
    /// only touches shared state while its session is current.
    session: u64,
    cancel: Option<CancellationToken>,
}

/// Result of one polling tick.
enum TickOutcome {
    /// Poll again after the delay.
    Continue(Duration),
    /// The session ended in this terminal phase.
    Finished(Phase),
    /// The session was detached or replaced mid-tick.
    Cancelled,
}

/// How far a reconciliation pass got.
enum Reconciled {
    CaughtUp,
    Deferred,
    Cancelled,
}

/// A job's cursor, shared by every session that tracks the job. Ticks hold
/// the lock, so two sessions never reconcile the same job at once.
type SharedCursor = Arc<Mutex<ProgressCursor>>;

struct Inner<C: JobOps, S: StatsApi> {
    jobs: C,
    reconciler: ReconciliationClient<S>,
    store: Arc<dyn JobStore>,
    log: StatusLog,
    config: ControllerConfig,
    instance_id: String,
    state: Mutex<ControlState>,
    /// Kept across detach and resume; dropped when the job leaves tracking.
    cursors: std::sync::Mutex<HashMap<String, SharedCursor>>,
    snapshot: watch::Sender<ControllerSnapshot>,
}

// ─────────────────────────────────────────────────────────────────────────────
// PollingController
// ─────────────────────────────────────────────────────────────────────────────

/// Drives one deployment at a time from submission to a terminal state.
///
/// Cheap to clone; clones share the same controller.
pub struct PollingController<C: JobOps, S: StatsApi> {
    inner: Arc<Inner<C, S>>,
}

impl<C: JobOps, S: StatsApi> Clone for PollingController<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: JobOps + 'static, S: StatsApi + 'static> PollingController<C, S> {
    pub fn new(
        jobs: C,
        stats: S,
        store: Arc<dyn JobStore>,
        log: StatusLog,
        config: ControllerConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        let (snapshot, _) = watch::channel(ControllerSnapshot::default());

        Self {
            inner: Arc::new(Inner {
                jobs,
                reconciler: ReconciliationClient::new(stats),
                store,
                log,
                config,
                instance_id: instance_id.into(),
                state: Mutex::new(ControlState {
                    phase: Phase::Idle,
                    session: 0,
                    cancel: None,
                }),
                cursors: std::sync::Mutex::new(HashMap::new()),
                snapshot,
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn log(&self) -> &StatusLog {
        &self.inner.log
    }

    /// Current UI state.
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receives every UI state change.
    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Waits until the controller is neither submitting nor polling.
    pub async fn wait_until_settled(&self) -> ControllerSnapshot {
        let mut rx = self.subscribe();
        let settled = rx.wait_for(|s| !s.phase.is_busy()).await.map(|s| s.clone());
        // The sender lives in `inner`, which we hold, so the channel cannot close.
        settled.unwrap_or_else(|_| self.snapshot())
    }

    /// Submits a new deployment and starts polling it. Returns the job id.
    ///
    /// # Errors
    ///
    /// - `AppError::JobInProgress` - Already submitting or polling (no side effects)
    /// - `AppError::Validation` - Count of zero or missing region/currency
    /// - `AppError::InsufficientCredits` - Advisory or authoritative check failed
    /// - `AppError::CreditDeductionFailed` - Job created but not charged
    /// - any job creation error
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, AppError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.phase.is_busy() {
            debug!("[POLLER] Submit rejected: {} in progress", state.phase.as_str());
            return Err(AppError::JobInProgress);
        }

        if let Err(e) = validate_request(&request) {
            inner.publish(|s| s.last_error = Some(e.to_presentation()));
            return Err(e);
        }

        if let Some(tracked) = inner.tracked_descriptor().await {
            info!(
                "[POLLER] Submit rejected: job {} is still tracked by instance {}",
                redact_id(&tracked.job_id),
                tracked.owner_instance
            );
            return Err(AppError::JobInProgress);
        }

        let max = inner.config.max_accounts_per_job;
        let count = request.count.min(max);

        state.phase = Phase::Submitting;
        inner.publish(|s| {
            s.phase = Phase::Submitting;
            s.job_id = None;
            s.progress = Progress {
                requested: u64::from(count),
                ..Progress::default()
            };
            s.last_error = None;
            s.owned_elsewhere = false;
        });
        drop(state);

        match inner.create(&request, count).await {
            Ok(job_id) => {
                let mut state = inner.state.lock().await;
                Arc::clone(inner).start_session(&mut state, job_id.clone(), u64::from(count));
                Ok(job_id)
            }
            Err(e) => {
                let mut state = inner.state.lock().await;
                state.phase = Phase::Idle;
                inner.publish(|s| {
                    s.phase = Phase::Idle;
                    s.last_error = Some(e.to_presentation());
                });
                Err(e)
            }
        }
    }

    /// Re-attaches to a job persisted by an earlier run of this instance.
    pub async fn resume(&self) -> Result<ResumeOutcome, AppError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.phase.is_busy() {
            return Ok(ResumeOutcome::AlreadyActive);
        }

        let descriptor = match inner.store.load().await {
            Ok(Some(d)) if d.is_polling => d,
            Ok(_) => return Ok(ResumeOutcome::NothingToResume),
            Err(e) => {
                warn!("[POLLER] Could not read job descriptor, nothing to resume: {}", e);
                return Ok(ResumeOutcome::NothingToResume);
            }
        };
        let job_id = descriptor.job_id.clone();

        if descriptor.owner_instance != inner.instance_id {
            info!(
                "[POLLER] Job {} belongs to instance {}, observing only",
                redact_id(&job_id),
                descriptor.owner_instance
            );
            inner.publish(|s| {
                s.job_id = Some(job_id.clone());
                s.owned_elsewhere = true;
            });
            return Ok(ResumeOutcome::OwnedElsewhere { job_id });
        }

        let requested = match inner.jobs.get_job_status(&job_id).await {
            Ok(status) if status.state.is_terminal() => {
                info!(
                    "[POLLER] Stored job {} already {}, discarding",
                    redact_id(&job_id),
                    status.state.as_str()
                );
                inner.clear_store().await;
                inner.release_job(&job_id);
                return Ok(ResumeOutcome::Cleared { job_id });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("[POLLER] Stored job {} no longer exists, discarding", redact_id(&job_id));
                inner.clear_store().await;
                inner.release_job(&job_id);
                return Ok(ResumeOutcome::Cleared { job_id });
            }
            Ok(status) => status.total_requested,
            Err(e) => {
                warn!(
                    "[POLLER] Verification of job {} failed, resuming anyway: {}",
                    redact_id(&job_id),
                    e
                );
                0
            }
        };

        inner.log.set_active(true).await;
        inner
            .log
            .info(format!("Resumed tracking of deployment {}.", job_id))
            .await;

        Arc::clone(inner).start_session(&mut state, job_id.clone(), requested);
        Ok(ResumeOutcome::Resumed { job_id })
    }

    /// Stops the local polling timer. The backend job and the persisted
    /// descriptor are left alone so a later `resume()` can pick them up.
    pub async fn detach(&self) {
        let mut state = self.inner.state.lock().await;

        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
            state.session += 1;
            info!("[POLLER] Detached from polling session");
        }

        if state.phase.is_busy() {
            state.phase = Phase::Idle;
            self.inner.publish(|s| s.phase = Phase::Idle);
        }
    }
}

fn validate_request(request: &SubmitRequest) -> Result<(), AppError> {
    if request.count == 0 {
        return Err(AppError::Validation(
            "Choose at least one account to deploy".into(),
        ));
    }
    if request.region.trim().is_empty() {
        return Err(AppError::Validation("Choose a region".into()));
    }
    if request.currency.trim().is_empty() {
        return Err(AppError::Validation("Choose a currency".into()));
    }
    Ok(())
}

/// One status-log line for an error, built from its safe presentation.
fn describe(error: &AppError) -> String {
    let p = error.to_presentation();
    match p.action {
        Some(action) => format!("{}: {} Next step: {}.", p.title, p.message, action),
        None => format!("{}: {}", p.title, p.message),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Submission
// ─────────────────────────────────────────────────────────────────────────────

impl<C: JobOps + 'static, S: StatsApi + 'static> Inner<C, S> {
    fn publish(&self, modify: impl FnOnce(&mut ControllerSnapshot)) {
        self.snapshot.send_modify(modify);
    }

    /// A persisted descriptor still marked as polling, from any instance. Our
    /// own one means an earlier run never finished tracking its job.
    async fn tracked_descriptor(&self) -> Option<JobDescriptor> {
        match self.store.load().await {
            Ok(Some(d)) if d.is_polling => Some(d),
            Ok(_) => None,
            Err(e) => {
                warn!("[POLLER] Could not read job descriptor: {}", e);
                None
            }
        }
    }

    /// Credit check, log reset, job creation and persistence.
    async fn create(&self, request: &SubmitRequest, count: u32) -> Result<String, AppError> {
        let check = self.jobs.check_credits(count).await;
        if !check.has_enough {
            let e = AppError::InsufficientCredits {
                current: check.current_credits,
                required: check.required_credits,
            };
            self.log.error(describe(&e)).await;
            return Err(e);
        }

        // New deployment: previous history goes.
        self.log.clear().await;
        self.log.set_active(true).await;

        if count < request.count {
            warn!(
                "[POLLER] Clamped request from {} to {} accounts",
                request.count, count
            );
            self.log
                .warning(format!(
                    "{} accounts requested; a deployment is limited to {}. Deploying {}.",
                    request.count, count, count
                ))
                .await;
        }

        self.log
            .info(format!(
                "Deploying {} accounts ({}, {})...",
                count, request.region, request.currency
            ))
            .await;

        let create = CreateJobRequest {
            count,
            region: request.region.trim().to_string(),
            currency: request.currency.trim().to_string(),
        };

        let job_id = match self.jobs.create_job(&create).await {
            Ok(job_id) => job_id,
            Err(e) => {
                warn!("[POLLER] Job creation failed: {}", e);
                self.log.error(describe(&e)).await;
                self.log.set_active(false).await;
                return Err(e);
            }
        };

        self.log
            .info(format!("Deployment {} started. Tracking progress...", job_id))
            .await;

        let descriptor = JobDescriptor::new(job_id.clone(), self.instance_id.clone());
        if let Err(e) = self.store.save(&descriptor).await {
            // Polling still works; only resumption after a restart is lost.
            warn!(
                "[STORE] Failed to persist job {}: {}",
                redact_id(&job_id),
                e
            );
        }

        Ok(job_id)
    }

    async fn clear_store(&self) {
        if let Err(e) = self.store.clear().await {
            warn!("[STORE] Failed to clear job descriptor: {}", e);
        }
    }

    /// The job's cursor, created on first use.
    fn cursor_for(&self, job_id: &str) -> SharedCursor {
        let mut cursors = self.lock_cursors();
        // One job at a time: anything else is left over from a replaced job.
        cursors.retain(|id, _| id == job_id);
        Arc::clone(cursors.entry(job_id.to_string()).or_default())
    }

    /// Forgets the cursor and acknowledged deltas of a job that left tracking.
    fn release_job(&self, job_id: &str) {
        self.lock_cursors().remove(job_id);
        self.reconciler.forget_job(job_id);
    }

    fn lock_cursors(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedCursor>> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Enters `Polling` and spawns the polling task. The caller holds the state lock.
    fn start_session(self: Arc<Self>, state: &mut ControlState, job_id: String, requested: u64) {
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        state.session += 1;
        state.phase = Phase::Polling;
        state.cancel = Some(cancel.clone());
        let session = state.session;

        self.publish(|s| {
            s.phase = Phase::Polling;
            s.job_id = Some(job_id.clone());
            s.progress = Progress {
                requested,
                ..Progress::default()
            };
            s.owned_elsewhere = false;
        });

        info!(
            "[POLLER] Polling job {} (session {})",
            redact_id(&job_id),
            session
        );
        let cursor = self.cursor_for(&job_id);
        tokio::spawn(self.poll_loop(session, job_id, cursor, cancel));
    }

    async fn poll_loop(
        self: Arc<Self>,
        session: u64,
        job_id: String,
        cursor: SharedCursor,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();

        loop {
            let outcome = {
                let mut cursor = cursor.lock().await;
                self.tick(&job_id, started, &mut cursor, &cancel).await
            };
            let delay = match outcome {
                TickOutcome::Continue(delay) => delay,
                TickOutcome::Finished(phase) => {
                    self.finish(session, &job_id, phase).await;
                    return;
                }
                TickOutcome::Cancelled => {
                    debug!("[POLLER] Session {} cancelled mid-tick", session);
                    return;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("[POLLER] Session {} cancelled", session);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Moves to a terminal phase and drops the persisted descriptor.
    async fn finish(&self, session: u64, job_id: &str, phase: Phase) {
        let mut state = self.state.lock().await;
        if state.session != session {
            debug!("[POLLER] Stale session {} finished, ignoring", session);
            return;
        }

        state.phase = phase;
        state.cancel = None;

        self.clear_store().await;
        self.release_job(job_id);
        self.log.set_active(false).await;
        self.publish(|s| s.phase = phase);

        info!(
            "[POLLER] Job {} finished: {}",
            redact_id(job_id),
            phase.as_str()
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ticks
    // ─────────────────────────────────────────────────────────────────────────

    /// One poll. Once `cancel` fires the tick stops before its next
    /// reconciliation call, log line or snapshot update.
    async fn tick(
        &self,
        job_id: &str,
        started: Instant,
        cursor: &mut ProgressCursor,
        cancel: &CancellationToken,
    ) -> TickOutcome {
        if cancel.is_cancelled() {
            return TickOutcome::Cancelled;
        }

        if started.elapsed() >= self.config.max_polling_duration {
            let e = AppError::PollingTimeout {
                job_id: job_id.to_string(),
                minutes: self.config.max_polling_minutes(),
            };
            warn!("[POLLER] {}", e);
            self.log.error(describe(&e)).await;
            self.publish(|s| s.last_error = Some(e.to_presentation()));
            return TickOutcome::Finished(Phase::Abandoned);
        }

        let polled = self.jobs.get_job_status(job_id).await;
        if cancel.is_cancelled() {
            return TickOutcome::Cancelled;
        }
        let status = match polled {
            Ok(status) => status,
            Err(e) => return self.poll_failed(job_id, e).await,
        };

        self.publish(|s| {
            if status.total_requested > 0 {
                s.progress.requested = status.total_requested;
            }
            s.progress.created = status.created();
            s.progress.failed = status.failed();
        });

        match status.state {
            JobState::Completed => self.complete(job_id, &status, cursor, cancel).await,
            JobState::Failed => {
                let e = AppError::JobFailed {
                    job_id: job_id.to_string(),
                    message: status
                        .error
                        .clone()
                        .unwrap_or_else(|| "The backend reported no reason".into()),
                };
                warn!("[POLLER] {}", e);
                self.log.error(describe(&e)).await;
                self.publish(|s| s.last_error = Some(e.to_presentation()));
                TickOutcome::Finished(Phase::Failed)
            }
            JobState::Pending | JobState::Running | JobState::Unknown => {
                match self.reconcile_running(job_id, &status, cursor, cancel).await {
                    Reconciled::Cancelled => return TickOutcome::Cancelled,
                    Reconciled::Deferred => self.reconcile_deferred().await,
                    Reconciled::CaughtUp => {}
                }
                self.heartbeat(&status, cursor).await;
                TickOutcome::Continue(self.config.poll_interval)
            }
        }
    }

    async fn poll_failed(&self, job_id: &str, error: AppError) -> TickOutcome {
        match error.kind() {
            ErrorKind::NotFound => {
                warn!("[POLLER] Job {} not found", redact_id(job_id));
                self.log
                    .error(format!(
                        "Deployment {} no longer exists on the server. Stopped tracking it.",
                        job_id
                    ))
                    .await;
                self.publish(|s| s.last_error = Some(error.to_presentation()));
                TickOutcome::Finished(Phase::Failed)
            }
            ErrorKind::RateLimited => {
                let retry_after = match error {
                    AppError::RateLimited {
                        retry_after_secs: Some(secs),
                    } => Duration::from_secs(secs),
                    _ => Duration::ZERO,
                };
                let delay = self.config.rate_limit_backoff.max(retry_after);
                warn!("[POLLER] Rate limited, backing off {:?}", delay);
                self.log
                    .warning(format!(
                        "The server is limiting requests. Next check in {} seconds.",
                        delay.as_secs()
                    ))
                    .await;
                TickOutcome::Continue(delay)
            }
            _ => {
                let delay = self.config.poll_interval;
                warn!("[POLLER] Status check failed, retrying: {}", error);
                self.log
                    .warning(format!(
                        "Status check failed ({}). Retrying in {} seconds.",
                        error.to_presentation().message,
                        delay.as_secs()
                    ))
                    .await;
                TickOutcome::Continue(delay)
            }
        }
    }

    /// Reconciles each newly listed account, then each new failure, one unit
    /// per call. Stops at the first failed call; the next tick retries it.
    async fn reconcile_running(
        &self,
        job_id: &str,
        status: &JobStatus,
        cursor: &mut ProgressCursor,
        cancel: &CancellationToken,
    ) -> Reconciled {
        for (index, account) in status
            .accounts
            .iter()
            .enumerate()
            .skip(cursor.account_count() as usize)
        {
            if cancel.is_cancelled() {
                return Reconciled::Cancelled;
            }
            let unit = index as u64;
            if self.reconciler.add(job_id, unit..unit + 1, 0..0).await.is_err() {
                return Reconciled::Deferred;
            }
            let first_sighting = unit >= cursor.announced_accounts();
            cursor.advance_accounts(unit + 1);
            if first_sighting {
                self.log
                    .success(format!("Account Created: {}", account.label()))
                    .await;
            }
        }

        for (index, failure) in status
            .failures
            .iter()
            .enumerate()
            .skip(cursor.failure_count() as usize)
        {
            if cancel.is_cancelled() {
                return Reconciled::Cancelled;
            }
            let unit = index as u64;
            if self.reconciler.add(job_id, 0..0, unit..unit + 1).await.is_err() {
                return Reconciled::Deferred;
            }
            let first_sighting = unit >= cursor.announced_failures();
            cursor.advance_failures(unit + 1);
            if first_sighting {
                self.log.warning(failure_line(failure)).await;
            }
        }

        Reconciled::CaughtUp
    }

    async fn reconcile_deferred(&self) {
        self.log
            .warning("Could not record progress in your statistics. Retrying on the next check.")
            .await;
    }

    async fn heartbeat(&self, status: &JobStatus, cursor: &mut ProgressCursor) {
        if !cursor.heartbeat_due(Instant::now(), self.config.heartbeat_interval) {
            return;
        }

        let requested = match status.total_requested {
            0 => self.snapshot.borrow().progress.requested,
            n => n,
        };
        let processed = status.created() + status.failed();
        debug!("[POLLER] Heartbeat {}/{}", processed, requested);
        self.log
            .info(format!(
                "Progress: {}/{} accounts processed ({} created, {} failed).",
                processed,
                requested,
                status.created(),
                status.failed()
            ))
            .await;
    }

    /// Logs what is new, flushes the remainder in one call and reports the
    /// credit settlement.
    async fn complete(
        &self,
        job_id: &str,
        status: &JobStatus,
        cursor: &mut ProgressCursor,
        cancel: &CancellationToken,
    ) -> TickOutcome {
        for account in status
            .accounts
            .iter()
            .skip(cursor.announced_accounts() as usize)
        {
            self.log
                .success(format!("Account Created: {}", account.label()))
                .await;
        }
        cursor.announce_accounts(status.accounts.len() as u64);

        for failure in status
            .failures
            .iter()
            .skip(cursor.announced_failures() as usize)
        {
            self.log.warning(failure_line(failure)).await;
        }
        cursor.announce_failures(status.failures.len() as u64);

        let created = status.created().max(cursor.account_count());
        let failed = status.failed().max(cursor.failure_count());

        let remainder = self
            .reconciler
            .add(
                job_id,
                cursor.account_count()..created,
                cursor.failure_count()..failed,
            )
            .await;
        if remainder.is_ok() {
            cursor.advance_accounts(created);
            cursor.advance_failures(failed);
        }
        if cancel.is_cancelled() {
            // The session that replaces this one reports the outcome.
            return TickOutcome::Cancelled;
        }
        if remainder.is_err() {
            self.log
                .warning(format!(
                    "Could not record the final results. Retrying in {} seconds.",
                    self.config.poll_interval.as_secs()
                ))
                .await;
            return TickOutcome::Continue(self.config.poll_interval);
        }

        let requested = match status.total_requested {
            0 => created + failed,
            n => n,
        };
        self.log
            .success(format!(
                "Deployment complete: {} of {} accounts created, {} failed.",
                created, requested, failed
            ))
            .await;

        if let Some(credits) = &status.credits {
            if credits.deducted {
                let balance = credits
                    .new_balance
                    .map(|b| format!(" New balance: {}.", b))
                    .unwrap_or_default();
                self.log
                    .success(format!("Charged {} credits.{}", credits.amount, balance))
                    .await;
            } else {
                let reason = credits.error.as_deref().unwrap_or("no reason given");
                warn!(
                    "[POLLER] Credits not deducted for job {}: {}",
                    redact_id(job_id),
                    reason
                );
                self.log
                    .warning(format!(
                        "Credits were not charged for this deployment ({}). Contact support with deployment id {} so your balance can be corrected.",
                        reason, job_id
                    ))
                    .await;
            }
        }

        TickOutcome::Finished(Phase::Completed)
    }
}

fn failure_line(failure: &FailureRecord) -> String {
    match failure.message.as_deref() {
        Some(message) => format!("Account Failed [{}]: {}", failure.code(), message),
        None => format!("Account Failed [{}]", failure.code()),
    }
}
