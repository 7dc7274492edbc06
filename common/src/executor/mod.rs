// Job execution
//
// One claimed firing = one attempt. The executor opens a history row,
// runs the kind's handler against a deadline, finalizes the row and moves
// the job row through exactly one terminal transition. Retries are not
// looped in-process: a transient failure parks the job as FAILED with a
// backoff deadline in next_run_at and the scheduler re-claims it.

pub mod registry;
pub mod token;

pub use registry::{ExecutionContext, HandlerRegistry, JobHandler, RunOutcome};
pub use token::{CancelSignal, ExecutionToken, TokenRegistry};

use crate::clock::Clock;
use crate::config::ExecutorConfig;
use crate::errors::ExecutionError;
use crate::models::{
    Job, JobHistory, JobKind, JobStatus, PartialFailurePolicy, RunStatus, RunSummary, TriggeredBy,
};
use crate::retry::RetryStrategy;
use crate::schedule;
use crate::store::{HistoryOutcome, JobHistoryLog, JobStore, JobTransition};
use crate::telemetry::{self, AlertNotifier};
use crate::window::WindowCoordinator;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Ceiling for job kinds that are not heavy batch work.
const LIGHT_CONCURRENCY: usize = 8;

/// Decide what a failed attempt does to the job row: the new retry count,
/// the next firing instant, and whether the failure is terminal for this
/// cycle. `failures` counts the attempt that just failed.
pub(crate) fn failure_disposition(
    job: &Job,
    failures: i32,
    transient: bool,
    now: DateTime<Utc>,
    coordinator: &WindowCoordinator,
    retry: &dyn RetryStrategy,
) -> (i32, Option<DateTime<Utc>>, bool) {
    let retry_count = failures.max(0);
    if transient && failures < job.max_retries {
        let delay = retry.delay_for((failures - 1).max(0) as u32);
        let next = now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(5));
        return (retry_count, Some(next), false);
    }
    // Terminal for this cycle. A recurring job rejoins its descriptor; that
    // is the next scheduled cycle, not a retry.
    let next = match schedule::next_run(job, coordinator.timezone(), now) {
        Ok(next) => next,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Could not compute next occurrence after failure");
            None
        }
    };
    (retry_count, next, true)
}

fn failure_reason(error: &ExecutionError) -> &'static str {
    match error {
        ExecutionError::Timeout(_) => "timeout",
        ExecutionError::Cancelled => "cancelled",
        ExecutionError::TokenSuperseded => "superseded",
        ExecutionError::UnknownJobKind(_) => "unknown-kind",
        ExecutionError::InvalidJobConfig(_) => "invalid-config",
        ExecutionError::ItemFailures(_) => "item-failures",
        ExecutionError::Store(_) => "store",
        ExecutionError::Collaborator(_) => "collaborator",
    }
}

/// Drives claimed jobs to a terminal state.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    history: Arc<dyn JobHistoryLog>,
    handlers: Arc<HandlerRegistry>,
    tokens: Arc<TokenRegistry>,
    windows: Arc<WindowCoordinator>,
    clock: Arc<dyn Clock>,
    retry: Arc<dyn RetryStrategy>,
    alerts: Arc<dyn AlertNotifier>,
    limits: HashMap<JobKind, Arc<Semaphore>>,
    heartbeat_interval: Duration,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        history: Arc<dyn JobHistoryLog>,
        handlers: Arc<HandlerRegistry>,
        tokens: Arc<TokenRegistry>,
        windows: Arc<WindowCoordinator>,
        clock: Arc<dyn Clock>,
        retry: Arc<dyn RetryStrategy>,
        alerts: Arc<dyn AlertNotifier>,
        config: &ExecutorConfig,
    ) -> Self {
        let mut limits = HashMap::new();
        for kind in JobKind::ALL {
            let ceiling = if kind.is_windowed() || kind == JobKind::ReportGeneration {
                config.batch_concurrency.max(1) as usize
            } else {
                LIGHT_CONCURRENCY
            };
            limits.insert(kind, Arc::new(Semaphore::new(ceiling)));
        }
        Self {
            store,
            history,
            handlers,
            tokens,
            windows,
            clock,
            retry,
            alerts,
            limits,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
        }
    }

    /// Reserve a concurrency slot for `kind` without waiting. `None` means
    /// the ceiling is reached and the firing should wait for a later tick.
    pub fn try_acquire(&self, kind: JobKind) -> Option<OwnedSemaphorePermit> {
        self.limits
            .get(&kind)
            .and_then(|sem| Arc::clone(sem).try_acquire_owned().ok())
    }

    /// Cooperative cancel of the job's live run in this process.
    pub fn request_cancel(&self, job_id: Uuid) -> bool {
        self.tokens.request_cancel(job_id)
    }

    /// Run an already-claimed job on a fresh task. `job` is the pre-claim
    /// snapshot; `attempt` and `coverage_start` were fixed by the claimant.
    pub fn spawn(
        self: &Arc<Self>,
        job: Job,
        attempt: i32,
        coverage_start: Option<DateTime<Utc>>,
        triggered_by: TriggeredBy,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            executor
                .run_claimed(job, attempt, coverage_start, triggered_by)
                .await;
        })
    }

    #[instrument(skip(self, job, triggered_by), fields(job_id = %job.id, job_name = %job.name, kind = %job.kind, attempt))]
    async fn run_claimed(
        &self,
        job: Job,
        attempt: i32,
        coverage_start: Option<DateTime<Utc>>,
        triggered_by: TriggeredBy,
    ) {
        let started = self.clock.now();
        let (token, cancel) = self.tokens.issue(job.id);

        let window = if job.kind.is_windowed() {
            match self.windows.window_for(started) {
                Ok(window) => Some(window),
                Err(e) => {
                    self.settle_failure(
                        &job,
                        None,
                        &token,
                        attempt,
                        started,
                        ExecutionError::InvalidJobConfig(format!(
                            "No settlement window for trigger: {}",
                            e
                        )),
                        None,
                        RunStatus::Failed,
                    )
                    .await;
                    return;
                }
            }
        } else {
            None
        };
        let idempotency_key = window.as_ref().map(|w| format!("{}:{}", job.kind, w.id()));

        // Manual re-runs of an already-settled window are safe no-ops.
        if let Some(key) = &idempotency_key {
            match self.history.find_completed_for_key(key).await {
                Ok(Some(previous)) => {
                    info!(
                        idempotency_key = %key,
                        previous_run = %previous.id,
                        "Window already settled; recording a no-op"
                    );
                    self.settle_noop(&job, &token, triggered_by, key, started)
                        .await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    self.settle_failure(
                        &job,
                        None,
                        &token,
                        attempt,
                        started,
                        ExecutionError::Store(e),
                        None,
                        RunStatus::Failed,
                    )
                    .await;
                    return;
                }
            }
        }

        let entry =
            JobHistory::begin(&job, attempt, triggered_by, idempotency_key.clone(), started);
        if let Err(e) = self.history.append(&entry).await {
            self.settle_failure(
                &job,
                None,
                &token,
                attempt,
                started,
                ExecutionError::Store(e),
                None,
                RunStatus::Failed,
            )
            .await;
            return;
        }

        let handler = match self.handlers.get(job.kind) {
            Ok(handler) => handler,
            Err(e) => {
                self.settle_failure(
                    &job,
                    Some(entry.id),
                    &token,
                    attempt,
                    started,
                    e,
                    None,
                    RunStatus::Failed,
                )
                .await;
                return;
            }
        };

        let ctx = ExecutionContext {
            job: job.clone(),
            window,
            idempotency_key,
            coverage_start,
            attempt,
            cancel: Arc::clone(&cancel),
        };

        let heartbeat = self.spawn_heartbeat(job.id);
        let deadline = Duration::from_secs(job.timeout_seconds.max(1) as u64);
        info!(timeout_seconds = deadline.as_secs(), "Attempt started");

        let verdict = tokio::select! {
            result = handler.run(&ctx) => Some(result),
            _ = tokio::time::sleep(deadline) => None,
        };
        heartbeat.abort();

        match verdict {
            Some(Ok(RunOutcome::Completed(summary))) => {
                if summary.failed > 0
                    && job.kind.partial_failure_policy() == PartialFailurePolicy::FailRun
                {
                    let failed = summary.failed;
                    self.settle_failure(
                        &job,
                        Some(entry.id),
                        &token,
                        attempt,
                        started,
                        ExecutionError::ItemFailures(failed),
                        Some(summary),
                        RunStatus::Failed,
                    )
                    .await;
                } else {
                    self.settle_success(&job, entry.id, &token, started, summary)
                        .await;
                }
            }
            Some(Ok(RunOutcome::Cancelled(summary))) => {
                self.settle_cancelled(&job, entry.id, &token, started, summary)
                    .await;
            }
            Some(Err(ExecutionError::Cancelled)) => {
                self.settle_cancelled(&job, entry.id, &token, started, RunSummary::new())
                    .await;
            }
            Some(Err(error)) => {
                self.settle_failure(
                    &job,
                    Some(entry.id),
                    &token,
                    attempt,
                    started,
                    error,
                    None,
                    RunStatus::Failed,
                )
                .await;
            }
            None => {
                // The handler future was dropped at the deadline. In-flight
                // collaborator I/O cannot be pulled back, so the stale token
                // keeps whatever lands late from being applied.
                self.settle_failure(
                    &job,
                    Some(entry.id),
                    &token,
                    attempt,
                    started,
                    ExecutionError::Timeout(deadline.as_secs()),
                    None,
                    RunStatus::Timeout,
                )
                .await;
            }
        }
    }

    async fn settle_noop(
        &self,
        job: &Job,
        token: &ExecutionToken,
        triggered_by: TriggeredBy,
        key: &str,
        now: DateTime<Utc>,
    ) {
        let reason = format!("Window {} already settled; run skipped", key);
        let row = JobHistory::skipped(job, triggered_by, Some(key.to_string()), &reason, now);
        if let Err(e) = self.history.append(&row).await {
            error!(job_id = %job.id, error = %e, "Failed to record skipped run");
        }
        let mut summary = RunSummary::new();
        summary.note(&reason);
        let next_run_at = self.next_occurrence(job, now);
        let applied = self
            .store
            .compare_and_transition(
                job.id,
                &[JobStatus::Running],
                JobTransition::Complete {
                    at: now,
                    duration_ms: 0,
                    result: summary,
                    next_run_at,
                },
            )
            .await;
        self.log_transition(job, applied, "no-op completion");
        self.tokens.release(token);
    }

    async fn settle_success(
        &self,
        job: &Job,
        history_id: Uuid,
        token: &ExecutionToken,
        started: DateTime<Utc>,
        summary: RunSummary,
    ) {
        let now = self.clock.now();
        let duration_ms = (now - started).num_milliseconds();
        let outcome = HistoryOutcome {
            status: RunStatus::Completed,
            ended_at: now,
            duration_ms,
            result: Some(summary.clone()),
            error_message: None,
        };
        if let Err(e) = self.history.finalize(history_id, outcome).await {
            error!(job_id = %job.id, error = %e, "Failed to finalize history row");
        }

        if !self.tokens.is_current(token) {
            warn!(job_id = %job.id, "Late completion with a stale token; outcome discarded");
            return;
        }

        let next_run_at = self.next_occurrence(job, now);
        let applied = self
            .store
            .compare_and_transition(
                job.id,
                &[JobStatus::Running],
                JobTransition::Complete {
                    at: now,
                    duration_ms,
                    result: summary.clone(),
                    next_run_at,
                },
            )
            .await;
        self.log_transition(job, applied, "completion");

        telemetry::record_job_success(&job.name, job.kind);
        telemetry::record_job_duration(&job.name, job.kind, duration_ms as f64 / 1000.0);
        info!(
            duration_ms,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Run completed"
        );
        self.tokens.release(token);
    }

    async fn settle_cancelled(
        &self,
        job: &Job,
        history_id: Uuid,
        token: &ExecutionToken,
        started: DateTime<Utc>,
        summary: RunSummary,
    ) {
        let now = self.clock.now();
        let duration_ms = (now - started).num_milliseconds();
        let outcome = HistoryOutcome {
            status: RunStatus::Cancelled,
            ended_at: now,
            duration_ms,
            result: Some(summary.clone()),
            error_message: Some("Cancelled by request".to_string()),
        };
        if let Err(e) = self.history.finalize(history_id, outcome).await {
            error!(job_id = %job.id, error = %e, "Failed to finalize history row");
        }

        if !self.tokens.is_current(token) {
            warn!(job_id = %job.id, "Stale cancel outcome discarded");
            return;
        }

        let applied = self
            .store
            .compare_and_transition(
                job.id,
                &[JobStatus::Running],
                JobTransition::Cancel {
                    at: now,
                    duration_ms: Some(duration_ms),
                    result: Some(summary),
                },
            )
            .await;
        self.log_transition(job, applied, "cancellation");
        info!(duration_ms, "Run cancelled");
        self.tokens.release(token);
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_failure(
        &self,
        job: &Job,
        history_id: Option<Uuid>,
        token: &ExecutionToken,
        attempt: i32,
        started: DateTime<Utc>,
        error: ExecutionError,
        summary: Option<RunSummary>,
        run_status: RunStatus,
    ) {
        let now = self.clock.now();
        let duration_ms = (now - started).num_milliseconds();
        let message = error.to_string();

        if let Some(history_id) = history_id {
            let outcome = HistoryOutcome {
                status: run_status,
                ended_at: now,
                duration_ms,
                result: summary.clone(),
                error_message: Some(message.clone()),
            };
            if let Err(e) = self.history.finalize(history_id, outcome).await {
                error!(job_id = %job.id, error = %e, "Failed to finalize history row");
            }
        }

        if !self.tokens.is_current(token) {
            warn!(job_id = %job.id, error = %message, "Stale failure outcome discarded");
            return;
        }

        let (retry_count, next_run_at, terminal) = failure_disposition(
            job,
            attempt,
            error.is_transient(),
            now,
            &self.windows,
            self.retry.as_ref(),
        );

        let applied = self
            .store
            .compare_and_transition(
                job.id,
                &[JobStatus::Running],
                JobTransition::Fail {
                    at: now,
                    duration_ms: Some(duration_ms),
                    result: summary,
                    error_message: message.clone(),
                    retry_count,
                    next_run_at,
                },
            )
            .await;
        self.log_transition(job, applied, "failure");

        if terminal {
            telemetry::record_job_failure(&job.name, job.kind, failure_reason(&error));
            warn!(
                error = %message,
                retry_count,
                next_run_at = ?next_run_at,
                "Run failed; retry budget exhausted or error is permanent"
            );
            let alert = format!(
                "Job '{}' failed after {} attempt(s): {}",
                job.name, attempt, message
            );
            if let Err(e) = self.alerts.send_alert(job.id, &job.name, &alert).await {
                error!(job_id = %job.id, error = %e, "Failed to deliver alert");
            }
        } else {
            telemetry::record_job_retry(&job.name);
            warn!(
                error = %message,
                retry_count,
                next_run_at = ?next_run_at,
                "Attempt failed; retry scheduled"
            );
        }
        self.tokens.release(token);
    }

    fn next_occurrence(&self, job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match schedule::next_run(job, self.windows.timezone(), now) {
            Ok(next) => next,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not compute next occurrence");
                None
            }
        }
    }

    fn spawn_heartbeat(&self, job_id: Uuid) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.touch_heartbeat(job_id, clock.now()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Heartbeat write failed");
                    }
                }
            }
        })
    }

    fn log_transition(
        &self,
        job: &Job,
        applied: Result<bool, crate::errors::StoreError>,
        what: &str,
    ) {
        match applied {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Job row changed under the run; {} discarded", what);
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record {}", what);
            }
        }
    }
}
