// Durable job state
//
// All job-row mutation funnels through one primitive,
// `compare_and_transition`: an atomic "if the status is still X, move it to
// Y and write these fields". The claim edge of that primitive is the
// exclusivity lease between scheduler instances; there is no separate lock.
// History rows have their own two-step discipline: append once at attempt
// start, finalize exactly once at attempt end.

pub mod memory;
pub mod postgres;

use crate::errors::StoreError;
use crate::models::{Job, JobHistory, JobStatus, RunStatus, RunSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The closed set of legal job-row transitions. Each variant carries the
/// fields it writes; nothing else about the row changes.
#[derive(Debug, Clone)]
pub enum JobTransition {
    /// A scheduler instance claims a firing. Starts a fresh cycle: running
    /// status, start/heartbeat stamps, last_run_at at the firing instant,
    /// retry budget reset, previous outcome cleared, next_run_at cleared
    /// until the run finishes.
    Claim { at: DateTime<Utc> },
    /// A scheduler instance claims a backoff retry of a failed cycle.
    /// Unlike `Claim`, the retry budget already spent is kept, and
    /// `last_run_at` stays at the original firing so coverage is not
    /// silently advanced by a failing run.
    Retry { at: DateTime<Utc> },
    /// The cycle finished successfully. `next_run_at` is the descriptor's
    /// next occurrence for recurring jobs, `None` for one-offs.
    Complete {
        at: DateTime<Utc>,
        duration_ms: i64,
        result: RunSummary,
        next_run_at: Option<DateTime<Utc>>,
    },
    /// The attempt failed. With retry budget left, `next_run_at` carries
    /// the backoff deadline and the next tick re-claims via `Retry`; with
    /// the budget exhausted the failure is terminal for this cycle and a
    /// recurring job rejoins its descriptor at `next_run_at`.
    Fail {
        at: DateTime<Utc>,
        duration_ms: Option<i64>,
        result: Option<RunSummary>,
        error_message: String,
        retry_count: i32,
        next_run_at: Option<DateTime<Utc>>,
    },
    /// A cooperative cancel completed. Terminal until an operator steps in.
    Cancel {
        at: DateTime<Utc>,
        duration_ms: Option<i64>,
        result: Option<RunSummary>,
    },
    /// Operator pause; future firings stop until resume.
    Pause { at: DateTime<Utc> },
    /// Operator resume; an overdue next_run_at fires one catch-up run.
    Resume { at: DateTime<Utc> },
}

impl JobTransition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            JobTransition::Claim { .. } | JobTransition::Retry { .. } => JobStatus::Running,
            JobTransition::Complete { .. } => JobStatus::Completed,
            JobTransition::Fail { .. } => JobStatus::Failed,
            JobTransition::Cancel { .. } => JobStatus::Cancelled,
            JobTransition::Pause { .. } => JobStatus::Paused,
            JobTransition::Resume { .. } => JobStatus::Scheduled,
        }
    }
}

/// Durable registry of job definitions and their current state.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Job>, StoreError>;

    /// All jobs, for the operator read model, ordered by name.
    async fn list_all(&self) -> Result<Vec<Job>, StoreError>;

    /// Enabled jobs in a claimable status that might be due at `now`:
    /// next_run_at has passed, or a recurring job has never run and its
    /// descriptor must be consulted. The store only pre-filters; precise
    /// due-ness is the scheduler's call.
    async fn list_enabled_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Atomically apply `transition` iff the current status is one of
    /// `expected`. `Ok(false)` means the row was in none of the expected
    /// states; for a claim, that the firing was already taken. Not an
    /// error.
    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        transition: JobTransition,
    ) -> Result<bool, StoreError>;

    /// Operator-controlled enable flag. Never touched by the scheduler.
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError>;

    /// Refresh the lease heartbeat. `Ok(false)` if the job is no longer
    /// running (the lease was lost or the run ended).
    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Running jobs whose heartbeat stopped before `cutoff`: leases held
    /// by processes presumed dead.
    async fn list_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;
}

/// Finalization payload for a history row.
#[derive(Debug, Clone)]
pub struct HistoryOutcome {
    pub status: RunStatus,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub result: Option<RunSummary>,
    pub error_message: Option<String>,
}

/// Append-only record of execution attempts.
#[async_trait]
pub trait JobHistoryLog: Send + Sync {
    async fn append(&self, entry: &JobHistory) -> Result<(), StoreError>;

    /// Write the outcome of a row exactly once. Erring if the row is
    /// missing or already finalized keeps history rows immutable after
    /// their end.
    async fn finalize(&self, id: Uuid, outcome: HistoryOutcome) -> Result<(), StoreError>;

    /// A completed run for this idempotency key, if any. The executor's
    /// no-op check for windowed re-runs.
    async fn find_completed_for_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobHistory>, StoreError>;

    /// History for one job, newest first.
    async fn list_for_job(
        &self,
        job_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobHistory>, StoreError>;
}
