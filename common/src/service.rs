// Operator surface
//
// Everything an operator does to a job definition goes through here:
// create, trigger, pause, resume, cancel, enable, inspect. The service
// validates and delegates. Exclusivity stays with the store's
// compare-and-transition, and a manual trigger runs through the same
// executor path as a scheduled firing, so idempotency and history rules
// hold regardless of who pulled the trigger.

use crate::clock::Clock;
use crate::errors::{ServiceError, StoreError};
use crate::executor::JobExecutor;
use crate::models::{Job, JobHistory, JobKind, JobStatus, TriggeredBy};
use crate::schedule;
use crate::store::{JobHistoryLog, JobStore, JobTransition};
use crate::window::WindowCoordinator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;

/// Statuses an operator's run-now may claim from. Unlike the scheduler's
/// tick, a paused job can be fired by hand; a cancelled one must be
/// resumed first.
const MANUAL_CLAIM_EDGES: [JobStatus; 4] = [
    JobStatus::Scheduled,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Paused,
];

/// One job with its projected next firing, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobOverview {
    pub job: Job,
    pub planned_next_run: Option<DateTime<Utc>>,
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    history: Arc<dyn JobHistoryLog>,
    executor: Arc<JobExecutor>,
    windows: Arc<WindowCoordinator>,
    clock: Arc<dyn Clock>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        history: Arc<dyn JobHistoryLog>,
        executor: Arc<JobExecutor>,
        windows: Arc<WindowCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            history,
            executor,
            windows,
            clock,
        }
    }

    /// Register a recurring job. The cron expression is validated up
    /// front and the first firing is precomputed so listings can show it.
    #[instrument(skip(self, config))]
    pub async fn create_recurring(
        &self,
        name: &str,
        kind: JobKind,
        expression: &str,
        config: Option<serde_json::Value>,
    ) -> Result<Job, ServiceError> {
        schedule::parse_expression(expression)?;
        self.ensure_name_free(name).await?;

        let now = self.clock.now();
        let mut job = Job::recurring(name, kind, expression, now);
        if let Some(config) = config {
            job = job.with_config(config);
        }
        job.next_run_at = Some(schedule::next_after(
            expression,
            self.windows.timezone(),
            now,
        )?);

        self.persist_new(job).await
    }

    /// Register a job that fires once at `run_at`.
    #[instrument(skip(self, config))]
    pub async fn create_one_off(
        &self,
        name: &str,
        kind: JobKind,
        run_at: DateTime<Utc>,
        config: Option<serde_json::Value>,
    ) -> Result<Job, ServiceError> {
        self.ensure_name_free(name).await?;

        let now = self.clock.now();
        let mut job = Job::one_off(name, kind, run_at, now);
        if let Some(config) = config {
            job = job.with_config(config);
        }
        self.persist_new(job).await
    }

    /// Fire a job immediately on the operator's behalf. The claim follows
    /// the same lease rules as the scheduler, so a job that is already
    /// running cannot be doubled up. The run continues whether or not the
    /// returned handle is awaited.
    #[instrument(skip(self))]
    pub async fn run_now(&self, id: Uuid, actor: &str) -> Result<JoinHandle<()>, ServiceError> {
        let job = self.require(id).await?;
        if !job.enabled {
            return Err(invalid(&job.name, "disabled", "run now"));
        }
        if !MANUAL_CLAIM_EDGES.contains(&job.status) {
            return Err(invalid(&job.name, &job.status.to_string(), "run now"));
        }

        let Some(permit) = self.executor.try_acquire(job.kind) else {
            return Err(invalid(&job.name, "at its concurrency ceiling", "run now"));
        };

        let now = self.clock.now();
        // A manual trigger is always a fresh cycle; catch-up coverage
        // still reaches back to the previous firing.
        let coverage_start = job.last_run_at;
        let won = self
            .store
            .compare_and_transition(id, &[job.status], JobTransition::Claim { at: now })
            .await?;
        if !won {
            return Err(invalid(&job.name, "already claimed", "run now"));
        }

        info!(job_id = %id, job_name = %job.name, actor, "Manual run claimed");
        let triggered_by = TriggeredBy::Operator {
            actor: actor.to_string(),
        };
        Ok(self
            .executor
            .spawn(job, 1, coverage_start, triggered_by, permit))
    }

    /// Stop future firings. A running job cannot be paused; cancel it.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: Uuid) -> Result<(), ServiceError> {
        let job = self.require(id).await?;
        let expected = [
            JobStatus::Scheduled,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];
        let now = self.clock.now();
        let applied = self
            .store
            .compare_and_transition(id, &expected, JobTransition::Pause { at: now })
            .await?;
        if !applied {
            let current = self.require(id).await?;
            return Err(invalid(&job.name, &current.status.to_string(), "pause"));
        }
        info!(job_id = %id, job_name = %job.name, "Job paused");
        Ok(())
    }

    /// Put a paused or cancelled job back on its schedule. An overdue
    /// next_run_at fires one catch-up run on the next tick.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: Uuid) -> Result<(), ServiceError> {
        let job = self.require(id).await?;
        let expected = [JobStatus::Paused, JobStatus::Cancelled];
        let now = self.clock.now();
        let applied = self
            .store
            .compare_and_transition(id, &expected, JobTransition::Resume { at: now })
            .await?;
        if !applied {
            let current = self.require(id).await?;
            return Err(invalid(&job.name, &current.status.to_string(), "resume"));
        }
        info!(job_id = %id, job_name = %job.name, "Job resumed");
        Ok(())
    }

    /// Ask the live run to stop at its next cancellation point. The run
    /// keeps everything it finished; the job row settles to CANCELLED
    /// when the run acknowledges.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<(), ServiceError> {
        let job = self.require(id).await?;
        if job.status != JobStatus::Running {
            return Err(invalid(&job.name, &job.status.to_string(), "cancel"));
        }
        if !self.executor.request_cancel(id) {
            // Running somewhere, but not here; this instance holds no
            // cancel flag for it.
            return Err(invalid(&job.name, "running in another instance", "cancel"));
        }
        info!(job_id = %id, job_name = %job.name, "Cancel requested");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), ServiceError> {
        let job = self.require(id).await?;
        self.store.set_enabled(id, enabled).await?;
        info!(job_id = %id, job_name = %job.name, enabled, "Enable flag updated");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, ServiceError> {
        self.require(id).await
    }

    /// Every job with its projected next firing, ordered by name. An
    /// overdue instant means the firing is owed and will go at the next
    /// tick.
    pub async fn overview(&self) -> Result<Vec<JobOverview>, ServiceError> {
        let jobs = self.store.list_all().await?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let planned_next_run = self.planned_next_run(&job);
                JobOverview {
                    job,
                    planned_next_run,
                }
            })
            .collect())
    }

    /// Execution history for one job, newest first.
    pub async fn history(
        &self,
        id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobHistory>, ServiceError> {
        self.require(id).await?;
        Ok(self.history.list_for_job(id, offset, limit).await?)
    }

    fn planned_next_run(&self, job: &Job) -> Option<DateTime<Utc>> {
        if !job.enabled || job.status == JobStatus::Paused {
            return None;
        }
        if job.next_run_at.is_some() {
            return job.next_run_at;
        }
        if !job.recurring {
            return None;
        }
        let expression = job.schedule_expression.as_deref()?;
        let reference = job.last_run_at.unwrap_or(job.created_at);
        schedule::next_after(expression, self.windows.timezone(), reference).ok()
    }

    async fn require(&self, id: Uuid) -> Result<Job, ServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    async fn ensure_name_free(&self, name: &str) -> Result<(), ServiceError> {
        if self.store.get_by_name(name).await?.is_some() {
            return Err(ServiceError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    async fn persist_new(&self, job: Job) -> Result<Job, ServiceError> {
        match self.store.create(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, job_name = %job.name, kind = %job.kind, "Job registered");
                Ok(job)
            }
            // Unique-name race between the pre-check and the insert.
            Err(StoreError::DuplicateKey(_)) => Err(ServiceError::DuplicateName(job.name)),
            Err(e) => Err(ServiceError::Store(e)),
        }
    }
}

fn invalid(job: &str, status: &str, action: &str) -> ServiceError {
    ServiceError::InvalidTransition {
        job: job.to_string(),
        status: status.to_string(),
        action: action.to_string(),
    }
}
