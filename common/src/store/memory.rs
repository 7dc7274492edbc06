// In-memory store adapters
//
// Same observable semantics as the PostgreSQL adapters, held behind a
// mutex. Used by unit tests and local smoke runs; the transition rules
// here are the reference the SQL must match.

use crate::errors::StoreError;
use crate::models::{Job, JobHistory, JobStatus, RunStatus};
use crate::store::{HistoryOutcome, JobHistoryLog, JobStore, JobTransition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn apply(job: &mut Job, transition: JobTransition) {
    match transition {
        JobTransition::Claim { at } => {
            job.status = JobStatus::Running;
            job.started_at = Some(at);
            job.heartbeat_at = Some(at);
            job.last_run_at = Some(at);
            job.next_run_at = None;
            job.retry_count = 0;
            job.last_retry_at = None;
            job.completed_at = None;
            job.duration_ms = None;
            job.result = None;
            job.error_message = None;
            job.updated_at = at;
        }
        JobTransition::Retry { at } => {
            job.status = JobStatus::Running;
            job.started_at = Some(at);
            job.heartbeat_at = Some(at);
            job.last_retry_at = Some(at);
            job.next_run_at = None;
            job.completed_at = None;
            job.duration_ms = None;
            job.result = None;
            job.error_message = None;
            job.updated_at = at;
        }
        JobTransition::Complete {
            at,
            duration_ms,
            result,
            next_run_at,
        } => {
            job.status = JobStatus::Completed;
            job.completed_at = Some(at);
            job.duration_ms = Some(duration_ms);
            job.result = Some(result);
            job.next_run_at = next_run_at;
            job.error_message = None;
            job.heartbeat_at = None;
            job.updated_at = at;
        }
        JobTransition::Fail {
            at,
            duration_ms,
            result,
            error_message,
            retry_count,
            next_run_at,
        } => {
            job.status = JobStatus::Failed;
            job.completed_at = Some(at);
            job.duration_ms = duration_ms;
            job.result = result;
            job.error_message = Some(error_message);
            job.retry_count = retry_count;
            job.next_run_at = next_run_at;
            job.heartbeat_at = None;
            job.updated_at = at;
        }
        JobTransition::Cancel {
            at,
            duration_ms,
            result,
        } => {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(at);
            job.duration_ms = duration_ms;
            job.result = result;
            job.next_run_at = None;
            job.heartbeat_at = None;
            job.updated_at = at;
        }
        JobTransition::Pause { at } => {
            job.status = JobStatus::Paused;
            job.updated_at = at;
        }
        JobTransition::Resume { at } => {
            job.status = JobStatus::Scheduled;
            job.updated_at = at;
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateKey(format!("job id {}", job.id)));
        }
        if jobs.values().any(|j| j.name == job.name) {
            return Err(StoreError::DuplicateKey(format!("job name {}", job.name)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().values().find(|j| j.name == name).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn list_enabled_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let claimable = [JobStatus::Scheduled, JobStatus::Completed, JobStatus::Failed];
        let mut jobs: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| j.enabled && claimable.contains(&j.status))
            .filter(|j| match j.next_run_at {
                Some(next) => next <= now,
                None => j.recurring,
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.next_run_at.is_none(), j.next_run_at));
        Ok(jobs)
    }

    async fn compare_and_transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        transition: JobTransition,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        match jobs.get_mut(&id) {
            Some(job) if expected.contains(&job.status) => {
                apply(job, transition);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Job not found: {}", id)))?;
        job.enabled = enabled;
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut jobs = self.lock();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.heartbeat_at = Some(at);
                job.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| {
                j.heartbeat_at
                    .or(j.started_at)
                    .unwrap_or(j.created_at)
                    < cutoff
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryHistoryLog {
    rows: Mutex<Vec<JobHistory>>,
}

impl InMemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JobHistory>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every row, oldest first. Test helper.
    pub fn all(&self) -> Vec<JobHistory> {
        self.lock().clone()
    }
}

#[async_trait]
impl JobHistoryLog for InMemoryHistoryLog {
    async fn append(&self, entry: &JobHistory) -> Result<(), StoreError> {
        let mut rows = self.lock();
        if rows.iter().any(|r| r.id == entry.id) {
            return Err(StoreError::DuplicateKey(format!("history id {}", entry.id)));
        }
        rows.push(entry.clone());
        Ok(())
    }

    async fn finalize(&self, id: Uuid, outcome: HistoryOutcome) -> Result<(), StoreError> {
        let mut rows = self.lock();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id && r.ended_at.is_none())
            .ok_or_else(|| {
                StoreError::NotFound(format!("History row missing or already finalized: {}", id))
            })?;
        row.status = outcome.status;
        row.ended_at = Some(outcome.ended_at);
        row.duration_ms = Some(outcome.duration_ms);
        row.result = outcome.result;
        row.error_message = outcome.error_message;
        Ok(())
    }

    async fn find_completed_for_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobHistory>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| {
                r.status == RunStatus::Completed
                    && r.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn list_for_job(
        &self,
        job_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobHistory>, StoreError> {
        let mut rows: Vec<JobHistory> = self
            .lock()
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
