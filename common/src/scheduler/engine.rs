// Scheduler core
//
// One tick: pre-filter candidates from the store, confirm due-ness
// against the job's descriptor, reserve an executor slot, then take the
// lease with a single compare-and-transition on the status column.
// Losing that race is normal operation between instances and is recorded
// as a skipped run, never re-fought. A slower sweep loop forces RUNNING
// rows whose heartbeat stopped back onto the retry path, so a crashed
// process cannot hold a lease forever.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::errors::StoreError;
use crate::executor::{failure_disposition, JobExecutor};
use crate::models::{Job, JobHistory, JobStatus, RunStatus, TriggeredBy};
use crate::retry::RetryStrategy;
use crate::schedule;
use crate::store::{HistoryOutcome, JobHistoryLog, JobStore, JobTransition};
use crate::telemetry::{self, AlertNotifier};
use crate::window::WindowCoordinator;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

/// How a due job is claimed: a fresh cycle resets the retry budget, a
/// backoff retry keeps it, and the attempt number tells the two apart in
/// history.
fn claim_plan(job: &Job, now: DateTime<Utc>) -> (JobTransition, i32) {
    if job.status == JobStatus::Failed
        && job.retry_count > 0
        && job.retry_count < job.max_retries
    {
        (JobTransition::Retry { at: now }, job.retry_count + 1)
    } else {
        (JobTransition::Claim { at: now }, 1)
    }
}

/// Periodic claim-and-dispatch loop over the job store.
pub struct SchedulerEngine {
    store: Arc<dyn JobStore>,
    history: Arc<dyn JobHistoryLog>,
    executor: Arc<JobExecutor>,
    windows: Arc<WindowCoordinator>,
    clock: Arc<dyn Clock>,
    retry: Arc<dyn RetryStrategy>,
    alerts: Arc<dyn AlertNotifier>,
    config: SchedulerConfig,
    shutdown_tx: broadcast::Sender<()>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        history: Arc<dyn JobHistoryLog>,
        executor: Arc<JobExecutor>,
        windows: Arc<WindowCoordinator>,
        clock: Arc<dyn Clock>,
        retry: Arc<dyn RetryStrategy>,
        alerts: Arc<dyn AlertNotifier>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        Self {
            store,
            history,
            executor,
            windows,
            clock,
            retry,
            alerts,
            config,
            shutdown_tx,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run the tick and sweep loops until `stop` is called, then wait for
    /// in-flight runs to finish.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            sweep_interval_seconds = self.config.sweep_interval_seconds,
            stale_after_seconds = self.config.stale_after_seconds,
            "Scheduler started"
        );

        let mut tick = interval(Duration::from_secs(self.config.tick_interval_seconds.max(1)));
        // The first sweep fires immediately, so leases orphaned by the
        // previous process are reclaimed on startup.
        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_seconds.max(1)));
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = self.clock.now();
                    match self.tick(now).await {
                        Ok(claimed) if claimed > 0 => {
                            info!(claimed, "Tick claimed due firings");
                        }
                        Ok(_) => debug!("No due firings"),
                        Err(e) => error!(error = %e, "Tick failed"),
                    }
                }
                _ = sweep.tick() => {
                    let now = self.clock.now();
                    match self.sweep(now).await {
                        Ok(reclaimed) if reclaimed > 0 => {
                            warn!(reclaimed, "Sweep reclaimed stale leases");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        self.drain().await;
        info!("Scheduler stopped");
    }

    /// Signal the run loop to stop after the current iteration.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One pass over the due candidates. Per-job failures are logged and
    /// never abort the pass. Returns how many firings were claimed.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let candidates = self.store.list_enabled_due(now).await?;
        telemetry::update_due_backlog(candidates.len());
        debug!(candidate_count = candidates.len(), "Evaluating due candidates");

        let mut claimed = 0;
        for job in candidates {
            let job_id = job.id;
            match self.consider(job, now).await {
                Ok(true) => claimed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to evaluate candidate");
                }
            }
        }
        Ok(claimed)
    }

    /// Evaluate one candidate: precise due check, executor slot, lease.
    async fn consider(&self, job: Job, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match schedule::is_due(&job, self.windows.timezone(), now) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Unusable schedule; skipping job");
                return Ok(false);
            }
        }

        // Reserve the concurrency slot before taking the lease. Claiming
        // first would park the job as RUNNING with nobody able to run it.
        let Some(permit) = self.executor.try_acquire(job.kind) else {
            debug!(job_id = %job.id, kind = %job.kind, "Concurrency ceiling reached; deferring");
            return Ok(false);
        };

        let (transition, attempt) = claim_plan(&job, now);
        // Coverage reaches back to the previous firing; a retry keeps the
        // failed cycle's coverage rather than advancing it.
        let coverage_start = job.last_run_at;

        let won = self
            .store
            .compare_and_transition(job.id, &[job.status], transition)
            .await?;
        if !won {
            // Another instance owns this firing.
            let row = JobHistory::skipped(
                &job,
                TriggeredBy::System,
                None,
                "skipped: already running",
                now,
            );
            if let Err(e) = self.history.append(&row).await {
                warn!(job_id = %job.id, error = %e, "Failed to record skipped firing");
            }
            info!(job_id = %job.id, job_name = %job.name, "Claim lost; firing skipped");
            return Ok(false);
        }

        info!(
            job_id = %job.id,
            job_name = %job.name,
            kind = %job.kind,
            attempt,
            "Firing claimed"
        );
        let handle = self
            .executor
            .spawn(job, attempt, coverage_start, TriggeredBy::System, permit);
        self.track(handle);
        Ok(true)
    }

    /// Force RUNNING jobs whose heartbeat stopped before the staleness
    /// cutoff onto the retry path. Returns how many leases were reclaimed.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now - ChronoDuration::seconds(self.config.stale_after_seconds.max(1) as i64);
        let stale = self.store.list_stale_running(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut reclaimed = 0;
        for job in stale {
            match self.reclaim(&job, now).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to reclaim stale lease");
                }
            }
        }
        if reclaimed > 0 {
            telemetry::record_stale_lease_reclaimed(reclaimed as u64);
        }
        Ok(reclaimed)
    }

    async fn reclaim(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, StoreError> {
        // The orphaned attempt spent one unit of retry budget.
        let failures = job.retry_count + 1;
        let (retry_count, next_run_at, terminal) = failure_disposition(
            job,
            failures,
            true,
            now,
            &self.windows,
            self.retry.as_ref(),
        );
        let message = match job.heartbeat_at {
            Some(last) => format!("Lease expired; last heartbeat at {}", last),
            None => "Lease expired; no heartbeat recorded".to_string(),
        };

        let applied = self
            .store
            .compare_and_transition(
                job.id,
                &[JobStatus::Running],
                JobTransition::Fail {
                    at: now,
                    duration_ms: None,
                    result: None,
                    error_message: message.clone(),
                    retry_count,
                    next_run_at,
                },
            )
            .await?;
        if !applied {
            // The run settled itself between the listing and the reclaim.
            return Ok(false);
        }

        self.finalize_orphan(job, &message, now).await;

        warn!(
            job_id = %job.id,
            job_name = %job.name,
            retry_count,
            next_run_at = ?next_run_at,
            "Stale lease reclaimed"
        );
        if terminal {
            telemetry::record_job_failure(&job.name, job.kind, "stale-lease");
            let alert = format!(
                "Job '{}' lost its lease with the retry budget exhausted: {}",
                job.name, message
            );
            if let Err(e) = self.alerts.send_alert(job.id, &job.name, &alert).await {
                error!(job_id = %job.id, error = %e, "Failed to deliver alert");
            }
        } else {
            telemetry::record_job_retry(&job.name);
        }
        Ok(true)
    }

    /// Close the history row the dead process left open, so the attempt
    /// does not read as live forever.
    async fn finalize_orphan(&self, job: &Job, message: &str, now: DateTime<Utc>) {
        let recent = match self.history.list_for_job(job.id, 0, 20).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not load history for orphan cleanup");
                return;
            }
        };
        let Some(open) = recent.into_iter().find(|row| row.ended_at.is_none()) else {
            return;
        };

        let duration_ms = (now - open.started_at).num_milliseconds();
        let outcome = HistoryOutcome {
            status: RunStatus::Failed,
            ended_at: now,
            duration_ms,
            result: None,
            error_message: Some(message.to_string()),
        };
        if let Err(e) = self.history.finalize(open.id, outcome).await {
            // A slow-but-alive run may have finalized its own row first;
            // its job-row write will then fail the RUNNING check instead.
            warn!(job_id = %job.id, error = %e, "Orphaned history row already finalized");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Wait for every spawned run to settle.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(in_flight = handles.len(), "Waiting for in-flight runs");
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::errors::ExecutionError;
    use crate::executor::{
        ExecutionContext, HandlerRegistry, JobHandler, RunOutcome, TokenRegistry,
    };
    use crate::models::{JobKind, RunSummary};
    use crate::retry::ExponentialBackoff;
    use crate::store::memory::{InMemoryHistoryLog, InMemoryJobStore};
    use crate::telemetry::LogAlertNotifier;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn eat(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        chrono_tz::Africa::Nairobi
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    struct CountingHandler {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, _ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome::Completed(RunSummary::new()))
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        history: Arc<InMemoryHistoryLog>,
        engine: SchedulerEngine,
        runs: Arc<AtomicUsize>,
    }

    fn harness(now: DateTime<Utc>) -> Harness {
        let settings = Settings::default();
        let store = Arc::new(InMemoryJobStore::new());
        let history = Arc::new(InMemoryHistoryLog::new());
        let clock = Arc::new(crate::clock::ManualClock::new(now));
        let windows = Arc::new(WindowCoordinator::default());
        let retry: Arc<dyn RetryStrategy> = Arc::new(ExponentialBackoff::default());
        let alerts: Arc<dyn AlertNotifier> = Arc::new(LogAlertNotifier);
        let runs = Arc::new(AtomicUsize::new(0));
        let handlers = Arc::new(HandlerRegistry::new().register(
            JobKind::Custom,
            Arc::new(CountingHandler {
                runs: Arc::clone(&runs),
            }),
        ));
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            history.clone(),
            handlers,
            Arc::new(TokenRegistry::new()),
            Arc::clone(&windows),
            clock.clone(),
            Arc::clone(&retry),
            Arc::clone(&alerts),
            &settings.executor,
        ));
        let engine = SchedulerEngine::new(
            store.clone(),
            history.clone(),
            executor,
            windows,
            clock,
            retry,
            alerts,
            settings.scheduler,
        );
        Harness {
            store,
            history,
            engine,
            runs,
        }
    }

    #[test]
    fn test_claim_plan_fresh_cycle_resets_budget() {
        let now = Utc::now();
        let job = Job::recurring("j", JobKind::Custom, "0 0 8 * * *", now);
        let (transition, attempt) = claim_plan(&job, now);
        assert!(matches!(transition, JobTransition::Claim { .. }));
        assert_eq!(attempt, 1);
    }

    #[test]
    fn test_claim_plan_failed_with_budget_is_a_retry() {
        let now = Utc::now();
        let mut job = Job::recurring("j", JobKind::Custom, "0 0 8 * * *", now);
        job.status = JobStatus::Failed;
        job.retry_count = 1;
        let (transition, attempt) = claim_plan(&job, now);
        assert!(matches!(transition, JobTransition::Retry { .. }));
        assert_eq!(attempt, 2);
    }

    #[test]
    fn test_claim_plan_exhausted_budget_starts_fresh() {
        let now = Utc::now();
        let mut job = Job::recurring("j", JobKind::Custom, "0 0 8 * * *", now);
        job.status = JobStatus::Failed;
        job.retry_count = job.max_retries;
        let (transition, attempt) = claim_plan(&job, now);
        assert!(matches!(transition, JobTransition::Claim { .. }));
        assert_eq!(attempt, 1);
    }

    #[tokio::test]
    async fn test_tick_claims_and_runs_due_job() {
        let now = eat(2024, 3, 4, 9, 0);
        let h = harness(now);
        let mut job = Job::recurring("hourly", JobKind::Custom, "0 0 * * * *", now);
        job.next_run_at = Some(now - ChronoDuration::minutes(1));
        h.store.create(&job).await.unwrap();

        let claimed = h.engine.tick(now).await.unwrap();
        assert_eq!(claimed, 1);
        h.engine.drain().await;

        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
        let settled = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Completed);
        assert!(settled.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_leaves_not_yet_due_jobs_alone() {
        let now = eat(2024, 3, 4, 9, 0);
        let h = harness(now);
        let mut job = Job::recurring("hourly", JobKind::Custom, "0 0 * * * *", now);
        job.next_run_at = Some(now + ChronoDuration::hours(1));
        h.store.create(&job).await.unwrap();

        let claimed = h.engine.tick(now).await.unwrap();
        assert_eq!(claimed, 0);
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lost_claim_records_skipped_run() {
        let now = eat(2024, 3, 4, 9, 0);
        let h = harness(now);
        let mut job = Job::recurring("hourly", JobKind::Custom, "0 0 * * * *", now);
        job.next_run_at = Some(now - ChronoDuration::minutes(1));
        h.store.create(&job).await.unwrap();

        // Another instance wins the race between snapshot and claim.
        let stale_snapshot = h.store.get(job.id).await.unwrap().unwrap();
        h.store
            .compare_and_transition(
                job.id,
                &[JobStatus::Scheduled],
                JobTransition::Claim { at: now },
            )
            .await
            .unwrap();

        let won = h.engine.consider(stale_snapshot, now).await.unwrap();
        assert!(!won);
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);

        let rows = h.history.list_for_job(job.id, 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RunStatus::Skipped);
        let details = &rows[0].result.as_ref().unwrap().details;
        assert_eq!(details, &vec!["skipped: already running".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_moves_stale_lease_to_retry_path() {
        let claim_at = eat(2024, 3, 4, 9, 0);
        let h = harness(claim_at);
        let mut job = Job::recurring("hourly", JobKind::Custom, "0 0 * * * *", claim_at);
        job.next_run_at = Some(claim_at);
        h.store.create(&job).await.unwrap();
        h.store
            .compare_and_transition(
                job.id,
                &[JobStatus::Scheduled],
                JobTransition::Claim { at: claim_at },
            )
            .await
            .unwrap();
        let open = JobHistory::begin(&job, 1, TriggeredBy::System, None, claim_at);
        h.history.append(&open).await.unwrap();

        // Well past the staleness cutoff, with no heartbeat since claim.
        let now = claim_at + ChronoDuration::minutes(10);
        let reclaimed = h.engine.sweep(now).await.unwrap();
        assert_eq!(reclaimed, 1);

        let swept = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(swept.status, JobStatus::Failed);
        assert_eq!(swept.retry_count, 1);
        let backoff = swept.next_run_at.unwrap();
        assert!(backoff > now, "retry deadline should be in the future");

        let rows = h.history.list_for_job(job.id, 0, 10).await.unwrap();
        assert_eq!(rows[0].status, RunStatus::Failed);
        assert!(rows[0].ended_at.is_some());

        // A healthy run that settles first is left alone.
        let again = h.engine.sweep(now + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(again, 0);
    }
}
