use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_SECONDS: i32 = 1800;
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ============================================================================
// Job Models
// ============================================================================

/// Job is the durable definition of a unit of background work. It is a plain
/// data record: the scheduler and executor mutate it only through the store,
/// and all derived behaviour lives in free functions and services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Cron expression evaluated in the settlement timezone. `None` for
    /// one-off jobs, which fire from `next_run_at` instead.
    pub schedule_expression: Option<String>,
    pub recurring: bool,
    /// Opaque per-job settings, interpreted by the handler.
    pub config: serde_json::Value,
    pub enabled: bool,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Refreshed by the executor while a run is in flight; the stale-lease
    /// sweep uses it to spot claims held by dead processes.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<RunSummary>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a recurring job definition driven by a cron expression.
    pub fn recurring(
        name: impl Into<String>,
        kind: JobKind,
        expression: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            status: JobStatus::Scheduled,
            schedule_expression: Some(expression.into()),
            recurring: true,
            config: serde_json::json!({}),
            enabled: true,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            last_retry_at: None,
            scheduled_at: Some(now),
            started_at: None,
            completed_at: None,
            next_run_at: None,
            last_run_at: None,
            heartbeat_at: None,
            duration_ms: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a one-off job that fires once at `run_at`.
    pub fn one_off(
        name: impl Into<String>,
        kind: JobKind,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            status: JobStatus::Scheduled,
            schedule_expression: None,
            recurring: false,
            config: serde_json::json!({}),
            enabled: true,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            last_retry_at: None,
            scheduled_at: Some(run_at),
            started_at: None,
            completed_at: None,
            next_run_at: Some(run_at),
            last_run_at: None,
            heartbeat_at: None,
            duration_ms: None,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_limits(mut self, timeout_seconds: i32, max_retries: i32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self.max_retries = max_retries;
        self
    }
}

/// JobKind is the closed set of work the platform schedules. Each kind has
/// exactly one handler registered at startup; there is no fallthrough
/// dispatch, so an unregistered kind is a permanent execution error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    PolicyBatch,
    PaymentReminder,
    LapseCheck,
    ReportGeneration,
    Reconciliation,
    Settlement,
    Custom,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::PolicyBatch,
        JobKind::PaymentReminder,
        JobKind::LapseCheck,
        JobKind::ReportGeneration,
        JobKind::Reconciliation,
        JobKind::Settlement,
        JobKind::Custom,
    ];

    /// Kinds whose runs are scoped to a settlement window and deduplicated
    /// by a (kind, window id) idempotency key.
    pub fn is_windowed(&self) -> bool {
        matches!(
            self,
            JobKind::PolicyBatch | JobKind::Settlement | JobKind::Reconciliation
        )
    }

    /// What a run with some failed items but no job-level error settles as.
    /// Reconciliation must account for every item, so any miss fails the run;
    /// the other batch kinds tally failures and complete, because each item
    /// that did succeed is independently idempotent and correct.
    pub fn partial_failure_policy(&self) -> PartialFailurePolicy {
        match self {
            JobKind::Reconciliation => PartialFailurePolicy::FailRun,
            _ => PartialFailurePolicy::CompleteWithFailures,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::PolicyBatch => write!(f, "policy-batch"),
            JobKind::PaymentReminder => write!(f, "payment-reminder"),
            JobKind::LapseCheck => write!(f, "lapse-check"),
            JobKind::ReportGeneration => write!(f, "report-generation"),
            JobKind::Reconciliation => write!(f, "reconciliation"),
            JobKind::Settlement => write!(f, "settlement"),
            JobKind::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "policy-batch" => Ok(JobKind::PolicyBatch),
            "payment-reminder" => Ok(JobKind::PaymentReminder),
            "lapse-check" => Ok(JobKind::LapseCheck),
            "report-generation" => Ok(JobKind::ReportGeneration),
            "reconciliation" => Ok(JobKind::Reconciliation),
            "settlement" => Ok(JobKind::Settlement),
            "custom" => Ok(JobKind::Custom),
            _ => Err(format!("Invalid job kind: {}", s)),
        }
    }
}

impl TryFrom<String> for JobKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// How a batch run with item-level failures settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialFailurePolicy {
    /// Any failed item fails the whole run (retried per the retry budget).
    FailRun,
    /// Failures are tallied in the summary and the run completes.
    CompleteWithFailures,
}

/// JobStatus is the persisted lifecycle state of a job definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Paused => write!(f, "paused"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "paused" => Ok(JobStatus::Paused),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

// ============================================================================
// Run Summary
// ============================================================================

/// Tally of a single run. For windowed batch kinds, `processed` counts
/// payment events collected for the window while `succeeded`, `failed` and
/// `skipped` count riders.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&mut self) {
        self.succeeded += 1;
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn fail(&mut self, detail: impl Into<String>) {
        self.failed += 1;
        self.details.push(detail.into());
    }

    pub fn note(&mut self, detail: impl Into<String>) {
        self.details.push(detail.into());
    }
}

// ============================================================================
// JobHistory Models
// ============================================================================

/// JobHistory is one append-only row per execution attempt. Created when the
/// attempt starts, finalized exactly once when it ends, never mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub status: RunStatus,
    /// Deduplication key for windowed runs, `kind:window_id`.
    pub idempotency_key: Option<String>,
    pub triggered_by: TriggeredBy,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<RunSummary>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobHistory {
    /// Open a history row for an attempt that is about to run.
    pub fn begin(
        job: &Job,
        attempt: i32,
        triggered_by: TriggeredBy,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_name: job.name.clone(),
            status: RunStatus::Running,
            idempotency_key,
            triggered_by,
            attempt,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            result: None,
            error_message: None,
            created_at: now,
        }
    }

    /// A pre-finalized row recording a firing that never ran (claim lost,
    /// window already settled). Keeps no-ops visible to operators.
    pub fn skipped(
        job: &Job,
        triggered_by: TriggeredBy,
        idempotency_key: Option<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut summary = RunSummary::new();
        summary.note(reason);
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_name: job.name.clone(),
            status: RunStatus::Skipped,
            idempotency_key,
            triggered_by,
            attempt: 0,
            started_at: now,
            ended_at: Some(now),
            duration_ms: Some(0),
            result: Some(summary),
            error_message: None,
            created_at: now,
        }
    }
}

/// RunStatus is the outcome recorded on a history row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "timeout" => Ok(RunStatus::Timeout),
            "cancelled" => Ok(RunStatus::Cancelled),
            "skipped" => Ok(RunStatus::Skipped),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl TryFrom<String> for RunStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Who asked for a run. Stored as the literal `system` or the operator's
/// actor id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggeredBy {
    System,
    Operator { actor: String },
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggeredBy::System => write!(f, "system"),
            TriggeredBy::Operator { actor } => write!(f, "{}", actor),
        }
    }
}

impl FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("Empty triggered_by value".to_string()),
            "system" => Ok(TriggeredBy::System),
            actor => Ok(TriggeredBy::Operator {
                actor: actor.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TriggeredBy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

// ============================================================================
// Payment Models
// ============================================================================

/// A confirmed premium payment as reported by the payment feed. Amounts are
/// in minor currency units (cents of KES).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentEvent {
    pub rider_id: String,
    pub amount_minor: i64,
    pub confirmed_at: DateTime<Utc>,
    /// Upstream payment reference, unique per confirmation.
    pub reference: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_round_trip() {
        for kind in JobKind::ALL {
            let parsed: JobKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Paused,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_windowed_kinds() {
        assert!(JobKind::Settlement.is_windowed());
        assert!(JobKind::PolicyBatch.is_windowed());
        assert!(JobKind::Reconciliation.is_windowed());
        assert!(!JobKind::PaymentReminder.is_windowed());
        assert!(!JobKind::ReportGeneration.is_windowed());
    }

    #[test]
    fn test_triggered_by_stores_actor_id() {
        let by: TriggeredBy = "ops-jane".parse().unwrap();
        assert_eq!(
            by,
            TriggeredBy::Operator {
                actor: "ops-jane".to_string()
            }
        );
        assert_eq!(by.to_string(), "ops-jane");
        assert_eq!("system".parse::<TriggeredBy>().unwrap(), TriggeredBy::System);
    }

    #[test]
    fn test_one_off_job_fires_from_next_run_at() {
        let now = Utc::now();
        let run_at = now + chrono::Duration::hours(2);
        let job = Job::one_off("eod-report", JobKind::ReportGeneration, run_at, now);
        assert_eq!(job.next_run_at, Some(run_at));
        assert!(job.schedule_expression.is_none());
        assert!(!job.recurring);
    }

    #[test]
    fn test_recurring_job_has_no_next_run_until_first_completion() {
        let now = Utc::now();
        let job = Job::recurring("settlement", JobKind::Settlement, "0 0 8,14,20 * * *", now);
        assert!(job.next_run_at.is_none());
        assert!(job.recurring);
    }
}
