// Job kind dispatch
//
// Every JobKind is mapped to exactly one handler in a table built at
// startup. Dispatch is a table lookup; a kind with no registered handler
// is a permanent execution error, never a silent fallthrough.

use crate::errors::ExecutionError;
use crate::executor::token::CancelSignal;
use crate::models::{Job, JobKind, RunSummary};
use crate::window::BatchWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one attempt of a job gets to see.
pub struct ExecutionContext {
    pub job: Job,
    /// The window this firing settles, for windowed kinds.
    pub window: Option<BatchWindow>,
    /// Run-level idempotency key, `kind:window_id` for windowed kinds.
    pub idempotency_key: Option<String>,
    /// Start of the interval this run is answerable for: the previous
    /// firing's instant. `None` on a job's first ever firing.
    pub coverage_start: Option<DateTime<Utc>>,
    /// 1-based attempt number within the current cycle.
    pub attempt: i32,
    pub cancel: Arc<CancelSignal>,
}

impl ExecutionContext {
    /// Window this context settles, or a permanent config error for
    /// handlers that cannot run without one.
    pub fn require_window(&self) -> Result<&BatchWindow, ExecutionError> {
        self.window.as_ref().ok_or_else(|| {
            ExecutionError::InvalidJobConfig(format!(
                "Job kind '{}' requires a settlement window",
                self.job.kind
            ))
        })
    }
}

/// How a handler came back. Cancellation keeps the partial tally so the
/// history row records how far the run got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled(RunSummary),
}

/// The work function of one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError>;
}

/// Immutable kind→handler table, built once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Result<Arc<dyn JobHandler>, ExecutionError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownJobKind(kind.to_string()))
    }

    pub fn registered_kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}
