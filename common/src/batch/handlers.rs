// Handlers binding the batch processor to the executor's job kinds.
//
// One handler per kind. The windowed kinds walk every candidate window of
// the firing's coverage interval, so a service that slept through window
// boundaries catches up on its first firing back, and a window whose
// earlier cycle exhausted its retry budget is picked up again by the next
// cycle. Candidates already settled by a completed run are skipped.

use super::{BatchProcessor, BatchVerdict};
use crate::clock::Clock;
use crate::errors::ExecutionError;
use crate::executor::{ExecutionContext, HandlerRegistry, JobHandler, RunOutcome};
use crate::models::{JobKind, RunSummary};
use async_trait::async_trait;
use chrono::Days;
use std::sync::Arc;
use tracing::{debug, info};

/// A registry with the platform's standard kinds wired to one processor.
/// `Custom` stays unregistered; running a custom job without registering
/// a handler for it is a permanent error, not a silent fallthrough.
pub fn standard_registry(processor: Arc<BatchProcessor>) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            JobKind::Settlement,
            Arc::new(SettlementHandler::new(Arc::clone(&processor))),
        )
        .register(
            JobKind::PolicyBatch,
            Arc::new(PolicyBatchHandler::new(Arc::clone(&processor))),
        )
        .register(
            JobKind::Reconciliation,
            Arc::new(ReconciliationHandler::new(Arc::clone(&processor))),
        )
        .register(
            JobKind::PaymentReminder,
            Arc::new(PaymentReminderHandler::new(Arc::clone(&processor))),
        )
        .register(
            JobKind::LapseCheck,
            Arc::new(LapseCheckHandler::new(Arc::clone(&processor))),
        )
        .register(
            JobKind::ReportGeneration,
            Arc::new(ReportGenerationHandler::new(processor)),
        )
}

/// Settles each unsettled candidate window: issues cover and posts the
/// premium journal entry for every rider who crossed the threshold.
pub struct SettlementHandler {
    processor: Arc<BatchProcessor>,
}

impl SettlementHandler {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for SettlementHandler {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
        settle_candidates(&self.processor, ctx, JobKind::Settlement, true).await
    }
}

/// Issue-only variant of settlement: drives policy issuance for eligible
/// riders without touching the ledger. Used to backfill cover when the
/// ledger is being repaired out of band.
pub struct PolicyBatchHandler {
    processor: Arc<BatchProcessor>,
}

impl PolicyBatchHandler {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for PolicyBatchHandler {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
        settle_candidates(&self.processor, ctx, JobKind::PolicyBatch, false).await
    }
}

async fn settle_candidates(
    processor: &BatchProcessor,
    ctx: &ExecutionContext,
    kind: JobKind,
    post_to_ledger: bool,
) -> Result<RunOutcome, ExecutionError> {
    let now = processor.clock().now();
    let mut summary = RunSummary::new();
    let candidates = processor
        .candidate_windows(ctx.coverage_start, now)
        .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))?;
    info!(
        candidate_count = candidates.len(),
        attempt = ctx.attempt,
        "Walking candidate windows"
    );

    for window in &candidates {
        if ctx.cancel.is_triggered() {
            summary.note(format!("Cancelled before window {}", window.id()));
            return Ok(RunOutcome::Cancelled(summary));
        }
        if processor.is_settled(kind, window).await? {
            debug!(window_id = %window.id(), "Candidate already settled");
            continue;
        }
        match processor
            .settle_window(&ctx.job, window, post_to_ledger, &ctx.cancel, &mut summary)
            .await?
        {
            BatchVerdict::Completed => {}
            BatchVerdict::Cancelled => return Ok(RunOutcome::Cancelled(summary)),
        }
    }
    Ok(RunOutcome::Completed(summary))
}

/// Compares each settled window of the previous settlement day against
/// the payment feed. Any mismatch fails the whole run, so reconciliation
/// surfaces drift instead of completing around it.
pub struct ReconciliationHandler {
    processor: Arc<BatchProcessor>,
}

impl ReconciliationHandler {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for ReconciliationHandler {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
        let now = self.processor.clock().now();
        let window = ctx.require_window()?;
        let report_date = window
            .settlement_date
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| ExecutionError::InvalidJobConfig("date out of range".to_string()))?;

        let mut summary = RunSummary::new();
        let windows = self
            .processor
            .coordinator()
            .windows_for_day(report_date)
            .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))?;
        for window in &windows {
            if ctx.cancel.is_triggered() {
                summary.note(format!("Cancelled before window {}", window.id()));
                return Ok(RunOutcome::Cancelled(summary));
            }
            // The previous day's overnight window closes mid-morning; if
            // it is still open its feed is incomplete and any comparison
            // would be noise.
            if window.range_end > now {
                summary.skip();
                summary.note(format!("window {} still open", window.id()));
                continue;
            }
            self.processor.reconcile_window(window, &mut summary).await?;
        }
        Ok(RunOutcome::Completed(summary))
    }
}

/// Flags riders who are paying this cycle but have not yet reached the
/// cover threshold.
pub struct PaymentReminderHandler {
    processor: Arc<BatchProcessor>,
}

impl PaymentReminderHandler {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for PaymentReminderHandler {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
        let now = self.processor.clock().now();
        let mut summary = RunSummary::new();
        let verdict = self
            .processor
            .remind_unfinished_riders(&ctx.job, now, &ctx.cancel, &mut summary)
            .await?;
        Ok(outcome(verdict, summary))
    }
}

/// Flags riders whose cover from last cycle is lapsing unpaid.
pub struct LapseCheckHandler {
    processor: Arc<BatchProcessor>,
}

impl LapseCheckHandler {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for LapseCheckHandler {
    async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
        let now = self.processor.clock().now();
        let mut summary = RunSummary::new();
        let verdict = self
            .processor
            .check_lapses(&ctx.job, now, &ctx.cancel, &mut summary)
            .await?;
        Ok(outcome(verdict, summary))
    }
}

/// Per-window payment statistics for the previous settlement day; the
/// run result doubles as the report.
pub struct ReportGenerationHandler {
    processor: Arc<BatchProcessor>,
}

impl ReportGenerationHandler {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for ReportGenerationHandler {
    async fn run(&self, _ctx: &ExecutionContext) -> Result<RunOutcome, ExecutionError> {
        let now = self.processor.clock().now();
        let mut summary = RunSummary::new();
        self.processor.generate_daily_report(now, &mut summary).await?;
        Ok(RunOutcome::Completed(summary))
    }
}

fn outcome(verdict: BatchVerdict, summary: RunSummary) -> RunOutcome {
    match verdict {
        BatchVerdict::Completed => RunOutcome::Completed(summary),
        BatchVerdict::Cancelled => RunOutcome::Cancelled(summary),
    }
}
