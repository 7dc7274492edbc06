// Batch settlement
//
// A settlement run walks the payment events of one closed window, groups
// them by rider, applies the coverage threshold rule and drives the two
// idempotent collaborator calls per eligible rider. Rider-level failures
// are tallied, never propagated; only window-level failures (a feed that
// cannot be read at all) abort the run. Cancellation is honored between
// riders, never mid-rider.

pub mod handlers;

use crate::clock::Clock;
use crate::collaborators::{JournalLine, LedgerPoster, PaymentFeed, PolicyIssuer};
use crate::config::SettlementConfig;
use crate::errors::{ExecutionError, ScheduleError, StoreError};
use crate::executor::CancelSignal;
use crate::models::{Job, JobKind, PaymentEvent, RunSummary};
use crate::store::JobHistoryLog;
use crate::telemetry;
use crate::window::{BatchWindow, WindowCoordinator};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// How a window walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerdict {
    Completed,
    /// Cancellation was observed at a rider boundary; the summary holds
    /// the partial tally.
    Cancelled,
}

/// Payment totals of one rider inside a window.
#[derive(Debug, Clone)]
struct RiderSlice {
    window_total: i64,
    payment_count: u64,
}

pub struct BatchProcessor {
    payments: Arc<dyn PaymentFeed>,
    policies: Arc<dyn PolicyIssuer>,
    ledger: Arc<dyn LedgerPoster>,
    history: Arc<dyn JobHistoryLog>,
    windows: Arc<WindowCoordinator>,
    clock: Arc<dyn Clock>,
    threshold_minor: i64,
    cash_account: String,
    premium_income_account: String,
}

impl BatchProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payments: Arc<dyn PaymentFeed>,
        policies: Arc<dyn PolicyIssuer>,
        ledger: Arc<dyn LedgerPoster>,
        history: Arc<dyn JobHistoryLog>,
        windows: Arc<WindowCoordinator>,
        clock: Arc<dyn Clock>,
        settlement: &SettlementConfig,
    ) -> Self {
        Self {
            payments,
            policies,
            ledger,
            history,
            windows,
            clock,
            threshold_minor: settlement.threshold_minor,
            cash_account: settlement.cash_account.clone(),
            premium_income_account: settlement.premium_income_account.clone(),
        }
    }

    pub fn coordinator(&self) -> &WindowCoordinator {
        &self.windows
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Per-job threshold override, falling back to the configured default.
    pub fn threshold_for(&self, job: &Job) -> i64 {
        job.config
            .get("threshold_minor")
            .and_then(|v| v.as_i64())
            .filter(|v| *v > 0)
            .unwrap_or(self.threshold_minor)
    }

    /// The closed windows a firing is answerable for, oldest first. With no
    /// previous firing this is just the most recently closed window; with
    /// one, every window that closed since then is a candidate, so downtime
    /// across boundaries is caught up. Already-settled candidates are
    /// no-ops for the caller via `is_settled`.
    pub fn candidate_windows(
        &self,
        coverage_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchWindow>, ScheduleError> {
        let current = self.windows.window_for(now)?;
        let Some(start) = coverage_start else {
            return Ok(vec![current]);
        };

        let tz = self.windows.timezone();
        // One day before the coverage start so the previous day's overnight
        // window, which closes inside the covered interval, is included.
        let mut date = start
            .min(now)
            .with_timezone(&tz)
            .date_naive()
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| ScheduleError::CalculationFailed("date out of range".to_string()))?;
        let last_date = now.with_timezone(&tz).date_naive();

        let mut candidates = Vec::new();
        while date <= last_date {
            for window in self.windows.windows_for_day(date)? {
                if window.range_end <= now {
                    candidates.push(window);
                }
            }
            date = date
                .checked_add_days(Days::new(1))
                .ok_or_else(|| ScheduleError::CalculationFailed("date out of range".to_string()))?;
        }
        candidates.sort_by_key(|w| w.range_end);
        candidates.dedup_by_key(|w| w.id());
        Ok(candidates)
    }

    /// Whether a completed run has already settled `window` for `kind`.
    pub async fn is_settled(&self, kind: JobKind, window: &BatchWindow) -> Result<bool, StoreError> {
        let key = format!("{}:{}", kind, window.id());
        Ok(self.history.find_completed_for_key(&key).await?.is_some())
    }

    /// Walk one window: group payments by rider, apply the threshold rule,
    /// and for each eligible rider issue cover and post the premium. When
    /// `post_to_ledger` is false only issuance is performed (policy-batch
    /// backfills). The summary counts payments as processed and riders as
    /// succeeded/failed/skipped.
    #[instrument(skip(self, job, cancel, summary), fields(window_id = %window.id()))]
    pub async fn settle_window(
        &self,
        job: &Job,
        window: &BatchWindow,
        post_to_ledger: bool,
        cancel: &CancelSignal,
        summary: &mut RunSummary,
    ) -> Result<BatchVerdict, ExecutionError> {
        let threshold = self.threshold_for(job);
        let events = self
            .payments
            .confirmed_in(window.range_start, window.range_end)
            .await?;
        summary.processed += events.len() as u64;
        telemetry::record_settlement_payments(events.len() as u64);

        let riders = group_by_rider(&events);
        let cycle_start = self.cycle_start(window)?;
        info!(
            payment_count = events.len(),
            rider_count = riders.len(),
            threshold_minor = threshold,
            cycle_start = %cycle_start,
            "Settling window"
        );

        let mut remaining = riders.len();
        for (rider_id, slice) in &riders {
            // Cooperative cancel point. Riders already handled stay
            // settled; the rest are counted as skipped work.
            if cancel.is_triggered() {
                summary.skipped += remaining as u64;
                summary.note(format!(
                    "Cancelled before {} of {} riders",
                    remaining,
                    riders.len()
                ));
                telemetry::record_settlement_riders("skipped", remaining as u64);
                return Ok(BatchVerdict::Cancelled);
            }
            remaining -= 1;

            match self
                .settle_rider(rider_id, slice, window, cycle_start, threshold, post_to_ledger)
                .await
            {
                Ok(RiderOutcome::Covered) => {
                    summary.succeed();
                    telemetry::record_settlement_riders("succeeded", 1);
                }
                Ok(RiderOutcome::BelowThreshold) | Ok(RiderOutcome::AlreadyCovered) => {
                    summary.skip();
                    telemetry::record_settlement_riders("skipped", 1);
                }
                Err(e) => {
                    warn!(rider_id = %rider_id, error = %e, "Rider settlement failed");
                    summary.fail(format!("rider {}: {}", rider_id, e));
                    telemetry::record_settlement_riders("failed", 1);
                }
            }
        }

        Ok(BatchVerdict::Completed)
    }

    async fn settle_rider(
        &self,
        rider_id: &str,
        slice: &RiderSlice,
        window: &BatchWindow,
        cycle_start: DateTime<Utc>,
        threshold: i64,
        post_to_ledger: bool,
    ) -> Result<RiderOutcome, ExecutionError> {
        let before = self
            .payments
            .cycle_total(rider_id, cycle_start, window.range_start)
            .await?;
        let crossed = before < threshold && before + slice.window_total >= threshold;
        if !crossed {
            return Ok(RiderOutcome::BelowThreshold);
        }

        let issue = self.policies.issue_policy(rider_id, &window.id()).await?;

        let mut newly_posted = false;
        if post_to_ledger {
            // Posting runs even when the policy already existed: a
            // cancelled or crashed run may have issued cover without its
            // journal entry, and the source_ref makes the repost a no-op
            // when it did land.
            let source_ref = format!("{}:{}", window.id(), rider_id);
            let lines = vec![
                JournalLine::debit(&self.cash_account, threshold),
                JournalLine::credit(&self.premium_income_account, threshold),
            ];
            let post = self.ledger.post_journal_entry(&source_ref, &lines).await?;
            newly_posted = post.newly_posted;
        }

        if issue.newly_issued || newly_posted {
            Ok(RiderOutcome::Covered)
        } else {
            Ok(RiderOutcome::AlreadyCovered)
        }
    }

    /// Start of the coverage cycle a window belongs to: the first instant
    /// of the settlement timezone's calendar month containing the window's
    /// close.
    pub fn cycle_start(&self, window: &BatchWindow) -> Result<DateTime<Utc>, ExecutionError> {
        let tz = self.windows.timezone();
        let local_end = window.range_end.with_timezone(&tz);
        let month_start = NaiveDate::from_ymd_opt(local_end.year(), local_end.month(), 1)
            .ok_or_else(|| {
                ExecutionError::InvalidJobConfig(format!(
                    "No month start for window close {}",
                    local_end
                ))
            })?;
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).ok_or_else(|| {
            ExecutionError::InvalidJobConfig("midnight is not a valid time".to_string())
        })?;
        self.windows
            .local_instant(month_start, midnight)
            .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))
    }

    /// Compare a window's recorded settlement against the payment feed.
    /// A settled window whose stored payment count no longer matches the
    /// feed is tallied as a mismatch; an unsettled closed window is noted
    /// and skipped.
    #[instrument(skip(self, summary), fields(window_id = %window.id()))]
    pub async fn reconcile_window(
        &self,
        window: &BatchWindow,
        summary: &mut RunSummary,
    ) -> Result<(), ExecutionError> {
        summary.processed += 1;
        let events = self
            .payments
            .confirmed_in(window.range_start, window.range_end)
            .await?;

        let key = format!("{}:{}", JobKind::Settlement, window.id());
        let settled = self
            .history
            .find_completed_for_key(&key)
            .await
            .map_err(ExecutionError::Store)?;

        match settled {
            None => {
                summary.skip();
                summary.note(format!("window {} not yet settled", window.id()));
            }
            Some(run) => {
                let recorded = run.result.as_ref().map(|r| r.processed).unwrap_or(0);
                if recorded == events.len() as u64 {
                    summary.succeed();
                } else {
                    summary.fail(format!(
                        "window {}: settled run saw {} payments, feed now has {}",
                        window.id(),
                        recorded,
                        events.len()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Riders whose cycle total at `now` is below the threshold but not
    /// zero: paying, not yet covered. One reminder tally per rider.
    pub async fn remind_unfinished_riders(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        cancel: &CancelSignal,
        summary: &mut RunSummary,
    ) -> Result<BatchVerdict, ExecutionError> {
        let threshold = self.threshold_for(job);
        let window = self
            .windows
            .window_containing(now)
            .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))?;
        let cycle_start = self.month_start_of(now)?;
        let events = self.payments.confirmed_in(cycle_start, now).await?;

        let riders = group_by_rider(&events);
        summary.processed += riders.len() as u64;
        let mut remaining = riders.len();
        for (rider_id, _) in &riders {
            if cancel.is_triggered() {
                summary.skipped += remaining as u64;
                summary.note(format!("Cancelled with {} riders unexamined", remaining));
                return Ok(BatchVerdict::Cancelled);
            }
            remaining -= 1;

            match self.payments.cycle_total(rider_id, cycle_start, now).await {
                Ok(total) if total > 0 && total < threshold => {
                    info!(
                        rider_id = %rider_id,
                        cycle_total = total,
                        threshold_minor = threshold,
                        window_id = %window.id(),
                        "Payment reminder due"
                    );
                    summary.succeed();
                }
                Ok(_) => summary.skip(),
                Err(e) => summary.fail(format!("rider {}: {}", rider_id, e)),
            }
        }
        Ok(BatchVerdict::Completed)
    }

    /// Riders who reached cover last month and have paid nothing this
    /// month: cover is lapsing. Tallied, with one detail line per rider.
    pub async fn check_lapses(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        cancel: &CancelSignal,
        summary: &mut RunSummary,
    ) -> Result<BatchVerdict, ExecutionError> {
        let threshold = self.threshold_for(job);
        let this_month = self.month_start_of(now)?;
        let previous_month = self.previous_month_start(this_month)?;

        let events = self.payments.confirmed_in(previous_month, this_month).await?;
        let riders = group_by_rider(&events);
        summary.processed += riders.len() as u64;

        let mut remaining = riders.len();
        for (rider_id, _) in &riders {
            if cancel.is_triggered() {
                summary.skipped += remaining as u64;
                summary.note(format!("Cancelled with {} riders unexamined", remaining));
                return Ok(BatchVerdict::Cancelled);
            }
            remaining -= 1;

            let previous_total = self
                .payments
                .cycle_total(rider_id, previous_month, this_month)
                .await;
            let current_total = self.payments.cycle_total(rider_id, this_month, now).await;
            match (previous_total, current_total) {
                (Ok(previous), Ok(current)) if previous >= threshold && current == 0 => {
                    summary.succeed();
                    summary.note(format!("rider {} lapsing; no payment this cycle", rider_id));
                }
                (Ok(_), Ok(_)) => summary.skip(),
                (Err(e), _) | (_, Err(e)) => {
                    summary.fail(format!("rider {}: {}", rider_id, e));
                }
            }
        }
        Ok(BatchVerdict::Completed)
    }

    /// Per-window payment statistics for the previous settlement day. The
    /// run result is the report.
    pub async fn generate_daily_report(
        &self,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), ExecutionError> {
        let tz = self.windows.timezone();
        let report_date = now
            .with_timezone(&tz)
            .date_naive()
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| {
                ExecutionError::InvalidJobConfig("date out of range".to_string())
            })?;

        let windows = self
            .windows
            .windows_for_day(report_date)
            .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))?;
        for window in &windows {
            let events = self
                .payments
                .confirmed_in(window.range_start, window.range_end)
                .await?;
            let total: i64 = events.iter().map(|e| e.amount_minor).sum();
            let riders = group_by_rider(&events);
            summary.processed += 1;
            summary.succeed();
            summary.note(format!(
                "{}: {} payments, {} riders, {} minor units",
                window.id(),
                events.len(),
                riders.len(),
                total
            ));
        }
        Ok(())
    }

    fn month_start_of(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, ExecutionError> {
        let tz = self.windows.timezone();
        let local = at.with_timezone(&tz);
        let first = NaiveDate::from_ymd_opt(local.year(), local.month(), 1).ok_or_else(|| {
            ExecutionError::InvalidJobConfig(format!("No month start for {}", local))
        })?;
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).ok_or_else(|| {
            ExecutionError::InvalidJobConfig("midnight is not a valid time".to_string())
        })?;
        self.windows
            .local_instant(first, midnight)
            .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))
    }

    fn previous_month_start(
        &self,
        month_start: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ExecutionError> {
        let tz = self.windows.timezone();
        let local = month_start.with_timezone(&tz).date_naive();
        let (year, month) = if local.month() == 1 {
            (local.year() - 1, 12)
        } else {
            (local.year(), local.month() - 1)
        };
        let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
            ExecutionError::InvalidJobConfig(format!("No month start for {}-{}", year, month))
        })?;
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).ok_or_else(|| {
            ExecutionError::InvalidJobConfig("midnight is not a valid time".to_string())
        })?;
        self.windows
            .local_instant(first, midnight)
            .map_err(|e| ExecutionError::InvalidJobConfig(e.to_string()))
    }
}

enum RiderOutcome {
    Covered,
    BelowThreshold,
    AlreadyCovered,
}

fn group_by_rider(events: &[PaymentEvent]) -> BTreeMap<String, RiderSlice> {
    let mut riders: BTreeMap<String, RiderSlice> = BTreeMap::new();
    for event in events {
        let slice = riders.entry(event.rider_id.clone()).or_insert(RiderSlice {
            window_total: 0,
            payment_count: 0,
        });
        slice.window_total += event.amount_minor;
        slice.payment_count += 1;
    }
    riders
}
