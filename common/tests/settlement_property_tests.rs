// Property-based tests for batch settlement
// Feature: boda-cover

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::batch::{BatchProcessor, BatchVerdict};
use common::clock::ManualClock;
use common::collaborators::memory::{InMemoryLedger, InMemoryPaymentFeed, InMemoryPolicyAdmin};
use common::collaborators::{CollaboratorError, PolicyIssue, PolicyIssuer};
use common::config::Settings;
use common::errors::ExecutionError;
use common::executor::{CancelSignal, TokenRegistry};
use common::models::{Job, JobHistory, JobKind, PaymentEvent, RunStatus, RunSummary, TriggeredBy};
use common::store::memory::InMemoryHistoryLog;
use common::store::{HistoryOutcome, JobHistoryLog};
use common::window::WindowCoordinator;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

const THRESHOLD: i64 = 10_000;

fn eat(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    chrono_tz::Africa::Nairobi
        .with_ymd_and_hms(y, mo, d, h, mi, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn pay(rider_id: &str, amount_minor: i64, at: DateTime<Utc>, reference: &str) -> PaymentEvent {
    PaymentEvent {
        rider_id: rider_id.to_string(),
        amount_minor,
        confirmed_at: at,
        reference: reference.to_string(),
    }
}

struct Harness {
    feed: Arc<InMemoryPaymentFeed>,
    policies: Arc<InMemoryPolicyAdmin>,
    ledger: Arc<InMemoryLedger>,
    history: Arc<InMemoryHistoryLog>,
    processor: BatchProcessor,
}

fn harness(now: DateTime<Utc>) -> Harness {
    let feed = Arc::new(InMemoryPaymentFeed::new());
    let policies = Arc::new(InMemoryPolicyAdmin::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let history = Arc::new(InMemoryHistoryLog::new());
    let processor = BatchProcessor::new(
        feed.clone(),
        policies.clone(),
        ledger.clone(),
        history.clone(),
        Arc::new(WindowCoordinator::default()),
        Arc::new(ManualClock::new(now)),
        &Settings::default().settlement,
    );
    Harness {
        feed,
        policies,
        ledger,
        history,
        processor,
    }
}

fn settlement_job(now: DateTime<Utc>) -> Job {
    Job::recurring("settle", JobKind::Settlement, "0 0 8,14,20 * * *", now)
}

fn fresh_cancel() -> Arc<CancelSignal> {
    let (_, cancel) = TokenRegistry::new().issue(Uuid::new_v4());
    cancel
}

/// Per-rider payment amounts confirmed inside one window.
fn rider_amounts_strategy() -> impl Strategy<Value = Vec<Vec<i64>>> {
    proptest::collection::vec(
        proptest::collection::vec(100i64..6_000, 1..4),
        1..6,
    )
}

// ============================================================================
// Threshold rule properties
// ============================================================================

/// **Feature: boda-cover, Property 6: The threshold decides cover**
///
/// *For any* set of riders with arbitrary payments inside one window,
/// exactly the riders whose window total reaches the threshold get cover
/// and a balanced journal entry; everyone else is skipped, and nothing
/// fails.
#[test]
fn property_threshold_crossing_decides_cover() {
    proptest!(|(rider_amounts in rider_amounts_strategy())| {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let now = eat(2024, 3, 15, 14, 5);
            let h = harness(now);
            let window = h.processor.coordinator().window_for(now).unwrap();

            let mut payment_count = 0u64;
            for (r, amounts) in rider_amounts.iter().enumerate() {
                let rider = format!("R-{:02}", r);
                for (i, amount) in amounts.iter().enumerate() {
                    let at = window.range_start + Duration::minutes((r * 10 + i) as i64);
                    h.feed.record(pay(&rider, *amount, at, &format!("p-{}-{}", r, i)));
                    payment_count += 1;
                }
            }

            let job = settlement_job(now);
            let mut summary = RunSummary::new();
            let verdict = h
                .processor
                .settle_window(&job, &window, true, &fresh_cancel(), &mut summary)
                .await?;
            prop_assert_eq!(verdict, BatchVerdict::Completed);

            let crossing: Vec<usize> = rider_amounts
                .iter()
                .enumerate()
                .filter(|(_, amounts)| amounts.iter().sum::<i64>() >= THRESHOLD)
                .map(|(r, _)| r)
                .collect();

            prop_assert_eq!(summary.processed, payment_count);
            prop_assert_eq!(summary.succeeded, crossing.len() as u64);
            prop_assert_eq!(summary.skipped, (rider_amounts.len() - crossing.len()) as u64);
            prop_assert_eq!(summary.failed, 0);

            for (r, _) in rider_amounts.iter().enumerate() {
                let rider = format!("R-{:02}", r);
                let covered = h.policies.has_cover(&rider, &window.id());
                prop_assert_eq!(covered, crossing.contains(&r));

                let source_ref = format!("{}:{}", window.id(), rider);
                match h.ledger.lines_for(&source_ref) {
                    Some(lines) => {
                        prop_assert!(crossing.contains(&r));
                        prop_assert_eq!(lines.len(), 2);
                        let debits: i64 = lines
                            .iter()
                            .filter(|l| l.is_debit)
                            .map(|l| l.amount_minor)
                            .sum();
                        let credits: i64 = lines
                            .iter()
                            .filter(|l| !l.is_debit)
                            .map(|l| l.amount_minor)
                            .sum();
                        prop_assert_eq!(debits, THRESHOLD);
                        prop_assert_eq!(credits, THRESHOLD);
                    }
                    None => prop_assert!(!crossing.contains(&r)),
                }
            }
            prop_assert_eq!(h.policies.policy_count(), crossing.len());
            prop_assert_eq!(h.ledger.entry_count(), crossing.len());
            Ok(())
        })?;
    });
}

/// **Feature: boda-cover, Property 7: Earlier cycle payments count**
///
/// *For any* rider, the crossing test uses the cycle total before the
/// window plus the window total: a rider already over the threshold
/// before the window gets nothing again, and a rider who only crosses
/// with the earlier payments included gets cover.
#[test]
fn property_cycle_total_counts_toward_threshold() {
    proptest!(|(before in 0i64..15_000, inside in 1i64..15_000)| {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let now = eat(2024, 3, 15, 14, 5);
            let h = harness(now);
            let window = h.processor.coordinator().window_for(now).unwrap();

            if before > 0 {
                h.feed.record(pay("R-1", before, eat(2024, 3, 10, 10, 0), "earlier"));
            }
            h.feed.record(pay("R-1", inside, window.range_start, "inside"));

            let job = settlement_job(now);
            let mut summary = RunSummary::new();
            h.processor
                .settle_window(&job, &window, true, &fresh_cancel(), &mut summary)
                .await?;

            let expected = before < THRESHOLD && before + inside >= THRESHOLD;
            prop_assert_eq!(h.policies.has_cover("R-1", &window.id()), expected);
            prop_assert_eq!(summary.succeeded, u64::from(expected));
            prop_assert_eq!(summary.skipped, u64::from(!expected));
            prop_assert_eq!(summary.failed, 0);
            Ok(())
        })?;
    });
}

// ============================================================================
// Idempotency properties
// ============================================================================

/// **Feature: boda-cover, Property 8: Re-running a window changes nothing**
///
/// *For any* rider set, settling the same window a second time issues no
/// new policies and posts no new journal entries; every rider is tallied
/// as skipped.
#[test]
fn property_rerun_is_a_no_op() {
    proptest!(|(rider_amounts in rider_amounts_strategy())| {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let now = eat(2024, 3, 15, 14, 5);
            let h = harness(now);
            let window = h.processor.coordinator().window_for(now).unwrap();

            for (r, amounts) in rider_amounts.iter().enumerate() {
                let rider = format!("R-{:02}", r);
                for (i, amount) in amounts.iter().enumerate() {
                    let at = window.range_start + Duration::minutes((r * 10 + i) as i64);
                    h.feed.record(pay(&rider, *amount, at, &format!("p-{}-{}", r, i)));
                }
            }

            let job = settlement_job(now);
            let mut first = RunSummary::new();
            h.processor
                .settle_window(&job, &window, true, &fresh_cancel(), &mut first)
                .await?;
            let policies_after_first = h.policies.policy_count();
            let entries_after_first = h.ledger.entry_count();

            let mut second = RunSummary::new();
            h.processor
                .settle_window(&job, &window, true, &fresh_cancel(), &mut second)
                .await?;

            prop_assert_eq!(second.succeeded, 0);
            prop_assert_eq!(second.failed, 0);
            prop_assert_eq!(second.skipped, rider_amounts.len() as u64);
            prop_assert_eq!(h.policies.policy_count(), policies_after_first);
            prop_assert_eq!(h.ledger.entry_count(), entries_after_first);
            Ok(())
        })?;
    });
}

/// Three payments push one rider past the threshold while two riders
/// stay below it: the run issues exactly one policy and posts exactly
/// one balanced journal entry.
#[tokio::test]
async fn test_single_crossing_rider_among_small_payers() {
    let now = eat(2024, 3, 15, 14, 5);
    let h = harness(now);
    let window = h.processor.coordinator().window_for(now).unwrap();
    let start = window.range_start;

    h.feed.record(pay("R-A", 4_000, start + Duration::minutes(10), "a-1"));
    h.feed.record(pay("R-A", 4_000, start + Duration::minutes(40), "a-2"));
    h.feed.record(pay("R-A", 2_000, start + Duration::minutes(70), "a-3"));
    h.feed.record(pay("R-B", 3_000, start + Duration::minutes(20), "b-1"));
    h.feed.record(pay("R-C", 3_000, start + Duration::minutes(50), "c-1"));

    let job = settlement_job(now);
    let mut summary = RunSummary::new();
    let verdict = h
        .processor
        .settle_window(&job, &window, true, &fresh_cancel(), &mut summary)
        .await
        .unwrap();

    assert_eq!(verdict, BatchVerdict::Completed);
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.failed, 0);

    assert!(h.policies.has_cover("R-A", &window.id()));
    assert_eq!(h.policies.policy_count(), 1);
    let lines = h
        .ledger
        .lines_for(&format!("{}:R-A", window.id()))
        .expect("journal entry for the covered rider");
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().any(|l| l.is_debit && l.account_code == "1001" && l.amount_minor == THRESHOLD));
    assert!(lines.iter().any(|l| !l.is_debit && l.account_code == "4001" && l.amount_minor == THRESHOLD));
}

// ============================================================================
// Failure isolation properties
// ============================================================================

/// **Feature: boda-cover, Property 9: One rider's failure stays theirs**
///
/// *For any* set of eligible riders with one failing, the run completes
/// with the others covered, tallies exactly one failure, and a later run
/// covers the failed rider without disturbing the rest.
#[test]
fn property_rider_failure_is_isolated() {
    proptest!(|(rider_count in 2usize..6, failing in 0usize..6)| {
        let rt = Runtime::new()?;
        rt.block_on(async {
            prop_assume!(failing < rider_count);
            let now = eat(2024, 3, 15, 14, 5);
            let h = harness(now);
            let window = h.processor.coordinator().window_for(now).unwrap();

            for r in 0..rider_count {
                let rider = format!("R-{:02}", r);
                let at = window.range_start + Duration::minutes(r as i64);
                h.feed.record(pay(&rider, THRESHOLD, at, &format!("p-{}", r)));
            }
            let failing_rider = format!("R-{:02}", failing);
            h.policies.fail_rider(&failing_rider);

            let job = settlement_job(now);
            let mut first = RunSummary::new();
            let verdict = h
                .processor
                .settle_window(&job, &window, true, &fresh_cancel(), &mut first)
                .await?;
            prop_assert_eq!(verdict, BatchVerdict::Completed);
            prop_assert_eq!(first.succeeded, (rider_count - 1) as u64);
            prop_assert_eq!(first.failed, 1);
            prop_assert!(first.details.iter().any(|d| d.contains(&failing_rider)));
            prop_assert!(!h.policies.has_cover(&failing_rider, &window.id()));
            prop_assert_eq!(h.policies.policy_count(), rider_count - 1);

            // The next cycle picks the failed rider up without doubling
            // anyone else.
            h.policies.clear_failures();
            let mut second = RunSummary::new();
            h.processor
                .settle_window(&job, &window, true, &fresh_cancel(), &mut second)
                .await?;
            prop_assert_eq!(second.succeeded, 1);
            prop_assert_eq!(second.failed, 0);
            prop_assert_eq!(second.skipped, (rider_count - 1) as u64);
            prop_assert_eq!(h.policies.policy_count(), rider_count);
            prop_assert_eq!(h.ledger.entry_count(), rider_count);
            Ok(())
        })?;
    });
}

/// Triggers the shared cancel flag once `after` policies have been
/// issued, so cancellation lands mid-walk at a rider boundary.
struct CancelAfterIssuer {
    inner: Arc<InMemoryPolicyAdmin>,
    cancel: Arc<CancelSignal>,
    after: usize,
    issued: AtomicUsize,
}

#[async_trait]
impl PolicyIssuer for CancelAfterIssuer {
    async fn issue_policy(
        &self,
        rider_id: &str,
        window_id: &str,
    ) -> Result<PolicyIssue, CollaboratorError> {
        let issue = self.inner.issue_policy(rider_id, window_id).await?;
        if self.issued.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.cancel.trigger();
        }
        Ok(issue)
    }
}

/// Cancelling after three of ten riders keeps the three issued policies,
/// tallies the remaining seven as skipped, and a restart covers exactly
/// the other seven without re-issuing anything.
#[tokio::test]
async fn test_cancel_mid_walk_keeps_partial_work_and_restart_completes() {
    let now = eat(2024, 3, 15, 14, 5);
    let feed = Arc::new(InMemoryPaymentFeed::new());
    let policies = Arc::new(InMemoryPolicyAdmin::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let history = Arc::new(InMemoryHistoryLog::new());

    let job = settlement_job(now);
    let (_, cancel) = TokenRegistry::new().issue(job.id);
    let issuer = Arc::new(CancelAfterIssuer {
        inner: policies.clone(),
        cancel: Arc::clone(&cancel),
        after: 3,
        issued: AtomicUsize::new(0),
    });
    let processor = BatchProcessor::new(
        feed.clone(),
        issuer,
        ledger.clone(),
        history,
        Arc::new(WindowCoordinator::default()),
        Arc::new(ManualClock::new(now)),
        &Settings::default().settlement,
    );
    let window = processor.coordinator().window_for(now).unwrap();

    for r in 0..10 {
        let rider = format!("R-{:02}", r);
        let at = window.range_start + Duration::minutes(r as i64);
        feed.record(pay(&rider, THRESHOLD, at, &format!("p-{}", r)));
    }

    let mut first = RunSummary::new();
    let verdict = processor
        .settle_window(&job, &window, true, &cancel, &mut first)
        .await
        .unwrap();
    assert_eq!(verdict, BatchVerdict::Cancelled);
    assert_eq!(first.succeeded, 3);
    assert_eq!(first.skipped, 7);
    assert_eq!(first.failed, 0);
    assert_eq!(policies.policy_count(), 3);
    assert_eq!(ledger.entry_count(), 3);
    assert!(first.details.iter().any(|d| d.contains("Cancelled")));

    // Restart with a fresh cancel flag: the three riders already covered
    // are skipped, the remaining seven settle, nothing is duplicated.
    let mut second = RunSummary::new();
    let verdict = processor
        .settle_window(&job, &window, true, &fresh_cancel(), &mut second)
        .await
        .unwrap();
    assert_eq!(verdict, BatchVerdict::Completed);
    assert_eq!(second.succeeded, 7);
    assert_eq!(second.skipped, 3);
    assert_eq!(policies.policy_count(), 10);
    assert_eq!(ledger.entry_count(), 10);
    for r in 0..10 {
        assert!(policies.has_cover(&format!("R-{:02}", r), &window.id()));
    }
}

// ============================================================================
// Reconciliation properties
// ============================================================================

/// **Feature: boda-cover, Property 10: Reconciliation flags drift**
///
/// *For any* settled window, reconciliation succeeds exactly when the
/// recorded payment count still matches the feed; an unsettled window is
/// noted and skipped, never failed.
#[test]
fn property_reconciliation_flags_count_drift() {
    proptest!(|(payments in 0u64..6, drift in 0u64..3, settled in proptest::bool::ANY)| {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let now = eat(2024, 3, 15, 14, 5);
            let h = harness(now);
            let window = h.processor.coordinator().window_for(now).unwrap();

            for i in 0..payments {
                let at = window.range_start + Duration::minutes(i as i64);
                h.feed.record(pay("R-1", 500, at, &format!("p-{}", i)));
            }

            if settled {
                let job = settlement_job(now);
                let key = format!("{}:{}", JobKind::Settlement, window.id());
                let row = JobHistory::begin(&job, 1, TriggeredBy::System, Some(key), now);
                h.history.append(&row).await?;
                let mut recorded = RunSummary::new();
                recorded.processed = payments + drift;
                h.history
                    .finalize(
                        row.id,
                        HistoryOutcome {
                            status: RunStatus::Completed,
                            ended_at: now,
                            duration_ms: 1,
                            result: Some(recorded),
                            error_message: None,
                        },
                    )
                    .await?;
            }

            let mut summary = RunSummary::new();
            h.processor.reconcile_window(&window, &mut summary).await?;

            prop_assert_eq!(summary.processed, 1);
            if !settled {
                prop_assert_eq!(summary.skipped, 1);
                prop_assert!(summary.details.iter().any(|d| d.contains("not yet settled")));
            } else if drift == 0 {
                prop_assert_eq!(summary.succeeded, 1);
                prop_assert_eq!(summary.failed, 0);
            } else {
                prop_assert_eq!(summary.failed, 1);
                prop_assert!(summary.details.iter().any(|d| d.contains(&window.id())));
            }
            Ok(())
        })?;
    });
}

// ============================================================================
// Catch-up coverage properties
// ============================================================================

/// **Feature: boda-cover, Property 11: Candidates cover downtime without gaps**
///
/// *For any* coverage interval, the candidate windows form a contiguous
/// closed chain reaching back past the coverage start and ending at the
/// most recently closed window.
#[test]
fn property_candidate_windows_are_a_contiguous_closed_chain() {
    proptest!(|(start_minutes in 0i64..40_000, span_minutes in 60i64..4_320)| {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let coverage_start = eat(2024, 3, 1, 0, 0) + Duration::minutes(start_minutes);
            let now = coverage_start + Duration::minutes(span_minutes);
            let h = harness(now);

            let candidates = h
                .processor
                .candidate_windows(Some(coverage_start), now)
                .unwrap();
            prop_assert!(!candidates.is_empty());

            for pair in candidates.windows(2) {
                prop_assert_eq!(pair[0].range_end, pair[1].range_start);
            }
            for window in &candidates {
                prop_assert!(window.range_end <= now);
            }
            let last = candidates.last().unwrap();
            let expected_last = h.processor.coordinator().window_for(now).unwrap();
            prop_assert_eq!(last, &expected_last);
            prop_assert!(candidates[0].range_start <= coverage_start);
            Ok(())
        })?;
    });
}
