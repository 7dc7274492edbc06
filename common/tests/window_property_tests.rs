// Property-based tests for settlement windows
// Feature: boda-cover

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use common::window::{BatchWindow, WindowCoordinator};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn nairobi() -> Tz {
    chrono_tz::Africa::Nairobi
}

/// Strictly increasing boundary tables with one to four slots.
fn boundaries_strategy() -> impl Strategy<Value = Vec<NaiveTime>> {
    proptest::collection::btree_set(0u32..1440u32, 1..=4).prop_map(|minutes| {
        minutes
            .into_iter()
            .map(|m| NaiveTime::from_hms_opt(m / 60, m % 60, 0).unwrap())
            .collect()
    })
}

/// Calendar dates well away from the representable edges.
fn date_strategy() -> impl Strategy<Value = NaiveDate> {
    (0u64..4000u64).prop_map(|days| {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(days))
            .unwrap()
    })
}

/// A UTC instant at some whole minute of the given local day.
fn utc_instant(date: NaiveDate, minute_of_day: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0).unwrap();
    nairobi()
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .unwrap()
        .with_timezone(&Utc)
}

// ============================================================================
// Window partition properties
// ============================================================================

/// **Feature: boda-cover, Property 1: Day windows partition 24 hours**
///
/// *For any* settlement date and any strictly increasing boundary table,
/// the day's windows are contiguous, closed-open, in slot order, and sum
/// to exactly one day.
#[test]
fn property_day_windows_partition_24_hours() {
    proptest!(|(date in date_strategy(), boundaries in boundaries_strategy())| {
        let coordinator = WindowCoordinator::new(boundaries.clone(), nairobi()).unwrap();
        let windows = coordinator.windows_for_day(date).unwrap();
        prop_assert_eq!(windows.len(), boundaries.len());

        let mut total = Duration::zero();
        for (slot_index, window) in windows.iter().enumerate() {
            prop_assert_eq!(window.slot_index, slot_index);
            prop_assert_eq!(window.settlement_date, date);
            prop_assert!(window.range_start < window.range_end);
            total += window.range_end - window.range_start;
        }
        for pair in windows.windows(2) {
            prop_assert_eq!(pair[0].range_end, pair[1].range_start);
        }
        prop_assert_eq!(total, Duration::hours(24));
    });
}

/// **Feature: boda-cover, Property 2: Every instant has exactly one window**
///
/// *For any* instant, exactly one window across the surrounding days
/// contains it, and `window_containing` returns that window.
#[test]
fn property_every_instant_has_exactly_one_window() {
    proptest!(|(
        date in date_strategy(),
        minute_of_day in 0u32..1440u32,
        boundaries in boundaries_strategy()
    )| {
        let coordinator = WindowCoordinator::new(boundaries, nairobi()).unwrap();
        let instant = utc_instant(date, minute_of_day);

        // An instant local to `date` lies in a window of `date` or, before
        // the day's first boundary, in the previous day's overnight window.
        let mut containing: Vec<BatchWindow> = Vec::new();
        for days_back in 0..=1u64 {
            let day = date.checked_sub_days(Days::new(days_back)).unwrap();
            for window in coordinator.windows_for_day(day).unwrap() {
                if window.contains(instant) {
                    containing.push(window);
                }
            }
        }
        prop_assert_eq!(containing.len(), 1);

        let found = coordinator.window_containing(instant).unwrap();
        prop_assert_eq!(&found, &containing[0]);
    });
}

// ============================================================================
// Trigger mapping properties
// ============================================================================

/// **Feature: boda-cover, Property 3: A trigger settles the window that just closed**
///
/// *For any* trigger instant, the settled window ends exactly where the
/// window containing the trigger begins, and a trigger delayed anywhere
/// inside the current window still settles the same one.
#[test]
fn property_trigger_settles_most_recently_closed_window() {
    proptest!(|(
        date in date_strategy(),
        minute_of_day in 0u32..1440u32,
        boundaries in boundaries_strategy(),
        delay_fraction in 0.0f64..1.0f64
    )| {
        let coordinator = WindowCoordinator::new(boundaries, nairobi()).unwrap();
        let trigger = utc_instant(date, minute_of_day);

        let settled = coordinator.window_for(trigger).unwrap();
        let current = coordinator.window_containing(trigger).unwrap();
        prop_assert!(settled.range_end <= trigger);
        prop_assert_eq!(settled.range_end, current.range_start);

        let room = (current.range_end - trigger).num_seconds();
        let delay = Duration::seconds(((room - 1).max(0) as f64 * delay_fraction) as i64);
        prop_assert_eq!(coordinator.window_for(trigger + delay).unwrap(), settled);
    });
}

/// **Feature: boda-cover, Property 4: Boundary instants open, never close**
///
/// *For any* boundary of any day, the boundary instant belongs to the
/// window starting there, and the window settled by a trigger at the
/// boundary is the one ending there.
#[test]
fn property_boundary_instant_belongs_to_opening_window() {
    proptest!(|(date in date_strategy(), boundaries in boundaries_strategy())| {
        let coordinator = WindowCoordinator::new(boundaries, nairobi()).unwrap();
        for window in coordinator.windows_for_day(date).unwrap() {
            prop_assert!(window.contains(window.range_start));
            prop_assert!(!window.contains(window.range_end));

            let containing = coordinator.window_containing(window.range_start).unwrap();
            prop_assert_eq!(&containing, &window);

            let settled = coordinator.window_for(window.range_start).unwrap();
            prop_assert_eq!(settled.range_end, window.range_start);
        }
    });
}

// ============================================================================
// Identifier properties
// ============================================================================

/// **Feature: boda-cover, Property 5: Window ids are unique**
///
/// *For any* run of consecutive days, every (day, slot) pair gets a
/// distinct identifier.
#[test]
fn property_window_ids_are_unique_across_days() {
    proptest!(|(
        date in date_strategy(),
        boundaries in boundaries_strategy(),
        span in 1u64..30u64
    )| {
        let coordinator = WindowCoordinator::new(boundaries, nairobi()).unwrap();
        let mut seen = BTreeSet::new();
        for offset in 0..span {
            let day = date.checked_add_days(Days::new(offset)).unwrap();
            for window in coordinator.windows_for_day(day).unwrap() {
                let id = window.id();
                prop_assert!(seen.insert(id.clone()), "duplicate window id {}", id);
            }
        }
    });
}
