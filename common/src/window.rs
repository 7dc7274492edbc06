// Settlement windows
//
// The settlement day is carved into N slots by a fixed table of local-time
// boundaries. Each slot covers the period since the previous boundary, and
// the final slot stretches past midnight to the next day's first boundary,
// so the slots of one day always add up to exactly 24 hours. All ranges are
// closed-open: an instant on a boundary belongs to the window that starts
// there, never to two windows.

use crate::errors::ScheduleError;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// One settlement window, derived on demand and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    pub slot_index: usize,
    /// Local calendar day the window settles under.
    pub settlement_date: NaiveDate,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

impl BatchWindow {
    /// Stable identifier, `YYYYMMDD-s<slot>`. Keys idempotent runs and
    /// collaborator deduplication.
    pub fn id(&self) -> String {
        format!("{}-s{}", self.settlement_date.format("%Y%m%d"), self.slot_index)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.range_start <= instant && instant < self.range_end
    }
}

/// Maps trigger instants to settlement windows.
#[derive(Debug, Clone)]
pub struct WindowCoordinator {
    boundaries: Vec<NaiveTime>,
    timezone: Tz,
}

impl Default for WindowCoordinator {
    fn default() -> Self {
        Self {
            boundaries: default_boundaries(),
            timezone: crate::schedule::default_timezone(),
        }
    }
}

/// Three settlements a day: morning, afternoon, evening.
pub fn default_boundaries() -> Vec<NaiveTime> {
    [(8, 0), (14, 0), (20, 0)]
        .iter()
        .filter_map(|&(h, m)| NaiveTime::from_hms_opt(h, m, 0))
        .collect()
}

impl WindowCoordinator {
    pub fn new(boundaries: Vec<NaiveTime>, timezone: Tz) -> Result<Self, ScheduleError> {
        if boundaries.is_empty() {
            return Err(ScheduleError::InvalidWindowBoundaries(
                "at least one boundary is required".to_string(),
            ));
        }
        if boundaries.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ScheduleError::InvalidWindowBoundaries(
                "boundaries must be strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            boundaries,
            timezone,
        })
    }

    pub fn slots_per_day(&self) -> usize {
        self.boundaries.len()
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// The windows of one settlement day, in slot order. Their union is the
    /// 24 hours from the day's first boundary to the next day's first
    /// boundary, with no gap and no overlap.
    pub fn windows_for_day(&self, date: NaiveDate) -> Result<Vec<BatchWindow>, ScheduleError> {
        let next_date = date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| ScheduleError::CalculationFailed("date out of range".to_string()))?;

        let mut windows = Vec::with_capacity(self.boundaries.len());
        for (slot_index, &start_time) in self.boundaries.iter().enumerate() {
            let range_start = self.local_instant(date, start_time)?;
            let range_end = match self.boundaries.get(slot_index + 1) {
                Some(&end_time) => self.local_instant(date, end_time)?,
                // Final slot absorbs the overnight remainder.
                None => self.local_instant(next_date, self.boundaries[0])?,
            };
            windows.push(BatchWindow {
                slot_index,
                settlement_date: date,
                range_start,
                range_end,
            });
        }
        Ok(windows)
    }

    /// The window a settlement trigger should process: the most recently
    /// closed one, i.e. the window with the greatest `range_end` that is at
    /// or before `trigger`. A trigger firing exactly on a boundary settles
    /// the period that just ended; a trigger delayed past the boundary still
    /// settles that same window.
    pub fn window_for(&self, trigger: DateTime<Utc>) -> Result<BatchWindow, ScheduleError> {
        self.recent_windows(trigger)?
            .into_iter()
            .filter(|w| w.range_end <= trigger)
            .max_by_key(|w| w.range_end)
            .ok_or_else(|| {
                ScheduleError::CalculationFailed(format!(
                    "no closed window at or before {}",
                    trigger
                ))
            })
    }

    /// The window whose range covers `instant`. Exactly one exists for any
    /// instant.
    pub fn window_containing(&self, instant: DateTime<Utc>) -> Result<BatchWindow, ScheduleError> {
        self.recent_windows(instant)?
            .into_iter()
            .find(|w| w.contains(instant))
            .ok_or_else(|| {
                ScheduleError::CalculationFailed(format!("no window contains {}", instant))
            })
    }

    /// Windows of the local day of `instant` and the two days before it.
    /// Enough to cover any lookup: the overnight window of day D-1 reaches
    /// into day D, and an instant before day D's first boundary may close a
    /// window of day D-1 or even D-2.
    fn recent_windows(&self, instant: DateTime<Utc>) -> Result<Vec<BatchWindow>, ScheduleError> {
        let local_date = instant.with_timezone(&self.timezone).date_naive();
        let mut windows = Vec::with_capacity(self.boundaries.len() * 3);
        for days_back in (0..=2).rev() {
            let date = local_date
                .checked_sub_days(Days::new(days_back))
                .ok_or_else(|| {
                    ScheduleError::CalculationFailed("date out of range".to_string())
                })?;
            windows.extend(self.windows_for_day(date)?);
        }
        Ok(windows)
    }

    pub(crate) fn local_instant(
        &self,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let naive = date.and_time(time);
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| {
                ScheduleError::CalculationFailed(format!(
                    "local time {} does not exist in {}",
                    naive, self.timezone
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn coordinator() -> WindowCoordinator {
        WindowCoordinator::default()
    }

    fn eat(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        chrono_tz::Africa::Nairobi
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_rejects_empty_boundaries() {
        let result = WindowCoordinator::new(vec![], chrono_tz::Africa::Nairobi);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_unsorted_boundaries() {
        let boundaries = vec![
            NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        ];
        let result = WindowCoordinator::new(boundaries, chrono_tz::Africa::Nairobi);
        assert!(result.is_err());
    }

    #[test]
    fn test_day_windows_partition_24_hours() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let windows = coordinator().windows_for_day(date).unwrap();
        assert_eq!(windows.len(), 3);

        // Contiguous, closed-open, summing to a full day.
        let mut total = Duration::zero();
        for pair in windows.windows(2) {
            assert_eq!(pair[0].range_end, pair[1].range_start);
        }
        for w in &windows {
            assert!(w.range_start < w.range_end);
            total += w.range_end - w.range_start;
        }
        assert_eq!(total, Duration::hours(24));
    }

    #[test]
    fn test_final_slot_absorbs_overnight() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let windows = coordinator().windows_for_day(date).unwrap();
        let last = windows.last().unwrap();
        assert_eq!(last.range_start, eat(2024, 3, 1, 20, 0));
        assert_eq!(last.range_end, eat(2024, 3, 2, 8, 0));
        assert_eq!(last.range_end - last.range_start, Duration::hours(12));
        assert_eq!(last.settlement_date, date);
    }

    #[test]
    fn test_afternoon_trigger_settles_morning_window() {
        let window = coordinator().window_for(eat(2024, 3, 1, 14, 0)).unwrap();
        assert_eq!(window.slot_index, 0);
        assert_eq!(window.range_start, eat(2024, 3, 1, 8, 0));
        assert_eq!(window.range_end, eat(2024, 3, 1, 14, 0));
    }

    #[test]
    fn test_morning_trigger_settles_previous_days_overnight_window() {
        let window = coordinator().window_for(eat(2024, 3, 2, 8, 0)).unwrap();
        assert_eq!(window.slot_index, 2);
        assert_eq!(
            window.settlement_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert_eq!(window.range_start, eat(2024, 3, 1, 20, 0));
        assert_eq!(window.range_end, eat(2024, 3, 2, 8, 0));
        assert_eq!(window.id(), "20240301-s2");
    }

    #[test]
    fn test_late_trigger_settles_same_window_as_on_time_trigger() {
        let on_time = coordinator().window_for(eat(2024, 3, 1, 14, 0)).unwrap();
        let late = coordinator().window_for(eat(2024, 3, 1, 14, 3)).unwrap();
        assert_eq!(on_time, late);
    }

    #[test]
    fn test_boundary_instant_belongs_to_the_window_starting_there() {
        let boundary = eat(2024, 3, 1, 14, 0);
        let containing = coordinator().window_containing(boundary).unwrap();
        assert_eq!(containing.range_start, boundary);
        assert!(containing.contains(boundary));

        let just_before = boundary - Duration::milliseconds(1);
        let previous = coordinator().window_containing(just_before).unwrap();
        assert_eq!(previous.range_end, boundary);
        assert!(!previous.contains(boundary));
    }

    #[test]
    fn test_small_hours_instant_is_in_previous_days_final_window() {
        let night = eat(2024, 3, 2, 3, 30);
        let window = coordinator().window_containing(night).unwrap();
        assert_eq!(window.slot_index, 2);
        assert_eq!(
            window.settlement_date,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_window_ids_are_distinct_within_a_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let windows = coordinator().windows_for_day(date).unwrap();
        let ids: Vec<String> = windows.iter().map(|w| w.id()).collect();
        assert_eq!(ids, vec!["20240301-s0", "20240301-s1", "20240301-s2"]);
    }

    #[test]
    fn test_single_boundary_day_is_one_24_hour_window() {
        let coordinator = WindowCoordinator::new(
            vec![NaiveTime::from_hms_opt(6, 0, 0).unwrap()],
            chrono_tz::Africa::Nairobi,
        )
        .unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let windows = coordinator.windows_for_day(date).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(
            windows[0].range_end - windows[0].range_start,
            Duration::hours(24)
        );
    }
}
