// Schedule descriptor evaluation
//
// A job's cron expression is treated as a black box that answers one
// question: given an instant, when is the next occurrence? Evaluation
// happens in the settlement timezone and results come back in UTC.

use crate::errors::ScheduleError;
use crate::models::Job;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Parse and validate a cron expression
pub fn parse_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next occurrence of `expression` strictly after `after`, evaluated in
/// `timezone` and returned in UTC.
pub fn next_after(
    expression: &str,
    timezone: Tz,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_expression(expression)?;
    let after_in_tz = after.with_timezone(&timezone);
    let next_in_tz = schedule
        .after(&after_in_tz)
        .next()
        .ok_or_else(|| ScheduleError::NoNextOccurrence(expression.to_string()))?;
    Ok(next_in_tz.with_timezone(&Utc))
}

/// Next run for a job that just finished at `completed_at`. Recurring jobs
/// re-evaluate their descriptor at completion time, so a stalled job never
/// accumulates a backlog of overdue firings; one-off jobs are done.
pub fn next_run(
    job: &Job,
    timezone: Tz,
    completed_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    if !job.recurring {
        return Ok(None);
    }
    match job.schedule_expression.as_deref() {
        Some(expression) => Ok(Some(next_after(expression, timezone, completed_at)?)),
        None => Ok(None),
    }
}

/// Whether a job is due at `now`. A job with `next_run_at` set fires once
/// that instant passes; a recurring job that has never run fires when its
/// descriptor first matches after the reference instant (last run, falling
/// back to creation). Downtime therefore costs at most one catch-up firing.
pub fn is_due(job: &Job, timezone: Tz, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
    if !job.enabled {
        return Ok(false);
    }
    if let Some(next_run_at) = job.next_run_at {
        return Ok(next_run_at <= now);
    }
    if !job.recurring {
        return Ok(false);
    }
    match job.schedule_expression.as_deref() {
        Some(expression) => {
            let reference = job.last_run_at.unwrap_or(job.created_at);
            Ok(next_after(expression, timezone, reference)? <= now)
        }
        None => Ok(false),
    }
}

/// Timezone the settlement day is defined in
pub fn default_timezone() -> Tz {
    chrono_tz::Africa::Nairobi
}
