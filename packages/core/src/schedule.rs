//! Cron definitions and scheduled entries.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::job::{JobId, JobKind};

/// Offset used for the operational catalogue (UTC-5).
pub const DEFAULT_CRON_OFFSET_SECS: i32 = -5 * 3600;

/// A pending promotion of a scheduled job into the ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub job_id: JobId,
    pub fire_at: DateTime<Utc>,
}

/// Cron expression plus the fixed offset it is evaluated in.
///
/// Stored on every job installed from the catalogue so the next occurrence
/// can be derived after the job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub expression: String,
    pub offset_secs: i32,
}

impl Recurrence {
    pub fn new(expression: impl Into<String>, offset_secs: i32) -> Result<Self, ValidationError> {
        let recurrence = Self {
            expression: expression.into(),
            offset_secs,
        };
        recurrence.schedule()?;
        recurrence.offset()?;
        Ok(recurrence)
    }

    pub fn schedule(&self) -> Result<Schedule, ValidationError> {
        parse_expression(&self.expression)
    }

    pub fn offset(&self) -> Result<FixedOffset, ValidationError> {
        FixedOffset::east_opt(self.offset_secs).ok_or(ValidationError::InvalidOffset {
            offset_secs: self.offset_secs,
        })
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
        let offset = self.offset()?;
        self.schedule()?
            .after(&now.with_timezone(&offset))
            .next()
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| ValidationError::NoUpcomingFireTime {
                expression: self.expression.clone(),
            })
    }
}

/// One entry of the recurring-job catalogue.
#[derive(Debug, Clone, PartialEq)]
pub struct CronDefinition {
    pub kind: JobKind,
    pub payload: Value,
    pub recurrence: Recurrence,
}

impl CronDefinition {
    pub fn new(
        expression: &str,
        kind: JobKind,
        payload: Value,
        offset_secs: i32,
    ) -> Result<Self, ValidationError> {
        kind.validate(&payload)?;
        Ok(Self {
            kind,
            payload,
            recurrence: Recurrence::new(expression, offset_secs)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.recurrence.expression
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
        self.recurrence.next_after(now)
    }
}

/// Parse a cron expression.
///
/// Five fields are read as a classic crontab line: seconds are pinned to zero
/// and numeric days of week count from Sunday = 0 (7 is Sunday too). Six or
/// seven fields go to the `cron` crate untouched, where Sunday = 1.
pub fn parse_expression(expression: &str) -> Result<Schedule, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday = classic_weekdays(weekday).map_err(invalid)?;
            format!("0 {minute} {hour} {day} {month} {weekday}")
        }
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => fields.join(" "),
        _ => {
            return Err(invalid(format!(
                "expected 5 to 7 fields, found {}",
                fields.len()
            )));
        }
    };

    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrite numeric crontab days of week as names, which the `cron` crate
/// reads the same way crontab does.
fn classic_weekdays(field: &str) -> Result<String, String> {
    let items = field
        .split(',')
        .map(classic_weekday_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn classic_weekday_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: usize = step
                .parse()
                .map_err(|_| format!("bad day-of-week step: {step}"))?;
            (range, Some(step))
        }
        None => (item, None),
    };
    let suffix = step.map(|step| format!("/{step}")).unwrap_or_default();

    let Some((start, end)) = range.split_once('-') else {
        return Ok(format!("{}{}", weekday_name(range)?, suffix));
    };

    // `n-7` runs through Saturday and wraps to Sunday.
    if let (Some(first), Some(7)) = (weekday_number(start)?, weekday_number(end)?) {
        let mut mapped = format!("{}-Sat{}", WEEKDAYS[first % 7], suffix);
        if first > 0 && (7 - first) % step.unwrap_or(1).max(1) == 0 {
            mapped.push_str(",Sun");
        }
        return Ok(mapped);
    }

    Ok(format!("{}-{}{}", weekday_name(start)?, weekday_name(end)?, suffix))
}

fn weekday_number(token: &str) -> Result<Option<usize>, String> {
    match token.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(Some(day)),
        Ok(day) => Err(format!("day of week out of range: {day}")),
        Err(_) => Ok(None),
    }
}

fn weekday_name(token: &str) -> Result<String, String> {
    Ok(match weekday_number(token)? {
        Some(day) => WEEKDAYS[day % 7].to_string(),
        None => token.to_string(),
    })
}
