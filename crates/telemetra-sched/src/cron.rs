//! Five-field cron expressions: minute, hour, day of month, month and day of
//! week (0 is Monday).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

use crate::ScheduleError;

/// Broken-down wall clock time a cron schedule is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub weekday: u32,
}

impl LocalTime {
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz: TimeZone>(value: &DateTime<Tz>) -> Self {
        LocalTime {
            minute: value.minute(),
            hour: value.hour(),
            day: value.day(),
            month: value.month(),
            weekday: value.weekday().num_days_from_monday(),
        }
    }
}

/// Resolves one cron field to the set of values it accepts within
/// `[lo, hi]`.
///
/// Supports `*`, literals, `a-b` ranges, `base/step` strides and comma
/// separated unions of these. A stride over `*` or a range keeps the values
/// divisible by the step; a stride over a literal is just that literal.
/// Values outside the range are dropped; a field that accepts nothing is an
/// error.
pub fn parse_field(expr: &str, lo: u32, hi: u32) -> Result<BTreeSet<u32>, ScheduleError> {
    let mut values = BTreeSet::new();
    for term in expr.split(',') {
        values.extend(parse_term(expr, term.trim(), lo, hi)?);
    }
    if values.is_empty() {
        return Err(ScheduleError::EmptyField(expr.to_string()));
    }
    Ok(values)
}

fn parse_term(expr: &str, term: &str, lo: u32, hi: u32) -> Result<BTreeSet<u32>, ScheduleError> {
    let syntax = || ScheduleError::Syntax(expr.to_string());
    if let Some((base, step)) = term.split_once('/') {
        let step: u32 = step.trim().parse().map_err(|_| syntax())?;
        if step == 0 {
            return Err(syntax());
        }
        let base = base.trim();
        let values = parse_term(expr, base, lo, hi)?;
        if base.parse::<u32>().is_ok() {
            // a literal base ignores the step
            return Ok(values);
        }
        return Ok(values.into_iter().filter(|value| value % step == 0).collect());
    }
    if term == "*" {
        return Ok((lo..=hi).collect());
    }
    if let Some((from, to)) = term.split_once('-') {
        let from: u32 = from.trim().parse().map_err(|_| syntax())?;
        let to: u32 = to.trim().parse().map_err(|_| syntax())?;
        return Ok((from.max(lo)..=to.min(hi)).collect());
    }
    let value: u32 = term.parse().map_err(|_| syntax())?;
    Ok((lo..=hi).contains(&value).then_some(value).into_iter().collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minute: BTreeSet<u32>,
    hour: BTreeSet<u32>,
    day: BTreeSet<u32>,
    month: BTreeSet<u32>,
    weekday: BTreeSet<u32>,
}

impl CronSchedule {
    pub fn new(
        minute: &str,
        hour: &str,
        day: &str,
        month: &str,
        weekday: &str,
    ) -> Result<Self, ScheduleError> {
        Ok(CronSchedule {
            expr: format!("{minute} {hour} {day} {month} {weekday}"),
            minute: parse_field(minute, 0, 59)?,
            hour: parse_field(hour, 0, 23)?,
            day: parse_field(day, 1, 31)?,
            month: parse_field(month, 1, 12)?,
            weekday: parse_field(weekday, 0, 6)?,
        })
    }

    pub fn matches(&self, time: &LocalTime) -> bool {
        self.minute.contains(&time.minute)
            && self.hour.contains(&time.hour)
            && self.day.contains(&time.day)
            && self.month.contains(&time.month)
            && self.weekday.contains(&time.weekday)
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = value.split_whitespace().collect();
        match fields.as_slice() {
            [minute, hour, day, month, weekday] => {
                CronSchedule::new(minute, hour, day, month, weekday)
            }
            _ => Err(ScheduleError::Syntax(value.to_string())),
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn combined_field_expression() {
        let values = parse_field("1,2,4-6,*/3,*/7", 1, 20).expect("field");
        let expected: BTreeSet<u32> = [1, 2, 3, 4, 5, 6, 7, 9, 12, 14, 15, 18].into_iter().collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn stride_over_range_and_literal() {
        let values = parse_field("10-20/5", 0, 59).expect("field");
        assert_eq!(values.into_iter().collect::<Vec<_>>(), vec![10, 15, 20]);
        assert_eq!(parse_field("12/4", 0, 59).expect("field").len(), 1);
    }

    #[test]
    fn literal_stride_keeps_the_literal() {
        let values = parse_field("7/2", 0, 59).expect("field");
        assert_eq!(values.into_iter().collect::<Vec<_>>(), vec![7]);
        let schedule = CronSchedule::new("7/2", "*", "*", "*", "*").expect("cron");
        assert_eq!(schedule.to_string(), "7/2 * * * *");
        assert!(matches!(parse_field("70/2", 0, 59), Err(ScheduleError::EmptyField(_))));
    }

    #[test]
    fn empty_or_malformed_fields_are_errors() {
        assert!(matches!(parse_field("1-5/7", 0, 59), Err(ScheduleError::EmptyField(_))));
        assert!(matches!(parse_field("70", 0, 59), Err(ScheduleError::EmptyField(_))));
        assert!(matches!(parse_field("*/0", 0, 59), Err(ScheduleError::Syntax(_))));
        assert!(matches!(parse_field("a-b", 0, 59), Err(ScheduleError::Syntax(_))));
        assert!("* * *".parse::<CronSchedule>().is_err());
    }

    #[test]
    fn matches_broken_down_time() {
        let schedule: CronSchedule = "*/15 8-18 * * 0-4".parse().expect("cron");
        // 2024-01-01 was a Monday
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).single().expect("date");
        assert!(schedule.matches(&LocalTime::from_datetime(&monday)));
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 9, 30, 0).single().expect("date");
        assert!(!schedule.matches(&LocalTime::from_datetime(&saturday)));
        let off_minute = Utc.with_ymd_and_hms(2024, 1, 1, 9, 31, 0).single().expect("date");
        assert!(!schedule.matches(&LocalTime::from_datetime(&off_minute)));
        assert_eq!(schedule.to_string(), "*/15 8-18 * * 0-4");
    }
}
