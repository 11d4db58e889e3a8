//! Recurrence expressions
//!
//! Accepts classic 5-field cron (`min hour dom mon dow`) and Quartz-style
//! 6/7-field expressions (`sec min hour dom mon dow [year]`) with `*`, `?`,
//! ranges, lists, steps and month/day names. Quartz days of week run 1-7
//! from Sunday; classic ones 0-7 with both 0 and 7 meaning Sunday.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::error::{SchedulerError, SchedulerResult};

const MONTHS: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAYS: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// How far ahead a search may look before giving up on an expression
const SEARCH_YEARS: i32 = 8;

/// Set of allowed values of one field, as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    /// Written as `*` or `?`
    any: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names for `min`, `min + 1`, ...
    names: &'static [&'static str],
}

impl FieldSpec {
    fn value(&self, text: &str) -> SchedulerResult<u32> {
        let upper = text.to_ascii_uppercase();
        if let Some(index) = self.names.iter().position(|name| *name == upper) {
            return Ok(self.min + index as u32);
        }
        let value: u32 = text
            .parse()
            .map_err(|_| invalid(format!("bad {} value '{}'", self.name, text)))?;
        if value < self.min || value > self.max {
            return Err(invalid(format!(
                "{} value {} outside {}-{}",
                self.name, value, self.min, self.max
            )));
        }
        Ok(value)
    }

    fn parse(&self, text: &str) -> SchedulerResult<FieldSet> {
        let mut bits = 0u64;
        let mut any = false;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(format!("bad {} step '{}'", self.name, step)))?;
                    if step == 0 {
                        return Err(invalid(format!("{} step must be positive", self.name)));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = match range {
                "*" | "?" => {
                    if step.is_none() {
                        any = true;
                    }
                    (self.min, self.max)
                }
                _ => match range.split_once('-') {
                    Some((a, b)) => (self.value(a)?, self.value(b)?),
                    // `a/n` runs from `a` to the end of the field
                    None if step.is_some() => (self.value(range)?, self.max),
                    None => {
                        let v = self.value(range)?;
                        (v, v)
                    }
                },
            };
            if start > end {
                return Err(invalid(format!("empty {} range '{}'", self.name, range)));
            }
            let step = step.unwrap_or(1) as usize;
            for value in (start..=end).step_by(step) {
                bits |= 1u64 << value;
            }
        }
        Ok(FieldSet { bits, any })
    }
}

const SECONDS: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[] };
const MINUTES: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOURS: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAYS_OF_MONTH: FieldSpec = FieldSpec { name: "day of month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTHS };
const QUARTZ_DAYS: FieldSpec = FieldSpec { name: "day of week", min: 1, max: 7, names: DAYS };
const CLASSIC_DAYS: FieldSpec = FieldSpec { name: "day of week", min: 0, max: 7, names: DAYS };

fn invalid(reason: String) -> SchedulerError {
    SchedulerError::InvalidSchedule(reason)
}

/// A parsed recurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    /// Sunday = 0
    days_of_week: FieldSet,
    years: Option<(i32, i32)>,
}

impl CronExpression {
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest, quartz) = match fields.len() {
            5 => ("0", &fields[..], false),
            6 | 7 => (fields[0], &fields[1..], true),
            n => {
                return Err(invalid(format!(
                    "expected 5, 6 or 7 fields in '{}', found {}",
                    expression, n
                )))
            }
        };
        let days_of_week = if quartz {
            let set = QUARTZ_DAYS.parse(rest[4])?;
            FieldSet {
                bits: set.bits >> 1,
                any: set.any,
            }
        } else {
            let set = CLASSIC_DAYS.parse(rest[4])?;
            let sunday = if set.contains(7) { 1 } else { 0 };
            FieldSet {
                bits: (set.bits & 0x7f) | sunday,
                any: set.any,
            }
        };

        let years = match rest.get(5) {
            None | Some(&"*") | Some(&"?") => None,
            Some(year) => Some(match year.split_once('-') {
                Some((a, b)) => (parse_year(a)?, parse_year(b)?),
                None => {
                    let y = parse_year(year)?;
                    (y, y)
                }
            }),
        };

        Ok(Self {
            source: expression.trim().to_string(),
            seconds: SECONDS.parse(seconds)?,
            minutes: MINUTES.parse(rest[0])?,
            hours: HOURS.parse(rest[1])?,
            days_of_month: DAYS_OF_MONTH.parse(rest[2])?,
            months: MONTH.parse(rest[3])?,
            days_of_week,
            years,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.any, self.days_of_week.any) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    fn year_matches(&self, year: i32) -> bool {
        self.years.map_or(true, |(from, to)| year >= from && year <= to)
    }

    /// First wall-clock time strictly after `after` that matches
    fn next_naive(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);
        let limit = after.year() + SEARCH_YEARS;

        while t.year() <= limit {
            if !self.year_matches(t.year()) {
                t = NaiveDate::from_ymd_opt(t.year() + 1, 1, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Next fire time after `after`, evaluated on the wall clock of its zone
    ///
    /// Local times skipped by a clock change are passed over.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let zone = after.timezone();
        let mut cursor = after.naive_local();
        loop {
            let naive = self.next_naive(cursor)?;
            if let Some(local) = zone.from_local_datetime(&naive).earliest() {
                if local > *after {
                    return Some(local);
                }
            }
            cursor = naive;
        }
    }
}

fn parse_year(text: &str) -> SchedulerResult<i32> {
    text.parse()
        .map_err(|_| invalid(format!("bad year '{}'", text)))
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, after: &str) -> String {
        CronExpression::parse(expr)
            .unwrap()
            .next_after(&at(after))
            .unwrap()
            .to_rfc3339()
    }

    #[test]
    fn test_quartz_daily() {
        assert_eq!(
            next("0 30 7 * * ?", "2024-03-10T08:00:00Z"),
            "2024-03-11T07:30:00+00:00"
        );
        assert_eq!(
            next("0 30 7 * * ?", "2024-03-10T07:00:00Z"),
            "2024-03-10T07:30:00+00:00"
        );
    }

    #[test]
    fn test_fire_is_strictly_after() {
        assert_eq!(
            next("0 30 7 * * ?", "2024-03-10T07:30:00Z"),
            "2024-03-11T07:30:00+00:00"
        );
    }

    #[test]
    fn test_steps_and_offsets() {
        assert_eq!(
            next("17 2/5 * * * ?", "2024-01-01T00:03:00Z"),
            "2024-01-01T00:07:17+00:00"
        );
        assert_eq!(
            next("*/15 * * * *", "2024-01-01T00:16:00Z"),
            "2024-01-01T00:30:00+00:00"
        );
    }

    #[test]
    fn test_days_of_week() {
        // 2024-01-01 is a Monday
        assert_eq!(
            next("0 0 9 ? * SAT", "2024-01-01T00:00:00Z"),
            "2024-01-06T09:00:00+00:00"
        );
        assert_eq!(
            next("0 0 9 ? * 1", "2024-01-01T00:00:00Z"),
            "2024-01-07T09:00:00+00:00"
        );
        assert_eq!(
            next("0 9 * * 0", "2024-01-01T00:00:00Z"),
            "2024-01-07T09:00:00+00:00"
        );
        assert_eq!(
            next("0 9 * * 7", "2024-01-01T00:00:00Z"),
            "2024-01-07T09:00:00+00:00"
        );
        assert_eq!(
            next("0 0 8 ? * MON-FRI", "2024-01-05T09:00:00Z"),
            "2024-01-08T08:00:00+00:00"
        );
    }

    #[test]
    fn test_months_and_years() {
        assert_eq!(
            next("0 0 0 1 JUN ?", "2024-07-01T00:00:00Z"),
            "2025-06-01T00:00:00+00:00"
        );
        assert_eq!(
            next("0 0 12 29 2 ? 2028", "2024-01-01T00:00:00Z"),
            "2028-02-29T12:00:00+00:00"
        );
        assert!(CronExpression::parse("0 0 0 30 2 ?")
            .unwrap()
            .next_after(&at("2024-01-01T00:00:00Z"))
            .is_none());
    }

    #[test]
    fn test_wall_clock_of_zone() {
        let zone = FixedOffset::east_opt(2 * 3600).unwrap();
        let after = zone.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let fire = CronExpression::parse("0 0 7 * * ?")
            .unwrap()
            .next_after(&after)
            .unwrap();
        assert_eq!(fire.to_rfc3339(), "2024-05-01T07:00:00+02:00");
    }

    #[test]
    fn test_rejects_malformed() {
        for expr in ["", "* * *", "61 * * * * ?", "0 0 25 * * ?", "0 0 0 L * ?", "*/0 * * * *", "5-1 * * * *"] {
            assert!(CronExpression::parse(expr).is_err(), "{}", expr);
        }
    }
}
