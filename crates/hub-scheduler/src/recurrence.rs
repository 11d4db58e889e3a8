//! Conversion of `schedule` arguments into recurrences

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

use crate::cron::CronExpression;
use crate::error::{SchedulerError, SchedulerResult};

/// What a caller passed to `schedule`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// A cron expression, or a date/time string fired daily at its time of day
    Expression(String),
    /// Epoch milliseconds, fired daily at its time of day
    Timestamp(i64),
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M"];

impl Recurrence {
    /// Resolve to a cron expression; times of day are read in `zone`
    pub fn to_cron(&self, zone: &FixedOffset) -> SchedulerResult<CronExpression> {
        match self {
            Recurrence::Expression(text) => match CronExpression::parse(text) {
                Ok(cron) => Ok(cron),
                Err(cron_err) => match time_of_day(text, zone) {
                    Some(time) => daily_at(time),
                    None => Err(cron_err),
                },
            },
            Recurrence::Timestamp(millis) => {
                let at = Utc.timestamp_millis_opt(*millis).single().ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!("timestamp {} out of range", millis))
                })?;
                daily_at(at.with_timezone(zone).time())
            }
        }
    }
}

/// Time of day of a date string, in `zone`
fn time_of_day(text: &str, zone: &FixedOffset) -> Option<NaiveTime> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(zone).time());
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.time());
        }
    }
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
}

fn daily_at(time: NaiveTime) -> SchedulerResult<CronExpression> {
    CronExpression::parse(&format!(
        "{} {} {} * * ?",
        time.second(),
        time.minute(),
        time.hour()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_expression_passes_through() {
        let cron = Recurrence::Expression("0 15 10 ? * MON-FRI".into())
            .to_cron(&utc())
            .unwrap();
        assert_eq!(cron.as_str(), "0 15 10 ? * MON-FRI");
    }

    #[test]
    fn test_timestamp_becomes_daily() {
        // 2024-01-01T06:45:30Z
        let cron = Recurrence::Timestamp(1_704_091_530_000)
            .to_cron(&utc())
            .unwrap();
        assert_eq!(cron.as_str(), "30 45 6 * * ?");

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let cron = Recurrence::Timestamp(1_704_091_530_000)
            .to_cron(&plus_two)
            .unwrap();
        assert_eq!(cron.as_str(), "30 45 8 * * ?");
    }

    #[test]
    fn test_date_strings_become_daily() {
        for (text, expected) in [
            ("2024-05-01T22:10:00Z", "0 10 22 * * ?"),
            ("2024-05-01 07:05:09", "9 5 7 * * ?"),
            ("18:30", "0 30 18 * * ?"),
        ] {
            let cron = Recurrence::Expression(text.into()).to_cron(&utc()).unwrap();
            assert_eq!(cron.as_str(), expected, "{}", text);
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Recurrence::Expression("every tuesday".into())
            .to_cron(&utc())
            .is_err());
    }
}
