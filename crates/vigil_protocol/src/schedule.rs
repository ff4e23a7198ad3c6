//! Five-field cron handling with timezone-correct fire computation.
//!
//! Expressions are validated and evaluated against the search's IANA
//! timezone; computed instants are converted to UTC before storage.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{0}': expected 5 fields")]
    FieldCount(String),
    #[error("invalid cron expression '{0}': {1}")]
    Parse(String, String),
    #[error("unknown timezone '{0}'")]
    Timezone(String),
}

/// A validated `(cron, timezone)` pair.
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: Schedule,
    tz: Tz,
}

impl CronSpec {
    /// Parse and validate a five-field cron expression in an IANA timezone.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.split_whitespace().count() != 5 {
            return Err(ScheduleError::FieldCount(expression.to_string()));
        }
        // The cron crate wants a seconds field; pin it to zero.
        let with_seconds = format!("0 {}", trimmed);
        let schedule = Schedule::from_str(&with_seconds)
            .map_err(|e| ScheduleError::Parse(expression.to_string(), e.to_string()))?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::Timezone(timezone.to_string()))?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
            tz,
        })
    }

    /// Validate without keeping the parsed schedule.
    pub fn validate(expression: &str, timezone: &str) -> Result<(), ScheduleError> {
        Self::parse(expression, timezone).map(|_| ())
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    /// The first fire strictly after `after`, in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        self.schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Fires due in the closed interval `[start, end]`: their count and the
    /// most recent one. Used by the scheduler's coalescing misfire policy.
    pub fn due_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> (u64, Option<DateTime<Utc>>) {
        if end < start {
            return (0, None);
        }
        const CAP: u64 = 100_000;
        // Fires land on whole minutes (the seconds field is pinned), so
        // backing off one second makes `after` include `start` itself.
        let from = (start - chrono::Duration::seconds(1)).with_timezone(&self.tz);
        let mut count = 0u64;
        let mut latest = None;
        for t in self.schedule.after(&from) {
            let utc = t.with_timezone(&Utc);
            if utc > end {
                break;
            }
            count += 1;
            latest = Some(utc);
            if count >= CAP {
                break;
            }
        }
        (count, latest)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn rejects_wrong_field_count() {
        assert!(matches!(
            CronSpec::parse("* * * *", "UTC"),
            Err(ScheduleError::FieldCount(_))
        ));
        assert!(matches!(
            CronSpec::parse("0 0 * * * *", "UTC"),
            Err(ScheduleError::FieldCount(_))
        ));
    }

    #[test]
    fn rejects_bad_timezone() {
        assert!(matches!(
            CronSpec::parse("*/5 * * * *", "Mars/Olympus"),
            Err(ScheduleError::Timezone(_))
        ));
    }

    #[test]
    fn next_fire_every_minute() {
        let spec = CronSpec::parse("* * * * *", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap();
        let next = spec.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn next_fire_respects_timezone() {
        // 09:00 in New York is 13:00 or 14:00 UTC depending on DST; in June
        // (EDT, UTC-4) it is 13:00 UTC.
        let spec = CronSpec::parse("0 9 * * *", "America/New_York").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let next = spec.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn due_in_window_includes_start_fire() {
        let spec = CronSpec::parse("* * * * *", "UTC").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 12, 9, 30).unwrap();
        let (count, latest) = spec.due_in_window(start, end);
        assert_eq!(count, 10);
        assert_eq!(latest, Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 9, 0).unwrap()));
    }

    #[test]
    fn due_in_window_is_empty_for_inverted_range() {
        let spec = CronSpec::parse("* * * * *", "UTC").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 10, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(spec.due_in_window(start, end), (0, None));
    }
}
