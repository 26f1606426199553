//! Five-field cron expressions
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Fields
//! accept `*`, numbers, ranges `a-b`, steps `*/n` and `a-b/n`, and comma
//! lists. Month and weekday fields also accept three-letter names. The
//! `@hourly`, `@daily`, `@weekly`, `@monthly` and `@yearly` shorthands are
//! recognized.
//!
//! As in Vixie cron, when both day-of-month and day-of-week are restricted a
//! day matches if either does. A field starting with `*` (including `*/n`)
//! counts as unrestricted, and then both fields must match.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Why an expression was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    /// Not five fields
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    /// A field could not be parsed
    #[error("invalid {field} field {value:?}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Field text
        value: String,
        /// What is wrong
        reason: String,
    },
}

/// One parsed field: the set of allowed values as a bitmask
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CronField {
    bits: u64,
    restricted: bool,
}

impl CronField {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn parse(
        text: &str,
        name: &'static str,
        min: u32,
        max: u32,
        names: &[&str],
    ) -> Result<Self, CronParseError> {
        let invalid = |reason: String| CronParseError::InvalidField {
            field: name,
            value: text.to_string(),
            reason,
        };
        let value_of = |s: &str| -> Result<u32, CronParseError> {
            if let Some(idx) = names.iter().position(|n| n.eq_ignore_ascii_case(s)) {
                return Ok(idx as u32 + min);
            }
            s.parse::<u32>()
                .map_err(|_| invalid(format!("{s:?} is not a number")))
        };

        let mut bits = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(format!("bad step {step:?}")))?;
                    if step == 0 {
                        return Err(invalid("step must be positive".to_string()));
                    }
                    if step > max - min + 1 {
                        return Err(invalid(format!("step {step} exceeds the field range")));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (value_of(a)?, value_of(b)?)
            } else {
                let v = value_of(range)?;
                // "5/15" means 5, 20, 35, 50
                if step > 1 {
                    (v, max)
                } else {
                    (v, v)
                }
            };

            if lo < min || hi > max || lo > hi {
                return Err(invalid(format!("range {lo}-{hi} outside {min}-{max}")));
            }
            let mut v = lo;
            while v <= hi {
                bits |= 1u64 << v;
                v += step;
            }
        }

        Ok(Self {
            bits,
            restricted: !text.starts_with('*'),
        })
    }
}

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    /// Parse an expression
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let expanded = match expr.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let mut day_of_week = CronField::parse(fields[4], "day-of-week", 0, 7, WEEKDAY_NAMES)?;
        // 7 is Sunday too
        if day_of_week.contains(7) {
            day_of_week.bits |= 1;
        }

        Ok(Self {
            source: expr.trim().to_string(),
            minute: CronField::parse(fields[0], "minute", 0, 59, &[])?,
            hour: CronField::parse(fields[1], "hour", 0, 23, &[])?,
            day_of_month: CronField::parse(fields[2], "day-of-month", 1, 31, &[])?,
            month: CronField::parse(fields[3], "month", 1, 12, MONTH_NAMES)?,
            day_of_week,
        })
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First firing strictly after `from`, `None` if none within five years
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = from.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(5 * 366);
        let mut t = start;

        while t < limit {
            if !self.month.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(&t) {
                t = start_of_day(t)? + Duration::days(1);
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    fn next(expr: &str, from: &str) -> DateTime<Utc> {
        CronExpr::parse(expr)
            .expect("valid expression")
            .next_after(at(from))
            .expect("has a next firing")
    }

    #[test]
    fn every_five_minutes() {
        assert_eq!(
            next("*/5 * * * *", "2024-03-10T10:02:30Z"),
            at("2024-03-10T10:05:00Z")
        );
        // Strictly after
        assert_eq!(
            next("*/5 * * * *", "2024-03-10T10:05:00Z"),
            at("2024-03-10T10:10:00Z")
        );
    }

    #[test]
    fn check_schedule_every_third_day() {
        assert_eq!(
            next("0 0 */3 * *", "2024-01-01T00:00:00Z"),
            at("2024-01-04T00:00:00Z")
        );
        // Day 31 is in the set; then the month rolls over to day 1
        assert_eq!(
            next("0 0 */3 * *", "2024-01-28T12:00:00Z"),
            at("2024-01-31T00:00:00Z")
        );
        assert_eq!(
            next("0 0 */3 * *", "2024-01-31T00:00:00Z"),
            at("2024-02-01T00:00:00Z")
        );
    }

    #[test]
    fn ranges_lists_and_names() {
        // 2024-03-09 is a Saturday
        assert_eq!(
            next("30 9 * * MON-FRI", "2024-03-09T08:00:00Z"),
            at("2024-03-11T09:30:00Z")
        );
        assert_eq!(
            next("0 6,18 * JAN,jul *", "2024-03-01T00:00:00Z"),
            at("2024-07-01T06:00:00Z")
        );
        assert_eq!(
            next("0 0 * * 7", "2024-03-09T08:00:00Z"),
            at("2024-03-10T00:00:00Z")
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // 15th of the month or any Monday; 2024-03-11 is a Monday
        assert_eq!(
            next("0 0 15 * 1", "2024-03-10T00:00:00Z"),
            at("2024-03-11T00:00:00Z")
        );
        assert_eq!(
            next("0 0 15 * 1", "2024-03-12T00:00:00Z"),
            at("2024-03-15T00:00:00Z")
        );
    }

    #[test]
    fn stepped_wildcard_day_field_is_unrestricted() {
        // Every third day that is also a Monday: 2024-03-11 is a Monday but
        // not in */3, 2024-03-25 is both
        assert_eq!(
            next("0 0 */3 * 1", "2024-03-10T00:00:00Z"),
            at("2024-03-25T00:00:00Z")
        );
        assert_eq!(
            next("0 0 * * 1", "2024-03-10T00:00:00Z"),
            at("2024-03-11T00:00:00Z")
        );
    }

    #[test]
    fn shorthands_and_year_rollover() {
        assert_eq!(
            next("@yearly", "2024-06-01T00:00:00Z"),
            at("2025-01-01T00:00:00Z")
        );
        assert_eq!(
            next("@hourly", "2024-12-31T23:10:00Z"),
            at("2025-01-01T00:00:00Z")
        );
    }

    #[test]
    fn impossible_date_never_fires() {
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(expr.next_after(at("2024-01-01T00:00:00Z")), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(
            CronExpr::parse("* * * *").unwrap_err(),
            CronParseError::FieldCount(4)
        );
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("* * * FOO *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
    }

    #[test]
    fn oversized_step_is_rejected() {
        let err = CronExpr::parse("0 0 1/4294967295 * *").unwrap_err();
        assert!(matches!(
            err,
            CronParseError::InvalidField {
                field: "day-of-month",
                ..
            }
        ));
        assert!(CronExpr::parse("*/61 * * * *").is_err());
        assert!(CronExpr::parse("*/60 * * * *").is_ok());
    }
}
