//! Cron schedule evaluation in a configured timezone.
//!
//! Accepts the classic five-field form (`minute hour day month weekday`) used
//! by crontab and CI schedulers, as well as the six/seven-field form with a
//! leading seconds column. Five-field expressions are normalized by pinning
//! seconds to `0` and translating numeric weekdays (`0`/`7` = Sunday) to
//! names, since the underlying parser numbers weekdays from Sunday = 1.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{HarvestError, Result};

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    inner: cron::Schedule,
    tz: Tz,
}

impl Schedule {
    pub fn parse(expr: &str, timezone: Option<&str>) -> Result<Self> {
        let tz = parse_timezone(timezone)?;
        let normalized = normalize(expr)?;
        let inner = cron::Schedule::from_str(&normalized).map_err(|e| {
            HarvestError::InvalidSchedule {
                expr: expr.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            expr: expr.to_string(),
            inner,
            tz,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Smallest step between possible occurrences: one second when the
    /// expression carries a seconds column, one minute otherwise.
    pub fn resolution(&self) -> Duration {
        if self.expr.split_whitespace().count() >= 6 {
            Duration::seconds(1)
        } else {
            Duration::minutes(1)
        }
    }

    /// First occurrence strictly after `instant`.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = instant.with_timezone(&self.tz);
        self.inner
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The next `count` occurrences strictly after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let local = from.with_timezone(&self.tz);
        self.inner
            .after(&local)
            .take(count)
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }

    /// Whether `instant`, truncated to the whole second, is an occurrence.
    pub fn is_occurrence(&self, instant: DateTime<Utc>) -> bool {
        let Some(truncated) = instant.with_nanosecond(0) else {
            return false;
        };
        self.next_after(truncated - Duration::seconds(1)) == Some(truncated)
    }
}

pub fn parse_timezone(name: Option<&str>) -> Result<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(n) if n.trim().is_empty() => Ok(Tz::UTC),
        Some(n) => n
            .parse::<Tz>()
            .map_err(|_| HarvestError::UnknownTimezone(n.to_string())),
    }
}

/// Format `instant` in the zone named by `timezone` (UTC when unset), the way
/// commit messages and logs present it.
pub fn format_local(instant: DateTime<Utc>, timezone: Option<&str>) -> Result<String> {
    let tz = parse_timezone(timezone)?;
    Ok(tz
        .from_utc_datetime(&instant.naive_utc())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string())
}

fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_weekdays(fields[4]).ok_or_else(|| HarvestError::InvalidSchedule {
                expr: expr.to_string(),
                reason: format!("bad weekday field '{}'", fields[4]),
            })?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(HarvestError::InvalidSchedule {
            expr: expr.to_string(),
            reason: format!("expected 5, 6 or 7 fields, got {n}"),
        }),
    }
}

fn translate_weekdays(field: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (part, None),
        };
        let mut ends = Vec::new();
        for end in range.split('-') {
            ends.push(weekday_name(end)?);
        }
        let mut out = ends.join("-");
        if let Some(s) = step {
            out.push('/');
            out.push_str(s);
        }
        parts.push(out);
    }
    Some(parts.join(","))
}

fn weekday_name(token: &str) -> Option<String> {
    if token == "*" || token == "?" || token.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(token.to_string());
    }
    let n: usize = token.parse().ok()?;
    WEEKDAYS.get(n).map(|s| s.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_midnight_utc() {
        let s = Schedule::parse("0 0 * * *", None).unwrap();
        let next = s.next_after(utc("2024-03-01T12:30:00Z")).unwrap();
        assert_eq!(next, utc("2024-03-02T00:00:00Z"));
    }

    #[test]
    fn timezone_shifts_occurrence() {
        let s = Schedule::parse("0 8 * * *", Some("Asia/Shanghai")).unwrap();
        let next = s.next_after(utc("2024-03-01T12:00:00Z")).unwrap();
        // 08:00 in Shanghai is 00:00 UTC
        assert_eq!(next, utc("2024-03-02T00:00:00Z"));
    }

    #[test]
    fn occurrence_only_inside_window() {
        let s = Schedule::parse("30 6 * * *", None).unwrap();
        assert!(s.is_occurrence(utc("2024-05-10T06:30:00Z")));
        assert!(s.is_occurrence(utc("2024-05-10T06:30:00.400Z")));
        assert!(!s.is_occurrence(utc("2024-05-10T06:31:00Z")));
        assert!(!s.is_occurrence(utc("2024-05-10T07:30:00Z")));
    }

    #[test]
    fn resolution_follows_seconds_column() {
        let minutely = Schedule::parse("30 6 * * *", None).unwrap();
        assert_eq!(minutely.resolution(), Duration::minutes(1));

        let s = Schedule::parse("15 30 6 * * *", None).unwrap();
        assert_eq!(s.resolution(), Duration::seconds(1));
        assert!(s.is_occurrence(utc("2024-05-10T06:30:15Z")));
        assert!(!s.is_occurrence(utc("2024-05-10T06:30:00Z")));
    }

    #[test]
    fn numeric_weekdays_follow_crontab() {
        // 1 = Monday in crontab; 2024-03-04 is a Monday.
        let s = Schedule::parse("0 9 * * 1", None).unwrap();
        let next = s.next_after(utc("2024-03-01T00:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-03-04T09:00:00Z"));

        let weekdays = Schedule::parse("0 9 * * 1-5", None).unwrap();
        let sat = utc("2024-03-02T10:00:00Z");
        assert_eq!(weekdays.next_after(sat).unwrap(), utc("2024-03-04T09:00:00Z"));

        let sunday = Schedule::parse("0 9 * * 0", None).unwrap();
        assert_eq!(sunday.next_after(sat).unwrap(), utc("2024-03-03T09:00:00Z"));
    }

    #[test]
    fn upcoming_is_ordered() {
        let s = Schedule::parse("0 */6 * * *", None).unwrap();
        let times = s.upcoming(utc("2024-01-01T01:00:00Z"), 3);
        assert_eq!(
            times,
            vec![
                utc("2024-01-01T06:00:00Z"),
                utc("2024-01-01T12:00:00Z"),
                utc("2024-01-01T18:00:00Z"),
            ]
        );
    }

    #[test]
    fn seconds_form_passes_through() {
        let s = Schedule::parse("15 0 0 * * *", None).unwrap();
        assert!(s.is_occurrence(utc("2024-01-01T00:00:15Z")));
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(matches!(
            Schedule::parse("every day", None),
            Err(HarvestError::InvalidSchedule { .. })
        ));
        assert!(matches!(
            Schedule::parse("0 0 * * 9", None),
            Err(HarvestError::InvalidSchedule { .. })
        ));
        assert!(matches!(
            Schedule::parse("61 0 * * *", None),
            Err(HarvestError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(matches!(
            Schedule::parse("0 0 * * *", Some("Mars/Olympus")),
            Err(HarvestError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn format_local_uses_zone() {
        let t = utc("2024-03-01T16:05:09Z");
        assert_eq!(format_local(t, None).unwrap(), "2024-03-01 16:05:09");
        assert_eq!(
            format_local(t, Some("Asia/Shanghai")).unwrap(),
            "2024-03-02 00:05:09"
        );
    }
}
