//! Boundaries of the relative-date operators.
//!
//! Shared by the compiler (which turns a window into inequalities) and the
//! evaluator (which tests values against it), so both agree on every edge.

use chrono::{Datelike, DateTime, Days, Duration, Months, NaiveDate, NaiveDateTime, Utc};

/// Half-open interval `[start, end)`; an absent side is unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl DateWindow {
    fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start.and_time(Default::default())),
            end: Some(end.and_time(Default::default())),
        }
    }

    pub fn contains(&self, value: NaiveDateTime) -> bool {
        self.start.map_or(true, |s| value >= s) && self.end.map_or(true, |e| value < e)
    }
}

/// Window selected by relative-date `op` at `now`.
///
/// Date operands are compared by whole days. Datetime operands use `now`
/// itself for the hour-based and future windows.
pub fn relative_window(op: &str, now: DateTime<Utc>, datetime: bool) -> Option<DateWindow> {
    let now = now.naive_utc();
    let today = now.date();
    let tomorrow = today.checked_add_days(Days::new(1))?;
    let month_start = today.with_day0(0)?;
    let year_start = month_start.with_month0(0)?;

    let days_back = |n: u64| -> Option<DateWindow> {
        Some(DateWindow::between(today.checked_sub_days(Days::new(n))?, tomorrow))
    };
    let months_back = |n: u32| -> Option<DateWindow> {
        Some(DateWindow::between(month_start.checked_sub_months(Months::new(n))?, tomorrow))
    };

    let window = match op {
        "thisyear" => DateWindow::between(year_start, year_start.checked_add_months(Months::new(12))?),
        "lastyear" => DateWindow::between(year_start.checked_sub_months(Months::new(12))?, year_start),
        "thismonth" => DateWindow::between(month_start, month_start.checked_add_months(Months::new(1))?),
        "lastmonth" => DateWindow::between(month_start.checked_sub_months(Months::new(1))?, month_start),
        "today" => DateWindow::between(today, tomorrow),
        "yesterday" => DateWindow::between(today.checked_sub_days(Days::new(1))?, today),
        "last24hours" if datetime => DateWindow {
            start: Some(now - Duration::hours(24)),
            end: Some(now),
        },
        "last24hours" => days_back(1)?,
        "last7days" => days_back(7)?,
        "last30days" => days_back(30)?,
        "last365days" => days_back(365)?,
        "last3months" => months_back(2)?,
        "last6months" => months_back(5)?,
        "last12months" => months_back(11)?,
        "future" if datetime => DateWindow {
            start: Some(now),
            end: None,
        },
        "future" => DateWindow {
            start: Some(tomorrow.and_time(Default::default())),
            end: None,
        },
        "notfuture" if datetime => DateWindow {
            start: None,
            end: Some(now),
        },
        "notfuture" => DateWindow {
            start: None,
            end: Some(tomorrow.and_time(Default::default())),
        },
        _ => return None,
    };
    Some(window)
}

/// Parse a stored date (`YYYY-MM-DD`) or datetime (RFC 3339) value
pub fn parse_date_value(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    let date = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap()
    }

    fn day(s: &str) -> NaiveDateTime {
        parse_date_value(s).unwrap()
    }

    #[test]
    fn test_calendar_windows() {
        let w = relative_window("thisyear", now(), false).unwrap();
        assert_eq!(w.start, Some(day("2024-01-01")));
        assert_eq!(w.end, Some(day("2025-01-01")));

        let w = relative_window("lastmonth", now(), false).unwrap();
        assert_eq!(w.start, Some(day("2024-02-01")));
        assert_eq!(w.end, Some(day("2024-03-01")));

        let w = relative_window("last3months", now(), false).unwrap();
        assert_eq!(w.start, Some(day("2024-01-01")));
        assert_eq!(w.end, Some(day("2024-03-16")));

        assert!(relative_window("today", now(), false).unwrap().contains(day("2024-03-15")));
        assert!(!relative_window("yesterday", now(), false).unwrap().contains(day("2024-03-15")));
        assert!(relative_window("nextweek", now(), false).is_none());
    }

    #[test]
    fn test_datetime_windows_use_now() {
        let w = relative_window("last24hours", now(), true).unwrap();
        assert!(w.contains(day("2024-03-15T00:00:00Z")));
        assert!(!w.contains(day("2024-03-14T10:00:00Z")));

        let future = relative_window("future", now(), true).unwrap();
        assert!(future.contains(day("2024-03-15T11:00:00Z")));
        assert!(!future.contains(day("2024-03-15T09:00:00Z")));
        let not_future = relative_window("notfuture", now(), false).unwrap();
        assert!(not_future.contains(day("2024-03-15")));
    }

    #[test]
    fn test_parse_date_value() {
        assert_eq!(day("2020-01-02T03:04:05+01:00"), day("2020-01-02T02:04:05Z"));
        assert_eq!(day("2020-01-02"), NaiveDate::from_ymd_opt(2020, 1, 2).unwrap().and_time(Default::default()));
        assert!(parse_date_value("not a date").is_none());
    }
}
