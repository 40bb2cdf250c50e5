use std::time::{SystemTime, UNIX_EPOCH};

use time::{macros::format_description, Date, Duration, OffsetDateTime};

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

pub trait Clock: Send + Sync {
    /// Unix seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        now_ts()
    }
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

const DAY_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Calendar day (`YYYY-MM-DD`) of `ts` in the reference timezone, given as
/// an hour offset from UTC.
pub fn calendar_day(ts: i64, offset_hours: i32) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .map(|dt| dt + Duration::hours(offset_hours as i64))
        .and_then(|dt| dt.date().format(DAY_FORMAT).ok())
        .unwrap_or_else(|| (ts / SECONDS_PER_DAY).to_string())
}

/// Parses a `YYYY-MM-DD` day.
pub fn parse_day(day: &str) -> Option<Date> {
    Date::parse(day, DAY_FORMAT).ok()
}

/// The day `days` after `day` (negative to go back).
pub fn shift_day(day: &str, days: i64) -> Option<String> {
    let date = parse_day(day)?.checked_add(Duration::days(days))?;
    date.format(DAY_FORMAT).ok()
}

/// Whole days from `from` to `to`; negative when `to` is earlier.
pub fn days_between(from: &str, to: &str) -> Option<i64> {
    Some((parse_day(to)? - parse_day(from)?).whole_days())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_boundary_follows_reference_offset() {
        // 2024-03-01T23:30:00Z
        let ts = 1_709_335_800;
        assert_eq!(calendar_day(ts, 0), "2024-03-01");
        assert_eq!(calendar_day(ts, 1), "2024-03-02");
        assert_eq!(calendar_day(ts, -5), "2024-03-01");
    }

    #[test]
    fn days_shift_across_months() {
        assert_eq!(shift_day("2024-03-01", -1).as_deref(), Some("2024-02-29"));
        assert_eq!(days_between("2024-02-01", "2024-03-01"), Some(29));
        assert!(parse_day("2024-13-01").is_none());
    }
}
