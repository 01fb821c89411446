//! Calendar conventions shared by every constraint source.
//!
//! Weekdays are ISO, Monday-origin: `0 = Monday … 6 = Sunday`. Business hours,
//! staff availability, and slot queries all resolve their weekday through
//! [`weekday_of`], so one (org, date) pair always maps to the same rows.
//!
//! Local clock times become absolute instants through a fixed UTC offset per
//! location; there is no DST handling.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::{Ms, Span};

pub const MINUTE_MS: Ms = 60_000;
const DAY_MINUTES: u16 = 24 * 60;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Minutes since local midnight, `0..=1440`. `24:00` is a valid closing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockTime(u16);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    pub const END_OF_DAY: ClockTime = ClockTime(DAY_MINUTES);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        let total = hour * 60 + minute;
        (minute < 60 && total <= DAY_MINUTES).then_some(ClockTime(total))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Parse `HH:MM` or `HH:MM:SS` (seconds must be zero).
    pub fn parse(s: &str) -> Result<Self, CalendarError> {
        let s = s.trim();
        if s == "24:00" || s == "24:00:00" {
            return Ok(Self::END_OF_DAY);
        }
        let t = NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map_err(|_| CalendarError::ClockTime(s.to_string()))?;
        if t.second() != 0 {
            return Err(CalendarError::ClockTime(s.to_string()));
        }
        Ok(ClockTime((t.hour() * 60 + t.minute()) as u16))
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

pub fn weekday_of(date: NaiveDate) -> Weekday {
    date.weekday()
}

pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_monday() as u8
}

pub fn weekday_from_index(index: i64) -> Option<Weekday> {
    usize::try_from(index).ok().and_then(|i| WEEK.get(i).copied())
}

/// `0`–`6` (Monday-origin) or an English day name (`mon`, `Monday`, …).
pub fn parse_weekday(s: &str) -> Result<Weekday, CalendarError> {
    let s = s.trim();
    if let Ok(index) = s.parse::<i64>() {
        return weekday_from_index(index).ok_or_else(|| CalendarError::Weekday(s.to_string()));
    }
    s.parse::<Weekday>()
        .map_err(|_| CalendarError::Weekday(s.to_string()))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| CalendarError::Date(s.to_string()))
}

/// Unix milliseconds, or an RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Result<Ms, CalendarError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| CalendarError::Timestamp(s.to_string()))
}

pub fn format_ms(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Absolute instant of a local clock time on `date` at a fixed UTC offset.
pub fn local_to_utc_ms(date: NaiveDate, time: ClockTime, utc_offset_min: i32) -> Ms {
    let midnight_utc = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    midnight_utc + Ms::from(time.minutes()) * MINUTE_MS - Ms::from(utc_offset_min) * MINUTE_MS
}

/// `[open, close)` on `date` as an absolute span; `None` when empty.
pub fn local_span(date: NaiveDate, open: ClockTime, close: ClockTime, utc_offset_min: i32) -> Option<Span> {
    let start = local_to_utc_ms(date, open, utc_offset_min);
    let end = local_to_utc_ms(date, close, utc_offset_min);
    (start < end).then(|| Span::new(start, end))
}

/// The whole local day `[00:00, 24:00)`.
pub fn day_window(date: NaiveDate, utc_offset_min: i32) -> Span {
    let start = local_to_utc_ms(date, ClockTime::MIDNIGHT, utc_offset_min);
    let end = local_to_utc_ms(date, ClockTime::END_OF_DAY, utc_offset_min);
    Span::new(start, end)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    ClockTime(String),
    Weekday(String),
    Date(String),
    Timestamp(String),
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::ClockTime(s) => write!(f, "bad clock time {s:?} (expected HH:MM)"),
            CalendarError::Weekday(s) => write!(f, "bad weekday {s:?} (expected 0-6, Monday = 0)"),
            CalendarError::Date(s) => write!(f, "bad date {s:?} (expected YYYY-MM-DD)"),
            CalendarError::Timestamp(s) => {
                write!(f, "bad timestamp {s:?} (expected unix ms or RFC 3339)")
            }
        }
    }
}

impl std::error::Error for CalendarError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn weekday_is_monday_origin() {
        // 2025-03-10 is a Monday, 2025-03-16 a Sunday.
        assert_eq!(weekday_index(weekday_of(date("2025-03-10"))), 0);
        assert_eq!(weekday_index(weekday_of(date("2025-03-16"))), 6);
        assert_eq!(weekday_from_index(0), Some(Weekday::Mon));
        assert_eq!(weekday_from_index(6), Some(Weekday::Sun));
        assert_eq!(weekday_from_index(7), None);
        assert_eq!(weekday_from_index(-1), None);
    }

    #[test]
    fn parse_weekday_accepts_index_and_name() {
        assert_eq!(parse_weekday("2").unwrap(), Weekday::Wed);
        assert_eq!(parse_weekday("sun").unwrap(), Weekday::Sun);
        assert_eq!(parse_weekday("Friday").unwrap(), Weekday::Fri);
        assert!(parse_weekday("9").is_err());
        assert!(parse_weekday("someday").is_err());
    }

    #[test]
    fn clock_time_parse() {
        assert_eq!(ClockTime::parse("09:30").unwrap().minutes(), 570);
        assert_eq!(ClockTime::parse("09:30:00").unwrap().minutes(), 570);
        assert_eq!(ClockTime::parse("24:00").unwrap(), ClockTime::END_OF_DAY);
        assert!(ClockTime::parse("09:30:15").is_err());
        assert!(ClockTime::parse("25:00").is_err());
        assert!(ClockTime::parse("nine").is_err());
        assert_eq!(ClockTime::from_hm(13, 5).unwrap().to_string(), "13:05");
        assert!(ClockTime::from_hm(24, 1).is_none());
    }

    #[test]
    fn local_time_applies_offset() {
        let d = date("2025-03-10");
        let utc_nine = local_to_utc_ms(d, ClockTime::from_hm(9, 0).unwrap(), 0);
        let cet_nine = local_to_utc_ms(d, ClockTime::from_hm(9, 0).unwrap(), 60);
        assert_eq!(utc_nine - cet_nine, 60 * MINUTE_MS);
        assert_eq!(format_ms(utc_nine), "2025-03-10T09:00:00+00:00");
    }

    #[test]
    fn day_window_spans_24_hours() {
        let w = day_window(date("2025-03-10"), 120);
        assert_eq!(w.duration_ms(), 24 * 60 * MINUTE_MS);
        assert_eq!(format_ms(w.start), "2025-03-09T22:00:00+00:00");
    }

    #[test]
    fn local_span_empty_when_inverted() {
        let d = date("2025-03-10");
        let nine = ClockTime::from_hm(9, 0).unwrap();
        let five = ClockTime::from_hm(17, 0).unwrap();
        assert!(local_span(d, five, nine, 0).is_none());
        assert!(local_span(d, nine, nine, 0).is_none());
        assert!(local_span(d, nine, five, 0).is_some());
    }

    #[test]
    fn timestamps_parse_ms_and_rfc3339() {
        assert_eq!(parse_timestamp("1741597200000").unwrap(), 1_741_597_200_000);
        assert_eq!(
            parse_timestamp("2025-03-10T09:00:00Z").unwrap(),
            1_741_597_200_000
        );
        assert!(parse_timestamp("tomorrow").is_err());
    }
}
