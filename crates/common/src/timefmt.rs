//! Timestamp and month formats shared by the index key layouts.
//!
//! Two wire formats are used throughout: second precision
//! (`yyyy-mm-ddTHH:MM:ssZ`) on published times and reply keys, and
//! microsecond precision (`yyyy-mm-ddTHH:MM:ss.SSSSSSZ`) on record
//! timestamps and activity sort keys. Both are always UTC.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, Utc};

use crate::error::{AppError, AppResult};

/// Format string for `yyyy-mm-ddTHH:MM:ss.SSSSSSZ`.
const FORMAT_MICROS: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Format string for `yyyy-mm-ddTHH:MM:ssZ`.
const FORMAT_SECONDS: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format string for `yyyy-mm`.
const FORMAT_MONTH: &str = "%Y-%m";

/// Formats a timestamp with microsecond precision in UTC.
#[must_use]
pub fn format_micros(time: DateTime<Utc>) -> String {
    time.format(FORMAT_MICROS).to_string()
}

/// Formats a timestamp with second precision in UTC.
#[must_use]
pub fn format_seconds(time: DateTime<Utc>) -> String {
    time.format(FORMAT_SECONDS).to_string()
}

/// Current timestamp with microsecond precision.
#[must_use]
pub fn now_micros() -> String {
    format_micros(Utc::now())
}

/// Current timestamp with second precision.
#[must_use]
pub fn now_seconds() -> String {
    format_seconds(Utc::now())
}

/// Parses a `yyyy-mm-ddTHH:MM:ss.SSSSSSZ` timestamp. Assumes UTC.
pub fn parse_micros(text: &str) -> AppResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, FORMAT_MICROS)
        .map_err(|e| AppError::BadRequest(format!("invalid timestamp {text:?}: {e}")))?;
    Ok(naive.and_utc())
}

/// Parses a `yyyy-mm-ddTHH:MM:ssZ` timestamp. Assumes UTC.
pub fn parse_seconds(text: &str) -> AppResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, FORMAT_SECONDS)
        .map_err(|e| AppError::BadRequest(format!("invalid timestamp {text:?}: {e}")))?;
    Ok(naive.and_utc())
}

/// Returns the first day of the month a timestamp falls in.
#[must_use]
pub fn month_of(time: DateTime<Utc>) -> NaiveDate {
    time.date_naive().with_day(1).unwrap_or(time.date_naive())
}

/// Formats a month as `yyyy-mm`.
#[must_use]
pub fn format_month(month: NaiveDate) -> String {
    month.format(FORMAT_MONTH).to_string()
}

/// Parses a `yyyy-mm` month into the first day of that month.
pub fn parse_month(text: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d")
        .map_err(|e| AppError::BadRequest(format!("invalid month {text:?}: {e}")))
}

/// The month immediately before `month`.
#[must_use]
pub fn previous_month(month: NaiveDate) -> NaiveDate {
    month - Months::new(1)
}

/// The month immediately after `month`.
#[must_use]
pub fn next_month(month: NaiveDate) -> NaiveDate {
    month + Months::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 7, 1, 2, 3).unwrap() + chrono::Duration::microseconds(456_789)
    }

    #[test]
    fn test_format_micros() {
        assert_eq!(format_micros(sample()), "2023-04-07T01:02:03.456789Z");
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(sample()), "2023-04-07T01:02:03Z");
    }

    #[test]
    fn test_parse_micros_round_trip() {
        let text = "2023-04-07T01:02:03.456789Z";
        assert_eq!(format_micros(parse_micros(text).unwrap()), text);
    }

    #[test]
    fn test_parse_seconds_round_trip() {
        let text = "2023-04-07T01:02:03Z";
        assert_eq!(format_seconds(parse_seconds(text).unwrap()), text);
    }

    #[test]
    fn test_parse_micros_rejects_second_precision() {
        assert!(parse_micros("2023-04-07T01:02:03Z").is_err());
    }

    #[test]
    fn test_month_helpers() {
        let month = month_of(sample());
        assert_eq!(format_month(month), "2023-04");
        assert_eq!(format_month(previous_month(month)), "2023-03");
        assert_eq!(format_month(next_month(month)), "2023-05");
        assert_eq!(parse_month("2023-04").unwrap(), month);
    }

    #[test]
    fn test_month_arithmetic_across_year() {
        let jan = parse_month("2024-01").unwrap();
        assert_eq!(format_month(previous_month(jan)), "2023-12");
        let dec = parse_month("2023-12").unwrap();
        assert_eq!(format_month(next_month(dec)), "2024-01");
    }

    #[test]
    fn test_parse_month_rejects_garbage() {
        assert!(parse_month("202304").is_err());
        assert!(parse_month("2023-13").is_err());
    }
}
