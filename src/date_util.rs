use std::sync::LazyLock;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

/// Compact revision timestamp format (`YYYYMMDDHHMMSS`) used by the history store.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Days covered by the default snapshot range, ending today.
pub const DEFAULT_RANGE_DAYS: i64 = 14;

static RE_DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// An inclusive timestamp window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateWindow {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Parse a timestamp in any of the accepted forms:
/// `YYYYMMDDHHMMSS`, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` or `YYYYMMDD`.
/// Date-only forms resolve to midnight.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT) {
        return Ok(ts);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts);
    }
    parse_date(s).map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Parse a calendar date as `YYYYMMDD` or `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .map_err(|_| Error::DateParse(s.to_string()))
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Find the first standalone 8-digit run in a file name that is a valid
/// `YYYYMMDD` date. Longer digit runs (e.g. full timestamps) do not count.
pub fn extract_date_token(file_name: &str) -> Option<NaiveDate> {
    RE_DIGIT_RUN
        .find_iter(file_name)
        .filter(|m| m.as_str().len() == 8)
        .find_map(|m| NaiveDate::parse_from_str(m.as_str(), "%Y%m%d").ok())
}

/// The default snapshot range: the last [`DEFAULT_RANGE_DAYS`] days through `today`.
pub fn default_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (today - Duration::days(DEFAULT_RANGE_DAYS), today)
}
