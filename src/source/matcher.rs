use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Capture groups every filename pattern must define.
pub const REQUIRED_GROUPS: [&str; 4] = ["year", "month", "day", "hour"];

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("pattern missing '{0}' capture group")]
    MissingGroup(&'static str),
}

/// Hour-granular timestamp parsed out of a raw object name.
///
/// Values are taken from the name as-is: a month of `13` is kept and compared
/// numerically. Ordering is (year, month, day, hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogTimestamp {
    pub year: u32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl LogTimestamp {
    pub fn new(year: u32, month: u32, day: u32, hour: u32) -> Self {
        Self {
            year,
            month,
            day,
            hour,
        }
    }

    /// The hour containing `dt`.
    pub fn floor(dt: DateTime<Utc>) -> Self {
        Self::new(dt.year() as u32, dt.month(), dt.day(), dt.hour())
    }

    /// The first hour boundary at or after `dt`.
    pub fn ceil(dt: DateTime<Utc>) -> Self {
        let floor = Self::floor(dt);
        if dt.minute() == 0 && dt.second() == 0 && dt.nanosecond() == 0 {
            floor
        } else {
            Self::floor(dt + chrono::Duration::hours(1))
        }
    }

    /// Start of the hour as a calendar time, if the fields form a real date.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::from_ymd_opt(self.year as i32, self.month, self.day)?;
        let naive = date.and_hms_opt(self.hour, 0, 0)?;
        Some(Utc.from_utc_datetime(&naive))
    }

    /// Object-name prefix for this window, e.g. `2024/03/15/12`.
    pub fn path_prefix(&self) -> String {
        format!(
            "{:04}/{:02}/{:02}/{:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

impl fmt::Display for LogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}{:02}{:02}{:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

impl FromStr for LogTimestamp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("expected YYYYMMDDHH, got '{}'", s));
        }
        let field = |range: std::ops::Range<usize>| -> u32 {
            // All ten bytes are ASCII digits, so every slice parses
            s[range].parse().unwrap_or_default()
        };
        Ok(Self::new(field(0..4), field(4..6), field(6..8), field(8..10)))
    }
}

impl Serialize for LogTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LogTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of a successful filename match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameMatch {
    pub timestamp: LogTimestamp,
    /// Named groups other than year/month/day/hour.
    pub extras: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FilenameMatcher {
    source: String,
    pattern: Regex,
}

impl FilenameMatcher {
    /// Compile a filename pattern.
    ///
    /// The pattern is anchored at the start of the name and compiled in
    /// verbose mode, so whitespace and `#` comments inside it are ignored.
    /// It must contain the named groups `year`, `month`, `day` and `hour`.
    pub fn new(pattern: &str) -> Result<Self, MatcherError> {
        let regex = Regex::new(&format!("^(?x:{})", pattern))?;

        for group in REQUIRED_GROUPS {
            if regex.capture_names().all(|name| name != Some(group)) {
                return Err(MatcherError::MissingGroup(group));
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            pattern: regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match an object name.
    ///
    /// Returns None when the name does not match, or when a date group is not
    /// numeric, the year is not four digits, or another field exceeds two
    /// digits. Such names are ignored rather than treated as errors.
    pub fn parse(&self, name: &str) -> Option<FilenameMatch> {
        let captures = self.pattern.captures(name)?;

        let numeric = |group: &str, max_len: usize| -> Option<u32> {
            let value = captures.name(group)?.as_str();
            if value.is_empty() || value.len() > max_len {
                return None;
            }
            if !value.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            value.parse().ok()
        };

        let year = captures.name("year")?.as_str();
        if year.len() != 4 {
            return None;
        }

        let timestamp = LogTimestamp::new(
            numeric("year", 4)?,
            numeric("month", 2)?,
            numeric("day", 2)?,
            numeric("hour", 2)?,
        );

        let extras = self
            .pattern
            .capture_names()
            .flatten()
            .filter(|name| !REQUIRED_GROUPS.contains(name))
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();

        Some(FilenameMatch { timestamp, extras })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCESS_PATTERN: &str =
        r"(?P<year>[0-9]{4})(?P<month>[0-1][0-9])(?P<day>[0-3][0-9])(?P<hour>[0-2][0-9]).*$";

    #[test]
    fn test_basic_match() {
        let matcher = FilenameMatcher::new(ACCESS_PATTERN).unwrap();
        let m = matcher.parse("2024031512-shard1").unwrap();

        assert_eq!(m.timestamp, LogTimestamp::new(2024, 3, 15, 12));
        assert!(m.extras.is_empty());
    }

    #[test]
    fn test_verbose_pattern_with_extras() {
        let pattern = r"
            prefix_.*_[0-9]+\.blah\.
            (?P<year>[0-9]{4})
            (?P<month>[0-1][0-9])
            (?P<day>[0-3][0-9])
            (?P<hour>[0-2][0-9])00-[0-9]{2}00
            -(?P<shard>[0-9]?[0-9])\.gz";
        let matcher = FilenameMatcher::new(pattern).unwrap();

        let m = matcher
            .parse("prefix_abc_123.blah.202403151200-1300-7.gz")
            .unwrap();

        assert_eq!(m.timestamp, LogTimestamp::new(2024, 3, 15, 12));
        assert_eq!(m.extras.get("shard").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_anchored_at_start() {
        let matcher = FilenameMatcher::new(ACCESS_PATTERN).unwrap();
        assert!(matcher.parse("plugin-2024031512").is_none());
    }

    #[test]
    fn test_no_match_is_none() {
        let matcher = FilenameMatcher::new(ACCESS_PATTERN).unwrap();
        assert!(matcher.parse("not-a-log").is_none());
        assert!(matcher.parse("202403").is_none());
    }

    #[test]
    fn test_lenient_out_of_range_values() {
        let matcher = FilenameMatcher::new(ACCESS_PATTERN).unwrap();
        let m = matcher.parse("2024193929").unwrap();

        assert_eq!(m.timestamp, LogTimestamp::new(2024, 19, 39, 29));
        assert!(m.timestamp.to_datetime().is_none());
        assert!(m.timestamp > LogTimestamp::new(2024, 12, 31, 23));
    }

    #[test]
    fn test_non_numeric_group_is_ignored() {
        let matcher = FilenameMatcher::new(
            r"(?P<year>\w{4})(?P<month>\w{2})(?P<day>\w{2})(?P<hour>\w{2})",
        )
        .unwrap();
        assert!(matcher.parse("20240315ab").is_none());
    }

    #[test]
    fn test_year_must_be_four_digits() {
        let matcher =
            FilenameMatcher::new(r"(?P<year>[0-9]+)-(?P<month>[0-9]{2})(?P<day>[0-9]{2})(?P<hour>[0-9]{2})")
                .unwrap();
        assert!(matcher.parse("24-031512").is_none());
        assert!(matcher.parse("2024-031512").is_some());
    }

    #[test]
    fn test_missing_group_error() {
        let result = FilenameMatcher::new(r"(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})");
        assert!(matches!(result, Err(MatcherError::MissingGroup("hour"))));
    }

    #[test]
    fn test_invalid_regex() {
        let result = FilenameMatcher::new(r"(?P<year>[invalid");
        assert!(matches!(result, Err(MatcherError::InvalidRegex(_))));
    }

    #[test]
    fn test_timestamp_display_and_parse() {
        let ts = LogTimestamp::new(2024, 3, 15, 13);
        assert_eq!(ts.to_string(), "2024031513");
        assert_eq!("2024031513".parse::<LogTimestamp>().unwrap(), ts);
        assert!("2024-03-15".parse::<LogTimestamp>().is_err());
        assert_eq!(ts.path_prefix(), "2024/03/15/13");
    }

    #[test]
    fn test_floor_and_ceil() {
        let dt: DateTime<Utc> = "2024-03-15T14:30:00Z".parse().unwrap();
        assert_eq!(LogTimestamp::floor(dt), LogTimestamp::new(2024, 3, 15, 14));
        assert_eq!(LogTimestamp::ceil(dt), LogTimestamp::new(2024, 3, 15, 15));

        let on_hour: DateTime<Utc> = "2024-03-15T23:00:00Z".parse().unwrap();
        assert_eq!(LogTimestamp::ceil(on_hour), LogTimestamp::new(2024, 3, 15, 23));

        let late: DateTime<Utc> = "2024-03-31T23:10:00Z".parse().unwrap();
        assert_eq!(LogTimestamp::ceil(late), LogTimestamp::new(2024, 4, 1, 0));
    }
}
