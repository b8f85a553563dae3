//! # Schedule Windows
//!
//! Parses the textual filters of a schedule rule and decides whether a given
//! instant falls inside the window.
//!
//! ## Filter syntax
//!
//! | Filter | Syntax |
//! |--------|--------|
//! | `begin_time` / `end_time` | `HH:MM[:SS]`, hour 0-24, minute and second 0-60 |
//! | `days_of_week` | names (`monday`), abbreviations (`mon`) or numbers 0-7 (0 and 7 are Sunday) |
//! | `days_of_month` | numbers 1-31 |
//! | `months_of_year` | names (`january`), abbreviations (`jan`) or numbers 1-12 |
//!
//! List filters are whitespace separated and case-insensitive; duplicates are
//! allowed. An unset or blank filter places no restriction on its axis. The
//! time range is inclusive on both ends; a range whose begin lies after its
//! end wraps past midnight.

use std::collections::BTreeSet;

use chrono::{Datelike, Timelike, Weekday};

use crate::error::ScheduleError;
use crate::rule::ScheduleRule;

/// Seconds since midnight. Can exceed one day for inputs such as `24:30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(u32);

impl TimeOfDay {
    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Self {
        Self(hour * 3600 + minute * 60 + second)
    }

    pub fn seconds_from_midnight(&self) -> u32 {
        self.0
    }

    /// Parse `HH:MM` or `HH:MM:SS`.
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let components: Vec<&str> = input.split(':').collect();
        if components.len() < 2 || components.len() > 3 {
            return Err(ScheduleError::InvalidTimeFormat(input.to_string()));
        }

        let component = |index: usize, name: &'static str, max: u32| {
            components[index]
                .parse::<u32>()
                .ok()
                .filter(|value| *value <= max)
                .ok_or_else(|| ScheduleError::InvalidTimeComponent {
                    component: name,
                    input: input.to_string(),
                })
        };

        let hour = component(0, "hour", 24)?;
        let minute = component(1, "minute", 60)?;
        let second = if components.len() == 3 {
            component(2, "second", 60)?
        } else {
            0
        };
        Ok(Self::from_hms(hour, minute, second))
    }
}

/// Parse a `days_of_week` filter.
pub fn parse_week_days(input: &str) -> Result<BTreeSet<u32>, ScheduleError> {
    input
        .split_whitespace()
        .map(|token| {
            parse_week_day(&token.to_lowercase())
                .map(|day| day.num_days_from_sunday())
                .ok_or_else(|| ScheduleError::UnknownWeekDay(token.to_string()))
        })
        .collect()
}

fn parse_week_day(token: &str) -> Option<Weekday> {
    let day = match token {
        "sunday" | "sun" | "0" | "7" => Weekday::Sun,
        "monday" | "mon" | "1" => Weekday::Mon,
        "tuesday" | "tue" | "2" => Weekday::Tue,
        "wednesday" | "wed" | "3" => Weekday::Wed,
        "thursday" | "thu" | "4" => Weekday::Thu,
        "friday" | "fri" | "5" => Weekday::Fri,
        "saturday" | "sat" | "6" => Weekday::Sat,
        _ => return None,
    };
    Some(day)
}

/// Parse a `days_of_month` filter.
pub fn parse_month_days(input: &str) -> Result<BTreeSet<u32>, ScheduleError> {
    input
        .split_whitespace()
        .map(|token| {
            token
                .parse::<u32>()
                .ok()
                .filter(|day| (1..=31).contains(day))
                .ok_or_else(|| ScheduleError::UnknownMonthDay(token.to_string()))
        })
        .collect()
}

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Parse a `months_of_year` filter into month numbers 1-12.
pub fn parse_months(input: &str) -> Result<BTreeSet<u32>, ScheduleError> {
    input
        .split_whitespace()
        .map(|token| parse_month(&token.to_lowercase()).ok_or_else(|| ScheduleError::UnknownMonth(token.to_string())))
        .collect()
}

fn parse_month(token: &str) -> Option<u32> {
    if let Ok(number) = token.parse::<u32>() {
        return (1..=12).contains(&number).then_some(number);
    }
    MONTH_NAMES
        .iter()
        .position(|name| *name == token || (token.len() == 3 && name.starts_with(token)))
        .map(|index| index as u32 + 1)
}

// ---------------------------------------------------------------------------
// ScheduleWindow
// ---------------------------------------------------------------------------

/// Parsed, evaluable form of a [`ScheduleRule`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub time_range: Option<(TimeOfDay, TimeOfDay)>,
    /// Days counted from Sunday = 0.
    pub week_days: Option<BTreeSet<u32>>,
    pub month_days: Option<BTreeSet<u32>>,
    pub months: Option<BTreeSet<u32>>,
}

impl ScheduleWindow {
    pub fn parse(rule: &ScheduleRule) -> Result<Self, ScheduleError> {
        let time_range = match (non_blank(&rule.begin_time), non_blank(&rule.end_time)) {
            (Some(begin), Some(end)) => Some((TimeOfDay::parse(begin)?, TimeOfDay::parse(end)?)),
            (None, None) => None,
            _ => return Err(ScheduleError::UnpairedTimeRange),
        };

        Ok(Self {
            time_range,
            week_days: non_blank(&rule.days_of_week).map(parse_week_days).transpose()?,
            month_days: non_blank(&rule.days_of_month).map(parse_month_days).transpose()?,
            months: non_blank(&rule.months_of_year).map(parse_months).transpose()?,
        })
    }

    /// Whether `at` satisfies every configured filter.
    pub fn contains<T: Datelike + Timelike>(&self, at: &T) -> bool {
        if let Some((begin, end)) = self.time_range {
            let now = at.num_seconds_from_midnight();
            let inside = if begin <= end {
                begin.0 <= now && now <= end.0
            } else {
                now >= begin.0 || now <= end.0
            };
            if !inside {
                return false;
            }
        }
        let allowed = |filter: &Option<BTreeSet<u32>>, value: u32| {
            filter.as_ref().map_or(true, |set| set.contains(&value))
        };
        allowed(&self.week_days, at.weekday().num_days_from_sunday())
            && allowed(&self.month_days, at.day())
            && allowed(&self.months, at.month())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn time_with_too_few_components_is_a_format_error() {
        for input in ["", "1", "1:2:3:4"] {
            let err = TimeOfDay::parse(input).unwrap_err();
            assert!(
                err.to_string().starts_with("Invalid time format"),
                "input {input:?} gave {err}"
            );
        }
    }

    #[test]
    fn invalid_time_components_name_the_component() {
        let cases = [
            (":", "hour"),
            ("a:", "hour"),
            ("-1:", "hour"),
            ("25:", "hour"),
            ("1:", "minute"),
            ("1:b", "minute"),
            ("1:-1", "minute"),
            ("1:61", "minute"),
            ("1:30:", "second"),
            ("1:30:c", "second"),
            ("1:30:-1", "second"),
            ("1:30:61", "second"),
        ];
        for (input, component) in cases {
            let err = TimeOfDay::parse(input).unwrap_err();
            assert!(
                err.to_string()
                    .starts_with(&format!("Error parsing {component} component")),
                "input {input:?} gave {err}"
            );
        }
    }

    #[test]
    fn valid_times_parse() {
        assert_eq!(TimeOfDay::parse("1:20").unwrap(), TimeOfDay::from_hms(1, 20, 0));
        assert_eq!(TimeOfDay::parse("01:20").unwrap(), TimeOfDay::from_hms(1, 20, 0));
        assert_eq!(TimeOfDay::parse("16:5").unwrap(), TimeOfDay::from_hms(16, 5, 0));
        assert_eq!(TimeOfDay::parse("8:47:1").unwrap(), TimeOfDay::from_hms(8, 47, 1));
    }

    #[test]
    fn week_days_accept_names_abbreviations_and_numbers() {
        let expected: BTreeSet<u32> = [1, 2, 3].into();
        assert_eq!(parse_week_days("monday tuesday wednesday").unwrap(), expected);
        assert_eq!(parse_week_days("mon tue wed").unwrap(), expected);
        assert_eq!(parse_week_days("1 2 3").unwrap(), expected);
        assert_eq!(parse_week_days("  MON  Tue    wEd ").unwrap(), expected);
        assert_eq!(parse_week_days("0").unwrap(), [0].into());
        assert_eq!(parse_week_days("7").unwrap(), [0].into());
        assert!(parse_week_days("").unwrap().is_empty());
    }

    #[test]
    fn week_days_reject_unknown_tokens() {
        assert!(parse_week_days("today").is_err());
        assert!(parse_week_days("mon:tue").is_err());
        assert!(parse_week_days("8").is_err());
    }

    #[test]
    fn month_days_range_checked() {
        assert_eq!(parse_month_days("  1  15  30 ").unwrap(), [1, 15, 30].into());
        for bad in ["aa", "1:2", "32", "-1", "0"] {
            assert!(parse_month_days(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn months_accept_names_abbreviations_and_numbers() {
        assert_eq!(parse_months("january february march").unwrap(), [1, 2, 3].into());
        assert_eq!(parse_months("jan FEB mar").unwrap(), [1, 2, 3].into());
        assert_eq!(parse_months("12 1").unwrap(), [1, 12].into());
        for bad in ["today", "jan:feb", "-1", "13", "ja"] {
            assert!(parse_months(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn unfiltered_window_is_always_open() {
        let window = ScheduleRule::always_open().window().unwrap();
        assert!(window.contains(&at(2020, 3, 3, 12, 0, 0)));
        assert!(window.contains(&at(1999, 12, 31, 23, 59, 59)));
    }

    #[test]
    fn time_range_is_inclusive() {
        let window = ScheduleRule::always_open()
            .with_time_range("9:00", "17:00")
            .window()
            .unwrap();
        assert!(window.contains(&at(2020, 3, 3, 9, 0, 0)));
        assert!(window.contains(&at(2020, 3, 3, 17, 0, 0)));
        assert!(!window.contains(&at(2020, 3, 3, 17, 0, 1)));
        assert!(!window.contains(&at(2020, 3, 3, 8, 59, 59)));
    }

    #[test]
    fn inverted_time_range_wraps_midnight() {
        let window = ScheduleRule::always_open()
            .with_time_range("22:00", "2:00")
            .window()
            .unwrap();
        assert!(window.contains(&at(2020, 3, 3, 23, 30, 0)));
        assert!(window.contains(&at(2020, 3, 3, 1, 0, 0)));
        assert!(!window.contains(&at(2020, 3, 3, 12, 0, 0)));
    }

    #[test]
    fn all_axes_must_match() {
        // 2020-03-03 is a Tuesday.
        let window = ScheduleRule::always_open()
            .with_days_of_week("tue thu")
            .with_days_of_month("3")
            .with_months_of_year("mar")
            .window()
            .unwrap();
        assert!(window.contains(&at(2020, 3, 3, 12, 0, 0)));
        assert!(!window.contains(&at(2020, 3, 5, 12, 0, 0)));
        assert!(!window.contains(&at(2020, 2, 3, 12, 0, 0)));
    }

    #[test]
    fn blank_filters_are_ignored() {
        let window = ScheduleRule::always_open()
            .with_days_of_week("   ")
            .window()
            .unwrap();
        assert_eq!(window.week_days, None);
    }

    proptest! {
        #[test]
        fn in_range_numeric_times_parse(h in 0u32..=24, m in 0u32..=60, s in 0u32..=60) {
            let parsed = TimeOfDay::parse(&format!("{h}:{m}:{s}")).unwrap();
            prop_assert_eq!(parsed.seconds_from_midnight(), h * 3600 + m * 60 + s);
        }

        #[test]
        fn out_of_range_hours_are_rejected(h in 25u32..10_000, m in 0u32..=60) {
            let parsed = TimeOfDay::parse(&format!("{h}:{m}"));
            let is_invalid_hour = matches!(
                parsed,
                Err(ScheduleError::InvalidTimeComponent { component: "hour", .. })
            );
            prop_assert!(is_invalid_hour);
        }
    }
}
