//! Date and time range checks for the PAC helper contract
//!
//! Implements the `weekdayRange`, `dateRange` and `timeRange` semantics:
//! one- and two-bound forms with wraparound, and a trailing `"GMT"`
//! argument that switches evaluation from local time to UTC.

use chrono::{Datelike, Local, Timelike, Utc};

use crate::error::{PorticoError, Result};

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// The calendar/clock fields a range check looks at.
#[derive(Debug, Clone, Copy)]
pub struct ClockFields {
    /// 1 = Sunday .. 7 = Saturday
    pub weekday: u32,
    pub year: i32,
    /// 1..=12
    pub month: u32,
    /// 1..=31
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl ClockFields {
    pub fn now(use_gmt: bool) -> Self {
        if use_gmt {
            Self::of(Utc::now())
        } else {
            Self::of(Local::now())
        }
    }

    fn of<Tz: chrono::TimeZone>(dt: chrono::DateTime<Tz>) -> Self {
        Self {
            weekday: dt.weekday().number_from_sunday(),
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }
}

/// `weekdayRange(wd1 [, wd2] [, "GMT"])`
pub fn weekday_range(args: &[String]) -> Result<bool> {
    let (args, use_gmt) = split_gmt(args);
    weekday_range_at(ClockFields::now(use_gmt), args)
}

pub fn weekday_range_at(clock: ClockFields, args: &[String]) -> Result<bool> {
    if args.is_empty() || args.len() > 2 {
        return Err(invalid("weekdayRange takes one or two weekday names"));
    }
    let min = weekday_number(&args[0])?;
    let max = if args.len() == 2 {
        weekday_number(&args[1])?
    } else {
        min
    };
    Ok(in_wrapping_range(clock.weekday, min, max))
}

/// `timeRange(h | h1, h2 | h1, m1, h2, m2 | h1, m1, s1, h2, m2, s2 [, "GMT"])`
pub fn time_range(args: &[String]) -> Result<bool> {
    let (args, use_gmt) = split_gmt(args);
    time_range_at(ClockFields::now(use_gmt), args)
}

pub fn time_range_at(clock: ClockFields, args: &[String]) -> Result<bool> {
    let now = (clock.hour, clock.minute, clock.second);
    let (start, end) = match args.len() {
        1 => {
            let hour = clock_part(&args[0], 23, "hour")?;
            ((hour, 0, 0), (hour, 59, 59))
        }
        2 => {
            let h1 = clock_part(&args[0], 23, "hour")?;
            let h2 = clock_part(&args[1], 23, "hour")?;
            if h1 == h2 {
                ((h1, 0, 0), (h1, 59, 59))
            } else {
                ((h1, 0, 0), (h2, 0, 0))
            }
        }
        4 => {
            let h1 = clock_part(&args[0], 23, "hour")?;
            let m1 = clock_part(&args[1], 59, "minute")?;
            let h2 = clock_part(&args[2], 23, "hour")?;
            let m2 = clock_part(&args[3], 59, "minute")?;
            ((h1, m1, 0), (h2, m2, 0))
        }
        6 => {
            let h1 = clock_part(&args[0], 23, "hour")?;
            let m1 = clock_part(&args[1], 59, "minute")?;
            let s1 = clock_part(&args[2], 59, "second")?;
            let h2 = clock_part(&args[3], 23, "hour")?;
            let m2 = clock_part(&args[4], 59, "minute")?;
            let s2 = clock_part(&args[5], 59, "second")?;
            ((h1, m1, s1), (h2, m2, s2))
        }
        _ => return Err(invalid("timeRange takes 1, 2, 4 or 6 time arguments")),
    };

    if start <= end {
        Ok(now >= start && now <= end)
    } else {
        Ok(now >= start || now <= end)
    }
}

/// `dateRange(...)`: day, month and/or year bounds, 1/2/4/6-argument forms.
pub fn date_range(args: &[String]) -> Result<bool> {
    let (args, use_gmt) = split_gmt(args);
    date_range_at(ClockFields::now(use_gmt), args)
}

pub fn date_range_at(clock: ClockFields, args: &[String]) -> Result<bool> {
    match args.len() {
        1 => match classify_date_arg(&args[0])? {
            DateArg::Year(y) => Ok(clock.year == y),
            DateArg::Month(m) => Ok(clock.month == m),
            DateArg::Day(d) => Ok(clock.day == d),
        },
        2 => match (classify_date_arg(&args[0])?, classify_date_arg(&args[1])?) {
            (DateArg::Year(a), DateArg::Year(b)) => Ok(clock.year >= a && clock.year <= b),
            (DateArg::Month(a), DateArg::Month(b)) => Ok(in_wrapping_range(clock.month, a, b)),
            (DateArg::Day(a), DateArg::Day(b)) => Ok(in_wrapping_range(clock.day, a, b)),
            _ => Err(invalid("dateRange bounds must be of the same kind")),
        },
        4 => match (
            classify_date_arg(&args[0])?,
            classify_date_arg(&args[1])?,
            classify_date_arg(&args[2])?,
            classify_date_arg(&args[3])?,
        ) {
            // dateRange(day1, month1, day2, month2)
            (DateArg::Day(d1), DateArg::Month(m1), DateArg::Day(d2), DateArg::Month(m2)) => {
                let now = clock.month * 100 + clock.day;
                Ok(in_wrapping_range(now, m1 * 100 + d1, m2 * 100 + d2))
            }
            // dateRange(month1, year1, month2, year2)
            (DateArg::Month(m1), DateArg::Year(y1), DateArg::Month(m2), DateArg::Year(y2)) => {
                let now = clock.year * 100 + clock.month as i32;
                Ok(now >= y1 * 100 + m1 as i32 && now <= y2 * 100 + m2 as i32)
            }
            _ => Err(invalid("dateRange: unsupported 4-argument form")),
        },
        6 => match (
            classify_date_arg(&args[0])?,
            classify_date_arg(&args[1])?,
            classify_date_arg(&args[2])?,
            classify_date_arg(&args[3])?,
            classify_date_arg(&args[4])?,
            classify_date_arg(&args[5])?,
        ) {
            // dateRange(day1, month1, year1, day2, month2, year2)
            (
                DateArg::Day(d1),
                DateArg::Month(m1),
                DateArg::Year(y1),
                DateArg::Day(d2),
                DateArg::Month(m2),
                DateArg::Year(y2),
            ) => {
                let now = clock.year * 10_000 + (clock.month * 100 + clock.day) as i32;
                let start = y1 * 10_000 + (m1 * 100 + d1) as i32;
                let end = y2 * 10_000 + (m2 * 100 + d2) as i32;
                Ok(now >= start && now <= end)
            }
            _ => Err(invalid("dateRange: unsupported 6-argument form")),
        },
        _ => Err(invalid("dateRange takes 1, 2, 4 or 6 arguments")),
    }
}

enum DateArg {
    Year(i32),
    Month(u32),
    Day(u32),
}

fn classify_date_arg(arg: &str) -> Result<DateArg> {
    if let Ok(number) = arg.parse::<i32>() {
        if (1..=31).contains(&number) {
            return Ok(DateArg::Day(number as u32));
        }
        if number >= 1000 {
            return Ok(DateArg::Year(number));
        }
        return Err(invalid(&format!("value out of range: {}", arg)));
    }
    let upper = arg.to_ascii_uppercase();
    if let Some(index) = MONTH_NAMES.iter().position(|name| *name == upper) {
        return Ok(DateArg::Month(index as u32 + 1));
    }
    Err(invalid(&format!("not a day, month or year: {}", arg)))
}

fn weekday_number(name: &str) -> Result<u32> {
    let upper = name.to_ascii_uppercase();
    WEEKDAY_NAMES
        .iter()
        .position(|wd| *wd == upper)
        .map(|index| index as u32 + 1)
        .ok_or_else(|| invalid(&format!("not a weekday name: {}", name)))
}

fn clock_part(arg: &str, max: u32, what: &str) -> Result<u32> {
    let value: u32 = arg
        .parse()
        .map_err(|_| invalid(&format!("not a number for {}: {}", what, arg)))?;
    if value > max {
        return Err(invalid(&format!("{} out of range: {}", what, value)));
    }
    Ok(value)
}

fn split_gmt(args: &[String]) -> (&[String], bool) {
    match args.last() {
        Some(last) if last.eq_ignore_ascii_case("GMT") => (&args[..args.len() - 1], true),
        _ => (args, false),
    }
}

fn in_wrapping_range(value: u32, min: u32, max: u32) -> bool {
    if min <= max {
        value >= min && value <= max
    } else {
        value >= min || value <= max
    }
}

fn invalid(message: &str) -> PorticoError {
    PorticoError::PacScript(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn clock(weekday: u32, year: i32, month: u32, day: u32, h: u32, m: u32, s: u32) -> ClockFields {
        ClockFields {
            weekday,
            year,
            month,
            day,
            hour: h,
            minute: m,
            second: s,
        }
    }

    #[test]
    fn test_weekday_single_day() {
        let wednesday = clock(4, 2024, 6, 12, 12, 0, 0);
        assert!(weekday_range_at(wednesday, &strings(&["WED"])).unwrap());
        assert!(!weekday_range_at(wednesday, &strings(&["FRI"])).unwrap());
    }

    #[test]
    fn test_weekday_wrapping_range() {
        // FRI..MON covers Fri, Sat, Sun, Mon.
        let sunday = clock(1, 2024, 6, 9, 12, 0, 0);
        let wednesday = clock(4, 2024, 6, 12, 12, 0, 0);
        assert!(weekday_range_at(sunday, &strings(&["FRI", "MON"])).unwrap());
        assert!(!weekday_range_at(wednesday, &strings(&["FRI", "MON"])).unwrap());
    }

    #[test]
    fn test_weekday_rejects_bad_args() {
        let sunday = clock(1, 2024, 6, 9, 12, 0, 0);
        assert!(weekday_range_at(sunday, &strings(&["NOPE"])).is_err());
        assert!(weekday_range_at(sunday, &strings(&[])).is_err());
        assert!(weekday_range_at(sunday, &strings(&["MON", "TUE", "WED"])).is_err());
    }

    #[test]
    fn test_time_single_hour() {
        let nine_thirty = clock(2, 2024, 6, 10, 9, 30, 0);
        assert!(time_range_at(nine_thirty, &strings(&["9"])).unwrap());
        assert!(!time_range_at(nine_thirty, &strings(&["10"])).unwrap());
    }

    #[test]
    fn test_time_hour_range() {
        let lunch = clock(2, 2024, 6, 10, 12, 15, 0);
        assert!(time_range_at(lunch, &strings(&["9", "17"])).unwrap());
        let evening = clock(2, 2024, 6, 10, 18, 0, 0);
        assert!(!time_range_at(evening, &strings(&["9", "17"])).unwrap());
    }

    #[test]
    fn test_time_range_wraps_past_midnight() {
        let late = clock(2, 2024, 6, 10, 23, 30, 0);
        let early = clock(2, 2024, 6, 10, 2, 0, 0);
        let morning = clock(2, 2024, 6, 10, 8, 0, 0);
        assert!(time_range_at(late, &strings(&["22", "6"])).unwrap());
        assert!(time_range_at(early, &strings(&["22", "6"])).unwrap());
        assert!(!time_range_at(morning, &strings(&["22", "6"])).unwrap());
    }

    #[test]
    fn test_time_minute_bounds() {
        let t = clock(2, 2024, 6, 10, 9, 45, 0);
        assert!(time_range_at(t, &strings(&["9", "30", "10", "0"])).unwrap());
        let before = clock(2, 2024, 6, 10, 9, 15, 0);
        assert!(!time_range_at(before, &strings(&["9", "30", "10", "0"])).unwrap());
    }

    #[test]
    fn test_time_rejects_bad_counts() {
        let t = clock(2, 2024, 6, 10, 9, 0, 0);
        assert!(time_range_at(t, &strings(&["9", "0", "17"])).is_err());
        assert!(time_range_at(t, &strings(&["9", "0", "17", "0", "30"])).is_err());
    }

    #[test]
    fn test_date_single_forms() {
        let day = clock(2, 2024, 6, 10, 9, 0, 0);
        assert!(date_range_at(day, &strings(&["10"])).unwrap());
        assert!(date_range_at(day, &strings(&["JUN"])).unwrap());
        assert!(date_range_at(day, &strings(&["2024"])).unwrap());
        assert!(!date_range_at(day, &strings(&["DEC"])).unwrap());
    }

    #[test]
    fn test_date_month_range_wraps() {
        let january = clock(2, 2024, 1, 10, 9, 0, 0);
        assert!(date_range_at(january, &strings(&["NOV", "FEB"])).unwrap());
        let june = clock(2, 2024, 6, 10, 9, 0, 0);
        assert!(!date_range_at(june, &strings(&["NOV", "FEB"])).unwrap());
    }

    #[test]
    fn test_date_day_month_range() {
        let midsummer = clock(2, 2024, 6, 24, 9, 0, 0);
        assert!(date_range_at(midsummer, &strings(&["1", "JUN", "15", "AUG"])).unwrap());
        let autumn = clock(2, 2024, 9, 1, 9, 0, 0);
        assert!(!date_range_at(autumn, &strings(&["1", "JUN", "15", "AUG"])).unwrap());
    }

    #[test]
    fn test_date_full_range() {
        let inside = clock(2, 2024, 6, 10, 9, 0, 0);
        let args = strings(&["1", "JAN", "2024", "31", "DEC", "2025"]);
        assert!(date_range_at(inside, &args).unwrap());
        let before = clock(2, 2023, 12, 31, 9, 0, 0);
        assert!(!date_range_at(before, &args).unwrap());
    }

    #[test]
    fn test_gmt_flag_is_stripped() {
        let with_gmt = strings(&["MON", "GMT"]);
        let (rest, gmt) = split_gmt(&with_gmt);
        assert!(gmt);
        assert_eq!(rest, &strings(&["MON"])[..]);

        let without_gmt = strings(&["MON"]);
        let (rest, gmt) = split_gmt(&without_gmt);
        assert!(!gmt);
        assert_eq!(rest.len(), 1);
    }
}
