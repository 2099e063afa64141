//! Time constants and integer time arithmetic

use chrono::{DateTime, Datelike};

pub const HOUR: i64 = 3600;
pub const DAY: i64 = 86400;
pub const WEEK: i64 = 604800;
pub const MONTH: i64 = 4 * WEEK;
pub const YEAR: i64 = 52 * WEEK;

/// Largest multiple of `interval` not greater than `time`.
pub fn floor(time: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return time;
    }
    time - time.rem_euclid(interval)
}

/// Smallest multiple of `interval` not less than `time`.
pub fn ceil(time: i64, interval: i64) -> i64 {
    let result = floor(time, interval);
    if result == time {
        result
    } else {
        result + interval
    }
}

/// Number of `interval` boundaries passed going from `start` to `end`.
/// Aging which happens in whole steps uses this so that it doesn't
/// depend on how often it is asked to age.
pub fn intervals_crossed(start: i64, end: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return 0;
    }
    let (start, end) = (floor(start, interval), floor(end, interval));
    if end > start {
        (end - start) / interval
    } else {
        0
    }
}

/// Zero based month of the year of `time` in UTC.
pub fn month_of_year(time: i64) -> u32 {
    DateTime::from_timestamp(time, 0)
        .map(|datetime| datetime.month0())
        .unwrap_or(0)
}
