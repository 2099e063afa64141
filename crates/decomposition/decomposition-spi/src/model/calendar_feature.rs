//! Calendar features: days anchored to the month

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Timelike};

use crate::error::DecompositionError;
use crate::model::time::DAY;

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// A day identified by its position in the calendar month.
///
/// Days and weeks are zero based. Day of week counts from Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CalendarFeature {
    DayOfMonth(u32),
    DaysBeforeEndOfMonth(u32),
    DayOfWeekAndWeekOfMonth { day_of_week: u32, week: u32 },
    DayOfWeekAndWeeksBeforeEndOfMonth { day_of_week: u32, week: u32 },
}

struct DayFields {
    day_of_month: u32,
    days_before_end: u32,
    day_of_week: u32,
    seconds_into_day: i64,
}

fn day_fields(time: i64) -> Option<DayFields> {
    let datetime = DateTime::from_timestamp(time, 0)?;
    let date = datetime.date_naive();
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    let first_of_this = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
    let days_in_month = (first_of_next - first_of_this).num_days() as u32;
    Some(DayFields {
        day_of_month: date.day0(),
        days_before_end: days_in_month - date.day(),
        day_of_week: date.weekday().num_days_from_sunday(),
        seconds_into_day: i64::from(datetime.num_seconds_from_midnight()),
    })
}

impl CalendarFeature {
    /// The four features describing the day containing `time`.
    pub fn features(time: i64) -> Vec<CalendarFeature> {
        match day_fields(time) {
            Some(fields) => vec![
                Self::DayOfMonth(fields.day_of_month),
                Self::DaysBeforeEndOfMonth(fields.days_before_end),
                Self::DayOfWeekAndWeekOfMonth {
                    day_of_week: fields.day_of_week,
                    week: fields.day_of_month / 7,
                },
                Self::DayOfWeekAndWeeksBeforeEndOfMonth {
                    day_of_week: fields.day_of_week,
                    week: fields.days_before_end / 7,
                },
            ],
            None => Vec::new(),
        }
    }

    /// Seconds into the feature's day if `time` falls on it.
    pub fn offset(&self, time: i64) -> Option<i64> {
        let fields = day_fields(time)?;
        let matches = match *self {
            Self::DayOfMonth(day) => fields.day_of_month == day,
            Self::DaysBeforeEndOfMonth(days) => fields.days_before_end == days,
            Self::DayOfWeekAndWeekOfMonth { day_of_week, week } => {
                fields.day_of_week == day_of_week && fields.day_of_month / 7 == week
            }
            Self::DayOfWeekAndWeeksBeforeEndOfMonth { day_of_week, week } => {
                fields.day_of_week == day_of_week && fields.days_before_end / 7 == week
            }
        };
        matches.then_some(fields.seconds_into_day)
    }

    pub fn in_window(&self, time: i64) -> bool {
        self.offset(time).is_some()
    }

    /// Length of the interval the feature covers
    pub fn window(&self) -> i64 {
        DAY
    }

    /// Stable delimited form used for persistence
    pub fn to_delimited(&self) -> String {
        match *self {
            Self::DayOfMonth(day) => format!("0:{}", day),
            Self::DaysBeforeEndOfMonth(days) => format!("1:{}", days),
            Self::DayOfWeekAndWeekOfMonth { day_of_week, week } => {
                format!("2:{}:{}", day_of_week, week)
            }
            Self::DayOfWeekAndWeeksBeforeEndOfMonth { day_of_week, week } => {
                format!("3:{}:{}", day_of_week, week)
            }
        }
    }
}

impl fmt::Display for CalendarFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day_name = |day: u32| DAY_NAMES.get(day as usize).copied().unwrap_or("?");
        match *self {
            Self::DayOfMonth(day) => write!(f, "day {} of month", day + 1),
            Self::DaysBeforeEndOfMonth(days) => write!(f, "{} days before end of month", days),
            Self::DayOfWeekAndWeekOfMonth { day_of_week, week } => {
                write!(f, "{} of week {} of month", day_name(day_of_week), week + 1)
            }
            Self::DayOfWeekAndWeeksBeforeEndOfMonth { day_of_week, week } => write!(
                f,
                "{} of {} weeks before end of month",
                day_name(day_of_week),
                week
            ),
        }
    }
}

impl FromStr for CalendarFeature {
    type Err = DecompositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<u32> = s
            .split(':')
            .map(|field| field.parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| DecompositionError::parse("calendar_feature", s))?;
        match fields.as_slice() {
            [0, day] if *day < 31 => Ok(Self::DayOfMonth(*day)),
            [1, days] if *days < 31 => Ok(Self::DaysBeforeEndOfMonth(*days)),
            [2, day_of_week, week] if *day_of_week < 7 && *week < 5 => {
                Ok(Self::DayOfWeekAndWeekOfMonth {
                    day_of_week: *day_of_week,
                    week: *week,
                })
            }
            [3, day_of_week, week] if *day_of_week < 7 && *week < 5 => {
                Ok(Self::DayOfWeekAndWeeksBeforeEndOfMonth {
                    day_of_week: *day_of_week,
                    week: *week,
                })
            }
            _ => Err(DecompositionError::parse("calendar_feature", s)),
        }
    }
}
