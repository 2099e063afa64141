//! Periodic time windows for seasonal components

use std::fmt;
use std::str::FromStr;

use crate::error::DecompositionError;
use crate::model::time::{DAY, WEEK};

/// Origin of windowed repeats: the epoch plus two days, a Saturday.
pub const WINDOW_ORIGIN: i64 = 2 * DAY;

/// The period of a seasonal component and the part of a longer repeat
/// in which it applies.
///
/// An unwindowed component has a window covering its whole repeat. The
/// weekday/weekend partition uses a one week repeat with windows
/// `[0, 2 days)` and `[2 days, 7 days)` measured from [`WINDOW_ORIGIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeasonalTime {
    period: i64,
    window_repeat: i64,
    window_start: i64,
    window_end: i64,
}

impl SeasonalTime {
    /// A component which applies at all times.
    pub fn unwindowed(period: i64) -> Self {
        Self {
            period,
            window_repeat: period,
            window_start: 0,
            window_end: period,
        }
    }

    pub fn windowed(period: i64, window_repeat: i64, window_start: i64, window_end: i64) -> Self {
        Self {
            period,
            window_repeat,
            window_start,
            window_end,
        }
    }

    /// Daily component restricted to weekends.
    pub fn weekend_daily() -> Self {
        Self::windowed(DAY, WEEK, 0, 2 * DAY)
    }

    /// Daily component restricted to weekdays.
    pub fn weekday_daily() -> Self {
        Self::windowed(DAY, WEEK, 2 * DAY, WEEK)
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    pub fn window_repeat(&self) -> i64 {
        self.window_repeat
    }

    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    pub fn window_end(&self) -> i64 {
        self.window_end
    }

    pub fn window(&self) -> (i64, i64) {
        (self.window_start, self.window_end)
    }

    pub fn window_length(&self) -> i64 {
        self.window_end - self.window_start
    }

    pub fn is_windowed(&self) -> bool {
        self.window_length() < self.window_repeat
    }

    /// Fraction of the repeat covered by the window
    pub fn fraction_in_window(&self) -> f64 {
        self.window_length() as f64 / self.window_repeat as f64
    }

    /// Offset of `time` into the window repeat.
    pub fn repeat_offset(&self, time: i64) -> i64 {
        (time - WINDOW_ORIGIN).rem_euclid(self.window_repeat)
    }

    pub fn in_window(&self, time: i64) -> bool {
        let offset = self.repeat_offset(time);
        offset >= self.window_start && offset < self.window_end
    }

    /// Offset of `time` into the period, in [0, period).
    pub fn phase(&self, time: i64) -> i64 {
        (time - WINDOW_ORIGIN).rem_euclid(self.period)
    }

    /// Start of the period containing `time`.
    pub fn start_of_period(&self, time: i64) -> i64 {
        time - self.phase(time)
    }

    /// Whether the two windows overlap
    pub fn overlaps(&self, other: &SeasonalTime) -> bool {
        self.window_repeat == other.window_repeat
            && self.window_start < other.window_end
            && other.window_start < self.window_end
    }

    /// Human readable description used in annotations
    pub fn describe(&self) -> String {
        let period = match self.period {
            DAY => "daily".to_string(),
            WEEK => "weekly".to_string(),
            period => format!("period {}s", period),
        };
        if !self.is_windowed() {
            return period;
        }
        match (self.window_start, self.window_end, self.window_repeat) {
            (0, end, WEEK) if end == 2 * DAY => format!("{} (weekends)", period),
            (start, WEEK, WEEK) if start == 2 * DAY => format!("{} (weekdays)", period),
            (start, end, repeat) => format!("{} (window {}-{} of {})", period, start, end, repeat),
        }
    }
}

impl fmt::Display for SeasonalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.period, self.window_repeat, self.window_start, self.window_end
        )
    }
}

impl FromStr for SeasonalTime {
    type Err = DecompositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<i64> = s
            .split(':')
            .map(|field| field.parse::<i64>())
            .collect::<Result<_, _>>()
            .map_err(|_| DecompositionError::parse("seasonal_time", s))?;
        match fields.as_slice() {
            [period, repeat, start, end]
                if *period > 0 && *repeat > 0 && start < end && *end <= *repeat =>
            {
                Ok(Self::windowed(*period, *repeat, *start, *end))
            }
            _ => Err(DecompositionError::parse("seasonal_time", s)),
        }
    }
}
