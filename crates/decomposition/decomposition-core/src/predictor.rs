//! Owned snapshots of the additive model used for prediction
//!
//! Tests which need to evaluate the model away from the current time get
//! a [`PredictionModel`] rather than a reference into the live components,
//! so they never hold a borrow of the handler which owns them.

use decomposition_spi::SeasonalTime;

use crate::calendar_component::CalendarComponent;
use crate::seasonal_component::SeasonalComponent;
use crate::trend_component::TrendComponent;

#[derive(Debug, Clone, Default)]
pub struct PredictionModel {
    trend: Option<TrendComponent>,
    using_trend: bool,
    seasonal: Vec<SeasonalComponent>,
    calendar: Vec<CalendarComponent>,
    time_shift: i64,
}

impl PredictionModel {
    pub fn new(
        trend: Option<TrendComponent>,
        using_trend: bool,
        seasonal: Vec<SeasonalComponent>,
        calendar: Vec<CalendarComponent>,
        time_shift: i64,
    ) -> Self {
        Self {
            trend,
            using_trend,
            seasonal,
            calendar,
            time_shift,
        }
    }

    /// Trend prediction. Until the trend earns its keep only its level is used.
    pub fn trend_value(&self, time: i64) -> f64 {
        match &self.trend {
            Some(trend) if self.using_trend => trend.value(time),
            Some(trend) => trend.level(),
            None => 0.0,
        }
    }

    /// Seasonal plus calendar prediction with an extra time shift.
    pub fn periodic_value_with_time_shift(&self, time: i64, shift: i64) -> f64 {
        let time = time + self.time_shift + shift;
        self.seasonal.iter().map(|c| c.value(time)).sum::<f64>()
            + self.calendar.iter().map(|c| c.value(time)).sum::<f64>()
    }

    pub fn periodic_value(&self, time: i64) -> f64 {
        self.periodic_value_with_time_shift(time, 0)
    }

    pub fn predict(&self, time: i64) -> f64 {
        self.trend_value(time) + self.periodic_value(time)
    }

    pub fn predict_with_time_shift(&self, time: i64, shift: i64) -> f64 {
        self.trend_value(time) + self.periodic_value_with_time_shift(time, shift)
    }

    pub fn seasonal_times(&self) -> Vec<SeasonalTime> {
        self.seasonal.iter().map(|c| *c.time()).collect()
    }

    pub fn has_seasonal(&self) -> bool {
        !self.seasonal.is_empty()
    }

    pub fn time_shift(&self) -> i64 {
        self.time_shift
    }

    /// The periodic part of the model without the seasonal components
    /// flagged in `remove`. The trend is always dropped.
    pub fn filtered(&self, remove: &[bool]) -> Self {
        let seasonal = self
            .seasonal
            .iter()
            .enumerate()
            .filter(|(i, _)| !remove.get(*i).copied().unwrap_or(false))
            .map(|(_, c)| c.clone())
            .collect();
        Self {
            trend: None,
            using_trend: false,
            seasonal,
            calendar: self.calendar.clone(),
            time_shift: self.time_shift,
        }
    }
}
