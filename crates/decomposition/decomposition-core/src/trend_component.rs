//! Trend component
//!
//! A straight line fitted by aged weighted least squares. Time is measured
//! in weeks from an origin which is advanced periodically so the fit stays
//! well conditioned. Slopes throughout the crate are in value per week.

use decomposition_spi::{
    floor, restore_value, DecompositionError, Result, StatePersistInserter,
    StateRestoreTraverser, DAY, WEEK,
};

use crate::checksum::Checksum;
use crate::regression::LeastSquaresRegression;
use crate::stats::MeanVarAccumulator;

const ORIGIN_TAG: &str = "a";
const REGRESSION_TAG: &str = "b";
const PREDICTION_ERROR_TAG: &str = "c";
const FIRST_UPDATE_TAG: &str = "d";
const LAST_UPDATE_TAG: &str = "e";

#[derive(Debug, Clone, PartialEq)]
pub struct TrendComponent {
    decay_rate: f64,
    origin: i64,
    regression: LeastSquaresRegression,
    prediction_error: MeanVarAccumulator,
    first_update_time: Option<i64>,
    last_update_time: Option<i64>,
}

impl TrendComponent {
    pub fn new(decay_rate: f64) -> Self {
        Self {
            decay_rate,
            origin: 0,
            regression: LeastSquaresRegression::new(),
            prediction_error: MeanVarAccumulator::new(),
            first_update_time: None,
            last_update_time: None,
        }
    }

    pub fn initialized(&self) -> bool {
        self.regression.count() > 0.0
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.decay_rate);
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
    }

    fn scaled(&self, time: i64) -> f64 {
        (time - self.origin) as f64 / WEEK as f64
    }

    pub fn add(&mut self, time: i64, value: f64, weight: f64) {
        if !self.initialized() {
            self.origin = floor(time, WEEK);
        } else {
            let error = value - self.value(time);
            self.prediction_error.add(error, weight);
        }
        let t = self.scaled(time);
        self.regression.add(t, value, weight);
        self.first_update_time.get_or_insert(time);
        self.last_update_time = Some(self.last_update_time.map_or(time, |last| last.max(time)));
    }

    /// Predicted value at `time`.
    pub fn value(&self, time: i64) -> f64 {
        if !self.initialized() {
            return 0.0;
        }
        self.regression.predict(self.scaled(time))
    }

    /// The level ignoring slope, i.e. the weighted mean of the fitted values.
    pub fn level(&self) -> f64 {
        self.regression.mean_value()
    }

    /// Number of parameters in the fitted model.
    pub fn parameters(&self) -> usize {
        self.regression.parameters().len()
    }

    pub fn slope(&self) -> f64 {
        self.regression.parameters()[1]
    }

    pub fn variance(&self) -> f64 {
        self.prediction_error.variance()
    }

    /// Interval spanned by the values added so far.
    pub fn observed_interval(&self) -> i64 {
        match (self.first_update_time, self.last_update_time) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        }
    }

    pub fn propagate_forwards(&mut self, start: i64, end: i64) {
        if end <= start {
            return;
        }
        let factor = (-self.decay_rate * (end - start) as f64 / DAY as f64).exp();
        self.regression.age(factor);
        self.prediction_error.age(factor);
    }

    pub fn shift_origin(&mut self, time: i64) {
        let time = floor(time, WEEK);
        if self.initialized() && time > self.origin {
            self.regression
                .shift_abscissa(-((time - self.origin) as f64) / WEEK as f64);
            self.origin = time;
        }
    }

    pub fn shift_level(&mut self, shift: f64) {
        self.regression.shift_ordinate(shift);
    }

    /// Shift the level of everything added before a change at the first of
    /// `later` samples, leaving the `(time, weight)` samples which were
    /// added after the change where they are.
    pub fn shift_level_before(&mut self, shift: f64, later: &[(i64, f64)]) {
        self.regression.shift_ordinate(shift);
        let last = self.last_update_time.unwrap_or(self.origin);
        for &(time, weight) in later {
            let age = (-self.decay_rate * (last - time).max(0) as f64 / DAY as f64).exp();
            let t = self.scaled(time);
            self.regression.shift_sample(t, -shift, weight * age);
        }
    }

    /// Add `shift` to the slope leaving the value at `time` unchanged.
    pub fn shift_slope(&mut self, time: i64, shift: f64) {
        let t = self.scaled(time);
        self.regression.shift_gradient(shift);
        self.regression.shift_ordinate(-shift * t);
    }

    pub fn linear_scale(&mut self, scale: f64) {
        self.regression.linear_scale(scale);
    }

    pub fn is_bad(&self) -> bool {
        !self.regression.is_finite()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(ORIGIN_TAG, &self.origin.to_string());
        inserter.insert_value(REGRESSION_TAG, &self.regression.to_delimited());
        inserter.insert_value(PREDICTION_ERROR_TAG, &self.prediction_error.to_delimited());
        if let Some(first) = self.first_update_time {
            inserter.insert_value(FIRST_UPDATE_TAG, &first.to_string());
        }
        if let Some(last) = self.last_update_time {
            inserter.insert_value(LAST_UPDATE_TAG, &last.to_string());
        }
    }

    pub fn restore(decay_rate: f64, traverser: &mut dyn StateRestoreTraverser) -> Result<Self> {
        let mut result = Self::new(decay_rate);
        loop {
            match traverser.name() {
                ORIGIN_TAG => result.origin = restore_value(traverser)?,
                REGRESSION_TAG => {
                    result.regression = LeastSquaresRegression::from_delimited(traverser.value())?
                }
                PREDICTION_ERROR_TAG => {
                    result.prediction_error = MeanVarAccumulator::from_delimited(traverser.value())?
                }
                FIRST_UPDATE_TAG => result.first_update_time = Some(restore_value(traverser)?),
                LAST_UPDATE_TAG => result.last_update_time = Some(restore_value(traverser)?),
                "" => {}
                other => {
                    return Err(DecompositionError::parse(other, traverser.value()));
                }
            }
            if !traverser.next() {
                break;
            }
        }
        Ok(result)
    }
}

impl Checksum for TrendComponent {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.decay_rate.checksum(seed);
        let seed = self.origin.checksum(seed);
        let seed = self.regression.checksum(seed);
        let seed = self.prediction_error.checksum(seed);
        let seed = self.first_update_time.checksum(seed);
        self.last_update_time.checksum(seed)
    }
}
