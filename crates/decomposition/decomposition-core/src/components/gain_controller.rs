//! Gain of the additive update
//!
//! Each component is moved towards the value by a share of the total error.
//! If the sum of the component amplitudes starts to grow the update loop is
//! unstable and the gain is dropped.

use decomposition_spi::{
    floor, restore_value, DecompositionError, Result, StatePersistInserter,
    StateRestoreTraverser, WEEK,
};

use crate::checksum::Checksum;
use crate::regression::LeastSquaresRegression;
use crate::stats::MeanAccumulator;

const REGRESSION_ORIGIN_TAG: &str = "a";
const MEAN_SUM_AMPLITUDES_TAG: &str = "b";
const MEAN_SUM_AMPLITUDES_TREND_TAG: &str = "c";

const STABLE_GAIN: f64 = 3.0;
const DAMPED_GAIN: f64 = 0.8;
/// Slope of the mean sum amplitudes, relative to their mean, which counts as growth
const GROWTH_THRESHOLD: f64 = 0.01;

fn scale_time(time: i64, origin: i64) -> f64 {
    (time - origin) as f64 / WEEK as f64
}

fn sum_amplitudes(predictions: &[f64]) -> f64 {
    predictions.iter().map(|prediction| prediction.abs()).sum()
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GainController {
    regression_origin: i64,
    mean_sum_amplitudes: MeanAccumulator,
    mean_sum_amplitudes_trend: LeastSquaresRegression,
}

impl GainController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn gain(&self) -> f64 {
        if self.mean_sum_amplitudes_trend.count() > 0.0 {
            let [_, slope] = self.mean_sum_amplitudes_trend.parameters();
            if slope > GROWTH_THRESHOLD * self.mean_sum_amplitudes.mean() {
                return DAMPED_GAIN;
            }
        }
        STABLE_GAIN
    }

    /// Seed the mean amplitude from historical component predictions.
    pub fn seed(&mut self, predictions: &[f64]) {
        self.mean_sum_amplitudes.add(sum_amplitudes(predictions), 1.0);
    }

    pub fn add(&mut self, time: i64, predictions: &[f64]) {
        if predictions.is_empty() {
            return;
        }
        self.mean_sum_amplitudes.add(sum_amplitudes(predictions), 1.0);
        self.mean_sum_amplitudes_trend.add(
            scale_time(time, self.regression_origin),
            self.mean_sum_amplitudes.mean(),
            self.mean_sum_amplitudes.count(),
        );
    }

    pub fn age(&mut self, factor: f64) {
        self.mean_sum_amplitudes.age(factor);
        self.mean_sum_amplitudes_trend.age(factor);
    }

    pub fn shift_origin(&mut self, time: i64) {
        let time = floor(time, WEEK);
        if time > self.regression_origin {
            self.mean_sum_amplitudes_trend
                .shift_abscissa(-scale_time(time, self.regression_origin));
            self.regression_origin = time;
        }
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(REGRESSION_ORIGIN_TAG, &self.regression_origin.to_string());
        inserter.insert_value(MEAN_SUM_AMPLITUDES_TAG, &self.mean_sum_amplitudes.to_delimited());
        inserter.insert_value(
            MEAN_SUM_AMPLITUDES_TREND_TAG,
            &self.mean_sum_amplitudes_trend.to_delimited(),
        );
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        loop {
            match traverser.name() {
                REGRESSION_ORIGIN_TAG => self.regression_origin = restore_value(traverser)?,
                MEAN_SUM_AMPLITUDES_TAG => {
                    self.mean_sum_amplitudes = MeanAccumulator::from_delimited(traverser.value())?
                }
                MEAN_SUM_AMPLITUDES_TREND_TAG => {
                    self.mean_sum_amplitudes_trend =
                        LeastSquaresRegression::from_delimited(traverser.value())?
                }
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
            if !traverser.next() {
                break;
            }
        }
        Ok(())
    }
}

impl Checksum for GainController {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.regression_origin.checksum(seed);
        let seed = self.mean_sum_amplitudes.checksum(seed);
        self.mean_sum_amplitudes_trend.checksum(seed)
    }
}
