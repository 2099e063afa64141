//! Adaptive control of the decay rate from prediction errors
//!
//! Biased, persistent or growing prediction errors mean the model is too
//! slow to follow the data, so the decay rate is raised. Errors persist when
//! successive updates mostly agree on their sign, as they do when a model
//! lags a slowly changing pattern even though the errors average to zero.
//! Unbiased noisy errors, or errors which are negligible relative to the
//! values being predicted, let it relax back down. The multiplier moves geometrically by a fixed step per update and
//! is clamped to a fixed range around the configured rate.

use decomposition_spi::{
    restore_value, DecompositionError, Result, StatePersistInserter, StateRestoreTraverser, DAY,
};
use tracing::trace;

use crate::checksum::Checksum;
use crate::stats::MeanAccumulator;

const PREDICTION_MEAN_TAG: &str = "a";
const BIAS_TAG: &str = "b";
const RECENT_ABSOLUTE_ERROR_TAG: &str = "c";
const HISTORICAL_ABSOLUTE_ERROR_TAG: &str = "d";
const MULTIPLIER_TAG: &str = "e";
const SAME_SIGN_TAG: &str = "f";
const ABSOLUTE_MEAN_ERROR_TAG: &str = "g";
const LAST_MEAN_ERROR_TAG: &str = "h";

const MINIMUM_MULTIPLIER: f64 = 0.25;
const MAXIMUM_MULTIPLIER: f64 = 40.0;
const STEP: f64 = 1.05;
/// Errors below this multiple of the mean prediction are treated as zero
const MINIMUM_COV_TO_CONTROL: f64 = 1e-5;
const MINIMUM_COUNT_TO_CONTROL: f64 = 10.0;
const BIAS_TO_INCREASE: f64 = 0.5;
const BIAS_TO_DECREASE: f64 = 0.2;
const ERROR_INCREASE_TO_INCREASE: f64 = 1.2;
/// Fraction of updates whose mean error keeps its sign
const SAME_SIGN_TO_INCREASE: f64 = 0.8;
/// Mean error magnitude, relative to the absolute error, for sign persistence to count
const SYSTEMATIC_ERROR_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayRateController {
    prediction_mean: MeanAccumulator,
    bias: MeanAccumulator,
    recent_absolute_error: MeanAccumulator,
    historical_absolute_error: MeanAccumulator,
    same_sign: MeanAccumulator,
    absolute_mean_error: MeanAccumulator,
    last_mean_error: Option<f64>,
    multiplier: f64,
}

impl Default for DecayRateController {
    fn default() -> Self {
        Self {
            prediction_mean: MeanAccumulator::new(),
            bias: MeanAccumulator::new(),
            recent_absolute_error: MeanAccumulator::new(),
            historical_absolute_error: MeanAccumulator::new(),
            same_sign: MeanAccumulator::new(),
            absolute_mean_error: MeanAccumulator::new(),
            last_mean_error: None,
            multiplier: 1.0,
        }
    }
}

impl DecayRateController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The product of every factor returned so far.
    pub fn cumulative_multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Update with the latest `prediction` and its `errors` and return the
    /// factor by which to scale the current decay rate.
    pub fn multiplier(
        &mut self,
        prediction: f64,
        errors: &[f64],
        bucket_length: i64,
        learn_rate: f64,
        decay_rate: f64,
    ) -> f64 {
        if errors.is_empty() {
            return 1.0;
        }

        let bucket = bucket_length as f64 / DAY as f64;
        self.prediction_mean.age((-decay_rate * bucket).exp());
        let recent = (-learn_rate * bucket / 2.0).exp();
        self.bias.age(recent);
        self.recent_absolute_error.age(recent);
        self.same_sign.age(recent);
        self.absolute_mean_error.age(recent);
        self.historical_absolute_error
            .age((-learn_rate * bucket / 8.0).exp());

        self.prediction_mean.add(prediction.abs(), 1.0);
        let weight = 1.0 / errors.len() as f64;
        for error in errors {
            self.bias.add(*error, weight);
            self.recent_absolute_error.add(error.abs(), weight);
            self.historical_absolute_error.add(error.abs(), weight);
        }
        let mean_error = errors.iter().sum::<f64>() * weight;
        if let Some(last) = self.last_mean_error {
            self.same_sign
                .add(if mean_error * last > 0.0 { 1.0 } else { 0.0 }, 1.0);
        }
        self.absolute_mean_error.add(mean_error.abs(), 1.0);
        self.last_mean_error = Some(mean_error);

        if self.recent_absolute_error.count() < MINIMUM_COUNT_TO_CONTROL {
            return 1.0;
        }

        let old = self.multiplier;
        let step = self.step();
        self.multiplier = (old * step).clamp(MINIMUM_MULTIPLIER, MAXIMUM_MULTIPLIER);
        if self.multiplier != old {
            trace!(multiplier = self.multiplier, "Decay rate multiplier changed");
        }
        self.multiplier / old
    }

    fn step(&self) -> f64 {
        let error = self.recent_absolute_error.mean();
        let scale = self.prediction_mean.mean().abs();
        if error <= MINIMUM_COV_TO_CONTROL * scale {
            return 1.0 / STEP;
        }
        let bias = self.bias.mean().abs();
        if bias > BIAS_TO_INCREASE * error {
            return STEP;
        }
        if self.same_sign.count() >= MINIMUM_COUNT_TO_CONTROL
            && self.same_sign.mean() > SAME_SIGN_TO_INCREASE
            && self.absolute_mean_error.mean() > SYSTEMATIC_ERROR_FRACTION * error
        {
            return STEP;
        }
        if self.historical_absolute_error.count() >= MINIMUM_COUNT_TO_CONTROL
            && error > ERROR_INCREASE_TO_INCREASE * self.historical_absolute_error.mean()
        {
            return STEP;
        }
        if bias < BIAS_TO_DECREASE * error {
            return 1.0 / STEP;
        }
        1.0
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(PREDICTION_MEAN_TAG, &self.prediction_mean.to_delimited());
        inserter.insert_value(BIAS_TAG, &self.bias.to_delimited());
        inserter.insert_value(
            RECENT_ABSOLUTE_ERROR_TAG,
            &self.recent_absolute_error.to_delimited(),
        );
        inserter.insert_value(
            HISTORICAL_ABSOLUTE_ERROR_TAG,
            &self.historical_absolute_error.to_delimited(),
        );
        inserter.insert_value(MULTIPLIER_TAG, &self.multiplier.to_string());
        inserter.insert_value(SAME_SIGN_TAG, &self.same_sign.to_delimited());
        inserter.insert_value(
            ABSOLUTE_MEAN_ERROR_TAG,
            &self.absolute_mean_error.to_delimited(),
        );
        if let Some(last) = self.last_mean_error {
            inserter.insert_value(LAST_MEAN_ERROR_TAG, &last.to_string());
        }
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        loop {
            match traverser.name() {
                PREDICTION_MEAN_TAG => {
                    self.prediction_mean = MeanAccumulator::from_delimited(traverser.value())?
                }
                BIAS_TAG => self.bias = MeanAccumulator::from_delimited(traverser.value())?,
                RECENT_ABSOLUTE_ERROR_TAG => {
                    self.recent_absolute_error = MeanAccumulator::from_delimited(traverser.value())?
                }
                HISTORICAL_ABSOLUTE_ERROR_TAG => {
                    self.historical_absolute_error =
                        MeanAccumulator::from_delimited(traverser.value())?
                }
                MULTIPLIER_TAG => self.multiplier = restore_value(traverser)?,
                SAME_SIGN_TAG => self.same_sign = MeanAccumulator::from_delimited(traverser.value())?,
                ABSOLUTE_MEAN_ERROR_TAG => {
                    self.absolute_mean_error = MeanAccumulator::from_delimited(traverser.value())?
                }
                LAST_MEAN_ERROR_TAG => self.last_mean_error = Some(restore_value(traverser)?),
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

impl Checksum for DecayRateController {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.prediction_mean.checksum(seed);
        let seed = self.bias.checksum(seed);
        let seed = self.recent_absolute_error.checksum(seed);
        let seed = self.historical_absolute_error.checksum(seed);
        let seed = self.same_sign.checksum(seed);
        let seed = self.absolute_mean_error.checksum(seed);
        let seed = self.last_mean_error.checksum(seed);
        self.multiplier.checksum(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::StateTree;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    const HOURLY: i64 = 3600;
    const DECAY_RATE: f64 = 0.0005;

    fn uniform_inputs(n: usize) -> Vec<(f64, f64)> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| (rng.gen_range(1000.0..1010.0), rng.gen_range(-2.0..6.0)))
            .collect()
    }

    #[test]
    fn test_small_biased_errors_then_negligible_errors() {
        let mut controller = DecayRateController::new();

        let mut decay_rate = DECAY_RATE;
        for _ in 0..1000 {
            decay_rate *= controller.multiplier(10000.0, &[1.0], HOURLY, 1.0, DECAY_RATE);
        }
        assert!(decay_rate > DECAY_RATE, "decay_rate = {}", decay_rate);
        assert_eq!(controller.cumulative_multiplier(), MAXIMUM_MULTIPLIER);

        for _ in 0..1000 {
            decay_rate *= controller.multiplier(10000.0, &[0.0], HOURLY, 1.0, DECAY_RATE);
        }
        assert!(decay_rate < DECAY_RATE, "decay_rate = {}", decay_rate);
    }

    #[test]
    fn test_ordered_unbiased_errors_do_not_increase() {
        let mut controller = DecayRateController::new();

        let mut decay_rate = DECAY_RATE;
        let mut errors = Vec::new();
        for _ in 0..200 {
            errors.extend((0..100).map(|j| (j - 50) as f64));
            decay_rate *= controller.multiplier(100.0, &errors, HOURLY, 1.0, DECAY_RATE);
        }
        assert!(decay_rate <= DECAY_RATE, "decay_rate = {}", decay_rate);
    }

    #[test]
    fn test_persistent_unbiased_errors_increase() {
        // A model lagging a daily cycle makes errors which average to zero
        // but keep their sign for hours at a time.
        let mut controller = DecayRateController::new();
        let mut decay_rate = DECAY_RATE;
        for i in 0..500 {
            let error = 5.0 * (2.0 * PI * i as f64 / 48.0).sin();
            decay_rate *= controller.multiplier(100.0, &[error], 1800, 1.0, DECAY_RATE);
        }
        assert_eq!(controller.cumulative_multiplier(), MAXIMUM_MULTIPLIER);
        assert!((decay_rate - MAXIMUM_MULTIPLIER * DECAY_RATE).abs() < 1e-9 * decay_rate);
    }

    #[test]
    fn test_noise_decreases() {
        let mut controller = DecayRateController::new();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..2000 {
            controller.multiplier(100.0, &[rng.gen_range(-5.0..5.0)], 1800, 1.0, DECAY_RATE);
        }
        assert!(controller.cumulative_multiplier() < 1.0, "{}", controller.cumulative_multiplier());
    }

    #[test]
    fn test_needs_history_before_controlling() {
        let mut controller = DecayRateController::new();
        for _ in 0..5 {
            assert_eq!(controller.multiplier(10.0, &[5.0], HOURLY, 1.0, DECAY_RATE), 1.0);
        }
        assert_eq!(controller.multiplier(10.0, &[], HOURLY, 1.0, DECAY_RATE), 1.0);
    }

    #[test]
    fn test_persist_round_trip() {
        let mut controller = DecayRateController::new();
        for (value, error) in uniform_inputs(1000) {
            controller.multiplier(value, &[error], HOURLY, 1.0, DECAY_RATE);
        }

        let tree = StateTree::persist(|inserter| controller.accept_persist_inserter(inserter));
        let json = tree.to_json().unwrap();
        let mut restored = DecayRateController::default();
        StateTree::from_json(&json)
            .unwrap()
            .restore(|traverser| restored.accept_restore_traverser(traverser))
            .unwrap();

        assert_eq!(restored.checksum(0), controller.checksum(0));
        assert_eq!(restored, controller);
    }

    #[test]
    fn test_same_decisions_after_restore() {
        let inputs = uniform_inputs(1000);
        let mut controller = DecayRateController::new();
        for (value, error) in &inputs[..500] {
            controller.multiplier(*value, &[*error], HOURLY, 1.0, DECAY_RATE);
        }

        let tree = StateTree::persist(|inserter| controller.accept_persist_inserter(inserter));
        let mut restored = DecayRateController::default();
        tree.restore(|traverser| restored.accept_restore_traverser(traverser))
            .unwrap();

        for (value, error) in &inputs[500..] {
            let expected = controller.multiplier(*value, &[*error], HOURLY, 1.0, DECAY_RATE);
            let actual = restored.multiplier(*value, &[*error], HOURLY, 1.0, DECAY_RATE);
            assert!((expected - actual).abs() <= 1e-5 * expected, "{} vs {}", expected, actual);
        }
    }

    #[test]
    fn test_restore_rejects_unknown_tag() {
        let tree = StateTree::persist(|inserter| inserter.insert_value("z", "1"));
        let mut restored = DecayRateController::default();
        assert!(tree
            .restore(|traverser| restored.accept_restore_traverser(traverser))
            .is_err());
    }
}
