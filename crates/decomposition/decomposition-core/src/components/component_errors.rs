//! Prediction error statistics deciding whether a component earns its keep

use decomposition_spi::{DecompositionError, Result, WEEK};

use crate::checksum::Checksum;
use crate::stats::{MaxAccumulator, VectorMeanAccumulator};

const DELIMITER: char = '|';
const LIST_DELIMITER: char = ';';

/// Squared errors are clamped to this multiple of their running mean
const WINSORISATION_FACTOR: f64 = 36.0;
const MINIMUM_COUNT_TO_WINSORISE: f64 = 10.0;
const MAXIMUM_VARIANCE_INCREASE_TO_REMOVE: f64 = 1.2;

/// Mean squared errors of the model
///
/// 0. using only the trend,
/// 1. using every component,
/// 2. using every component except this one,
///
/// plus the largest increase in this component's share of the variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComponentErrors {
    mean_errors: VectorMeanAccumulator,
    max_variance_increase: MaxAccumulator,
}

impl ComponentErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        reference_error: f64,
        error: f64,
        prediction: f64,
        variance_increase: f64,
        weight: f64,
    ) {
        let errors = [
            reference_error * reference_error,
            error * error,
            (error + prediction) * (error + prediction),
        ];
        self.mean_errors.add(self.winsorise(errors), weight);
        self.max_variance_increase.add(variance_increase);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True if the component with `period` should be removed from a model
    /// with `bucket_length`.
    pub fn remove(&self, bucket_length: i64, period: i64) -> bool {
        let history = self.mean_errors.count() * bucket_length as f64;
        let [without_components, with_component, without_component] = self.mean_errors.mean();
        let small_variance_increase = self
            .max_variance_increase
            .max()
            .map_or(true, |max| max < MAXIMUM_VARIANCE_INCREASE_TO_REMOVE);
        (history > WEEK as f64 && with_component > without_components)
            || (history > 5.0 * period as f64
                && small_variance_increase
                && without_component <= with_component)
    }

    pub fn age(&mut self, factor: f64) {
        self.mean_errors.age(factor);
        self.max_variance_increase.age(factor);
    }

    fn winsorise(&self, errors: [f64; 3]) -> [f64; 3] {
        if self.mean_errors.count() <= MINIMUM_COUNT_TO_WINSORISE {
            return errors;
        }
        let means = self.mean_errors.mean();
        let mut result = errors;
        for (error, mean) in result.iter_mut().zip(means) {
            *error = error.min(WINSORISATION_FACTOR * mean);
        }
        result
    }

    pub fn to_delimited(&self) -> String {
        format!(
            "{}{}{}",
            self.mean_errors.to_delimited(),
            DELIMITER,
            self.max_variance_increase.to_delimited()
        )
    }

    pub fn from_delimited(text: &str) -> Result<Self> {
        let (errors, max) = text
            .split_once(DELIMITER)
            .ok_or_else(|| DecompositionError::parse("component_errors", text))?;
        Ok(Self {
            mean_errors: VectorMeanAccumulator::from_delimited(errors)?,
            max_variance_increase: MaxAccumulator::from_delimited(max)?,
        })
    }
}

impl Checksum for ComponentErrors {
    fn checksum(&self, seed: u64) -> u64 {
        self.max_variance_increase
            .checksum(self.mean_errors.checksum(seed))
    }
}

pub fn errors_to_delimited(errors: &[ComponentErrors]) -> String {
    errors
        .iter()
        .map(ComponentErrors::to_delimited)
        .collect::<Vec<_>>()
        .join(&LIST_DELIMITER.to_string())
}

pub fn errors_from_delimited(text: &str) -> Result<Vec<ComponentErrors>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(LIST_DELIMITER)
        .map(ComponentErrors::from_delimited)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use decomposition_spi::{DAY, HOUR};

    #[test]
    fn test_remove_component_which_increases_error() {
        let mut errors = ComponentErrors::new();
        for _ in 0..200 {
            errors.add(1.0, 2.0, 0.5, 1.0, 1.0);
        }
        assert!(errors.remove(HOUR, DAY));
    }

    #[test]
    fn test_keep_component_which_reduces_error() {
        let mut errors = ComponentErrors::new();
        for _ in 0..200 {
            errors.add(3.0, 1.0, 2.5, 1.5, 1.0);
        }
        assert!(!errors.remove(HOUR, DAY));
    }

    #[test]
    fn test_needs_history() {
        let mut errors = ComponentErrors::new();
        for _ in 0..100 {
            errors.add(1.0, 2.0, 0.0, 1.0, 1.0);
        }
        // 100 hours is less than a week and less than five days.
        assert!(!errors.remove(HOUR, DAY));
    }

    #[test]
    fn test_winsorises_large_errors() {
        let mut errors = ComponentErrors::new();
        for _ in 0..20 {
            errors.add(1.0, 1.0, 0.0, 1.0, 1.0);
        }
        errors.add(1000.0, 1000.0, 0.0, 1.0, 1.0);
        let [reference, ..] = errors.mean_errors.mean();
        assert!(reference < 3.0, "reference = {}", reference);
    }

    #[test]
    fn test_delimited_round_trip() {
        let mut errors = ComponentErrors::new();
        errors.add(1.0, 0.5, 0.25, 1.1, 2.0);
        let list = vec![errors, ComponentErrors::new()];
        let restored = errors_from_delimited(&errors_to_delimited(&list)).unwrap();
        assert_eq!(restored, list);
        assert!(errors_from_delimited("").unwrap().is_empty());
    }
}
