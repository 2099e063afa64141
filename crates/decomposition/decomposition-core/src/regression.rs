//! Online weighted least squares straight line fit
//!
//! Keeps the weighted means of `t`, `t^2`, `y` and `t y`, so aging only
//! touches the count and the abscissa and ordinate can be shifted in
//! closed form.

use decomposition_spi::{DecompositionError, Result};

use crate::checksum::Checksum;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LeastSquaresRegression {
    count: f64,
    /// Weighted means of t, t^2, y and t y
    moments: [f64; 4],
}

impl LeastSquaresRegression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, t: f64, y: f64, weight: f64) {
        if weight <= 0.0 || !t.is_finite() || !y.is_finite() {
            return;
        }
        self.count += weight;
        let alpha = weight / self.count;
        let x = [t, t * t, y, t * y];
        for (moment, x) in self.moments.iter_mut().zip(x) {
            *moment += alpha * (x - *moment);
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    /// Weighted mean of the ordinates
    pub fn mean_value(&self) -> f64 {
        self.moments[2]
    }

    /// Intercept and slope of the best fit line.
    ///
    /// Falls back to a constant when the abscissas have no spread.
    pub fn parameters(&self) -> [f64; 2] {
        let [mt, mtt, my, mty] = self.moments;
        let variance = mtt - mt * mt;
        if self.count <= 0.0 || variance <= 1e-10 * mtt.abs().max(1.0) {
            return [my, 0.0];
        }
        let slope = (mty - mt * my) / variance;
        [my - slope * mt, slope]
    }

    pub fn predict(&self, t: f64) -> f64 {
        let [intercept, slope] = self.parameters();
        intercept + slope * t
    }

    /// Re-express the fit in terms of `t + dt`.
    pub fn shift_abscissa(&mut self, dt: f64) {
        let [mt, mtt, my, mty] = self.moments;
        self.moments = [mt + dt, mtt + 2.0 * dt * mt + dt * dt, my, mty + dt * my];
    }

    /// Add `dy` to every ordinate.
    pub fn shift_ordinate(&mut self, dy: f64) {
        self.moments[2] += dy;
        self.moments[3] += dy * self.moments[0];
    }

    /// Add `dg * t` to every ordinate.
    pub fn shift_gradient(&mut self, dg: f64) {
        self.moments[2] += dg * self.moments[0];
        self.moments[3] += dg * self.moments[1];
    }

    /// Add `dy` to the ordinate of one previously added sample.
    pub fn shift_sample(&mut self, t: f64, dy: f64, weight: f64) {
        if self.count <= 0.0 {
            return;
        }
        let alpha = weight / self.count;
        self.moments[2] += alpha * dy;
        self.moments[3] += alpha * dy * t;
    }

    /// Multiply every ordinate by `scale`.
    pub fn linear_scale(&mut self, scale: f64) {
        self.moments[2] *= scale;
        self.moments[3] *= scale;
    }

    pub fn is_finite(&self) -> bool {
        self.count.is_finite() && self.moments.iter().all(|m| m.is_finite())
    }

    pub fn to_delimited(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.count, self.moments[0], self.moments[1], self.moments[2], self.moments[3]
        )
    }

    pub fn from_delimited(text: &str) -> Result<Self> {
        let fields: Vec<f64> = text
            .split(':')
            .map(str::parse::<f64>)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| DecompositionError::parse("regression", text))?;
        match fields.as_slice() {
            [count, mt, mtt, my, mty] => Ok(Self {
                count: *count,
                moments: [*mt, *mtt, *my, *mty],
            }),
            _ => Err(DecompositionError::parse("regression", text)),
        }
    }
}

impl Checksum for LeastSquaresRegression {
    fn checksum(&self, seed: u64) -> u64 {
        self.moments
            .iter()
            .fold(self.count.checksum(seed), |seed, m| m.checksum(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fitted(intercept: f64, slope: f64) -> LeastSquaresRegression {
        let mut regression = LeastSquaresRegression::new();
        for i in 0..20 {
            let t = i as f64 * 0.5;
            regression.add(t, intercept + slope * t, 1.0);
        }
        regression
    }

    #[test]
    fn test_exact_line() {
        let regression = fitted(3.0, 2.0);
        let [a, b] = regression.parameters();
        assert!((a - 3.0).abs() < 1e-9);
        assert!((b - 2.0).abs() < 1e-9);
        assert!((regression.predict(20.0) - 43.0).abs() < 1e-8);
    }

    #[test]
    fn test_single_abscissa_falls_back_to_mean() {
        let mut regression = LeastSquaresRegression::new();
        regression.add(1.0, 2.0, 1.0);
        regression.add(1.0, 4.0, 1.0);
        assert_eq!(regression.parameters(), [3.0, 0.0]);
    }

    #[test]
    fn test_shift_abscissa_preserves_predictions() {
        let mut regression = fitted(1.0, -0.5);
        let before = regression.predict(4.0);
        regression.shift_abscissa(-2.0);
        assert!((regression.predict(2.0) - before).abs() < 1e-9);
    }

    #[test]
    fn test_shift_ordinate_and_gradient() {
        let mut regression = fitted(1.0, 1.0);
        regression.shift_ordinate(5.0);
        regression.shift_gradient(0.5);
        let [a, b] = regression.parameters();
        assert!((a - 6.0).abs() < 1e-9);
        assert!((b - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_shift_sample_undoes_one_point() {
        let mut regression = LeastSquaresRegression::new();
        regression.add(0.0, 1.0, 1.0);
        regression.add(1.0, 1.0, 1.0);
        regression.add(2.0, 11.0, 1.0);
        regression.shift_sample(2.0, -10.0, 1.0);
        let [a, b] = regression.parameters();
        assert!((a - 1.0).abs() < 1e-9);
        assert!(b.abs() < 1e-9);
    }

    #[test]
    fn test_linear_scale() {
        let mut regression = fitted(2.0, 1.0);
        regression.linear_scale(2.0);
        let [a, b] = regression.parameters();
        assert!((a - 4.0).abs() < 1e-9);
        assert!((b - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_aging_keeps_fit() {
        let mut regression = fitted(2.0, 1.0);
        regression.age(0.1);
        assert!((regression.count() - 2.0).abs() < 1e-9);
        assert!((regression.predict(1.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_ignores_non_finite() {
        let mut regression = fitted(2.0, 1.0);
        let count = regression.count();
        regression.add(1.0, f64::NAN, 1.0);
        assert_eq!(regression.count(), count);
        assert!(regression.is_finite());
    }

    #[test]
    fn test_delimited_round_trip() {
        let regression = fitted(0.1, 1.0 / 3.0);
        let text = regression.to_delimited();
        let restored = LeastSquaresRegression::from_delimited(&text).unwrap();
        assert_eq!(restored, regression);
        assert!(LeastSquaresRegression::from_delimited("1:2").is_err());
    }
}
