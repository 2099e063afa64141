//! Deterministic normal noise
//!
//! Noise is drawn from a freshly seeded generator on every call so that
//! restored states replay the same values and checksums stay stable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::stats::MeanAccumulator;

const SEED: u64 = 0;

/// `n` samples of N(0, `variance`) with their sample mean removed.
pub fn mean_zero_normal_samples(variance: f64, n: usize) -> Vec<f64> {
    if variance <= 0.0 || n == 0 {
        return vec![0.0; n];
    }
    let mut rng = StdRng::seed_from_u64(SEED);
    let sd = variance.sqrt();
    let mut samples: Vec<f64> = (0..n).map(|_| sd * standard_normal(&mut rng)).collect();
    let mean = samples.iter().sum::<f64>() / n as f64;
    if n > 1 {
        for sample in samples.iter_mut() {
            *sample -= mean;
        }
    }
    samples
}

/// Add mean zero noise with `variance` to every non-empty value.
pub fn add_mean_zero_normal_noise(variance: f64, values: &mut [MeanAccumulator]) {
    if variance <= 0.0 {
        return;
    }
    let noise = mean_zero_normal_samples(variance, values.len());
    for (value, noise) in values.iter_mut().zip(noise) {
        if !value.is_empty() {
            value.shift(noise);
        }
    }
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    // Box-Muller
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_deterministic() {
        assert_eq!(
            mean_zero_normal_samples(2.0, 10),
            mean_zero_normal_samples(2.0, 10)
        );
    }

    #[test]
    fn test_samples_have_zero_mean_and_roughly_right_variance() {
        let samples = mean_zero_normal_samples(4.0, 5000);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance = samples.iter().map(|x| x * x).sum::<f64>() / samples.len() as f64;
        assert!(mean.abs() < 1e-9);
        assert!((variance - 4.0).abs() < 0.4, "variance = {}", variance);
    }

    #[test]
    fn test_zero_variance_is_noop() {
        assert_eq!(mean_zero_normal_samples(0.0, 3), vec![0.0; 3]);
        let mut values = vec![MeanAccumulator::from_parts(1.0, 5.0)];
        add_mean_zero_normal_noise(0.0, &mut values);
        assert_eq!(values[0].mean(), 5.0);
    }

    #[test]
    fn test_empty_values_untouched() {
        let mut values = vec![MeanAccumulator::new(), MeanAccumulator::from_parts(1.0, 0.0)];
        add_mean_zero_normal_noise(1.0, &mut values);
        assert_eq!(values[0].mean(), 0.0);
        assert_eq!(values[0].count(), 0.0);
    }
}
