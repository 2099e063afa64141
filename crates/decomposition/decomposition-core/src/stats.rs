//! Basic weighted statistics accumulators and statistical tests
//!
//! All accumulators support exponential aging, a compact delimited text
//! form for persistence and checksums.

use decomposition_spi::{DecompositionError, Result};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::checksum::Checksum;

const DELIMITER: char = ':';
const LIST_DELIMITER: char = ';';

fn parse_fields<const N: usize>(tag: &str, text: &str) -> Result<[f64; N]> {
    let mut result = [0.0; N];
    let mut fields = text.split(DELIMITER);
    for slot in result.iter_mut() {
        *slot = fields
            .next()
            .and_then(|field| field.parse::<f64>().ok())
            .ok_or_else(|| DecompositionError::parse(tag, text))?;
    }
    if fields.next().is_some() {
        return Err(DecompositionError::parse(tag, text));
    }
    Ok(result)
}

/// Weighted running mean
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanAccumulator {
    count: f64,
    mean: f64,
}

impl MeanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(count: f64, mean: f64) -> Self {
        Self { count, mean }
    }

    pub fn add(&mut self, x: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.count += weight;
        self.mean += weight / self.count * (x - self.mean);
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn is_empty(&self) -> bool {
        self.count <= 0.0
    }

    /// Move the mean by `delta` without changing the count
    pub fn shift(&mut self, delta: f64) {
        self.mean += delta;
    }

    pub fn scale_count(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn merge(&mut self, other: &MeanAccumulator) {
        self.add(other.mean, other.count);
    }

    pub fn to_delimited(&self) -> String {
        format!("{}{}{}", self.count, DELIMITER, self.mean)
    }

    pub fn from_delimited(text: &str) -> Result<Self> {
        let [count, mean] = parse_fields::<2>("mean_accumulator", text)?;
        Ok(Self { count, mean })
    }
}

impl Checksum for MeanAccumulator {
    fn checksum(&self, seed: u64) -> u64 {
        self.mean.checksum(self.count.checksum(seed))
    }
}

/// Weighted running mean and (population) variance
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanVarAccumulator {
    count: f64,
    mean: f64,
    variance: f64,
}

impl MeanVarAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(count: f64, mean: f64, variance: f64) -> Self {
        Self {
            count,
            mean,
            variance,
        }
    }

    pub fn add(&mut self, x: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        let count = self.count + weight;
        let delta = x - self.mean;
        let mean = self.mean + weight / count * delta;
        self.variance = (self.count * self.variance + weight * delta * (x - mean)) / count;
        self.mean = mean;
        self.count = count;
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance.max(0.0)
    }

    /// Unbiased variance estimate, zero below two samples
    pub fn sample_variance(&self) -> f64 {
        if self.count > 1.0 {
            self.variance() * self.count / (self.count - 1.0)
        } else {
            0.0
        }
    }

    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn merge(&mut self, other: &MeanVarAccumulator) {
        if other.count <= 0.0 {
            return;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + other.count / count * delta;
        self.variance = (self.count * self.variance
            + other.count * other.variance
            + self.count * other.count / count * delta * delta)
            / count;
        self.mean = mean;
        self.count = count;
    }

    pub fn to_delimited(&self) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.count,
            self.mean,
            self.variance,
            d = DELIMITER
        )
    }

    pub fn from_delimited(text: &str) -> Result<Self> {
        let [count, mean, variance] = parse_fields::<3>("mean_var_accumulator", text)?;
        Ok(Self {
            count,
            mean,
            variance,
        })
    }
}

impl Checksum for MeanVarAccumulator {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.count.checksum(seed);
        self.variance.checksum(self.mean.checksum(seed))
    }
}

/// Weighted running mean of a three vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VectorMeanAccumulator {
    count: f64,
    mean: [f64; 3],
}

impl VectorMeanAccumulator {
    pub fn add(&mut self, x: [f64; 3], weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.count += weight;
        let alpha = weight / self.count;
        for (mean, x) in self.mean.iter_mut().zip(x) {
            *mean += alpha * (x - *mean);
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> [f64; 3] {
        self.mean
    }

    pub fn age(&mut self, factor: f64) {
        self.count *= factor;
    }

    pub fn to_delimited(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.count,
            self.mean[0],
            self.mean[1],
            self.mean[2],
            d = DELIMITER
        )
    }

    pub fn from_delimited(text: &str) -> Result<Self> {
        let [count, m0, m1, m2] = parse_fields::<4>("vector_mean_accumulator", text)?;
        Ok(Self {
            count,
            mean: [m0, m1, m2],
        })
    }
}

impl Checksum for VectorMeanAccumulator {
    fn checksum(&self, seed: u64) -> u64 {
        self.mean
            .iter()
            .fold(self.count.checksum(seed), |seed, x| x.checksum(seed))
    }
}

/// Running maximum which decays towards zero as it ages
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl MaxAccumulator {
    pub fn add(&mut self, x: f64) {
        self.max = Some(self.max.map_or(x, |max| max.max(x)));
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn age(&mut self, factor: f64) {
        if let Some(max) = self.max.as_mut() {
            *max *= factor;
        }
    }

    pub fn to_delimited(&self) -> String {
        self.max.map(|max| max.to_string()).unwrap_or_default()
    }

    pub fn from_delimited(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Ok(Self::default());
        }
        text.parse::<f64>()
            .map(|max| Self { max: Some(max) })
            .map_err(|_| DecompositionError::parse("max_accumulator", text))
    }
}

impl Checksum for MaxAccumulator {
    fn checksum(&self, seed: u64) -> u64 {
        self.max.checksum(seed)
    }
}

/// Minimum and maximum of a collection
#[derive(Debug, Clone, Copy, Default)]
pub struct MinMax {
    range: Option<(f64, f64)>,
}

impl MinMax {
    pub fn add(&mut self, x: f64) {
        self.range = Some(match self.range {
            Some((min, max)) => (min.min(x), max.max(x)),
            None => (x, x),
        });
    }

    /// The value of smallest magnitude if every value has the same sign,
    /// zero otherwise.
    pub fn sign_margin(&self) -> f64 {
        match self.range {
            Some((min, _)) if min > 0.0 => min,
            Some((_, max)) if max < 0.0 => max,
            _ => 0.0,
        }
    }
}

/// Persist a list of means as one delimited value.
pub fn means_to_delimited(values: &[MeanAccumulator]) -> String {
    values
        .iter()
        .map(MeanAccumulator::to_delimited)
        .collect::<Vec<_>>()
        .join(&LIST_DELIMITER.to_string())
}

pub fn means_from_delimited(text: &str) -> Result<Vec<MeanAccumulator>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(LIST_DELIMITER)
        .map(MeanAccumulator::from_delimited)
        .collect()
}

pub fn mean_vars_to_delimited(values: &[MeanVarAccumulator]) -> String {
    values
        .iter()
        .map(MeanVarAccumulator::to_delimited)
        .collect::<Vec<_>>()
        .join(&LIST_DELIMITER.to_string())
}

pub fn mean_vars_from_delimited(text: &str) -> Result<Vec<MeanVarAccumulator>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(LIST_DELIMITER)
        .map(MeanVarAccumulator::from_delimited)
        .collect()
}

/// Logistic function `1 / (1 + exp(-sign (x - x0) / width))`.
pub fn logistic(x: f64, width: f64, x0: f64, sign: f64) -> f64 {
    1.0 / (1.0 + (-sign * (x - x0) / width).exp())
}

/// Probability of observing a variance ratio no greater than `v0 / v1`
/// under the null hypothesis that both variances are equal.
pub fn left_tail_f_test(v0: f64, v1: f64, df0: f64, df1: f64) -> f64 {
    if v1 <= 0.0 {
        return 1.0;
    }
    match FisherSnedecor::new(df0, df1) {
        Ok(distribution) => distribution.cdf(v0 / v1),
        Err(_) => 1.0,
    }
}

/// Probability of observing a variance ratio at least `v0 / v1` under
/// the null hypothesis that both variances are equal.
pub fn right_tail_f_test(v0: f64, v1: f64, df0: f64, df1: f64) -> f64 {
    if v1 <= 0.0 {
        return if v0 > 0.0 { 0.0 } else { 1.0 };
    }
    match FisherSnedecor::new(df0, df1) {
        Ok(distribution) => distribution.sf(v0 / v1),
        Err(_) => 1.0,
    }
}
