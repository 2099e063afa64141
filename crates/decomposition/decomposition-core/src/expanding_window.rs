//! Expanding window of bucketed values
//!
//! A fixed number of buckets whose length steps through a ladder of
//! increasing bucket lengths. When a value arrives past the end of the
//! window the buckets are merged into the next, longer, bucket length so
//! the window covers a longer interval at lower resolution. Once the
//! longest bucket length fills up the window restarts at the shortest.
//! The start is aligned to the longest bucket length so merged buckets
//! never straddle two coarser buckets.

use decomposition_spi::{
    floor, restore_value, DecompositionError, Result, StatePersistInserter,
    StateRestoreTraverser,
};

use crate::checksum::Checksum;
use crate::stats::{
    mean_vars_from_delimited, mean_vars_to_delimited, means_from_delimited, means_to_delimited,
    MeanAccumulator, MeanVarAccumulator,
};

const INDEX_TAG: &str = "a";
const START_TAG: &str = "b";
const VALUES_TAG: &str = "c";
const RESIDUALS_TAG: &str = "d";

/// Predictions are averaged over at most this many points per bucket.
const MAXIMUM_PREDICTION_SAMPLES: i64 = 48;

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandingWindow {
    base_bucket_length: i64,
    bucket_lengths: &'static [i64],
    index: usize,
    size: usize,
    decay_rate: f64,
    start: i64,
    values: Vec<MeanAccumulator>,
    residuals: Vec<MeanVarAccumulator>,
}

impl ExpandingWindow {
    pub fn new(
        base_bucket_length: i64,
        bucket_lengths: &'static [i64],
        size: usize,
        decay_rate: f64,
    ) -> Self {
        Self {
            base_bucket_length,
            bucket_lengths,
            index: 0,
            size: size.max(1),
            decay_rate,
            start: 0,
            values: vec![MeanAccumulator::new(); size.max(1)],
            residuals: vec![MeanVarAccumulator::new(); size.max(1)],
        }
    }

    /// Reset the window to start at `time`.
    pub fn initialize(&mut self, time: i64) {
        self.index = 0;
        self.start = time;
        self.clear_buckets();
    }

    fn clear_buckets(&mut self) {
        self.values.iter_mut().for_each(|v| *v = MeanAccumulator::new());
        self.residuals.iter_mut().for_each(|r| *r = MeanVarAccumulator::new());
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bucket_length(&self) -> i64 {
        self.bucket_lengths
            .get(self.index)
            .copied()
            .unwrap_or(self.base_bucket_length)
    }

    pub fn max_bucket_length(&self) -> i64 {
        self.bucket_lengths
            .last()
            .copied()
            .unwrap_or(self.base_bucket_length)
    }

    pub fn base_bucket_length(&self) -> i64 {
        self.base_bucket_length
    }

    /// Whether the window has already been through a shorter bucket length
    pub fn have_shorter_windows(&self) -> bool {
        self.index > 0
    }

    pub fn start_time(&self) -> i64 {
        self.start
    }

    pub fn end_time(&self) -> i64 {
        self.start + self.size as i64 * self.bucket_length()
    }

    /// Start of the first bucket holding a value
    pub fn begin_values_time(&self) -> i64 {
        let first = self.values.iter().position(|v| !v.is_empty()).unwrap_or(0);
        self.start + first as i64 * self.bucket_length()
    }

    pub fn need_to_compress(&self, time: i64) -> bool {
        time >= self.end_time()
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
    }

    pub fn add(&mut self, time: i64, value: f64, prediction: f64, weight: f64) {
        if time < self.start || weight <= 0.0 {
            return;
        }
        while self.need_to_compress(time) {
            if self.index + 1 < self.bucket_lengths.len() {
                self.compress();
            } else {
                self.index = 0;
                self.start = floor(time, self.max_bucket_length());
                self.clear_buckets();
            }
        }
        let bucket = ((time - self.start) / self.bucket_length()) as usize;
        if let (Some(v), Some(r)) = (self.values.get_mut(bucket), self.residuals.get_mut(bucket)) {
            v.add(value, weight);
            r.add(value - prediction, weight);
        }
    }

    fn compress(&mut self) {
        let from = self.bucket_length();
        self.index += 1;
        let to = self.bucket_length();
        let mut values = vec![MeanAccumulator::new(); self.size];
        let mut residuals = vec![MeanVarAccumulator::new(); self.size];
        for i in 0..self.size {
            let j = (i as i64 * from / to) as usize;
            values[j].merge(&self.values[i]);
            residuals[j].merge(&self.residuals[i]);
        }
        self.values = values;
        self.residuals = residuals;
    }

    /// Raw bucket means
    pub fn values(&self) -> &[MeanAccumulator] {
        &self.values
    }

    /// Bucket means minus `predictor` averaged over each bucket.
    pub fn values_minus_prediction(&self, predictor: impl Fn(i64) -> f64) -> Vec<MeanAccumulator> {
        let length = self.bucket_length();
        let samples = (length / self.base_bucket_length.max(1)).clamp(1, MAXIMUM_PREDICTION_SAMPLES);
        let step = length / samples;
        self.values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                if value.is_empty() {
                    return *value;
                }
                let bucket_start = self.start + i as i64 * length;
                let prediction = (0..samples)
                    .map(|k| predictor(bucket_start + k * step + step / 2))
                    .sum::<f64>()
                    / samples as f64;
                MeanAccumulator::from_parts(value.count(), value.mean() - prediction)
            })
            .collect()
    }

    /// Count weighted mean of the residual variance inside each bucket.
    pub fn within_bucket_variance(&self) -> f64 {
        let mut result = MeanAccumulator::new();
        for residual in &self.residuals {
            result.add(residual.variance(), residual.count());
        }
        result.mean()
    }

    /// Relabel every bucket by `shift`.
    pub fn shift_time(&mut self, shift: i64) {
        self.start += shift;
    }

    pub fn propagate_forwards_by_time(&mut self, time: f64) {
        let factor = (-self.decay_rate * time).exp();
        self.values.iter_mut().for_each(|v| v.age(factor));
        self.residuals.iter_mut().for_each(|r| r.age(factor));
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.values.capacity() * std::mem::size_of::<MeanAccumulator>()
            + self.residuals.capacity() * std::mem::size_of::<MeanVarAccumulator>()
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(INDEX_TAG, &self.index.to_string());
        inserter.insert_value(START_TAG, &self.start.to_string());
        inserter.insert_value(VALUES_TAG, &means_to_delimited(&self.values));
        inserter.insert_value(RESIDUALS_TAG, &mean_vars_to_delimited(&self.residuals));
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        loop {
            match traverser.name() {
                INDEX_TAG => {
                    let index: usize = restore_value(traverser)?;
                    if index >= self.bucket_lengths.len().max(1) {
                        return Err(DecompositionError::parse(INDEX_TAG, traverser.value()));
                    }
                    self.index = index;
                }
                START_TAG => self.start = restore_value(traverser)?,
                VALUES_TAG => {
                    let values = means_from_delimited(traverser.value())?;
                    if values.len() != self.size {
                        return Err(DecompositionError::parse(VALUES_TAG, traverser.value()));
                    }
                    self.values = values;
                }
                RESIDUALS_TAG => {
                    let residuals = mean_vars_from_delimited(traverser.value())?;
                    if residuals.len() != self.size {
                        return Err(DecompositionError::parse(RESIDUALS_TAG, traverser.value()));
                    }
                    self.residuals = residuals;
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

impl Checksum for ExpandingWindow {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.index.checksum(seed);
        let seed = self.start.checksum(seed);
        let seed = self.values.checksum(seed);
        self.residuals.checksum(seed)
    }
}
