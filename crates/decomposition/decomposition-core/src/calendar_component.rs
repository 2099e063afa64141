//! Calendar component
//!
//! Models the profile of one calendar feature's day, e.g. the last Friday
//! of the month, as equal width buckets over the day. The knots are
//! refreshed once the feature's day has passed.

use decomposition_spi::{
    restore_value, CalendarFeature, DecompositionError, Result, StatePersistInserter,
    StateRestoreTraverser,
};

use crate::checksum::Checksum;
use crate::stats::{mean_vars_from_delimited, mean_vars_to_delimited, MeanAccumulator, MeanVarAccumulator};

const FEATURE_TAG: &str = "a";
const TIME_ZONE_OFFSET_TAG: &str = "b";
const BUCKETS_TAG: &str = "c";
const KNOTS_TAG: &str = "d";
const MEAN_VALUE_TAG: &str = "e";
const LAST_UPDATE_TAG: &str = "f";
const LAST_INTERPOLATION_TAG: &str = "g";

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarComponent {
    feature: CalendarFeature,
    time_zone_offset: i64,
    decay_rate: f64,
    buckets: Vec<MeanVarAccumulator>,
    knots: Vec<f64>,
    mean_value: f64,
    last_update: Option<i64>,
    last_interpolation: Option<i64>,
}

impl CalendarComponent {
    pub fn new(feature: CalendarFeature, time_zone_offset: i64, size: usize, decay_rate: f64) -> Self {
        Self {
            feature,
            time_zone_offset,
            decay_rate,
            buckets: vec![MeanVarAccumulator::new(); size.max(1)],
            knots: Vec::new(),
            mean_value: 0.0,
            last_update: None,
            last_interpolation: None,
        }
    }

    pub fn feature(&self) -> CalendarFeature {
        self.feature
    }

    pub fn time_zone_offset(&self) -> i64 {
        self.time_zone_offset
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn initialized(&self) -> bool {
        self.buckets.iter().any(|b| b.count() > 0.0)
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.feature, self.time_zone_offset, self.size(), self.decay_rate);
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
    }

    fn offset(&self, time: i64) -> Option<i64> {
        self.feature.offset(time + self.time_zone_offset)
    }

    pub fn in_window(&self, time: i64) -> bool {
        self.offset(time).is_some()
    }

    fn bucket_width(&self) -> f64 {
        self.feature.window() as f64 / self.size() as f64
    }

    pub fn add(&mut self, time: i64, value: f64, weight: f64) {
        let Some(offset) = self.offset(time) else {
            return;
        };
        let bucket = ((offset as f64 / self.bucket_width()) as usize).min(self.size() - 1);
        self.buckets[bucket].add(value, weight);
        self.last_update = Some(time);
    }

    /// Predicted value at `time`, zero off the feature's day.
    pub fn value(&self, time: i64) -> f64 {
        let Some(offset) = self.offset(time) else {
            return 0.0;
        };
        if self.knots.is_empty() {
            return 0.0;
        }
        let n = self.knots.len();
        let x = (offset as f64 / self.bucket_width() - 0.5).clamp(0.0, (n - 1) as f64);
        let i0 = x.floor() as usize;
        let i1 = (i0 + 1).min(n - 1);
        let fraction = x - i0 as f64;
        (1.0 - fraction) * self.knots[i0] + fraction * self.knots[i1]
    }

    pub fn mean_value(&self) -> f64 {
        self.mean_value
    }

    pub fn variance(&self, time: i64) -> f64 {
        match self.offset(time) {
            Some(offset) => {
                let bucket = ((offset as f64 / self.bucket_width()) as usize).min(self.size() - 1);
                self.buckets[bucket].variance()
            }
            None => 0.0,
        }
    }

    pub fn mean_variance(&self) -> f64 {
        let mut mean = MeanAccumulator::new();
        for bucket in &self.buckets {
            mean.add(bucket.variance(), bucket.count());
        }
        mean.mean()
    }

    /// True once the feature's day has passed since the last update.
    pub fn should_interpolate(&self, time: i64) -> bool {
        match self.last_update {
            Some(last) => {
                !self.in_window(time) && self.last_interpolation.map_or(true, |i| i < last)
            }
            None => false,
        }
    }

    pub fn interpolate(&mut self, time: i64) {
        let known: Vec<Option<f64>> = self
            .buckets
            .iter()
            .map(|b| (b.count() > 0.0).then(|| b.mean()))
            .collect();
        if known.iter().all(Option::is_none) {
            return;
        }
        let n = known.len();
        let nearest = |i: usize| -> f64 {
            (1..n)
                .flat_map(|d| [i.checked_sub(d), Some(i + d).filter(|j| *j < n)])
                .flatten()
                .find_map(|j| known[j])
                .unwrap_or(0.0)
        };
        self.knots = (0..n).map(|i| known[i].unwrap_or_else(|| nearest(i))).collect();
        self.mean_value = self.knots.iter().sum::<f64>() / n as f64;
        self.last_interpolation = Some(time);
    }

    /// Calendar components age once per month.
    pub fn propagate_forwards_by_time(&mut self, months: f64) {
        let factor = (-self.decay_rate * months).exp();
        for bucket in &mut self.buckets {
            bucket.age(factor);
        }
    }

    pub fn linear_scale(&mut self, scale: f64) {
        for bucket in &mut self.buckets {
            *bucket = MeanVarAccumulator::from_parts(
                bucket.count(),
                scale * bucket.mean(),
                scale * scale * bucket.variance(),
            );
        }
        for knot in &mut self.knots {
            *knot *= scale;
        }
        self.mean_value *= scale;
    }

    pub fn shift_level(&mut self, shift: f64) {
        for bucket in &mut self.buckets {
            if bucket.count() > 0.0 {
                *bucket = MeanVarAccumulator::from_parts(
                    bucket.count(),
                    bucket.mean() + shift,
                    bucket.variance(),
                );
            }
        }
        for knot in &mut self.knots {
            *knot += shift;
        }
        self.mean_value += shift;
    }

    pub fn is_bad(&self) -> bool {
        !(self.knots.iter().all(|k| k.is_finite())
            && self.buckets.iter().all(|b| b.mean().is_finite() && b.variance().is_finite())
            && self.mean_value.is_finite())
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.buckets.capacity() * std::mem::size_of::<MeanVarAccumulator>()
            + self.knots.capacity() * std::mem::size_of::<f64>()
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(FEATURE_TAG, &self.feature.to_delimited());
        inserter.insert_value(TIME_ZONE_OFFSET_TAG, &self.time_zone_offset.to_string());
        inserter.insert_value(BUCKETS_TAG, &mean_vars_to_delimited(&self.buckets));
        let knots = self
            .knots
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(";");
        inserter.insert_value(KNOTS_TAG, &knots);
        inserter.insert_value(MEAN_VALUE_TAG, &self.mean_value.to_string());
        if let Some(last) = self.last_update {
            inserter.insert_value(LAST_UPDATE_TAG, &last.to_string());
        }
        if let Some(last) = self.last_interpolation {
            inserter.insert_value(LAST_INTERPOLATION_TAG, &last.to_string());
        }
    }

    pub fn restore(decay_rate: f64, traverser: &mut dyn StateRestoreTraverser) -> Result<Self> {
        let mut result = Self::new(CalendarFeature::DayOfMonth(0), 0, 1, decay_rate);
        loop {
            match traverser.name() {
                FEATURE_TAG => result.feature = restore_value(traverser)?,
                TIME_ZONE_OFFSET_TAG => result.time_zone_offset = restore_value(traverser)?,
                BUCKETS_TAG => result.buckets = mean_vars_from_delimited(traverser.value())?,
                KNOTS_TAG => {
                    result.knots = if traverser.value().is_empty() {
                        Vec::new()
                    } else {
                        traverser
                            .value()
                            .split(';')
                            .map(|k| {
                                k.parse::<f64>()
                                    .map_err(|_| DecompositionError::parse(KNOTS_TAG, k))
                            })
                            .collect::<Result<_>>()?
                    }
                }
                MEAN_VALUE_TAG => result.mean_value = restore_value(traverser)?,
                LAST_UPDATE_TAG => result.last_update = Some(restore_value(traverser)?),
                LAST_INTERPOLATION_TAG => {
                    result.last_interpolation = Some(restore_value(traverser)?)
                }
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
            if !traverser.next() {
                break;
            }
        }
        if result.buckets.is_empty() {
            return Err(DecompositionError::MissingValue(BUCKETS_TAG.to_string()));
        }
        Ok(result)
    }
}

impl Checksum for CalendarComponent {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.feature.to_delimited().checksum(seed);
        let seed = self.time_zone_offset.checksum(seed);
        let seed = self.decay_rate.checksum(seed);
        let seed = self.buckets.checksum(seed);
        let seed = self.knots.checksum(seed);
        let seed = self.mean_value.checksum(seed);
        let seed = self.last_update.checksum(seed);
        self.last_interpolation.checksum(seed)
    }
}
