//! Seasonal component
//!
//! The period is split into equal width buckets. Each bucket keeps an aged
//! regression of the values which fell in it against time in weeks, plus
//! the variance of the residuals. Predictions interpolate linearly between
//! knots placed at the bucket centres; the knots are refreshed once per
//! period by [`SeasonalComponent::interpolate`].

use decomposition_spi::{
    floor, restore_value, DecompositionError, Result, SeasonalTime, StatePersistInserter,
    StateRestoreTraverser, WEEK,
};

use crate::checksum::Checksum;
use crate::regression::LeastSquaresRegression;
use crate::stats::{mean_vars_from_delimited, mean_vars_to_delimited, MeanAccumulator, MeanVarAccumulator, MinMax};

const TIME_TAG: &str = "a";
const ORIGIN_TAG: &str = "b";
const REGRESSIONS_TAG: &str = "c";
const VARIANCES_TAG: &str = "d";
const KNOTS_TAG: &str = "e";
const KNOT_TIME_TAG: &str = "f";
const MEAN_VALUE_TAG: &str = "g";
const FIRST_UPDATE_TAG: &str = "h";
const LAST_INTERPOLATION_TAG: &str = "i";

/// Fraction of the interpolated gradient used to move a value to its
/// bucket centre.
const GRADIENT_LEARN_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Knot {
    level: f64,
    slope: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeasonalComponent {
    time: SeasonalTime,
    decay_rate: f64,
    origin: i64,
    regressions: Vec<LeastSquaresRegression>,
    variances: Vec<MeanVarAccumulator>,
    knots: Vec<Knot>,
    knot_time: i64,
    mean_value: f64,
    first_update_time: Option<i64>,
    last_interpolation: i64,
}

impl SeasonalComponent {
    pub fn new(time: SeasonalTime, size: usize, decay_rate: f64) -> Self {
        let size = size.max(1);
        Self {
            time,
            decay_rate,
            origin: 0,
            regressions: vec![LeastSquaresRegression::new(); size],
            variances: vec![MeanVarAccumulator::new(); size],
            knots: Vec::new(),
            knot_time: 0,
            mean_value: 0.0,
            first_update_time: None,
            last_interpolation: 0,
        }
    }

    /// Create a component and fit it to `values`, the i'th of which is
    /// centred at `start + (i + 1/2) dt`.
    pub fn with_initial_values(
        time: SeasonalTime,
        size: usize,
        decay_rate: f64,
        start: i64,
        dt: i64,
        values: &[MeanAccumulator],
    ) -> Self {
        let mut component = Self::new(time, size, decay_rate);
        component.origin = floor(start, WEEK);
        for (i, value) in values.iter().enumerate() {
            let t = start + i as i64 * dt + dt / 2;
            if !value.is_empty() && time.in_window(t) {
                component.add(t, value.mean(), value.count());
            }
        }
        component.interpolate(start + values.len() as i64 * dt, true);
        component
    }

    pub fn time(&self) -> &SeasonalTime {
        &self.time
    }

    pub fn size(&self) -> usize {
        self.regressions.len()
    }

    pub fn initialized(&self) -> bool {
        self.regressions.iter().any(|r| r.count() > 0.0)
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.time, self.size(), self.decay_rate);
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

    fn bucket_width(&self) -> f64 {
        self.time.period() as f64 / self.size() as f64
    }

    fn bucket(&self, time: i64) -> usize {
        let index = (self.time.phase(time) as f64 / self.bucket_width()) as usize;
        index.min(self.size() - 1)
    }

    pub fn add(&mut self, time: i64, value: f64, weight: f64) {
        if !self.time.in_window(time) || weight <= 0.0 {
            return;
        }
        if !self.initialized() {
            self.origin = floor(time, WEEK);
        }
        let bucket = self.bucket(time);
        let prediction = if self.knots.is_empty() {
            self.regressions[bucket].mean_value()
        } else {
            self.value(time)
        };
        let t = self.scaled(time);
        self.variances[bucket].add(value - prediction, weight);
        let centre = self.bucket_centre(time, bucket);
        let projected = if self.knots.is_empty() || !self.time.in_window(centre) {
            value
        } else {
            value + GRADIENT_LEARN_RATE * (self.value(centre) - self.value(time))
        };
        self.regressions[bucket].add(t, projected, weight);
        self.first_update_time.get_or_insert(time);
    }

    fn bucket_centre(&self, time: i64, bucket: usize) -> i64 {
        let offset = (bucket as f64 + 0.5) * self.bucket_width() - self.time.phase(time) as f64;
        time + offset.round() as i64
    }

    /// Predicted value at `time`, zero outside the window.
    pub fn value(&self, time: i64) -> f64 {
        if self.knots.is_empty() || !self.time.in_window(time) {
            return 0.0;
        }
        let n = self.knots.len();
        let x = self.time.phase(time) as f64 / self.bucket_width() - 0.5;
        let lower = x.floor();
        let fraction = x - lower;
        let i0 = (lower as i64).rem_euclid(n as i64) as usize;
        let i1 = (i0 + 1) % n;
        let (k0, k1) = (self.knots[i0], self.knots[i1]);
        let dt = self.scaled(time) - self.scaled(self.knot_time);
        let level = (1.0 - fraction) * k0.level + fraction * k1.level;
        let slope = (1.0 - fraction) * k0.slope + fraction * k1.slope;
        level + slope * dt
    }

    pub fn mean_value(&self) -> f64 {
        self.mean_value
    }

    /// Residual variance in the bucket containing `time`.
    pub fn variance(&self, time: i64) -> f64 {
        if !self.time.in_window(time) {
            return 0.0;
        }
        self.variances[self.bucket(time)].variance()
    }

    pub fn mean_variance(&self) -> f64 {
        let mut mean = MeanAccumulator::new();
        for variance in &self.variances {
            mean.add(variance.variance(), variance.count());
        }
        mean.mean()
    }

    /// Mean slope of the knots in value per week.
    pub fn slope(&self) -> f64 {
        if self.knots.is_empty() {
            return 0.0;
        }
        self.knots.iter().map(|k| k.slope).sum::<f64>() / self.knots.len() as f64
    }

    /// Whether the bucket regressions have seen enough repeats for their
    /// slopes to be trusted.
    pub fn slope_accurate(&self, time: i64) -> bool {
        let required = 2 * WEEK.max(3 * self.time.period());
        self.first_update_time
            .map_or(false, |first| time - first >= required)
    }

    pub fn should_interpolate(&self, time: i64) -> bool {
        self.time.start_of_period(time) > self.time.start_of_period(self.last_interpolation)
    }

    /// Refresh the knots from the bucket regressions evaluated at `time`.
    /// With `refine` set empty buckets borrow from their neighbours.
    pub fn interpolate(&mut self, time: i64, refine: bool) {
        let slope_accurate = self.slope_accurate(time);
        let t = self.scaled(time);
        let mut knots: Vec<Option<Knot>> = self
            .regressions
            .iter()
            .map(|regression| {
                (regression.count() > 0.0).then(|| {
                    if slope_accurate {
                        Knot {
                            level: regression.predict(t),
                            slope: regression.parameters()[1],
                        }
                    } else {
                        Knot {
                            level: regression.mean_value(),
                            slope: 0.0,
                        }
                    }
                })
            })
            .collect();
        if refine {
            fill_from_neighbours(&mut knots);
        }
        self.knots = knots.into_iter().map(Option::unwrap_or_default).collect();
        self.knot_time = time;
        self.mean_value = self.knots.iter().map(|k| k.level).sum::<f64>() / self.knots.len() as f64;
        self.last_interpolation = time;
    }

    /// Bias of this component at the phase of `time` of a shorter period
    /// component, consistent across all repeats of the shorter period.
    pub fn delta(&self, time: i64, short_period: i64) -> f64 {
        let period = self.time.period();
        if short_period <= 0 || period <= short_period || period % short_period != 0 {
            return 0.0;
        }
        let mut range = MinMax::default();
        let mut t = time;
        while t < time + period {
            if self.time.in_window(t) {
                range.add(self.value(t) - self.mean_value);
            }
            t += short_period;
        }
        range.sign_margin()
    }

    /// Age by `exp(-decay_rate * t)`.
    pub fn propagate_forwards_by_time(&mut self, t: f64) {
        let factor = (-self.decay_rate * t).exp();
        for regression in &mut self.regressions {
            regression.age(factor);
        }
        for variance in &mut self.variances {
            variance.age(factor);
        }
    }

    pub fn shift_origin(&mut self, time: i64) {
        let time = floor(time, WEEK);
        if time > self.origin {
            let dt = -((time - self.origin) as f64) / WEEK as f64;
            for regression in &mut self.regressions {
                regression.shift_abscissa(dt);
            }
            self.origin = time;
        }
    }

    pub fn shift_level(&mut self, shift: f64) {
        for regression in &mut self.regressions {
            regression.shift_ordinate(shift);
        }
        for knot in &mut self.knots {
            knot.level += shift;
        }
        self.mean_value += shift;
    }

    /// Add `shift` to the slope leaving values at `time` unchanged.
    pub fn shift_slope(&mut self, time: i64, shift: f64) {
        let t = self.scaled(time);
        for regression in &mut self.regressions {
            regression.shift_gradient(shift);
            regression.shift_ordinate(-shift * t);
        }
        let offset = shift * (self.scaled(self.knot_time) - t);
        for knot in &mut self.knots {
            knot.level += offset;
            knot.slope += shift;
        }
        self.mean_value += offset;
    }

    pub fn linear_scale(&mut self, scale: f64) {
        for regression in &mut self.regressions {
            regression.linear_scale(scale);
        }
        for knot in &mut self.knots {
            knot.level *= scale;
            knot.slope *= scale;
        }
        self.mean_value *= scale;
    }

    pub fn is_bad(&self) -> bool {
        !(self.regressions.iter().all(LeastSquaresRegression::is_finite)
            && self
                .knots
                .iter()
                .all(|k| k.level.is_finite() && k.slope.is_finite())
            && self.mean_value.is_finite())
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.regressions.capacity() * std::mem::size_of::<LeastSquaresRegression>()
            + self.variances.capacity() * std::mem::size_of::<MeanVarAccumulator>()
            + self.knots.capacity() * std::mem::size_of::<Knot>()
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(TIME_TAG, &self.time.to_string());
        inserter.insert_value(ORIGIN_TAG, &self.origin.to_string());
        let regressions = self
            .regressions
            .iter()
            .map(LeastSquaresRegression::to_delimited)
            .collect::<Vec<_>>()
            .join(";");
        inserter.insert_value(REGRESSIONS_TAG, &regressions);
        inserter.insert_value(VARIANCES_TAG, &mean_vars_to_delimited(&self.variances));
        let knots = self
            .knots
            .iter()
            .map(|k| format!("{}:{}", k.level, k.slope))
            .collect::<Vec<_>>()
            .join(";");
        inserter.insert_value(KNOTS_TAG, &knots);
        inserter.insert_value(KNOT_TIME_TAG, &self.knot_time.to_string());
        inserter.insert_value(MEAN_VALUE_TAG, &self.mean_value.to_string());
        if let Some(first) = self.first_update_time {
            inserter.insert_value(FIRST_UPDATE_TAG, &first.to_string());
        }
        inserter.insert_value(LAST_INTERPOLATION_TAG, &self.last_interpolation.to_string());
    }

    pub fn restore(decay_rate: f64, traverser: &mut dyn StateRestoreTraverser) -> Result<Self> {
        let mut result = Self::new(SeasonalTime::unwindowed(1), 1, decay_rate);
        loop {
            match traverser.name() {
                TIME_TAG => result.time = restore_value(traverser)?,
                ORIGIN_TAG => result.origin = restore_value(traverser)?,
                REGRESSIONS_TAG => {
                    result.regressions = traverser
                        .value()
                        .split(';')
                        .map(LeastSquaresRegression::from_delimited)
                        .collect::<Result<_>>()?
                }
                VARIANCES_TAG => result.variances = mean_vars_from_delimited(traverser.value())?,
                KNOTS_TAG => result.knots = knots_from_delimited(traverser.value())?,
                KNOT_TIME_TAG => result.knot_time = restore_value(traverser)?,
                MEAN_VALUE_TAG => result.mean_value = restore_value(traverser)?,
                FIRST_UPDATE_TAG => result.first_update_time = Some(restore_value(traverser)?),
                LAST_INTERPOLATION_TAG => result.last_interpolation = restore_value(traverser)?,
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
            if !traverser.next() {
                break;
            }
        }
        if result.regressions.len() != result.variances.len()
            || !(result.knots.is_empty() || result.knots.len() == result.regressions.len())
        {
            return Err(DecompositionError::parse(
                REGRESSIONS_TAG,
                format!(
                    "{} regressions, {} variances, {} knots",
                    result.regressions.len(),
                    result.variances.len(),
                    result.knots.len()
                ),
            ));
        }
        Ok(result)
    }
}

fn fill_from_neighbours(knots: &mut [Option<Knot>]) {
    let n = knots.len();
    if knots.iter().all(Option::is_none) {
        return;
    }
    let known: Vec<Option<Knot>> = knots.to_vec();
    let find = |start: usize, step: isize| -> Knot {
        let mut i = start;
        loop {
            i = (i as isize + step).rem_euclid(n as isize) as usize;
            if let Some(knot) = known[i] {
                return knot;
            }
        }
    };
    for i in 0..n {
        if known[i].is_none() {
            let (left, right) = (find(i, -1), find(i, 1));
            knots[i] = Some(Knot {
                level: 0.5 * (left.level + right.level),
                slope: 0.5 * (left.slope + right.slope),
            });
        }
    }
}

fn knots_from_delimited(text: &str) -> Result<Vec<Knot>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(';')
        .map(|knot| {
            let (level, slope) = knot
                .split_once(':')
                .ok_or_else(|| DecompositionError::parse(KNOTS_TAG, knot))?;
            Ok(Knot {
                level: level
                    .parse()
                    .map_err(|_| DecompositionError::parse(KNOTS_TAG, knot))?,
                slope: slope
                    .parse()
                    .map_err(|_| DecompositionError::parse(KNOTS_TAG, knot))?,
            })
        })
        .collect()
}

impl Checksum for SeasonalComponent {
    fn checksum(&self, seed: u64) -> u64 {
        let mut seed = self.time.to_string().checksum(seed);
        seed = self.decay_rate.checksum(seed);
        seed = self.origin.checksum(seed);
        seed = self.regressions.checksum(seed);
        seed = self.variances.checksum(seed);
        for knot in &self.knots {
            seed = knot.slope.checksum(knot.level.checksum(seed));
        }
        seed = self.knot_time.checksum(seed);
        seed = self.mean_value.checksum(seed);
        seed = self.first_update_time.checksum(seed);
        self.last_interpolation.checksum(seed)
    }
}
