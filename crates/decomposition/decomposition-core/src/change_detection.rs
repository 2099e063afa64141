//! Change point detection
//!
//! [`TestForChange`] fits a window of bucketed values, less the current
//! prediction, with a straight line and then with every supported change
//! at every admissible split. The change with the smallest BIC is reported
//! if it beats the line by an F-test whose significance is divided by the
//! number of candidates tried. The split itself counts as a parameter.
//!
//! A committed change can be reversed. [`UndoableChange`] holds the
//! reversal and watches whether the model without the change would have
//! done clearly better since it was made.

use decomposition_spi::{
    restore_value, DecompositionError, Result, StatePersistInserter, StateRestoreTraverser,
};

use crate::calendar_component::CalendarComponent;
use crate::checksum::Checksum;
use crate::predictor::PredictionModel;
use crate::seasonal_component::SeasonalComponent;
use crate::stats::{right_tail_f_test, MeanAccumulator};
use crate::trend_component::TrendComponent;

/// Fraction of the window values treated as outliers, before scaling by occupancy.
pub const OUTLIER_FRACTION: f64 = 0.1;

const SIGNIFICANCE: f64 = 1e-3;
const MINIMUM_SEGMENT_LENGTH: usize = 3;
const TIME_SHIFTS: [i64; 8] = [-10800, -7200, -3600, -1800, 1800, 3600, 7200, 10800];
const MINIMUM_UNDO_COUNT: f64 = 6.0;
const UNDO_ERROR_RATIO: f64 = 0.5;

const KIND_TAG: &str = "a";
const AMOUNT_TAG: &str = "b";
const TIME_TAG: &str = "c";
const MAGNITUDE_TAG: &str = "d";
const SAMPLES_TAG: &str = "e";

const CHANGE_TAG: &str = "a";
const WITH_CHANGE_TAG: &str = "b";
const WITHOUT_CHANGE_TAG: &str = "c";

const DERATE_MAGNITUDE_TAG: &str = "a";

// ============================================================================
// Change points
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangeKind {
    /// Everything after the change moved by `shift`
    LevelShift { shift: f64 },
    /// Everything after the change was multiplied by `scale`
    LinearScale { scale: f64 },
    /// The seasonal pattern moved by `shift` seconds
    TimeShift { shift: i64 },
}

impl ChangeKind {
    fn code(&self) -> (u32, String) {
        match *self {
            Self::LevelShift { shift } => (0, shift.to_string()),
            Self::LinearScale { scale } => (1, scale.to_string()),
            Self::TimeShift { shift } => (2, shift.to_string()),
        }
    }

    fn from_code(code: u32, amount: &str) -> Result<Self> {
        let parse_error = || DecompositionError::parse(AMOUNT_TAG, amount);
        match code {
            0 => Ok(Self::LevelShift {
                shift: amount.parse().map_err(|_| parse_error())?,
            }),
            1 => Ok(Self::LinearScale {
                scale: amount.parse().map_err(|_| parse_error())?,
            }),
            2 => Ok(Self::TimeShift {
                shift: amount.parse().map_err(|_| parse_error())?,
            }),
            _ => Err(DecompositionError::parse(KIND_TAG, code.to_string())),
        }
    }
}

/// A detected change and what is needed to apply and reverse it
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePoint {
    kind: ChangeKind,
    time: i64,
    magnitude: f64,
    residuals: Vec<MeanAccumulator>,
    /// `(time, weight)` of the values seen after the change
    samples: Vec<(i64, f64)>,
}

impl ChangePoint {
    pub fn new(
        kind: ChangeKind,
        time: i64,
        magnitude: f64,
        residuals: Vec<MeanAccumulator>,
        samples: Vec<(i64, f64)>,
    ) -> Self {
        Self {
            kind,
            time,
            magnitude,
            residuals,
            samples,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Start of the first bucket after the change
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// Window values less the prediction with the change applied
    pub fn residuals(&self) -> &[MeanAccumulator] {
        &self.residuals
    }

    pub fn residuals_mut(&mut self) -> &mut [MeanAccumulator] {
        &mut self.residuals
    }

    pub fn samples(&self) -> &[(i64, f64)] {
        &self.samples
    }

    pub fn large_enough(&self, threshold: f64) -> bool {
        self.magnitude > threshold
    }

    pub fn long_enough(&self, time: i64, minimum_length: i64) -> bool {
        time - self.time >= minimum_length
    }

    /// Shift applied to the decomposition's time offset
    pub fn time_shift(&self) -> i64 {
        match self.kind {
            ChangeKind::TimeShift { shift } => shift,
            _ => 0,
        }
    }

    pub fn apply_to_trend(&self, trend: &mut TrendComponent) {
        match self.kind {
            ChangeKind::LevelShift { shift } => trend.shift_level_before(shift, &self.samples),
            ChangeKind::LinearScale { scale } => trend.linear_scale(scale),
            ChangeKind::TimeShift { .. } => {}
        }
    }

    /// Returns true if the component was modified.
    pub fn apply_to_seasonal(&self, component: &mut SeasonalComponent) -> bool {
        match self.kind {
            ChangeKind::LinearScale { scale } => {
                component.linear_scale(scale);
                true
            }
            ChangeKind::TimeShift { .. } => true,
            ChangeKind::LevelShift { .. } => false,
        }
    }

    /// Returns true if the component was modified.
    pub fn apply_to_calendar(&self, component: &mut CalendarComponent) -> bool {
        match self.kind {
            ChangeKind::LinearScale { scale } => {
                component.linear_scale(scale);
                true
            }
            ChangeKind::TimeShift { .. } => true,
            ChangeKind::LevelShift { .. } => false,
        }
    }

    /// Prediction `predictor` would make at `time` had this change been applied to it.
    pub fn adjust_prediction(&self, predictor: &PredictionModel, time: i64) -> f64 {
        match self.kind {
            ChangeKind::LevelShift { shift } => predictor.predict(time) + shift,
            ChangeKind::LinearScale { scale } => scale * predictor.predict(time),
            ChangeKind::TimeShift { shift } => predictor.predict_with_time_shift(time, shift),
        }
    }

    /// The change which undoes this one.
    pub fn reversed(&self) -> ChangePoint {
        let kind = match self.kind {
            ChangeKind::LevelShift { shift } => ChangeKind::LevelShift { shift: -shift },
            ChangeKind::LinearScale { scale } => ChangeKind::LinearScale { scale: 1.0 / scale },
            ChangeKind::TimeShift { shift } => ChangeKind::TimeShift { shift: -shift },
        };
        ChangePoint {
            kind,
            time: self.time,
            magnitude: self.magnitude,
            residuals: Vec::new(),
            samples: self.samples.clone(),
        }
    }

    pub fn undoable(&self) -> UndoableChange {
        UndoableChange::new(self.reversed())
    }

    pub fn outlier_weight_derate(&self) -> OutlierWeightDerate {
        OutlierWeightDerate::new(self.magnitude)
    }

    pub fn print(&self) -> String {
        match self.kind {
            ChangeKind::LevelShift { shift } => format!("level shift by {}", shift),
            ChangeKind::LinearScale { scale } => format!("linear scale by {}", scale),
            ChangeKind::TimeShift { shift } => format!("time shift by {}s", shift),
        }
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        let (code, amount) = self.kind.code();
        inserter.insert_value(KIND_TAG, &code.to_string());
        inserter.insert_value(AMOUNT_TAG, &amount);
        inserter.insert_value(TIME_TAG, &self.time.to_string());
        inserter.insert_value(MAGNITUDE_TAG, &self.magnitude.to_string());
        let samples = self
            .samples
            .iter()
            .map(|(time, weight)| format!("{}:{}", time, weight))
            .collect::<Vec<_>>()
            .join(";");
        inserter.insert_value(SAMPLES_TAG, &samples);
    }

    pub fn restore(traverser: &mut dyn StateRestoreTraverser) -> Result<Self> {
        let mut code: Option<u32> = None;
        let mut amount: Option<String> = None;
        let mut time = 0;
        let mut magnitude = 0.0;
        let mut samples = Vec::new();
        loop {
            match traverser.name() {
                KIND_TAG => code = Some(restore_value(traverser)?),
                AMOUNT_TAG => amount = Some(traverser.value().to_string()),
                TIME_TAG => time = restore_value(traverser)?,
                MAGNITUDE_TAG => magnitude = restore_value(traverser)?,
                SAMPLES_TAG => samples = samples_from_delimited(traverser.value())?,
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
            if !traverser.next() {
                break;
            }
        }
        let code = code.ok_or_else(|| DecompositionError::MissingValue(KIND_TAG.to_string()))?;
        let amount =
            amount.ok_or_else(|| DecompositionError::MissingValue(AMOUNT_TAG.to_string()))?;
        Ok(Self {
            kind: ChangeKind::from_code(code, &amount)?,
            time,
            magnitude,
            residuals: Vec::new(),
            samples,
        })
    }
}

fn samples_from_delimited(text: &str) -> Result<Vec<(i64, f64)>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(';')
        .map(|sample| {
            let error = || DecompositionError::parse(SAMPLES_TAG, sample);
            let (time, weight) = sample.split_once(':').ok_or_else(error)?;
            Ok((
                time.parse().map_err(|_| error())?,
                weight.parse().map_err(|_| error())?,
            ))
        })
        .collect()
}

impl Checksum for ChangePoint {
    fn checksum(&self, seed: u64) -> u64 {
        let (code, amount) = self.kind.code();
        let seed = code.checksum(seed);
        let seed = amount.checksum(seed);
        let seed = self.time.checksum(seed);
        let seed = self.magnitude.checksum(seed);
        self.samples.checksum(seed)
    }
}

// ============================================================================
// Undo
// ============================================================================

/// A committed change on probation
#[derive(Debug, Clone, PartialEq)]
pub struct UndoableChange {
    reversal: ChangePoint,
    with_change: MeanAccumulator,
    without_change: MeanAccumulator,
}

impl UndoableChange {
    pub fn new(reversal: ChangePoint) -> Self {
        Self {
            reversal,
            with_change: MeanAccumulator::new(),
            without_change: MeanAccumulator::new(),
        }
    }

    /// Score a new value against the model with and without the change.
    pub fn add(&mut self, time: i64, value: f64, weight: f64, predictor: &PredictionModel) {
        let with_change = value - predictor.predict(time);
        let without_change = value - self.reversal.adjust_prediction(predictor, time);
        self.with_change.add(with_change * with_change, weight);
        self.without_change.add(without_change * without_change, weight);
    }

    pub fn should_undo(&self) -> bool {
        self.with_change.count() >= MINIMUM_UNDO_COUNT
            && self.without_change.mean() < UNDO_ERROR_RATIO * self.with_change.mean()
    }

    pub fn reversal(&self) -> &ChangePoint {
        &self.reversal
    }

    pub fn into_reversal(self) -> ChangePoint {
        self.reversal
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_level(CHANGE_TAG, &mut |inserter| {
            self.reversal.accept_persist_inserter(inserter)
        });
        inserter.insert_value(WITH_CHANGE_TAG, &self.with_change.to_delimited());
        inserter.insert_value(WITHOUT_CHANGE_TAG, &self.without_change.to_delimited());
    }

    pub fn restore(traverser: &mut dyn StateRestoreTraverser) -> Result<Self> {
        let mut reversal = None;
        let mut with_change = MeanAccumulator::new();
        let mut without_change = MeanAccumulator::new();
        loop {
            match traverser.name() {
                CHANGE_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    reversal = Some(ChangePoint::restore(traverser)?);
                    Ok(())
                })?,
                WITH_CHANGE_TAG => with_change = MeanAccumulator::from_delimited(traverser.value())?,
                WITHOUT_CHANGE_TAG => {
                    without_change = MeanAccumulator::from_delimited(traverser.value())?
                }
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
            if !traverser.next() {
                break;
            }
        }
        Ok(Self {
            reversal: reversal
                .ok_or_else(|| DecompositionError::MissingValue(CHANGE_TAG.to_string()))?,
            with_change,
            without_change,
        })
    }
}

impl Checksum for UndoableChange {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.reversal.checksum(seed);
        let seed = self.with_change.checksum(seed);
        self.without_change.checksum(seed)
    }
}

// ============================================================================
// Outlier weight derate
// ============================================================================

/// How far to relax outlier weighting for errors comparable to the last change
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutlierWeightDerate {
    magnitude: f64,
}

impl OutlierWeightDerate {
    pub fn new(magnitude: f64) -> Self {
        Self { magnitude }
    }

    /// Derate in [0, 1] for a prediction error of `error`.
    pub fn value(&self, error: f64) -> f64 {
        if self.magnitude <= 0.0 {
            return 0.0;
        }
        (error.abs() / self.magnitude).min(1.0)
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(DERATE_MAGNITUDE_TAG, &self.magnitude.to_string());
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        loop {
            match traverser.name() {
                DERATE_MAGNITUDE_TAG => self.magnitude = restore_value(traverser)?,
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

impl Checksum for OutlierWeightDerate {
    fn checksum(&self, seed: u64) -> u64 {
        self.magnitude.checksum(seed)
    }
}

// ============================================================================
// Test
// ============================================================================

struct Sample {
    index: usize,
    time: i64,
    value: f64,
    weight: f64,
    prediction: f64,
}

struct Fit {
    rss: f64,
    parameters: usize,
    coefficients: Vec<f64>,
    fitted: Vec<f64>,
}

struct Candidate {
    kind: ChangeKind,
    split: usize,
    magnitude: f64,
    fit: Fit,
}

/// Test a window of values for a change
pub struct TestForChange {
    test_seasonal_changes: bool,
    values_start_time: i64,
    buckets_start_time: i64,
    bucket_length: i64,
    predictor: PredictionModel,
    values: Vec<MeanAccumulator>,
    minimum_variance: f64,
    outlier_fraction: f64,
}

impl TestForChange {
    /// Create a test over `values`, the i'th of which is centred on
    /// `values_start_time + i bucket_length`. Scale and time shifts are
    /// only tested for if `test_seasonal_changes` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        test_seasonal_changes: bool,
        values_start_time: i64,
        buckets_start_time: i64,
        bucket_length: i64,
        predictor: PredictionModel,
        values: Vec<MeanAccumulator>,
        minimum_variance: f64,
        outlier_fraction: f64,
    ) -> Self {
        Self {
            test_seasonal_changes,
            values_start_time,
            buckets_start_time,
            bucket_length,
            predictor,
            values,
            minimum_variance,
            outlier_fraction,
        }
    }

    pub fn test(&self) -> Option<ChangePoint> {
        let mut samples: Vec<Sample> = self
            .values
            .iter()
            .enumerate()
            .filter(|(_, value)| value.count() > 0.0)
            .map(|(index, value)| {
                let time = self.values_start_time + index as i64 * self.bucket_length;
                Sample {
                    index,
                    time,
                    value: value.mean(),
                    weight: value.count(),
                    prediction: self.predictor.predict(time),
                }
            })
            .collect();
        if samples.len() < 2 * MINIMUM_SEGMENT_LENGTH + 2 {
            return None;
        }
        let mean_weight = samples.iter().map(|s| s.weight).sum::<f64>() / samples.len() as f64;
        for sample in &mut samples {
            sample.weight /= mean_weight;
        }

        self.remove_outliers(&mut samples);
        let n = samples.len();
        if n < 2 * MINIMUM_SEGMENT_LENGTH + 2 {
            return None;
        }

        let residuals: Vec<f64> = samples.iter().map(|s| s.value - s.prediction).collect();
        let null = self.fit_line(&samples, &residuals, None)?;
        let null_bic = self.bic(&null, n);

        let mut best: Option<(f64, Candidate)> = None;
        let mut candidates = 0usize;
        let mut consider = |candidate: Candidate| {
            candidates += 1;
            let bic = self.bic(&candidate.fit, n);
            if bic < null_bic && best.as_ref().map_or(true, |(best_bic, _)| bic < *best_bic) {
                best = Some((bic, candidate));
            }
        };

        for split in MINIMUM_SEGMENT_LENGTH..=n - MINIMUM_SEGMENT_LENGTH {
            let after = |j: usize| if j >= split { 1.0 } else { 0.0 };

            let step: Vec<f64> = (0..n).map(after).collect();
            if let Some(fit) = self.fit_line(&samples, &residuals, Some(&step)) {
                let shift = fit.coefficients[2];
                consider(Candidate {
                    kind: ChangeKind::LevelShift { shift },
                    split,
                    magnitude: shift.abs(),
                    fit,
                });
            }

            if !self.test_seasonal_changes {
                continue;
            }

            let scaled: Vec<f64> = samples
                .iter()
                .enumerate()
                .map(|(j, s)| after(j) * s.prediction)
                .collect();
            let rms_after = root_mean_square(scaled[split..].iter().copied());
            if rms_after > 0.0 {
                if let Some(fit) = self.fit_line(&samples, &residuals, Some(&scaled)) {
                    let c = fit.coefficients[2];
                    if 1.0 + c > 0.0 {
                        consider(Candidate {
                            kind: ChangeKind::LinearScale { scale: 1.0 + c },
                            split,
                            magnitude: c.abs() * rms_after,
                            fit,
                        });
                    }
                }
            }

            for shift in TIME_SHIFTS {
                let shifted: Vec<f64> = samples
                    .iter()
                    .enumerate()
                    .map(|(j, s)| {
                        if j >= split {
                            s.value - self.predictor.predict_with_time_shift(s.time, shift)
                        } else {
                            s.value - s.prediction
                        }
                    })
                    .collect();
                if let Some(mut fit) = self.fit_line(&samples, &shifted, None) {
                    fit.parameters += 1;
                    // Express the fit relative to the unshifted residuals.
                    for (j, fitted) in fit.fitted.iter_mut().enumerate() {
                        *fitted += residuals[j] - shifted[j];
                    }
                    let magnitude = root_mean_square(samples[split..].iter().map(|s| {
                        s.prediction - self.predictor.predict_with_time_shift(s.time, shift)
                    }));
                    consider(Candidate {
                        kind: ChangeKind::TimeShift { shift },
                        split,
                        magnitude,
                        fit,
                    });
                }
            }
        }

        let (_, candidate) = best?;
        let parameters = candidate.fit.parameters + 1;
        let df0 = (parameters - null.parameters) as f64;
        let df1 = n as f64 - parameters as f64;
        if df1 <= 0.0 {
            return None;
        }
        let p = right_tail_f_test(
            (null.rss - candidate.fit.rss) / df0,
            candidate.fit.rss / df1,
            df0,
            df1,
        );
        if p * candidates.max(1) as f64 >= SIGNIFICANCE {
            return None;
        }
        Some(self.change_point(&samples, &residuals, candidate))
    }

    fn change_point(&self, samples: &[Sample], residuals: &[f64], candidate: Candidate) -> ChangePoint {
        let mut change_residuals = vec![MeanAccumulator::new(); self.values.len()];
        for ((sample, residual), fitted) in samples.iter().zip(residuals).zip(&candidate.fit.fitted) {
            change_residuals[sample.index] =
                MeanAccumulator::from_parts(self.values[sample.index].count(), residual - fitted);
        }
        let first_changed = samples[candidate.split].index;
        let after: Vec<(i64, f64)> = samples[candidate.split..]
            .iter()
            .map(|s| (s.time, self.values[s.index].count()))
            .collect();
        ChangePoint::new(
            candidate.kind,
            self.buckets_start_time + first_changed as i64 * self.bucket_length,
            candidate.magnitude,
            change_residuals,
            after,
        )
    }

    /// Drop the samples which differ most from the median of their neighbours,
    /// which removes short spikes but leaves steps alone.
    fn remove_outliers(&self, samples: &mut Vec<Sample>) {
        let count = (self.outlier_fraction * samples.len() as f64).ceil() as usize;
        if count == 0 {
            return;
        }
        let residuals: Vec<f64> = samples.iter().map(|s| s.value - s.prediction).collect();
        let n = residuals.len();
        let score: Vec<f64> = (0..n)
            .map(|j| {
                let mut neighbourhood: Vec<f64> =
                    residuals[j.saturating_sub(2)..(j + 3).min(n)].to_vec();
                neighbourhood.sort_by(f64::total_cmp);
                (residuals[j] - neighbourhood[neighbourhood.len() / 2]).abs()
            })
            .collect();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| score[b].total_cmp(&score[a]));
        let mut outlier = vec![false; n];
        for &j in order.iter().take(count) {
            outlier[j] = true;
        }
        let mut j = 0;
        samples.retain(|_| {
            let keep = !outlier[j];
            j += 1;
            keep
        });
    }

    /// Weighted least squares fit of `targets` by a line in bucket index plus
    /// an optional extra regressor.
    fn fit_line(&self, samples: &[Sample], targets: &[f64], extra: Option<&[f64]>) -> Option<Fit> {
        let features = |j: usize| -> Vec<f64> {
            let x = samples[j].index as f64 / self.values.len().max(1) as f64;
            match extra {
                Some(extra) => vec![1.0, x, extra[j]],
                None => vec![1.0, x],
            }
        };
        let dimension = if extra.is_some() { 3 } else { 2 };
        let mut a = vec![vec![0.0; dimension]; dimension];
        let mut b = vec![0.0; dimension];
        for (j, sample) in samples.iter().enumerate() {
            let x = features(j);
            for r in 0..dimension {
                b[r] += sample.weight * x[r] * targets[j];
                for c in 0..dimension {
                    a[r][c] += sample.weight * x[r] * x[c];
                }
            }
        }
        let beta = solve(a, b)?;
        let fitted: Vec<f64> = (0..samples.len())
            .map(|j| features(j).iter().zip(&beta).map(|(x, b)| x * b).sum())
            .collect();
        let rss = samples
            .iter()
            .zip(targets)
            .zip(&fitted)
            .map(|((s, y), f)| s.weight * (y - f) * (y - f))
            .sum::<f64>()
            .max(self.minimum_variance * samples.len() as f64);
        Some(Fit {
            rss,
            parameters: dimension,
            coefficients: beta,
            fitted,
        })
    }

    fn bic(&self, fit: &Fit, n: usize) -> f64 {
        let n = n as f64;
        n * (fit.rss / n).max(1e-300).ln() + fit.parameters as f64 * n.ln()
    }
}

fn root_mean_square(values: impl Iterator<Item = f64>) -> f64 {
    let mut mean = MeanAccumulator::new();
    for value in values {
        mean.add(value * value, 1.0);
    }
    mean.mean().sqrt()
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    let scale = a.iter().flatten().fold(0.0_f64, |m, x| m.max(x.abs()));
    if scale == 0.0 {
        return None;
    }
    for column in 0..n {
        let pivot = (column..n).max_by(|&i, &j| a[i][column].abs().total_cmp(&a[j][column].abs()))?;
        if a[pivot][column].abs() <= 1e-12 * scale {
            return None;
        }
        a.swap(column, pivot);
        b.swap(column, pivot);
        for row in column + 1..n {
            let factor = a[row][column] / a[column][column];
            for c in column..n {
                a[row][c] -= factor * a[column][c];
            }
            b[row] -= factor * b[column];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let sum: f64 = (row + 1..n).map(|c| a[row][c] * x[c]).sum();
        x[row] = (b[row] - sum) / a[row][row];
    }
    Some(x)
}
