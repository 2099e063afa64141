//! Periodicity decomposition test
//!
//! Works on a window of bucketed values from which the prediction of any
//! components the window can't resolve has been removed. After removing a
//! linear trend it greedily adds the candidate seasonality which most
//! reduces the BIC, provided an F-test says it is significant and it
//! explains a non-trivial fraction of the remaining variance. Candidates
//! are daily, weekly, the weekday/weekend split of daily and the strongest
//! autocorrelation peak at any other period.
//!
//! Every testable modelled component is refit from scratch, so the result
//! either matches what is modelled or replaces all of it.

use decomposition_spi::{SeasonalTime, DAY, WEEK};

use crate::expanding_window::ExpandingWindow;
use crate::predictor::PredictionModel;
use crate::seasonal_component::SeasonalComponent;
use crate::stats::{right_tail_f_test, MeanAccumulator};

const SIGNIFICANCE: f64 = 1e-3;
const MINIMUM_EXPLAINED_VARIANCE: f64 = 0.02;
const MINIMUM_AUTOCORRELATION: f64 = 0.3;
const MINIMUM_NUMBER_VALUES: usize = 8;
/// Parameters of the linear trend removed before testing
const TREND_PARAMETERS: usize = 2;

/// Whether a component with `time` can be tested on values with bucket
/// length `bucket_length` spanning `span`.
pub fn can_test_component(
    time: &SeasonalTime,
    bucket_length: i64,
    span: i64,
    minimum_period: i64,
    minimum_resolution: usize,
) -> bool {
    let period = time.period();
    bucket_length > 0
        && period % bucket_length == 0
        && period >= minimum_period
        && (period / bucket_length) as usize >= minimum_resolution
        && span >= 2 * period
        && (!time.is_windowed() || span >= 2 * time.window_repeat())
}

/// Interval from the start of the first to the end of the last non-empty value.
pub fn values_span(values: &[MeanAccumulator], bucket_length: i64) -> i64 {
    let first = values.iter().position(|v| !v.is_empty());
    let last = values.iter().rposition(|v| !v.is_empty());
    match (first, last) {
        (Some(first), Some(last)) => (last - first + 1) as i64 * bucket_length,
        _ => 0,
    }
}

/// Which `modelled` components the window can test.
pub fn testable_components(
    modelled: &[SeasonalTime],
    window: &ExpandingWindow,
    minimum_period: i64,
    minimum_resolution: usize,
) -> Vec<bool> {
    let span = values_span(window.values(), window.bucket_length());
    modelled
        .iter()
        .map(|time| {
            can_test_component(
                time,
                window.bucket_length(),
                span,
                minimum_period,
                minimum_resolution,
            )
        })
        .collect()
}

/// A seasonal component the test found, with its share of the window values
#[derive(Debug, Clone, PartialEq)]
pub struct NewSeasonalComponent {
    time: SeasonalTime,
    size: usize,
    initial_values: Vec<MeanAccumulator>,
}

impl NewSeasonalComponent {
    pub fn time(&self) -> &SeasonalTime {
        &self.time
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn initial_values(&self) -> &[MeanAccumulator] {
        &self.initial_values
    }

    /// Build the component fit to its initial values, the i'th of which
    /// covers `[start + i dt, start + (i + 1) dt)`.
    pub fn create(&self, decay_rate: f64, start: i64, dt: i64) -> SeasonalComponent {
        SeasonalComponent::with_initial_values(
            self.time,
            self.size,
            decay_rate,
            start,
            dt,
            &self.initial_values,
        )
    }

    pub fn annotation(&self) -> String {
        format!("Detected seasonal component: {}", self.time.describe())
    }

    pub fn memory_usage(&self) -> usize {
        SeasonalComponent::new(self.time, self.size, 0.0).memory_usage()
    }
}

/// Result of a [`SeasonalityDecompositionTest`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeasonalDecomposition {
    components: Vec<NewSeasonalComponent>,
    remove: Vec<bool>,
    trend_initial_values: Vec<MeanAccumulator>,
    start: i64,
    bucket_length: i64,
    within_bucket_variance: f64,
    changed: bool,
}

impl SeasonalDecomposition {
    pub fn components(&self) -> &[NewSeasonalComponent] {
        &self.components
    }

    /// Mask of the modelled components to remove
    pub fn remove(&self) -> &[bool] {
        &self.remove
    }

    /// Values less the new components, used to refit the trend
    pub fn trend_initial_values(&self) -> &[MeanAccumulator] {
        &self.trend_initial_values
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.start + self.trend_initial_values.len() as i64 * self.bucket_length
    }

    pub fn bucket_length(&self) -> i64 {
        self.bucket_length
    }

    pub fn within_bucket_variance(&self) -> f64 {
        self.within_bucket_variance
    }

    pub fn components_changed(&self) -> bool {
        self.changed
    }

    pub fn print(&self) -> String {
        let names: Vec<String> = self.components.iter().map(|c| c.time.describe()).collect();
        format!("[{}]", names.join(", "))
    }
}

/// Per test parameters which depend on the job and the window kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeasonalityTestParameters {
    pub base_bucket_length: i64,
    pub component_size: usize,
    pub minimum_period: i64,
    pub minimum_resolution: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    Daily,
    Weekly,
    WeekdayWeekend,
    Custom,
}

impl CandidateKind {
    fn excludes(&self, other: &CandidateKind) -> bool {
        matches!(
            (self, other),
            (Self::Daily, Self::WeekdayWeekend) | (Self::WeekdayWeekend, Self::Daily)
        ) || self == other
    }
}

struct Candidate {
    kind: CandidateKind,
    times: Vec<SeasonalTime>,
}

struct Point {
    index: usize,
    time: i64,
}

/// Profile of each of a candidate's components at every point
struct Fit {
    profiles: Vec<Vec<f64>>,
    parameters: usize,
    rss: f64,
}

#[derive(Debug, Clone)]
pub struct SeasonalityDecompositionTest {
    parameters: SeasonalityTestParameters,
    start: i64,
    bucket_length: i64,
    values: Vec<MeanAccumulator>,
    within_bucket_variance: f64,
    modelled: Vec<SeasonalTime>,
    testable: Vec<bool>,
}

impl SeasonalityDecompositionTest {
    /// Test `window` less the prediction of `preconditioner`.
    pub fn new(
        parameters: SeasonalityTestParameters,
        window: &ExpandingWindow,
        preconditioner: &PredictionModel,
        modelled: &[SeasonalTime],
        testable: &[bool],
    ) -> Self {
        Self::from_values(
            parameters,
            window.start_time(),
            window.bucket_length(),
            window.values_minus_prediction(|time| preconditioner.periodic_value(time)),
            window.within_bucket_variance(),
            modelled,
            testable,
        )
    }

    pub fn from_values(
        parameters: SeasonalityTestParameters,
        start: i64,
        bucket_length: i64,
        values: Vec<MeanAccumulator>,
        within_bucket_variance: f64,
        modelled: &[SeasonalTime],
        testable: &[bool],
    ) -> Self {
        Self {
            parameters,
            start,
            bucket_length,
            values,
            within_bucket_variance,
            modelled: modelled.to_vec(),
            testable: testable.to_vec(),
        }
    }

    pub fn decompose(&self) -> SeasonalDecomposition {
        let mut result = SeasonalDecomposition {
            components: Vec::new(),
            remove: vec![false; self.modelled.len()],
            trend_initial_values: self.values.clone(),
            start: self.start,
            bucket_length: self.bucket_length,
            within_bucket_variance: self.within_bucket_variance,
            changed: false,
        };

        let points: Vec<Point> = self
            .values
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_empty())
            .map(|(index, _)| Point {
                index,
                time: self.start + index as i64 * self.bucket_length + self.bucket_length / 2,
            })
            .collect();
        if points.len() < MINIMUM_NUMBER_VALUES {
            return result;
        }

        let mut residuals = self.detrended(&points);
        let candidates = self.candidates(&points, &residuals);

        let n = points.len() as f64;
        let mut used_parameters = TREND_PARAMETERS;
        let mut selected: Vec<(CandidateKind, SeasonalTime, Vec<f64>)> = Vec::new();
        loop {
            let rss0: f64 = residuals.iter().map(|r| r * r).sum();
            let mut best: Option<(f64, usize, Fit)> = None;
            for (c, candidate) in candidates.iter().enumerate() {
                if selected.iter().any(|(kind, _, _)| kind.excludes(&candidate.kind)) {
                    continue;
                }
                let fit = self.fit(&candidate.times, &points, &residuals);
                let df0 = fit.parameters as f64;
                let df1 = n - (used_parameters + fit.parameters) as f64;
                if fit.parameters == 0 || df1 <= 0.0 || rss0 <= 0.0 {
                    continue;
                }
                let explained = (rss0 - fit.rss) / rss0;
                let p = right_tail_f_test((rss0 - fit.rss) / df0, fit.rss / df1, df0, df1);
                let bic = n * (fit.rss / n).max(1e-300).ln()
                    + (used_parameters + fit.parameters) as f64 * n.ln();
                if p < SIGNIFICANCE
                    && explained >= MINIMUM_EXPLAINED_VARIANCE
                    && best.as_ref().map_or(true, |(best_bic, _, _)| bic < *best_bic)
                {
                    best = Some((bic, c, fit));
                }
            }
            let Some((_, c, fit)) = best else {
                break;
            };
            for profile in &fit.profiles {
                for (r, x) in residuals.iter_mut().zip(profile) {
                    *r -= x;
                }
            }
            used_parameters += fit.parameters;
            let candidate = &candidates[c];
            for (time, profile) in candidate.times.iter().zip(fit.profiles) {
                selected.push((candidate.kind, *time, profile));
            }
        }

        let modelled_testable: Vec<SeasonalTime> = self
            .modelled
            .iter()
            .zip(&self.testable)
            .filter(|(_, testable)| **testable)
            .map(|(time, _)| *time)
            .collect();
        let changed = selected.len() != modelled_testable.len()
            || selected
                .iter()
                .any(|(_, time, _)| !modelled_testable.contains(time));
        if !changed {
            return result;
        }

        result.changed = true;
        result.remove = self
            .testable
            .iter()
            .copied()
            .chain(std::iter::repeat(false))
            .take(self.modelled.len())
            .collect();
        for (_, time, profile) in selected {
            let mut initial_values = vec![MeanAccumulator::new(); self.values.len()];
            for (point, x) in points.iter().zip(&profile) {
                let count = self.values[point.index].count();
                initial_values[point.index] = MeanAccumulator::from_parts(count, *x);
                result.trend_initial_values[point.index].shift(-x);
            }
            let size = (time.period() / self.parameters.base_bucket_length.max(1)) as usize;
            result.components.push(NewSeasonalComponent {
                time,
                size: size.min(2 * self.parameters.component_size).max(2),
                initial_values,
            });
        }
        result
    }

    fn detrended(&self, points: &[Point]) -> Vec<f64> {
        let n = points.len() as f64;
        let xs: Vec<f64> = points.iter().map(|p| p.index as f64).collect();
        let ys: Vec<f64> = points.iter().map(|p| self.values[p.index].mean()).collect();
        let mx = xs.iter().sum::<f64>() / n;
        let my = ys.iter().sum::<f64>() / n;
        let sxx: f64 = xs.iter().map(|x| (x - mx) * (x - mx)).sum();
        let sxy: f64 = xs.iter().zip(&ys).map(|(x, y)| (x - mx) * (y - my)).sum();
        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        xs.iter()
            .zip(&ys)
            .map(|(x, y)| y - my - slope * (x - mx))
            .collect()
    }

    fn candidates(&self, points: &[Point], residuals: &[f64]) -> Vec<Candidate> {
        let span = values_span(&self.values, self.bucket_length);
        let mut candidates = vec![
            Candidate {
                kind: CandidateKind::Daily,
                times: vec![SeasonalTime::unwindowed(DAY)],
            },
            Candidate {
                kind: CandidateKind::Weekly,
                times: vec![SeasonalTime::unwindowed(WEEK)],
            },
            Candidate {
                kind: CandidateKind::WeekdayWeekend,
                times: vec![SeasonalTime::weekend_daily(), SeasonalTime::weekday_daily()],
            },
        ];
        if let Some(period) = self.autocorrelation_period(points, residuals) {
            candidates.push(Candidate {
                kind: CandidateKind::Custom,
                times: vec![SeasonalTime::unwindowed(period)],
            });
        }
        candidates.retain(|candidate| {
            candidate.times.iter().all(|time| {
                can_test_component(
                    time,
                    self.bucket_length,
                    span,
                    self.parameters.minimum_period,
                    self.parameters.minimum_resolution,
                )
            })
        });
        candidates
    }

    /// The period of the highest autocorrelation peak other than a day or a week.
    fn autocorrelation_period(&self, points: &[Point], residuals: &[f64]) -> Option<i64> {
        let length = self.values.len();
        let mut series = vec![None; length];
        for (point, r) in points.iter().zip(residuals) {
            series[point.index] = Some(*r);
        }
        let variance = residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64;
        if variance <= 0.0 {
            return None;
        }
        let shortest = (self.parameters.minimum_period + self.bucket_length - 1) / self.bucket_length;
        let min_lag = (shortest.max(2) as usize).max(self.parameters.minimum_resolution);
        let max_lag = length / 2;
        if min_lag > max_lag {
            return None;
        }
        let acf: Vec<f64> = (0..=max_lag + 1)
            .map(|lag| {
                if lag < min_lag.saturating_sub(1) || lag >= length {
                    return 0.0;
                }
                let mut sum = MeanAccumulator::new();
                for i in 0..length - lag {
                    if let (Some(a), Some(b)) = (series[i], series[i + lag]) {
                        sum.add(a * b, 1.0);
                    }
                }
                if sum.count() < (points.len() / 4) as f64 {
                    0.0
                } else {
                    sum.mean() / variance
                }
            })
            .collect();
        let peaks: Vec<usize> = (min_lag..=max_lag)
            .filter(|&lag| {
                let period = lag as i64 * self.bucket_length;
                period != DAY && period != WEEK
            })
            .filter(|&lag| acf[lag] >= acf[lag - 1] && acf[lag] >= acf[lag + 1])
            .filter(|&lag| acf[lag] >= MINIMUM_AUTOCORRELATION)
            .collect();
        let highest = peaks.iter().map(|&lag| acf[lag]).fold(f64::MIN, f64::max);
        // Multiples of the period are peaks too, so prefer the shortest near the top.
        peaks
            .into_iter()
            .find(|&lag| acf[lag] >= 0.9 * highest)
            .map(|lag| lag as i64 * self.bucket_length)
    }

    /// Fit the mean of `residuals` at each phase of each of `times`.
    fn fit(&self, times: &[SeasonalTime], points: &[Point], residuals: &[f64]) -> Fit {
        let mut profiles = Vec::with_capacity(times.len());
        let mut parameters = 0;
        for time in times {
            let groups = (time.period() / self.bucket_length).max(1) as usize;
            let mut means = vec![MeanAccumulator::new(); groups];
            let key = |t: i64| ((time.phase(t) / self.bucket_length) as usize).min(groups - 1);
            for (point, r) in points.iter().zip(residuals) {
                if time.in_window(point.time) {
                    means[key(point.time)].add(*r, 1.0);
                }
            }
            parameters += means.iter().filter(|m| !m.is_empty()).count();
            profiles.push(
                points
                    .iter()
                    .map(|point| {
                        if time.in_window(point.time) {
                            means[key(point.time)].mean()
                        } else {
                            0.0
                        }
                    })
                    .collect::<Vec<f64>>(),
            );
        }
        let rss = residuals
            .iter()
            .enumerate()
            .map(|(j, r)| {
                let fitted: f64 = profiles.iter().map(|profile| profile[j]).sum();
                (r - fitted) * (r - fitted)
            })
            .sum();
        Fit {
            profiles,
            parameters,
            rss,
        }
    }
}
