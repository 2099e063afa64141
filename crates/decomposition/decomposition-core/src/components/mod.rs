//! Components handler
//!
//! Owns the trend, seasonal and calendar components and updates them from
//! each new value. The prediction error is shared between the components in
//! window with a gain which is damped if the update loop starts to ring.
//! Reacts to detected seasonality, calendar features and change points by
//! editing its components, and decides on its own when the trend starts to
//! contribute more than its level to predictions.

mod calendar;
mod component_errors;
mod gain_controller;
mod seasonal;

pub use calendar::CalendarComponents;
pub use component_errors::ComponentErrors;
pub use gain_controller::GainController;
pub use seasonal::{CommonShift, SeasonalComponents};

use decomposition_spi::{
    restore_value, CalendarFeature, DecompositionError, Result, SeasonalTime,
    StatePersistInserter, StateRestoreTraverser, DAY,
};
use tracing::{debug, error, trace};

use crate::calendar_component::CalendarComponent;
use crate::callbacks::SharedCallbacks;
use crate::checksum::Checksum;
use crate::mediator::{Handler, Mediator};
use crate::message::{
    AddValue, DetectedCalendar, DetectedChangePoint, DetectedSeasonal, DetectedTrend, Message,
    MessageHeader,
};
use crate::predictor::PredictionModel;
use crate::sampling::add_mean_zero_normal_noise;
use crate::seasonality_decomposition::SeasonalDecomposition;
use crate::state_machine::{
    StateMachine, COMPONENTS_MACHINE, SC_ADDED_COMPONENTS, SC_DISABLED, SC_INTERPOLATED,
    SC_NEW_COMPONENTS, SC_NORMAL, SC_RESET,
};
use crate::stats::{left_tail_f_test, logistic, MeanAccumulator, MeanVarAccumulator};
use crate::trend_component::TrendComponent;

const VERSION_TAG: &str = "6.3";
const MACHINE_TAG: &str = "a";
const DECAY_RATE_TAG: &str = "b";
const TREND_TAG: &str = "c";
const SEASONAL_TAG: &str = "d";
const CALENDAR_TAG: &str = "e";
const MEAN_VARIANCE_SCALE_TAG: &str = "h";
const PREDICTION_ERROR_WITHOUT_TREND_TAG: &str = "i";
const PREDICTION_ERROR_WITH_TREND_TAG: &str = "j";
const USING_TREND_FOR_PREDICTION_TAG: &str = "k";
const GAIN_CONTROLLER_TAG: &str = "l";
const TIME_SHIFT_TAG: &str = "m";

/// Total component memory, in units of one seasonal component
pub const MAXIMUM_COMPONENTS: usize = 8;

/// Share of the error the trend must explain before it is used to predict
const MINIMUM_TREND_PROBABILITY: f64 = 0.25;
const TREND_SIGNIFICANCE: f64 = 0.001;
const MINIMUM_TREND_VARIANCE_REDUCTION: f64 = 0.6;
/// Length of history, in buckets, before the trend is tested
const MINIMUM_TREND_TEST_BUCKETS: i64 = 6;

#[derive(Debug, Clone)]
pub struct Components {
    machine: StateMachine,
    decay_rate: f64,
    bucket_length: i64,
    seasonal_component_size: usize,
    calendar_component_size: usize,
    trend: TrendComponent,
    seasonal: Option<SeasonalComponents>,
    calendar: Option<CalendarComponents>,
    gain_controller: GainController,
    mean_variance_scale: MeanAccumulator,
    prediction_error_without_trend: MeanVarAccumulator,
    prediction_error_with_trend: MeanVarAccumulator,
    using_trend_for_prediction: bool,
    /// Offset added to time before evaluating the periodic components
    time_shift: i64,
    callbacks: SharedCallbacks,
}

impl Components {
    pub fn new(
        decay_rate: f64,
        bucket_length: i64,
        seasonal_component_size: usize,
        callbacks: SharedCallbacks,
    ) -> Self {
        Self {
            machine: StateMachine::new(&COMPONENTS_MACHINE, SC_NORMAL),
            decay_rate,
            bucket_length,
            seasonal_component_size,
            calendar_component_size: (seasonal_component_size / 3).max(1),
            trend: TrendComponent::new(decay_rate),
            seasonal: None,
            calendar: None,
            gain_controller: GainController::new(),
            mean_variance_scale: MeanAccumulator::new(),
            prediction_error_without_trend: MeanVarAccumulator::new(),
            prediction_error_with_trend: MeanVarAccumulator::new(),
            using_trend_for_prediction: false,
            time_shift: 0,
            callbacks,
        }
    }

    /// A copy with no callbacks attached, for running forecasts.
    pub fn for_forecast(&self) -> Self {
        Self {
            callbacks: SharedCallbacks::new(),
            ..self.clone()
        }
    }

    pub fn state(&self) -> usize {
        self.machine.state()
    }

    pub fn callbacks(&self) -> &SharedCallbacks {
        &self.callbacks
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
        self.trend.set_decay_rate(decay_rate);
        if let Some(seasonal) = &mut self.seasonal {
            seasonal.set_decay_rate(decay_rate);
        }
        if let Some(calendar) = &mut self.calendar {
            calendar.set_decay_rate(decay_rate);
        }
    }

    pub fn trend(&self) -> &TrendComponent {
        &self.trend
    }

    pub fn seasonal(&self) -> Option<&SeasonalComponents> {
        self.seasonal.as_ref()
    }

    pub fn calendar(&self) -> Option<&CalendarComponents> {
        self.calendar.as_ref()
    }

    pub fn seasonal_times(&self) -> Vec<SeasonalTime> {
        self.seasonal
            .as_ref()
            .map(|seasonal| seasonal.components().iter().map(|c| *c.time()).collect())
            .unwrap_or_default()
    }

    pub fn calendar_features(&self) -> Vec<CalendarFeature> {
        self.calendar
            .as_ref()
            .map(|calendar| {
                calendar
                    .components()
                    .iter()
                    .map(CalendarComponent::feature)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn using_trend_for_prediction(&self) -> bool {
        self.using_trend_for_prediction
    }

    pub fn time_shift(&self) -> i64 {
        self.time_shift
    }

    pub fn gain(&self) -> f64 {
        self.gain_controller.gain()
    }

    /// Total number of seasonal and calendar buckets.
    pub fn size(&self) -> usize {
        self.seasonal.as_ref().map_or(0, SeasonalComponents::size)
            + self.calendar.as_ref().map_or(0, CalendarComponents::size)
    }

    pub fn max_size(&self) -> usize {
        MAXIMUM_COMPONENTS * self.seasonal_component_size
    }

    /// Trend prediction at `time`; only the level until the trend is used.
    pub fn trend_value(&self, time: i64) -> f64 {
        if self.using_trend_for_prediction {
            self.trend.value(time)
        } else {
            self.trend.level()
        }
    }

    pub fn seasonal_value(&self, time: i64) -> f64 {
        let time = time + self.time_shift;
        self.seasonal.as_ref().map_or(0.0, |seasonal| {
            seasonal.components().iter().map(|c| c.value(time)).sum()
        })
    }

    pub fn calendar_value(&self, time: i64) -> f64 {
        let time = time + self.time_shift;
        self.calendar.as_ref().map_or(0.0, |calendar| {
            calendar.components().iter().map(|c| c.value(time)).sum()
        })
    }

    /// The level around which values fluctuate at `time`: the trend plus the
    /// mean of each seasonal component in window.
    pub fn mean_value(&self, time: i64) -> f64 {
        let periodic_time = time + self.time_shift;
        self.trend_value(time)
            + self.seasonal.as_ref().map_or(0.0, |seasonal| {
                seasonal
                    .components()
                    .iter()
                    .filter(|c| c.time().in_window(periodic_time))
                    .map(|c| c.mean_value())
                    .sum()
            })
    }

    /// Variance of the model's prediction error.
    pub fn mean_variance(&self) -> f64 {
        if self.using_trend_for_prediction {
            self.prediction_error_with_trend.variance()
        } else {
            self.prediction_error_without_trend.variance()
        }
    }

    /// Mean of the factor by which the per component update was scaled.
    pub fn mean_variance_scale(&self) -> f64 {
        if self.mean_variance_scale.count() > 0.0 {
            self.mean_variance_scale.mean()
        } else {
            1.0
        }
    }

    pub fn prediction_model(&self) -> PredictionModel {
        PredictionModel::new(
            Some(self.trend.clone()),
            self.using_trend_for_prediction,
            self.seasonal
                .as_ref()
                .map(|seasonal| seasonal.components().to_vec())
                .unwrap_or_default(),
            self.calendar
                .as_ref()
                .map(|calendar| calendar.components().to_vec())
                .unwrap_or_default(),
            self.time_shift,
        )
    }

    pub fn propagate_forwards(&mut self, start: i64, end: i64) {
        if end <= start {
            return;
        }
        self.trend.propagate_forwards(start, end);
        if let Some(seasonal) = &mut self.seasonal {
            seasonal.propagate_forwards(start, end);
        }
        if let Some(calendar) = &mut self.calendar {
            calendar.propagate_forwards(start, end);
        }
        let factor = (-self.decay_rate * (end - start) as f64 / DAY as f64).exp();
        self.gain_controller.age(factor);
        self.mean_variance_scale.age(factor);
        self.prediction_error_without_trend.age(factor);
        self.prediction_error_with_trend.age(factor);
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.trend.memory_usage()
            + self
                .seasonal
                .as_ref()
                .map_or(0, SeasonalComponents::memory_usage)
            + self
                .calendar
                .as_ref()
                .map_or(0, CalendarComponents::memory_usage)
    }

    fn apply(&mut self, symbol: usize, time: i64) {
        if symbol == SC_RESET {
            self.clear();
        }
        let old = self.machine.state();
        let new = self.machine.apply(symbol);
        if old == new {
            return;
        }
        trace!(
            symbol = self.machine.symbol_name(symbol),
            state = self.machine.state_name(),
            "Components transition"
        );
        match new {
            SC_NEW_COMPONENTS => {
                let periodic_time = time + self.time_shift;
                if let Some(seasonal) = &mut self.seasonal {
                    seasonal.interpolate(periodic_time, false);
                }
                if let Some(calendar) = &mut self.calendar {
                    calendar.interpolate(periodic_time);
                }
            }
            SC_NORMAL => {}
            SC_DISABLED => self.clear(),
            state => {
                error!(state, "Components in a bad state");
                self.apply(SC_RESET, time);
            }
        }
    }

    fn clear(&mut self) {
        self.trend.clear();
        self.seasonal = None;
        self.calendar = None;
        self.gain_controller.clear();
        self.mean_variance_scale = MeanAccumulator::new();
        self.prediction_error_without_trend = MeanVarAccumulator::new();
        self.prediction_error_with_trend = MeanVarAccumulator::new();
        self.using_trend_for_prediction = false;
    }

    /// Advance the regression origins, drop components which don't pay
    /// their way and move common level and slope into the trend. Predictions
    /// are unchanged.
    fn canonicalize(&mut self, time: i64) {
        if self.decay_rate > 0.0 {
            let origin = time - (DAY as f64 / self.decay_rate / 2.0) as i64;
            self.trend.shift_origin(origin);
            if let Some(seasonal) = &mut self.seasonal {
                seasonal.shift_origin(origin);
            }
            self.gain_controller.shift_origin(origin);
        }

        if let Some(seasonal) = &mut self.seasonal {
            let shift = seasonal.prune(time, self.bucket_length);
            self.trend.shift_level(shift);
        }
        if self.seasonal.as_ref().is_some_and(SeasonalComponents::is_empty) {
            self.seasonal = None;
        }
        if let Some(calendar) = &mut self.calendar {
            calendar.prune(time, self.bucket_length);
        }
        if self.calendar.as_ref().is_some_and(CalendarComponents::is_empty) {
            self.calendar = None;
        }

        if !self.trend.initialized() {
            return;
        }
        if let Some(seasonal) = &mut self.seasonal {
            let slopes = self.using_trend_for_prediction;
            let shift = seasonal.canonicalize(time + self.time_shift, slopes);
            self.trend.shift_level(shift.level);
            if slopes && shift.slope != 0.0 {
                self.trend.shift_slope(time, shift.slope);
            }
        }
    }

    fn interpolate(&mut self, time: i64) {
        self.canonicalize(time);
        let periodic_time = time + self.time_shift;
        let should_interpolate = self.machine.state() == SC_NEW_COMPONENTS
            || self
                .seasonal
                .as_ref()
                .is_some_and(|seasonal| seasonal.should_interpolate(periodic_time))
            || self
                .calendar
                .as_ref()
                .is_some_and(|calendar| calendar.should_interpolate(periodic_time));
        if !should_interpolate {
            return;
        }
        let mut removed = false;
        if let Some(seasonal) = &mut self.seasonal {
            removed |= seasonal.remove_bad(periodic_time);
            seasonal.interpolate(periodic_time, true);
        }
        if let Some(calendar) = &mut self.calendar {
            removed |= calendar.remove_bad(periodic_time);
            calendar.interpolate(periodic_time);
        }
        if removed {
            self.callbacks.component_change(Vec::new());
        }
        self.apply(SC_INTERPOLATED, time);
    }

    /// Share the prediction error between the components in window.
    fn decompose(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        let time = message.header.time;
        let periodic_time = time + self.time_shift;
        let value = message.value;
        let weight = message.weights.count_for_update();
        let count = message.weights.count;

        let seasonal_indices = self
            .seasonal
            .as_ref()
            .map(|seasonal| seasonal.in_window(periodic_time))
            .unwrap_or_default();
        let deltas = self
            .seasonal
            .as_ref()
            .map(|seasonal| seasonal.deltas(periodic_time, &seasonal_indices))
            .unwrap_or_default();
        let calendar_indices = self
            .calendar
            .as_ref()
            .map(|calendar| calendar.in_window(periodic_time))
            .unwrap_or_default();

        // Values, means and variances of the periodic components in window.
        let mut values = Vec::with_capacity(seasonal_indices.len() + calendar_indices.len());
        let mut means = Vec::with_capacity(values.capacity());
        let mut variances = Vec::with_capacity(values.capacity() + 1);
        variances.push(if self.using_trend_for_prediction {
            self.trend.variance()
        } else {
            0.0
        });
        if let Some(seasonal) = &self.seasonal {
            for &i in &seasonal_indices {
                let component = seasonal.component(i);
                values.push(component.value(periodic_time));
                means.push(component.mean_value());
                variances.push(component.variance(periodic_time));
            }
        }
        if let Some(calendar) = &self.calendar {
            for &i in &calendar_indices {
                let component = calendar.component(i);
                values.push(component.value(periodic_time));
                means.push(component.mean_value());
                variances.push(component.variance(periodic_time));
            }
        }

        let x0 = self.trend.value(time);
        let components = (values.len() + 1) as f64;
        let z = (components / self.gain_controller.gain()).max(1.0);
        let prediction = x0 + values.iter().sum::<f64>();
        let error = value - prediction;
        let reference_error = value - x0;
        let total_variance: f64 = variances.iter().sum();
        let variance_increase = |variance: f64| {
            if total_variance > 0.0 {
                variance / total_variance * components
            } else {
                1.0
            }
        };
        let predictions: Vec<f64> = values.iter().zip(&means).map(|(x, mean)| x - mean).collect();
        let test_for_trend = !self.using_trend_for_prediction
            && self.trend.observed_interval() > MINIMUM_TREND_TEST_BUCKETS * self.bucket_length;

        self.trend.add(time, x0 + error / z, weight);
        let m = seasonal_indices.len();
        if let Some(seasonal) = &mut self.seasonal {
            for (k, &i) in seasonal_indices.iter().enumerate() {
                let (component, errors) = seasonal.component_and_errors_mut(i);
                let update_weight = if component.initialized() { weight } else { count };
                component.add(periodic_time, values[k] + error / z + deltas[k], update_weight);
                errors.add(
                    reference_error,
                    error,
                    predictions[k],
                    variance_increase(variances[k + 1]),
                    weight,
                );
            }
        }
        if let Some(calendar) = &mut self.calendar {
            for (k, &i) in calendar_indices.iter().enumerate() {
                let k = m + k;
                let (component, errors) = calendar.component_and_errors_mut(i);
                let update_weight = if component.initialized() { weight } else { count };
                component.add(periodic_time, values[k] + error / z, update_weight);
                errors.add(
                    reference_error,
                    error,
                    predictions[k],
                    variance_increase(variances[k + 1]),
                    weight,
                );
            }
        }

        self.mean_variance_scale.add(z / components, weight);
        self.prediction_error_without_trend.add(error + x0, weight);
        self.prediction_error_with_trend.add(error, weight);
        self.gain_controller.add(time, &predictions);

        if test_for_trend && self.should_use_trend() {
            self.using_trend_for_prediction = true;
            debug!(time, slope = self.trend.slope(), "Detected trend");
            let callbacks = self.callbacks.clone();
            let component_change =
                move |residuals: Vec<MeanAccumulator>| callbacks.component_change(residuals);
            mediator.forward(&Message::DetectedTrend(DetectedTrend {
                header: MessageHeader::new(time, message.header.last_time, message.header.breaker),
                predictor: self.prediction_model(),
                component_change: &component_change,
            }));
            self.callbacks.annotate("Detected trend");
        }
    }

    /// Whether predicting with the trend significantly reduces the error
    /// compared with predicting with its level.
    fn should_use_trend(&self) -> bool {
        let v0 = self.prediction_error_without_trend.variance();
        let v1 = self.prediction_error_with_trend.variance();
        let df0 = self.prediction_error_without_trend.count() - 1.0;
        let df1 = self.prediction_error_with_trend.count() - self.trend.parameters() as f64;
        if df0 <= 0.0 || df1 <= 0.0 || v0 <= 0.0 {
            return false;
        }
        let relative_log_significance =
            left_tail_f_test(v1, v0, df1, df0).ln() / TREND_SIGNIFICANCE.ln();
        let vt = MINIMUM_TREND_VARIANCE_REDUCTION * v0;
        let p = logistic(relative_log_significance, 0.1, 1.0, 1.0)
            * if vt > v1 {
                logistic(vt / v1, 1.0, 1.0, 1.0)
            } else {
                logistic(v1 / vt, 0.1, 1.0, -1.0)
            };
        p >= MINIMUM_TREND_PROBABILITY
    }

    fn add_seasonal_components(&mut self, message: &DetectedSeasonal<'_>) -> bool {
        let decomposition = &message.decomposition;
        let removed: usize = self.seasonal.as_ref().map_or(0, |seasonal| {
            decomposition
                .remove()
                .iter()
                .zip(seasonal.components())
                .filter(|(remove, _)| **remove)
                .map(|(_, component)| component.size())
                .sum()
        });
        let added: usize = decomposition.components().iter().map(|c| c.size()).sum();
        if (self.size() + added).saturating_sub(removed) > self.max_size() {
            debug!(
                size = self.size(),
                added,
                removed,
                max_size = self.max_size(),
                "Refusing seasonal components over budget"
            );
            return false;
        }

        let seasonal = self.seasonal.get_or_insert_with(SeasonalComponents::new);
        if !message.header.allocations_allowed()
            && seasonal.estimate_size_change(decomposition) > 0
        {
            trace!("Memory limit reached, not adding seasonal components");
            if seasonal.is_empty() {
                self.seasonal = None;
            }
            return false;
        }
        if !seasonal.remove(decomposition.remove()) {
            error!(
                mask = decomposition.remove().len(),
                components = seasonal.len(),
                "Seasonal components out of sync with test"
            );
            return false;
        }

        if decomposition.components().is_empty() {
            self.callbacks.annotate("Removed all seasonality");
        }
        let start = decomposition.start();
        let dt = decomposition.bucket_length();
        for component in decomposition.components() {
            seasonal.add(component.create(self.decay_rate, start + self.time_shift, dt));
            self.callbacks.annotate(&component.annotation());
        }
        seasonal.sort();
        if seasonal.is_empty() {
            self.seasonal = None;
        }
        self.clear_component_errors();
        self.reseed_gain_controller(decomposition);
        self.refit_trend(decomposition);
        true
    }

    fn clear_component_errors(&mut self) {
        if let Some(seasonal) = &mut self.seasonal {
            seasonal.clear_errors();
        }
        if let Some(calendar) = &mut self.calendar {
            calendar.clear_errors();
        }
    }

    fn reseed_gain_controller(&mut self, decomposition: &SeasonalDecomposition) {
        self.gain_controller.clear();
        let age = (-self.decay_rate * self.bucket_length as f64 / DAY as f64).exp();
        let mut predictions = Vec::new();
        let mut time = decomposition.start();
        while time < decomposition.end() {
            predictions.clear();
            let periodic_time = time + self.time_shift;
            if let Some(seasonal) = &self.seasonal {
                seasonal.append_predictions(periodic_time, &mut predictions);
            }
            if let Some(calendar) = &self.calendar {
                calendar.append_predictions(periodic_time, &mut predictions);
            }
            self.gain_controller.seed(&predictions);
            self.gain_controller.age(age);
            time += self.bucket_length;
        }
    }

    /// Refit the trend to the values less the new components and hand the
    /// consumer the residuals.
    fn refit_trend(&mut self, decomposition: &SeasonalDecomposition) {
        let start = decomposition.start();
        let dt = decomposition.bucket_length();
        self.trend = fit_trend(self.decay_rate, start, dt, decomposition.trend_initial_values());
        self.using_trend_for_prediction = true;

        let mut residuals = decomposition.trend_initial_values().to_vec();
        for (i, residual) in residuals.iter_mut().enumerate() {
            if !residual.is_empty() {
                residual.shift(-self.trend.value(start + i as i64 * dt));
            }
        }
        add_mean_zero_normal_noise(decomposition.within_bucket_variance(), &mut residuals);
        self.callbacks.component_change(residuals);
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(VERSION_TAG, "");
        inserter.insert_level(MACHINE_TAG, &mut |inserter| {
            self.machine.accept_persist_inserter(inserter)
        });
        inserter.insert_value(DECAY_RATE_TAG, &self.decay_rate.to_string());
        inserter.insert_level(GAIN_CONTROLLER_TAG, &mut |inserter| {
            self.gain_controller.accept_persist_inserter(inserter)
        });
        inserter.insert_level(TREND_TAG, &mut |inserter| {
            self.trend.accept_persist_inserter(inserter)
        });
        if let Some(seasonal) = &self.seasonal {
            inserter.insert_level(SEASONAL_TAG, &mut |inserter| {
                seasonal.accept_persist_inserter(inserter)
            });
        }
        if let Some(calendar) = &self.calendar {
            inserter.insert_level(CALENDAR_TAG, &mut |inserter| {
                calendar.accept_persist_inserter(inserter)
            });
        }
        inserter.insert_value(MEAN_VARIANCE_SCALE_TAG, &self.mean_variance_scale.to_delimited());
        inserter.insert_value(
            PREDICTION_ERROR_WITHOUT_TREND_TAG,
            &self.prediction_error_without_trend.to_delimited(),
        );
        inserter.insert_value(
            PREDICTION_ERROR_WITH_TREND_TAG,
            &self.prediction_error_with_trend.to_delimited(),
        );
        inserter.insert_value(
            USING_TREND_FOR_PREDICTION_TAG,
            &self.using_trend_for_prediction.to_string(),
        );
        inserter.insert_value(TIME_SHIFT_TAG, &self.time_shift.to_string());
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        if traverser.name() != VERSION_TAG {
            return Err(DecompositionError::unsupported_version(
                traverser.name(),
                VERSION_TAG,
            ));
        }
        self.seasonal = None;
        self.calendar = None;
        while traverser.next() {
            match traverser.name() {
                MACHINE_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    self.machine.accept_restore_traverser(traverser)
                })?,
                DECAY_RATE_TAG => self.decay_rate = restore_value(traverser)?,
                GAIN_CONTROLLER_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    self.gain_controller.accept_restore_traverser(traverser)
                })?,
                TREND_TAG => {
                    let decay_rate = self.decay_rate;
                    let mut trend = None;
                    traverser.traverse_sub_level(&mut |traverser| {
                        trend = Some(TrendComponent::restore(decay_rate, traverser)?);
                        Ok(())
                    })?;
                    self.trend = trend.ok_or_else(|| DecompositionError::MissingValue(TREND_TAG.to_string()))?;
                }
                SEASONAL_TAG => {
                    let decay_rate = self.decay_rate;
                    traverser.traverse_sub_level(&mut |traverser| {
                        self.seasonal = Some(SeasonalComponents::restore(decay_rate, traverser)?);
                        Ok(())
                    })?;
                }
                CALENDAR_TAG => {
                    let decay_rate = self.decay_rate;
                    traverser.traverse_sub_level(&mut |traverser| {
                        self.calendar = Some(CalendarComponents::restore(decay_rate, traverser)?);
                        Ok(())
                    })?;
                }
                MEAN_VARIANCE_SCALE_TAG => {
                    self.mean_variance_scale = MeanAccumulator::from_delimited(traverser.value())?
                }
                PREDICTION_ERROR_WITHOUT_TREND_TAG => {
                    self.prediction_error_without_trend =
                        MeanVarAccumulator::from_delimited(traverser.value())?
                }
                PREDICTION_ERROR_WITH_TREND_TAG => {
                    self.prediction_error_with_trend =
                        MeanVarAccumulator::from_delimited(traverser.value())?
                }
                USING_TREND_FOR_PREDICTION_TAG => {
                    self.using_trend_for_prediction = restore_value(traverser)?
                }
                TIME_SHIFT_TAG => self.time_shift = restore_value(traverser)?,
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
        }
        Ok(())
    }
}

impl Handler for Components {
    fn handle_add_value(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        let time = message.header.time;
        match self.machine.state() {
            SC_NORMAL | SC_NEW_COMPONENTS => {
                self.interpolate(time);
                self.decompose(message, mediator);
            }
            SC_DISABLED => {}
            state => {
                error!(state, "Components in a bad state");
                self.apply(SC_RESET, time);
            }
        }
    }

    fn handle_detected_seasonal(&mut self, message: &DetectedSeasonal<'_>, _mediator: &Mediator) {
        let time = message.header.time;
        match self.machine.state() {
            SC_NORMAL | SC_NEW_COMPONENTS => {
                debug!(time, components = %message.decomposition.print(), "Updating seasonal components");
                if self.add_seasonal_components(message) {
                    self.apply(SC_ADDED_COMPONENTS, time);
                }
            }
            SC_DISABLED => {}
            state => {
                error!(state, "Components in a bad state");
                self.apply(SC_RESET, time);
            }
        }
    }

    fn handle_detected_calendar(&mut self, message: &DetectedCalendar<'_>, _mediator: &Mediator) {
        let time = message.header.time;
        if self.size() + self.calendar_component_size > self.max_size() {
            debug!(feature = %message.feature, "Refusing calendar component over budget");
            return;
        }
        match self.machine.state() {
            SC_NORMAL | SC_NEW_COMPONENTS => {
                if self
                    .calendar
                    .as_ref()
                    .is_some_and(|calendar| calendar.have_component(message.feature))
                {
                    return;
                }
                if !message.header.allocations_allowed() {
                    trace!("Memory limit reached, not adding calendar component");
                    return;
                }
                self.calendar
                    .get_or_insert_with(CalendarComponents::new)
                    .add(CalendarComponent::new(
                        message.feature,
                        message.time_zone_offset,
                        self.calendar_component_size,
                        self.decay_rate,
                    ));
                debug!(time, feature = %message.feature, "Detected calendar feature");
                self.callbacks
                    .annotate(&format!("Detected calendar feature: {}", message.feature));
                self.apply(SC_ADDED_COMPONENTS, time);
            }
            SC_DISABLED => {}
            state => {
                error!(state, "Components in a bad state");
                self.apply(SC_RESET, time);
            }
        }
    }

    fn handle_detected_change_point(
        &mut self,
        message: &DetectedChangePoint<'_>,
        _mediator: &Mediator,
    ) {
        let change = &message.change;
        change.apply_to_trend(&mut self.trend);
        if let Some(seasonal) = &mut self.seasonal {
            seasonal.apply(change);
        }
        if let Some(calendar) = &mut self.calendar {
            calendar.apply(change);
        }
        self.time_shift += change.time_shift();
        if !self.using_trend_for_prediction {
            self.using_trend_for_prediction = true;
            self.callbacks.component_change(change.residuals().to_vec());
        }
        debug!(time = message.header.time, change = %change.print(), "Applied change");
        self.callbacks.annotate(&format!("Detected {}", change.print()));
    }
}

impl Checksum for Components {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.machine.checksum(seed);
        let seed = self.decay_rate.checksum(seed);
        let seed = self.gain_controller.checksum(seed);
        let seed = self.trend.checksum(seed);
        let seed = self.seasonal.checksum(seed);
        let seed = self.calendar.checksum(seed);
        let seed = self.mean_variance_scale.checksum(seed);
        let seed = self.prediction_error_without_trend.checksum(seed);
        let seed = self.prediction_error_with_trend.checksum(seed);
        let seed = self.using_trend_for_prediction.checksum(seed);
        self.time_shift.checksum(seed)
    }
}

/// Fit a trend to bucketed values, aging it only after buckets with values.
fn fit_trend(decay_rate: f64, start: i64, dt: i64, values: &[MeanAccumulator]) -> TrendComponent {
    let mut trend = TrendComponent::new(decay_rate);
    let mut time = start;
    for value in values {
        if !value.is_empty() {
            trend.add(time, value.mean(), value.count());
            trend.propagate_forwards(time, time + dt);
        }
        time += dt;
    }
    trend
}
