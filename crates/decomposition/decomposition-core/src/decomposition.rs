//! The decomposition of a time series into trend, seasonal and calendar
//! components.
//!
//! [`Decomposition`] owns the four handlers and the mediator connecting
//! them. Each new value is wrapped in an [`AddValue`] message carrying the
//! current predictions and forwarded to the change point test, seasonality
//! test, calendar test and components in that order.

use std::cell::RefCell;
use std::rc::Rc;

use decomposition_spi::{
    restore_value, CalendarFeature, DecompositionError, MemoryCircuitBreaker, Result,
    SampleWeights, SeasonalTime, StatePersistInserter, StateRestoreTraverser,
};
use tracing::{debug, trace};

use crate::calendar_test::CalendarTest;
use crate::callbacks::{AnnotationCallback, CallbackGuard, ComponentChangeCallback, SharedCallbacks};
use crate::change_point_test::ChangePointTest;
use crate::checksum::Checksum;
use crate::components::Components;
use crate::decay_rate_controller::DecayRateController;
use crate::mediator::Mediator;
use crate::message::{AddValue, Message, MessageHeader, SeasonalityTestInput};
use crate::persist::StateTree;
use crate::predictor::PredictionModel;
use crate::seasonality_decomposition::{SeasonalityDecompositionTest, SeasonalityTestParameters};
use crate::seasonality_test::SeasonalityTest;

const VERSION_TAG: &str = "6.3";
const DECAY_RATE_TAG: &str = "a";
const LAST_VALUE_TIME_TAG: &str = "b";
const LAST_PROPAGATION_TIME_TAG: &str = "c";
const CHANGE_POINT_TEST_TAG: &str = "d";
const SEASONALITY_TEST_TAG: &str = "e";
const CALENDAR_TEST_TAG: &str = "f";
const COMPONENTS_TAG: &str = "g";
const DECAY_RATE_CONTROLLER_TAG: &str = "h";
const FIRST_VALUE_TIME_TAG: &str = "i";

/// Marks a decomposition which hasn't seen a value.
const NO_VALUE: i64 = i64::MIN;

/// Rate at which the decay rate controller learns
const DECAY_RATE_LEARN_RATE: f64 = 1.0;

pub struct Decomposition {
    decay_rate: f64,
    bucket_length: i64,
    seasonal_component_size: usize,
    first_value_time: i64,
    last_value_time: i64,
    last_propagation_time: i64,
    callbacks: SharedCallbacks,
    change_point_test: Rc<RefCell<ChangePointTest>>,
    seasonality_test: Rc<RefCell<SeasonalityTest>>,
    calendar_test: Rc<RefCell<CalendarTest>>,
    components: Rc<RefCell<Components>>,
    decay_rate_controller: Option<DecayRateController>,
    mediator: Mediator,
}

impl Decomposition {
    /// Create a decomposition for values in buckets of `bucket_length`
    /// seconds whose statistics age at `decay_rate` per day.
    ///
    /// `seasonal_component_size` is the number of buckets in each seasonal
    /// component. With `decay_rate_control` the decay rate adapts to the
    /// bias of the prediction errors.
    pub fn new(
        decay_rate: f64,
        bucket_length: i64,
        seasonal_component_size: usize,
        decay_rate_control: bool,
    ) -> Self {
        let callbacks = SharedCallbacks::new();
        Self::from_handlers(
            decay_rate,
            bucket_length,
            seasonal_component_size,
            callbacks.clone(),
            ChangePointTest::new(decay_rate, bucket_length),
            SeasonalityTest::new(decay_rate, bucket_length),
            CalendarTest::new(decay_rate, bucket_length),
            Components::new(decay_rate, bucket_length, seasonal_component_size, callbacks),
            decay_rate_control.then(DecayRateController::new),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_handlers(
        decay_rate: f64,
        bucket_length: i64,
        seasonal_component_size: usize,
        callbacks: SharedCallbacks,
        change_point_test: ChangePointTest,
        seasonality_test: SeasonalityTest,
        calendar_test: CalendarTest,
        components: Components,
        decay_rate_controller: Option<DecayRateController>,
    ) -> Self {
        let change_point_test = Rc::new(RefCell::new(change_point_test));
        let seasonality_test = Rc::new(RefCell::new(seasonality_test));
        let calendar_test = Rc::new(RefCell::new(calendar_test));
        let components = Rc::new(RefCell::new(components));

        let mut mediator = Mediator::new();
        mediator.register_handler(change_point_test.clone());
        mediator.register_handler(seasonality_test.clone());
        mediator.register_handler(calendar_test.clone());
        mediator.register_handler(components.clone());

        Self {
            decay_rate,
            bucket_length,
            seasonal_component_size,
            first_value_time: NO_VALUE,
            last_value_time: NO_VALUE,
            last_propagation_time: NO_VALUE,
            callbacks,
            change_point_test,
            seasonality_test,
            calendar_test,
            components,
            decay_rate_controller,
            mediator,
        }
    }

    /// A copy for running forecasts: the tests are disabled and no
    /// callbacks are attached.
    pub fn for_forecast(&self) -> Self {
        let components = self.components.borrow().for_forecast();
        let mut result = Self::from_handlers(
            self.decay_rate,
            self.bucket_length,
            self.seasonal_component_size,
            components.callbacks().clone(),
            self.change_point_test.borrow().for_forecast(),
            self.seasonality_test.borrow().for_forecast(),
            self.calendar_test.borrow().for_forecast(),
            components,
            self.decay_rate_controller,
        );
        result.first_value_time = self.first_value_time;
        result.last_value_time = self.last_value_time;
        result.last_propagation_time = self.last_propagation_time;
        result
    }

    /// Attach the callbacks through which the consumer hears that its
    /// residual baseline changed and receives model annotations. They stay
    /// attached until the returned guard is dropped.
    pub fn attach_callbacks(
        &self,
        component_change: ComponentChangeCallback,
        annotation: AnnotationCallback,
    ) -> CallbackGuard {
        self.callbacks.attach(component_change, annotation)
    }

    pub fn bucket_length(&self) -> i64 {
        self.bucket_length
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
        self.change_point_test.borrow_mut().set_decay_rate(decay_rate);
        self.seasonality_test.borrow_mut().set_decay_rate(decay_rate);
        self.calendar_test.borrow_mut().set_decay_rate(decay_rate);
        self.components.borrow_mut().set_decay_rate(decay_rate);
    }

    pub fn decay_rate_control(&self) -> bool {
        self.decay_rate_controller.is_some()
    }

    pub fn first_value_time(&self) -> Option<i64> {
        (self.first_value_time != NO_VALUE).then_some(self.first_value_time)
    }

    pub fn last_value_time(&self) -> Option<i64> {
        (self.last_value_time != NO_VALUE).then_some(self.last_value_time)
    }

    /// Add `value` observed at `time`.
    ///
    /// A value with zero count is an explicit null: the clock advances to
    /// `time` exactly as [`skip_time`](Self::skip_time) would and nothing
    /// is updated.
    pub fn add_value(
        &mut self,
        time: i64,
        value: f64,
        weights: SampleWeights,
        occupancy: f64,
        breaker: &dyn MemoryCircuitBreaker,
    ) {
        if weights.count <= 0.0 {
            if self.last_value_time != NO_VALUE && time > self.last_value_time {
                self.skip_time(time - self.last_value_time);
            }
            return;
        }
        if self.first_value_time == NO_VALUE {
            self.first_value_time = time;
            self.last_value_time = time;
            self.last_propagation_time = time;
        }

        self.propagate_forwards_to(time);

        let last_time = self.last_value_time;
        self.last_value_time = self.last_value_time.max(time);

        let (trend, seasonal, calendar, time_shift) = {
            let components = self.components.borrow();
            (
                components.trend_value(time),
                components.seasonal_value(time),
                components.calendar_value(time),
                components.time_shift(),
            )
        };

        let components = &self.components;
        let make_predictor = || match components.try_borrow() {
            Ok(components) => components.prediction_model(),
            Err(_) => {
                trace!("Components busy, predicting zero");
                PredictionModel::default()
            }
        };
        let make_filtered_predictor = |remove: &[bool]| make_predictor().filtered(remove);
        let base_bucket_length = self.bucket_length;
        let component_size = self.seasonal_component_size;
        let make_test = |input: &SeasonalityTestInput<'_>| {
            SeasonalityDecompositionTest::new(
                SeasonalityTestParameters {
                    base_bucket_length,
                    component_size,
                    minimum_period: input.minimum_period,
                    minimum_resolution: input.minimum_resolution,
                },
                input.window,
                input.preconditioner,
                input.modelled,
                input.testable,
            )
        };

        let message = AddValue {
            header: MessageHeader::new(time, last_time, breaker),
            time_shift,
            value,
            weights,
            occupancy,
            first_value_time: self.first_value_time,
            trend,
            seasonal,
            calendar,
            make_predictor: &make_predictor,
            make_filtered_predictor: &make_filtered_predictor,
            make_test_for_seasonality: &make_test,
        };
        let prediction = message.prediction();
        self.mediator.forward(&Message::AddValue(message));

        if let Some(controller) = &mut self.decay_rate_controller {
            let factor = controller.multiplier(
                prediction,
                &[value - prediction],
                self.bucket_length,
                DECAY_RATE_LEARN_RATE,
                self.decay_rate,
            );
            if factor != 1.0 {
                let decay_rate = self.decay_rate * factor;
                debug!(time, decay_rate, "Adjusting decay rate");
                self.set_decay_rate(decay_rate);
            }
        }
    }

    /// Advance the clock by `interval` without aging anything.
    pub fn skip_time(&mut self, interval: i64) {
        if interval <= 0 || self.last_value_time == NO_VALUE {
            return;
        }
        trace!(interval, "Skipping time");
        self.last_value_time += interval;
        self.last_propagation_time += interval;
    }

    fn propagate_forwards_to(&mut self, time: i64) {
        let start = self.last_propagation_time;
        if time <= start {
            return;
        }
        self.change_point_test
            .borrow_mut()
            .propagate_forwards(start, time);
        self.seasonality_test
            .borrow_mut()
            .propagate_forwards(start, time);
        self.calendar_test.borrow_mut().propagate_forwards(start, time);
        self.components.borrow_mut().propagate_forwards(start, time);
        self.last_propagation_time = time;
    }

    /// Predicted value at `time`.
    pub fn predict(&self, time: i64) -> f64 {
        let components = self.components.borrow();
        components.trend_value(time) + components.seasonal_value(time) + components.calendar_value(time)
    }

    pub fn trend_value(&self, time: i64) -> f64 {
        self.components.borrow().trend_value(time)
    }

    pub fn seasonal_value(&self, time: i64) -> f64 {
        self.components.borrow().seasonal_value(time)
    }

    pub fn calendar_value(&self, time: i64) -> f64 {
        self.components.borrow().calendar_value(time)
    }

    /// A standalone model making the same predictions as this one.
    pub fn prediction_model(&self) -> PredictionModel {
        self.components.borrow().prediction_model()
    }

    pub fn mean_value(&self, time: i64) -> f64 {
        self.components.borrow().mean_value(time)
    }

    pub fn mean_variance(&self) -> f64 {
        self.components.borrow().mean_variance()
    }

    pub fn mean_variance_scale(&self) -> f64 {
        self.components.borrow().mean_variance_scale()
    }

    pub fn using_trend_for_prediction(&self) -> bool {
        self.components.borrow().using_trend_for_prediction()
    }

    pub fn time_shift(&self) -> i64 {
        self.components.borrow().time_shift()
    }

    pub fn seasonal_components(&self) -> Vec<SeasonalTime> {
        self.components.borrow().seasonal_times()
    }

    pub fn calendar_components(&self) -> Vec<CalendarFeature> {
        self.components.borrow().calendar_features()
    }

    /// Total size of the seasonal and calendar components.
    pub fn component_size(&self) -> usize {
        self.components.borrow().size()
    }

    pub fn maximum_component_size(&self) -> usize {
        self.components.borrow().max_size()
    }

    /// Weight to apply to a value at `time` while a change is suspected.
    pub fn count_weight(&self, time: i64) -> f64 {
        self.change_point_test.borrow().count_weight(time)
    }

    pub fn outlier_weight_derate(&self, time: i64, error: f64) -> f64 {
        self.change_point_test
            .borrow()
            .outlier_weight_derate(time, error)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.change_point_test.borrow().memory_usage()
            + self.seasonality_test.borrow().memory_usage()
            + self.calendar_test.borrow().memory_usage()
            + self.components.borrow().memory_usage()
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(VERSION_TAG, "");
        inserter.insert_value(DECAY_RATE_TAG, &self.decay_rate.to_string());
        inserter.insert_value(FIRST_VALUE_TIME_TAG, &self.first_value_time.to_string());
        inserter.insert_value(LAST_VALUE_TIME_TAG, &self.last_value_time.to_string());
        inserter.insert_value(
            LAST_PROPAGATION_TIME_TAG,
            &self.last_propagation_time.to_string(),
        );
        inserter.insert_level(CHANGE_POINT_TEST_TAG, &mut |inserter| {
            self.change_point_test
                .borrow()
                .accept_persist_inserter(inserter)
        });
        inserter.insert_level(SEASONALITY_TEST_TAG, &mut |inserter| {
            self.seasonality_test
                .borrow()
                .accept_persist_inserter(inserter)
        });
        inserter.insert_level(CALENDAR_TEST_TAG, &mut |inserter| {
            self.calendar_test.borrow().accept_persist_inserter(inserter)
        });
        inserter.insert_level(COMPONENTS_TAG, &mut |inserter| {
            self.components.borrow().accept_persist_inserter(inserter)
        });
        if let Some(controller) = &self.decay_rate_controller {
            inserter.insert_level(DECAY_RATE_CONTROLLER_TAG, &mut |inserter| {
                controller.accept_persist_inserter(inserter)
            });
        }
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        if traverser.name() != VERSION_TAG {
            return Err(DecompositionError::unsupported_version(
                traverser.name(),
                VERSION_TAG,
            ));
        }
        while traverser.next() {
            match traverser.name() {
                DECAY_RATE_TAG => self.decay_rate = restore_value(traverser)?,
                FIRST_VALUE_TIME_TAG => self.first_value_time = restore_value(traverser)?,
                LAST_VALUE_TIME_TAG => self.last_value_time = restore_value(traverser)?,
                LAST_PROPAGATION_TIME_TAG => self.last_propagation_time = restore_value(traverser)?,
                CHANGE_POINT_TEST_TAG => {
                    let test = &self.change_point_test;
                    traverser.traverse_sub_level(&mut |traverser| {
                        test.borrow_mut().accept_restore_traverser(traverser)
                    })?
                }
                SEASONALITY_TEST_TAG => {
                    let test = &self.seasonality_test;
                    traverser.traverse_sub_level(&mut |traverser| {
                        test.borrow_mut().accept_restore_traverser(traverser)
                    })?
                }
                CALENDAR_TEST_TAG => {
                    let test = &self.calendar_test;
                    traverser.traverse_sub_level(&mut |traverser| {
                        test.borrow_mut().accept_restore_traverser(traverser)
                    })?
                }
                COMPONENTS_TAG => {
                    let components = &self.components;
                    traverser.traverse_sub_level(&mut |traverser| {
                        components.borrow_mut().accept_restore_traverser(traverser)
                    })?
                }
                DECAY_RATE_CONTROLLER_TAG => {
                    let mut controller = DecayRateController::new();
                    traverser.traverse_sub_level(&mut |traverser| {
                        controller.accept_restore_traverser(traverser)
                    })?;
                    self.decay_rate_controller = Some(controller);
                }
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
        }
        // The tests don't persist their decay rate.
        self.set_decay_rate(self.decay_rate);
        Ok(())
    }

    /// Snapshot the whole state.
    pub fn persist(&self) -> StateTree {
        StateTree::persist(|inserter| self.accept_persist_inserter(inserter))
    }

    /// Overwrite this decomposition's state with `state`.
    pub fn restore(&mut self, state: &StateTree) -> Result<()> {
        state.restore(|traverser| self.accept_restore_traverser(traverser))
    }
}

impl Checksum for Decomposition {
    fn checksum(&self, seed: u64) -> u64 {
        let mut seed = self.decay_rate.checksum(seed);
        seed = self.first_value_time.checksum(seed);
        seed = self.last_value_time.checksum(seed);
        seed = self.last_propagation_time.checksum(seed);
        seed = self.change_point_test.borrow().checksum(seed);
        seed = self.seasonality_test.borrow().checksum(seed);
        seed = self.calendar_test.borrow().checksum(seed);
        seed = self.components.borrow().checksum(seed);
        self.decay_rate_controller.checksum(seed)
    }
}

impl std::fmt::Debug for Decomposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decomposition")
            .field("decay_rate", &self.decay_rate)
            .field("bucket_length", &self.bucket_length)
            .field("last_value_time", &self.last_value_time)
            .field("mediator", &self.mediator)
            .finish()
    }
}
