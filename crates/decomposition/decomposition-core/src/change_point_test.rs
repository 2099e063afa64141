//! Change point test handler
//!
//! Keeps a window of recent values bucketed at no less than an hour and
//! tests it for a sudden change. Testing happens on a slow schedule or,
//! faster, once a run of large prediction errors has flagged a candidate
//! change. A committed change stays on probation until it is either
//! reversed, because the model without it does clearly better, or it has
//! stood for the maximum detection interval.

use std::collections::VecDeque;

use decomposition_spi::{
    ceil, floor, intervals_crossed, restore_value, DecompositionError, Result,
    StatePersistInserter, StateRestoreTraverser, DAY, HOUR,
};
use tracing::{debug, error, trace};

use crate::change_detection::{
    OutlierWeightDerate, TestForChange, UndoableChange, OUTLIER_FRACTION,
};
use crate::checksum::Checksum;
use crate::mediator::{Handler, Mediator};
use crate::message::{AddValue, DetectedChangePoint, DetectedSeasonal, Message, MessageHeader};
use crate::sampling::add_mean_zero_normal_noise;
use crate::state_machine::{
    StateMachine, CD_DISABLE, CD_NOT_TESTING, CD_RESET, CD_TEST, CHANGE_DETECTOR_MACHINE,
};
use crate::stats::{means_from_delimited, means_to_delimited, MeanAccumulator, MeanVarAccumulator};

const MACHINE_TAG: &str = "a";
const WINDOW_TAG: &str = "b";
const MEAN_OFFSET_TAG: &str = "c";
const RESIDUAL_MOMENTS_TAG: &str = "d";
const LARGE_ERROR_FRACTION_TAG: &str = "e";
const TOTAL_COUNT_WEIGHT_ADJUSTMENT_TAG: &str = "f";
const MINIMUM_TOTAL_COUNT_WEIGHT_ADJUSTMENT_TAG: &str = "g";
const LAST_TEST_TIME_TAG: &str = "h";
const LAST_CHANGE_POINT_TIME_TAG: &str = "i";
const LAST_CANDIDATE_CHANGE_POINT_TIME_TAG: &str = "j";
const UNDOABLE_LAST_CHANGE_TAG: &str = "k";
const OUTLIER_WEIGHT_DERATE_TAG: &str = "l";

const MINIMUM_WINDOW_BUCKET_LENGTH: i64 = HOUR;
const MINIMUM_WINDOW_SIZE: i64 = 32;
const MINIMUM_CHANGE_LENGTH: i64 = 30 * HOUR;
const CHANGE_COUNT_WEIGHT: f64 = 0.1;
/// Errors larger than this many standard deviations count as large
const LARGE_ERROR: f64 = 3.0;
const CANDIDATE_LARGE_ERROR_FRACTION: f64 = 0.5;
const DOWN_WEIGHT_LARGE_ERROR_FRACTION: f64 = 0.25;
const WARM_UP: i64 = 3 * DAY;
const DERATE_INTERVAL: i64 = 3 * DAY;
const NEVER: i64 = i64::MIN / 2;

#[derive(Debug, Clone)]
pub struct ChangePointTest {
    machine: StateMachine,
    decay_rate: f64,
    bucket_length: i64,
    window: VecDeque<MeanAccumulator>,
    mean_offset: MeanAccumulator,
    residual_moments: MeanVarAccumulator,
    large_error_fraction: f64,
    total_count_weight_adjustment: f64,
    minimum_total_count_weight_adjustment: f64,
    last_test_time: i64,
    last_change_point_time: i64,
    last_candidate_change_point_time: i64,
    undoable_last_change: Option<UndoableChange>,
    last_change_outlier_weight_derate: OutlierWeightDerate,
}

impl ChangePointTest {
    pub fn new(decay_rate: f64, bucket_length: i64) -> Self {
        let mut result = Self {
            machine: StateMachine::new(&CHANGE_DETECTOR_MACHINE, CD_TEST),
            decay_rate,
            bucket_length,
            window: VecDeque::new(),
            mean_offset: MeanAccumulator::new(),
            residual_moments: MeanVarAccumulator::new(),
            large_error_fraction: 0.0,
            total_count_weight_adjustment: 0.0,
            minimum_total_count_weight_adjustment: 0.0,
            last_test_time: NEVER,
            last_change_point_time: NEVER,
            last_candidate_change_point_time: NEVER,
            undoable_last_change: None,
            last_change_outlier_weight_derate: OutlierWeightDerate::default(),
        };
        result.reset_window();
        result
    }

    /// A copy which never tests.
    pub fn for_forecast(&self) -> Self {
        let mut result = self.clone();
        result.apply(CD_DISABLE);
        result
    }

    pub fn state(&self) -> usize {
        self.machine.state()
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
    }

    pub fn last_candidate_change_point_time(&self) -> i64 {
        self.last_candidate_change_point_time
    }

    pub fn has_undoable_change(&self) -> bool {
        self.undoable_last_change.is_some()
    }

    /// Weight to apply to a value at `time`. Values are down weighted while
    /// a change is suspected and up weighted afterwards until the weight
    /// lost has been made up.
    pub fn count_weight(&self, _time: i64) -> f64 {
        if self.total_count_weight_adjustment > self.minimum_total_count_weight_adjustment
            && self.large_error_fraction > DOWN_WEIGHT_LARGE_ERROR_FRACTION
        {
            return CHANGE_COUNT_WEIGHT;
        }
        1.0 + (-self.total_count_weight_adjustment).min(1.0)
    }

    /// How much to relax outlier weighting for a prediction `error` at
    /// `time`. Fades out over a few days after the last change.
    pub fn outlier_weight_derate(&self, time: i64, error: f64) -> f64 {
        let fade = 1.0 - (time - self.last_change_point_time) as f64 / DERATE_INTERVAL as f64;
        fade.max(0.0) * self.last_change_outlier_weight_derate.value(error)
    }

    pub fn propagate_forwards(&mut self, start: i64, end: i64) {
        let days = intervals_crossed(start, end, DAY);
        if days > 0 {
            self.residual_moments
                .age((-self.decay_rate * days as f64 / 8.0).exp());
        }
    }

    fn window_bucket_length(&self) -> i64 {
        self.bucket_length.max(MINIMUM_WINDOW_BUCKET_LENGTH)
    }

    fn window_size(&self) -> usize {
        (4 * DAY / self.window_bucket_length()).max(MINIMUM_WINDOW_SIZE) as usize
    }

    fn start_of_window_bucket(&self, time: i64) -> i64 {
        floor(time, self.window_bucket_length())
    }

    pub fn minimum_change_length(&self, occupancy: f64) -> i64 {
        let wbl = self.window_bucket_length();
        let scale = if occupancy > 0.0 {
            (1.0 / occupancy).min(2.0)
        } else {
            2.0
        };
        let length = scale * MINIMUM_CHANGE_LENGTH.max(5 * wbl) as f64;
        ceil((length + 0.5) as i64, wbl)
    }

    pub fn maximum_interval_to_detect_change(&self, occupancy: f64) -> i64 {
        5 * self.minimum_change_length(occupancy) / 3
    }

    fn apply(&mut self, symbol: usize) {
        let old = self.machine.state();
        let new = self.machine.apply(symbol);
        if old == new {
            return;
        }
        trace!(
            symbol = self.machine.symbol_name(symbol),
            state = self.machine.state_name(),
            "Change point test transition"
        );
        match new {
            CD_TEST => self.reset_window(),
            CD_NOT_TESTING => {
                self.window = VecDeque::new();
                self.mean_offset = MeanAccumulator::new();
                self.large_error_fraction = 0.0;
            }
            state => {
                error!(state, "Change point test in a bad state");
                self.apply(CD_RESET);
            }
        }
    }

    fn reset_window(&mut self) {
        self.window = std::iter::repeat(MeanAccumulator::new())
            .take(self.window_size())
            .collect();
        self.mean_offset = MeanAccumulator::new();
        self.large_error_fraction = 0.0;
    }

    fn reset(&mut self, time: i64) {
        self.reset_window();
        self.residual_moments = MeanVarAccumulator::new();
        self.total_count_weight_adjustment = 0.0;
        self.minimum_total_count_weight_adjustment = 0.0;
        self.last_candidate_change_point_time = time - 4 * self.maximum_interval_to_detect_change(1.0);
    }

    fn update_window(&mut self, message: &AddValue<'_>) {
        let wbl = self.window_bucket_length();
        let size = self.window_size();
        let elapsed = self.start_of_window_bucket(message.header.time)
            - self.start_of_window_bucket(message.header.last_time);
        let steps = (elapsed / wbl).clamp(0, size as i64) as usize;
        for _ in 0..steps {
            if self.window.len() >= size {
                self.window.pop_front();
            }
            self.window.push_back(MeanAccumulator::new());
        }
        let count = message.weights.count;
        if let Some(last) = self.window.back_mut() {
            last.add(message.value, count);
        }
        self.mean_offset
            .add((message.header.time.rem_euclid(self.bucket_length)) as f64, count);
    }

    fn update_total_count_weights(&mut self, message: &AddValue<'_>) {
        let time = message.header.time;
        let buckets = (time - message.header.last_time) as f64 / self.bucket_length as f64;
        let weight = self.count_weight(time);
        self.total_count_weight_adjustment += buckets * (weight - 1.0);
        self.total_count_weight_adjustment = self.total_count_weight_adjustment.min(0.0);
        if self.total_count_weight_adjustment == 0.0 {
            self.minimum_total_count_weight_adjustment = (CHANGE_COUNT_WEIGHT - 1.0)
                * self.maximum_interval_to_detect_change(message.occupancy) as f64
                / self.bucket_length as f64;
        } else if self.total_count_weight_adjustment < self.minimum_total_count_weight_adjustment {
            self.minimum_total_count_weight_adjustment = 0.0;
        }
    }

    fn test_for_candidate_change(&mut self, message: &AddValue<'_>) {
        let time = message.header.time;
        if time < message.first_value_time + WARM_UP {
            return;
        }
        let error = (message.value - message.prediction()).abs();
        let sd = self.residual_moments.variance().sqrt();
        let beta = self.bucket_length as f64 / (4 * self.window_bucket_length()) as f64;
        let previous = self.large_error_fraction;
        let large = if error > LARGE_ERROR * sd { 1.0 } else { 0.0 };
        self.large_error_fraction = (1.0 - beta) * previous + beta * large;
        if previous <= CANDIDATE_LARGE_ERROR_FRACTION
            && self.large_error_fraction > CANDIDATE_LARGE_ERROR_FRACTION
            && time
                > self.last_candidate_change_point_time
                    + 2 * self.maximum_interval_to_detect_change(message.occupancy)
        {
            trace!(time, "Candidate change point");
            self.last_candidate_change_point_time = time;
        }
    }

    fn test_undo_last_change(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        let time = message.header.time;
        let elapsed = time - self.last_change_point_time;
        let minimum_length = self.minimum_change_length(message.occupancy);
        let maximum_interval = self.maximum_interval_to_detect_change(message.occupancy);
        let Some(undoable) = self.undoable_last_change.as_mut() else {
            return;
        };
        let predictor = (message.make_predictor)();
        undoable.add(time, message.value, message.weights.count, &predictor);
        if elapsed > minimum_length / 10 && undoable.should_undo() {
            if let Some(undoable) = self.undoable_last_change.take() {
                let reversal = undoable.into_reversal();
                debug!(time, change = %reversal.print(), "Undoing last change");
                self.last_change_outlier_weight_derate = OutlierWeightDerate::default();
                mediator.forward(&Message::DetectedChangePoint(DetectedChangePoint {
                    header: MessageHeader::new(time, message.header.last_time, message.header.breaker),
                    change: reversal,
                }));
            }
        } else if elapsed > maximum_interval {
            self.undoable_last_change = None;
        }
    }

    fn should_test(&self, time: i64, occupancy: f64) -> bool {
        if self.undoable_last_change.is_some() {
            return false;
        }
        let minimum_length = self.minimum_change_length(occupancy);
        time > self.last_test_time + minimum_length
            || (time > self.last_test_time + 3 * self.window_bucket_length()
                && time
                    < self.last_candidate_change_point_time
                        + self.maximum_interval_to_detect_change(occupancy)
                && time > self.last_candidate_change_point_time + minimum_length)
    }

    fn test_for_change(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        let time = message.header.time;
        if !self.should_test(time, message.occupancy) {
            return;
        }
        let wbl = self.window_bucket_length();
        let minimum_length = self.minimum_change_length(message.occupancy);
        let Some(first) = self.window.iter().position(|value| !value.is_empty()) else {
            return;
        };
        let length = self.window.len() - first;
        if wbl * length as i64 <= minimum_length {
            return;
        }

        let predictor = (message.make_predictor)();
        let buckets_start = self.start_of_window_bucket(time) - (length as i64 - 1) * wbl;
        // Window times are real times and the predictor applies the time shift.
        let values_start =
            buckets_start + (wbl - self.bucket_length) / 2 + (self.mean_offset.mean() + 0.5) as i64;
        let values: Vec<MeanAccumulator> = self.window.iter().skip(first).copied().collect();
        let test = TestForChange::new(
            predictor.has_seasonal(),
            values_start,
            buckets_start,
            wbl,
            predictor,
            values,
            0.0,
            OUTLIER_FRACTION * message.occupancy,
        );
        self.last_test_time = time;

        let Some(mut change) = test.test() else {
            return;
        };
        let threshold = LARGE_ERROR * self.residual_moments.variance().sqrt();
        if change.large_enough(threshold) && change.long_enough(time, minimum_length) {
            debug!(time, change = %change.print(), "Detected change point");
            add_mean_zero_normal_noise(self.residual_moments.variance(), change.residuals_mut());
            self.large_error_fraction = 0.0;
            self.last_change_point_time = time;
            self.last_candidate_change_point_time = self
                .last_candidate_change_point_time
                .min(time - self.maximum_interval_to_detect_change(message.occupancy));
            self.undoable_last_change = Some(change.undoable());
            self.last_change_outlier_weight_derate = change.outlier_weight_derate();
            mediator.forward(&Message::DetectedChangePoint(DetectedChangePoint {
                header: MessageHeader::new(time, message.header.last_time, message.header.breaker),
                change,
            }));
        } else {
            trace!(time, candidate = change.time(), "Change too small or too recent");
            self.last_candidate_change_point_time = change.time();
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.window.capacity() * std::mem::size_of::<MeanAccumulator>()
            + self.undoable_last_change.as_ref().map_or(0, |undoable| {
                undoable.reversal().samples().len() * std::mem::size_of::<(i64, f64)>()
            })
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_level(MACHINE_TAG, &mut |inserter| {
            self.machine.accept_persist_inserter(inserter)
        });
        let window: Vec<MeanAccumulator> = self.window.iter().copied().collect();
        inserter.insert_value(WINDOW_TAG, &means_to_delimited(&window));
        inserter.insert_value(MEAN_OFFSET_TAG, &self.mean_offset.to_delimited());
        inserter.insert_value(RESIDUAL_MOMENTS_TAG, &self.residual_moments.to_delimited());
        inserter.insert_value(LARGE_ERROR_FRACTION_TAG, &self.large_error_fraction.to_string());
        inserter.insert_value(
            TOTAL_COUNT_WEIGHT_ADJUSTMENT_TAG,
            &self.total_count_weight_adjustment.to_string(),
        );
        inserter.insert_value(
            MINIMUM_TOTAL_COUNT_WEIGHT_ADJUSTMENT_TAG,
            &self.minimum_total_count_weight_adjustment.to_string(),
        );
        inserter.insert_value(LAST_TEST_TIME_TAG, &self.last_test_time.to_string());
        inserter.insert_value(LAST_CHANGE_POINT_TIME_TAG, &self.last_change_point_time.to_string());
        inserter.insert_value(
            LAST_CANDIDATE_CHANGE_POINT_TIME_TAG,
            &self.last_candidate_change_point_time.to_string(),
        );
        if let Some(undoable) = &self.undoable_last_change {
            inserter.insert_level(UNDOABLE_LAST_CHANGE_TAG, &mut |inserter| {
                undoable.accept_persist_inserter(inserter)
            });
        }
        inserter.insert_level(OUTLIER_WEIGHT_DERATE_TAG, &mut |inserter| {
            self.last_change_outlier_weight_derate
                .accept_persist_inserter(inserter)
        });
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        self.undoable_last_change = None;
        loop {
            match traverser.name() {
                MACHINE_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    self.machine.accept_restore_traverser(traverser)
                })?,
                WINDOW_TAG => self.window = means_from_delimited(traverser.value())?.into(),
                MEAN_OFFSET_TAG => {
                    self.mean_offset = MeanAccumulator::from_delimited(traverser.value())?
                }
                RESIDUAL_MOMENTS_TAG => {
                    self.residual_moments = MeanVarAccumulator::from_delimited(traverser.value())?
                }
                LARGE_ERROR_FRACTION_TAG => self.large_error_fraction = restore_value(traverser)?,
                TOTAL_COUNT_WEIGHT_ADJUSTMENT_TAG => {
                    self.total_count_weight_adjustment = restore_value(traverser)?
                }
                MINIMUM_TOTAL_COUNT_WEIGHT_ADJUSTMENT_TAG => {
                    self.minimum_total_count_weight_adjustment = restore_value(traverser)?
                }
                LAST_TEST_TIME_TAG => self.last_test_time = restore_value(traverser)?,
                LAST_CHANGE_POINT_TIME_TAG => self.last_change_point_time = restore_value(traverser)?,
                LAST_CANDIDATE_CHANGE_POINT_TIME_TAG => {
                    self.last_candidate_change_point_time = restore_value(traverser)?
                }
                UNDOABLE_LAST_CHANGE_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    self.undoable_last_change = Some(UndoableChange::restore(traverser)?);
                    Ok(())
                })?,
                OUTLIER_WEIGHT_DERATE_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    self.last_change_outlier_weight_derate
                        .accept_restore_traverser(traverser)
                })?,
                "" => {}
                other => return Err(DecompositionError::parse(other, traverser.value())),
            }
            if !traverser.next() {
                break;
            }
        }
        if self.machine.state() == CD_TEST && self.window.len() != self.window_size() {
            return Err(DecompositionError::parse(
                WINDOW_TAG,
                format!("{} buckets", self.window.len()),
            ));
        }
        Ok(())
    }
}

impl Handler for ChangePointTest {
    fn handle_add_value(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        match self.machine.state() {
            CD_TEST => {
                self.update_window(message);
                self.residual_moments.add(
                    message.value - message.prediction(),
                    message.weights.count_for_update(),
                );
                self.update_total_count_weights(message);
                self.test_for_candidate_change(message);
                self.test_undo_last_change(message, mediator);
                self.test_for_change(message, mediator);
            }
            CD_NOT_TESTING => {}
            state => {
                error!(state, "Change point test in a bad state");
                self.apply(CD_RESET);
            }
        }
    }

    fn handle_detected_seasonal(&mut self, message: &DetectedSeasonal<'_>, _mediator: &Mediator) {
        match self.machine.state() {
            CD_TEST => self.reset(message.header.time),
            CD_NOT_TESTING => {}
            state => {
                error!(state, "Change point test in a bad state");
                self.apply(CD_RESET);
            }
        }
    }
}

impl Checksum for ChangePointTest {
    fn checksum(&self, seed: u64) -> u64 {
        let mut seed = self.machine.checksum(seed);
        seed = self.decay_rate.checksum(seed);
        seed = self.bucket_length.checksum(seed);
        for value in &self.window {
            seed = value.checksum(seed);
        }
        seed = self.mean_offset.checksum(seed);
        seed = self.residual_moments.checksum(seed);
        seed = self.large_error_fraction.checksum(seed);
        seed = self.total_count_weight_adjustment.checksum(seed);
        seed = self.minimum_total_count_weight_adjustment.checksum(seed);
        seed = self.last_test_time.checksum(seed);
        seed = self.last_change_point_time.checksum(seed);
        seed = self.last_candidate_change_point_time.checksum(seed);
        seed = self.undoable_last_change.checksum(seed);
        self.last_change_outlier_weight_derate.checksum(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_detection::{ChangeKind, ChangePoint};
    use crate::message::{DetectedSeasonal, SeasonalityTestInput};
    use crate::persist::StateTree;
    use crate::predictor::PredictionModel;
    use crate::seasonality_decomposition::{
        SeasonalDecomposition, SeasonalityDecompositionTest, SeasonalityTestParameters,
    };
    use crate::seasonal_component::SeasonalComponent;
    use decomposition_spi::{AlwaysAllowAllocations, SampleWeights, SeasonalTime};
    use std::f64::consts::PI;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;

    const START: i64 = 1_609_545_600;

    /// Records the change points it is sent
    #[derive(Default)]
    struct Changes {
        seen: Vec<ChangePoint>,
    }

    impl Handler for Changes {
        fn handle_detected_change_point(&mut self, message: &DetectedChangePoint<'_>, _: &Mediator) {
            self.seen.push(message.change.clone());
        }
    }

    struct Harness {
        test: Rc<RefCell<ChangePointTest>>,
        changes: Rc<RefCell<Changes>>,
        mediator: Mediator,
        last_time: i64,
    }

    impl Harness {
        fn new() -> Self {
            let test = Rc::new(RefCell::new(ChangePointTest::new(0.01, HOUR)));
            let changes = Rc::new(RefCell::new(Changes::default()));
            let mut mediator = Mediator::new();
            mediator.register_handler(test.clone());
            mediator.register_handler(changes.clone());
            Self {
                test,
                changes,
                mediator,
                last_time: START,
            }
        }

        fn add(&mut self, time: i64, value: f64) {
            self.add_predicted(time, value, &PredictionModel::default());
        }

        fn add_predicted(&mut self, time: i64, value: f64, predictor: &PredictionModel) {
            let breaker = AlwaysAllowAllocations;
            let make_predictor = || predictor.clone();
            let make_filtered_predictor = |_: &[bool]| PredictionModel::default();
            let parameters = SeasonalityTestParameters {
                base_bucket_length: HOUR,
                component_size: 36,
                minimum_period: HOUR,
                minimum_resolution: 12,
            };
            let make_test = |input: &SeasonalityTestInput<'_>| {
                SeasonalityDecompositionTest::new(
                    parameters,
                    input.window,
                    input.preconditioner,
                    input.modelled,
                    input.testable,
                )
            };
            self.mediator.forward(&Message::AddValue(AddValue {
                header: MessageHeader::new(time, self.last_time, &breaker),
                time_shift: predictor.time_shift(),
                value,
                weights: SampleWeights::unit(),
                occupancy: 1.0,
                first_value_time: START,
                trend: 0.0,
                seasonal: predictor.predict(time),
                calendar: 0.0,
                make_predictor: &make_predictor,
                make_filtered_predictor: &make_filtered_predictor,
                make_test_for_seasonality: &make_test,
            }));
            self.last_time = time;
        }
    }

    fn feed(harness: &mut Harness, rng: &mut StdRng, hours: std::ops::Range<i64>, level: f64) {
        for i in hours {
            harness.add(START + i * HOUR, level + rng.gen_range(-1.0..1.0));
        }
    }

    #[test]
    fn test_window_and_change_lengths() {
        let test = ChangePointTest::new(0.01, HOUR);
        assert_eq!(test.window_size(), 96);
        assert_eq!(test.minimum_change_length(1.0), 30 * HOUR);
        assert_eq!(test.maximum_interval_to_detect_change(1.0), 50 * HOUR);
        assert_eq!(test.minimum_change_length(0.25), 60 * HOUR);

        let test = ChangePointTest::new(0.01, 300);
        assert_eq!(test.window_bucket_length(), HOUR);
        let test = ChangePointTest::new(0.01, 2 * HOUR);
        assert_eq!(test.window_size(), 48);
        assert_eq!(test.minimum_change_length(1.0), 30 * HOUR);
    }

    #[test]
    fn test_detects_level_shift_once() {
        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(1);
        feed(&mut harness, &mut rng, 0..240, 0.0);
        assert!(harness.changes.borrow().seen.is_empty());
        feed(&mut harness, &mut rng, 240..285, 10.0);

        let changes = harness.changes.borrow();
        assert_eq!(changes.seen.len(), 1);
        let change = &changes.seen[0];
        match change.kind() {
            ChangeKind::LevelShift { shift } => assert!((shift - 10.0).abs() < 2.0, "shift = {}", shift),
            kind => panic!("unexpected change {:?}", kind),
        }
        assert!((change.time() - (START + 240 * HOUR)).abs() <= 2 * HOUR);
        assert!(!change.residuals().is_empty());
        assert!(harness.test.borrow().has_undoable_change());
    }

    #[test]
    fn test_detects_level_shift_after_time_shift() {
        let daily = |t: i64| 20.0 * (2.0 * PI * (t - START) as f64 / DAY as f64).sin();
        let mut component = SeasonalComponent::new(SeasonalTime::unwindowed(DAY), 24, 0.0);
        for i in 0..24 * 14 {
            let t = START + i * HOUR + HOUR / 2;
            component.add(t, daily(t), 1.0);
        }
        component.interpolate(START + 14 * DAY, true);
        // The model has already absorbed a three hour shift of the daily cycle.
        let predictor = PredictionModel::new(None, false, vec![component], Vec::new(), 3 * HOUR);

        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(6);
        for i in 0..285 {
            let time = START + i * HOUR;
            let level = if i >= 240 { 10.0 } else { 0.0 };
            let value = daily(time + 3 * HOUR) + level + rng.gen_range(-1.0..1.0);
            harness.add_predicted(time, value, &predictor);
        }

        let changes = harness.changes.borrow();
        assert_eq!(changes.seen.len(), 1, "{:?}", changes.seen.iter().map(ChangePoint::kind).collect::<Vec<_>>());
        match changes.seen[0].kind() {
            ChangeKind::LevelShift { shift } => assert!((shift - 10.0).abs() < 2.0, "shift = {}", shift),
            kind => panic!("unexpected change {:?}", kind),
        }
        assert!((changes.seen[0].time() - (START + 240 * HOUR)).abs() <= 2 * HOUR);
    }

    #[test]
    fn test_residual_moments_ignore_count_weight() {
        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(3);
        feed(&mut harness, &mut rng, 0..240, 0.0);
        feed(&mut harness, &mut rng, 240..244, 10.0);
        let test = harness.test.borrow();
        assert_eq!(test.count_weight(START + 244 * HOUR), CHANGE_COUNT_WEIGHT);
        // Every value counts fully, so the aged count is the same as with no change.
        let mut unweighted = Harness::new();
        let mut rng = StdRng::seed_from_u64(3);
        feed(&mut unweighted, &mut rng, 0..244, 0.0);
        let expected = unweighted.test.borrow().residual_moments.count();
        assert!((test.residual_moments.count() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_single_spike_is_not_a_change() {
        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(2);
        feed(&mut harness, &mut rng, 0..240, 0.0);
        harness.add(START + 240 * HOUR, 20.0);
        feed(&mut harness, &mut rng, 241..336, 0.0);
        assert!(harness.changes.borrow().seen.is_empty());
        assert!(!harness.test.borrow().has_undoable_change());
    }

    #[test]
    fn test_count_weight_drops_while_change_suspected() {
        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(3);
        feed(&mut harness, &mut rng, 0..240, 0.0);
        assert_eq!(harness.test.borrow().count_weight(START + 240 * HOUR), 1.0);
        feed(&mut harness, &mut rng, 240..244, 10.0);
        let test = harness.test.borrow();
        assert_eq!(test.count_weight(START + 244 * HOUR), CHANGE_COUNT_WEIGHT);
        assert!(test.last_candidate_change_point_time() >= START + 236 * HOUR);
    }

    #[test]
    fn test_detected_seasonal_resets() {
        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(4);
        feed(&mut harness, &mut rng, 0..100, 0.0);
        let time = START + 100 * HOUR;
        let breaker = AlwaysAllowAllocations;
        harness
            .mediator
            .forward(&Message::DetectedSeasonal(DetectedSeasonal {
                header: MessageHeader::new(time, time - HOUR, &breaker),
                decomposition: SeasonalDecomposition::default(),
            }));
        let test = harness.test.borrow();
        assert!(test.window.iter().all(MeanAccumulator::is_empty));
        assert_eq!(test.window.len(), 96);
        assert_eq!(test.residual_moments.count(), 0.0);
        assert_eq!(
            test.last_candidate_change_point_time(),
            time - 4 * test.maximum_interval_to_detect_change(1.0)
        );
    }

    #[test]
    fn test_for_forecast_never_tests() {
        let test = ChangePointTest::new(0.01, HOUR).for_forecast();
        assert_eq!(test.state(), CD_NOT_TESTING);
        assert!(test.window.is_empty());
        let mut harness = Harness::new();
        *harness.test.borrow_mut() = test;
        let mut rng = StdRng::seed_from_u64(5);
        feed(&mut harness, &mut rng, 0..240, 0.0);
        feed(&mut harness, &mut rng, 240..300, 10.0);
        assert!(harness.changes.borrow().seen.is_empty());
        assert_eq!(harness.test.borrow().residual_moments.count(), 0.0);
    }

    #[test]
    fn test_bad_state_resets() {
        let mut harness = Harness::new();
        harness.test.borrow_mut().machine = StateMachine::new(&CHANGE_DETECTOR_MACHINE, 11);
        harness.add(START, 1.0);
        assert_eq!(harness.test.borrow().state(), CD_TEST);
        assert_eq!(harness.test.borrow().window.len(), 96);
    }

    #[test]
    fn test_outlier_weight_derate_fades() {
        let mut test = ChangePointTest::new(0.01, HOUR);
        test.last_change_point_time = START;
        test.last_change_outlier_weight_derate = OutlierWeightDerate::new(10.0);
        assert_eq!(test.outlier_weight_derate(START, 20.0), 1.0);
        assert!((test.outlier_weight_derate(START + DAY, 5.0) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(test.outlier_weight_derate(START + 4 * DAY, 20.0), 0.0);
    }

    #[test]
    fn test_persist_round_trip() {
        let mut harness = Harness::new();
        let mut rng = StdRng::seed_from_u64(6);
        feed(&mut harness, &mut rng, 0..240, 0.0);
        feed(&mut harness, &mut rng, 240..285, 10.0);
        let test = harness.test.borrow();
        assert!(test.has_undoable_change());

        let tree = StateTree::persist(|inserter| test.accept_persist_inserter(inserter));
        let mut restored = ChangePointTest::new(0.01, HOUR);
        tree.restore(|traverser| restored.accept_restore_traverser(traverser))
            .unwrap();
        assert_eq!(restored.checksum(0), test.checksum(0));
        let again = StateTree::persist(|inserter| restored.accept_persist_inserter(inserter));
        assert_eq!(again.to_json().unwrap(), tree.to_json().unwrap());
    }

    #[test]
    fn test_restore_rejects_unknown_tag() {
        let tree = StateTree::persist(|inserter| inserter.insert_value("z", "1"));
        let mut restored = ChangePointTest::new(0.01, HOUR);
        assert!(tree
            .restore(|traverser| restored.accept_restore_traverser(traverser))
            .is_err());
    }
}
