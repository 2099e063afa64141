//! Calendar test handler
//!
//! Feeds prediction errors to a [`CalendarCyclicTest`] and tests it once
//! a month for calendar effects.

use decomposition_spi::{
    intervals_crossed, month_of_year, restore_value, DecompositionError, Result,
    StatePersistInserter, StateRestoreTraverser, DAY,
};
use tracing::{debug, error, trace};

use crate::calendar_cyclic_test::CalendarCyclicTest;
use crate::checksum::Checksum;
use crate::mediator::{Handler, Mediator};
use crate::message::{AddValue, DetectedCalendar, DetectedSeasonal, Message, MessageHeader};
use crate::state_machine::{
    StateMachine, CALENDAR_TEST_MACHINE, CC_INITIAL, CC_NEW_VALUE, CC_NOT_TESTING, CC_RESET,
    CC_TEST,
};

const MACHINE_TAG: &str = "a";
const LAST_MONTH_TAG: &str = "b";
const TEST_TAG: &str = "c";

#[derive(Debug, Clone)]
pub struct CalendarTest {
    machine: StateMachine,
    decay_rate: f64,
    bucket_length: i64,
    last_month: u32,
    test: Option<CalendarCyclicTest>,
}

impl CalendarTest {
    pub fn new(decay_rate: f64, bucket_length: i64) -> Self {
        let state = if bucket_length > DAY {
            CC_NOT_TESTING
        } else {
            CC_INITIAL
        };
        Self {
            machine: StateMachine::new(&CALENDAR_TEST_MACHINE, state),
            decay_rate,
            bucket_length,
            last_month: 0,
            test: None,
        }
    }

    /// A copy which never tests.
    pub fn for_forecast(&self) -> Self {
        Self {
            machine: StateMachine::new(&CALENDAR_TEST_MACHINE, CC_NOT_TESTING),
            decay_rate: self.decay_rate,
            bucket_length: self.bucket_length,
            last_month: self.last_month,
            test: None,
        }
    }

    pub fn state(&self) -> usize {
        self.machine.state()
    }

    pub fn set_decay_rate(&mut self, decay_rate: f64) {
        self.decay_rate = decay_rate;
        if let Some(test) = &mut self.test {
            test.set_decay_rate(decay_rate);
        }
    }

    fn apply(&mut self, symbol: usize, time: i64) {
        let old = self.machine.state();
        let new = self.machine.apply(symbol);
        if old == new {
            return;
        }
        trace!(
            symbol = self.machine.symbol_name(symbol),
            state = self.machine.state_name(),
            "Calendar test transition"
        );
        match new {
            CC_TEST => {
                if self.test.is_none() {
                    self.test = Some(CalendarCyclicTest::new(self.decay_rate));
                    self.last_month = month_of_year(time) + 2;
                }
            }
            CC_NOT_TESTING | CC_INITIAL => {
                self.test = None;
                self.last_month = 0;
            }
            state => {
                error!(state, "Calendar test in a bad state");
                self.apply(CC_RESET, time);
            }
        }
    }

    /// True on the first value of each new month.
    fn should_test(&mut self, time: i64) -> bool {
        let month = month_of_year(time);
        if month == (self.last_month + 1) % 12 {
            self.last_month = month;
            return true;
        }
        false
    }

    fn test(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        let time = message.header.time;
        if !self.should_test(time) {
            return;
        }
        match self.machine.state() {
            CC_TEST => {
                let found = self.test.as_ref().map(CalendarCyclicTest::test).unwrap_or_default();
                for (feature, time_zone_offset) in found {
                    debug!(time, %feature, time_zone_offset, "Detected calendar feature");
                    mediator.forward(&Message::DetectedCalendar(DetectedCalendar {
                        header: MessageHeader::new(time, message.header.last_time, message.header.breaker),
                        feature,
                        time_zone_offset,
                    }));
                }
            }
            CC_NOT_TESTING | CC_INITIAL => {}
            state => {
                error!(state, "Calendar test in a bad state");
                self.apply(CC_RESET, time);
            }
        }
    }

    pub fn propagate_forwards(&mut self, start: i64, end: i64) {
        let days = intervals_crossed(start, end, DAY);
        if let (Some(test), true) = (&mut self.test, days > 0) {
            test.propagate_forwards_by_time(days as f64);
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.test.as_ref().map_or(0, CalendarCyclicTest::memory_usage)
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_level(MACHINE_TAG, &mut |inserter| {
            self.machine.accept_persist_inserter(inserter)
        });
        inserter.insert_value(LAST_MONTH_TAG, &self.last_month.to_string());
        if let Some(test) = &self.test {
            inserter.insert_level(TEST_TAG, &mut |inserter| test.accept_persist_inserter(inserter));
        }
    }

    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        self.test = None;
        loop {
            match traverser.name() {
                MACHINE_TAG => traverser.traverse_sub_level(&mut |traverser| {
                    self.machine.accept_restore_traverser(traverser)
                })?,
                LAST_MONTH_TAG => self.last_month = restore_value(traverser)?,
                TEST_TAG => {
                    let decay_rate = self.decay_rate;
                    traverser.traverse_sub_level(&mut |traverser| {
                        self.test = Some(CalendarCyclicTest::restore(decay_rate, traverser)?);
                        Ok(())
                    })?
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

impl Handler for CalendarTest {
    fn handle_add_value(&mut self, message: &AddValue<'_>, mediator: &Mediator) {
        self.test(message, mediator);

        match self.machine.state() {
            CC_TEST => {
                if !message.header.allocations_allowed() {
                    return;
                }
                if let Some(test) = &mut self.test {
                    test.add(
                        message.header.time,
                        message.value - message.prediction(),
                        message.weights.count_for_update(),
                    );
                }
            }
            CC_NOT_TESTING => {}
            CC_INITIAL => {
                self.apply(CC_NEW_VALUE, message.header.time);
                self.handle_add_value(message, mediator);
            }
            state => {
                error!(state, "Calendar test in a bad state");
                self.apply(CC_RESET, message.header.time);
            }
        }
    }

    fn handle_detected_seasonal(&mut self, message: &DetectedSeasonal<'_>, _mediator: &Mediator) {
        match self.machine.state() {
            CC_TEST => {
                if let Some(test) = &mut self.test {
                    test.forget_error_distribution();
                }
            }
            CC_NOT_TESTING | CC_INITIAL => {}
            state => {
                error!(state, "Calendar test in a bad state");
                self.apply(CC_RESET, message.header.time);
            }
        }
    }
}

impl Checksum for CalendarTest {
    fn checksum(&self, seed: u64) -> u64 {
        let seed = self.machine.checksum(seed);
        let seed = self.decay_rate.checksum(seed);
        let seed = self.bucket_length.checksum(seed);
        let seed = self.last_month.checksum(seed);
        self.test.checksum(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::StateTree;
    use crate::predictor::PredictionModel;
    use crate::message::SeasonalityTestInput;
    use crate::seasonality_decomposition::{
        SeasonalityDecompositionTest, SeasonalityTestParameters,
    };
    use decomposition_spi::{AlwaysAllowAllocations, CalendarFeature, SampleWeights, HOUR};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;

    // 2021-01-01 00:00:00 UTC
    const START: i64 = 1_609_459_200;

    #[derive(Default)]
    struct Features {
        seen: Vec<(i64, CalendarFeature)>,
        offsets: Vec<i64>,
    }

    impl Handler for Features {
        fn handle_detected_calendar(&mut self, message: &DetectedCalendar<'_>, _: &Mediator) {
            self.seen.push((message.header.time, message.feature));
            self.offsets.push(message.time_zone_offset);
        }
    }

    fn run(bucket_length: i64, days: i64, effect: impl Fn(i64) -> f64) -> (CalendarTest, Vec<(i64, CalendarFeature)>) {
        let (test, features) = run_with_offsets(bucket_length, days, effect);
        (test, features.seen)
    }

    fn run_with_offsets(bucket_length: i64, days: i64, effect: impl Fn(i64) -> f64) -> (CalendarTest, Features) {
        let test = Rc::new(RefCell::new(CalendarTest::new(0.01, bucket_length)));
        let features = Rc::new(RefCell::new(Features::default()));
        let mut mediator = Mediator::new();
        mediator.register_handler(test.clone());
        mediator.register_handler(features.clone());

        let breaker = AlwaysAllowAllocations;
        let make_predictor = PredictionModel::default;
        let make_filtered_predictor = |_: &[bool]| PredictionModel::default();
        let make_test = |input: &SeasonalityTestInput<'_>| {
            SeasonalityDecompositionTest::new(
                SeasonalityTestParameters {
                    base_bucket_length: bucket_length,
                    component_size: 36,
                    minimum_period: input.minimum_period,
                    minimum_resolution: input.minimum_resolution,
                },
                input.window,
                input.preconditioner,
                input.modelled,
                input.testable,
            )
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut last_time = START;
        for i in 0..(days * DAY / bucket_length) {
            let time = START + i * bucket_length;
            mediator.forward(&Message::AddValue(AddValue {
                header: MessageHeader::new(time, last_time, &breaker),
                time_shift: 0,
                value: effect(time) + rng.gen_range(-1.0..1.0),
                weights: SampleWeights::unit(),
                occupancy: 1.0,
                first_value_time: START,
                trend: 0.0,
                seasonal: 0.0,
                calendar: 0.0,
                make_predictor: &make_predictor,
                make_filtered_predictor: &make_filtered_predictor,
                make_test_for_seasonality: &make_test,
            }));
            last_time = time;
        }
        let test = test.borrow().clone();
        let features = std::mem::take(&mut *features.borrow_mut());
        (test, features)
    }

    #[test]
    fn test_long_buckets_disable_testing() {
        assert_eq!(CalendarTest::new(0.01, 2 * DAY).state(), CC_NOT_TESTING);
        assert_eq!(CalendarTest::new(0.01, DAY).state(), CC_INITIAL);
    }

    #[test]
    fn test_first_value_starts_testing() {
        let (test, seen) = run(HOUR, 1, |_| 0.0);
        assert_eq!(test.state(), CC_TEST);
        assert!(test.test.is_some());
        // January, so the first test is at the start of April.
        assert_eq!(test.last_month, 2);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_tests_monthly_and_finds_month_start() {
        let (test, seen) = run(HOUR, 150, |time| {
            if CalendarFeature::DayOfMonth(0).in_window(time) {
                10.0
            } else {
                0.0
            }
        });
        assert_eq!(test.last_month, month_of_year(START + 149 * DAY));
        assert!(!seen.is_empty());
        assert!(seen
            .iter()
            .all(|(_, feature)| *feature == CalendarFeature::DayOfMonth(0)));
        // Tests only happen on the first value of a month.
        assert!(seen
            .iter()
            .all(|(time, _)| CalendarFeature::DayOfMonth(0).in_window(*time)));
    }

    #[test]
    fn test_forwards_every_feature_found() {
        let (_, features) = run_with_offsets(HOUR, 150, |time| {
            if CalendarFeature::DayOfMonth(0).in_window(time) {
                10.0
            } else if CalendarFeature::DayOfMonth(14).in_window(time + 6 * HOUR) {
                -10.0
            } else {
                0.0
            }
        });
        let found: Vec<(CalendarFeature, i64)> = features
            .seen
            .iter()
            .map(|(_, feature)| *feature)
            .zip(features.offsets.iter().copied())
            .collect();
        assert!(found.contains(&(CalendarFeature::DayOfMonth(0), 0)), "{:?}", found);
        assert!(
            found.contains(&(CalendarFeature::DayOfMonth(14), 6 * HOUR)),
            "{:?}",
            found
        );
        // Both are found by the same monthly test.
        let first = features.seen.first().map(|(time, _)| *time);
        assert_eq!(
            features.seen.iter().filter(|(time, _)| Some(*time) == first).count(),
            2
        );
    }

    #[test]
    fn test_no_features_in_noise() {
        let (_, seen) = run(HOUR, 150, |_| 0.0);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_for_forecast_never_tests() {
        let (test, _) = run(HOUR, 2, |_| 0.0);
        let copy = test.for_forecast();
        assert_eq!(copy.state(), CC_NOT_TESTING);
        assert!(copy.test.is_none());
    }

    #[test]
    fn test_persist_round_trip() {
        let (test, _) = run(HOUR, 10, |_| 1.0);
        let tree = StateTree::persist(|inserter| test.accept_persist_inserter(inserter));
        let mut restored = CalendarTest::new(0.01, HOUR);
        tree.restore(|traverser| restored.accept_restore_traverser(traverser))
            .unwrap();
        assert_eq!(restored.checksum(0), test.checksum(0));
        let again = StateTree::persist(|inserter| restored.accept_persist_inserter(inserter));
        assert_eq!(again.to_json().unwrap(), tree.to_json().unwrap());
    }
}
