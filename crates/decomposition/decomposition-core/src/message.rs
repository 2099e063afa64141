//! Messages passed between the decomposition's handlers
//!
//! Messages live on the stack for the duration of one synchronous
//! [`Mediator::forward`](crate::mediator::Mediator::forward) and are never
//! stored.

use decomposition_spi::{CalendarFeature, MemoryCircuitBreaker, SampleWeights, SeasonalTime};

use crate::change_detection::ChangePoint;
use crate::expanding_window::ExpandingWindow;
use crate::predictor::PredictionModel;
use crate::seasonality_decomposition::{SeasonalDecomposition, SeasonalityDecompositionTest};
use crate::stats::MeanAccumulator;

/// Fields every message carries
#[derive(Clone, Copy)]
pub struct MessageHeader<'a> {
    pub time: i64,
    pub last_time: i64,
    pub breaker: &'a dyn MemoryCircuitBreaker,
}

impl<'a> MessageHeader<'a> {
    pub fn new(time: i64, last_time: i64, breaker: &'a dyn MemoryCircuitBreaker) -> Self {
        Self {
            time,
            last_time,
            breaker,
        }
    }

    pub fn allocations_allowed(&self) -> bool {
        self.breaker.allocations_allowed()
    }
}

/// What the seasonality test hands the test factory for one window
pub struct SeasonalityTestInput<'a> {
    pub window: &'a ExpandingWindow,
    /// Prediction of the components the test can't see at this resolution
    pub preconditioner: &'a PredictionModel,
    pub modelled: &'a [SeasonalTime],
    pub testable: &'a [bool],
    pub minimum_period: i64,
    pub minimum_resolution: usize,
}

pub type MakePredictor<'a> = &'a dyn Fn() -> PredictionModel;
pub type MakeFilteredPredictor<'a> = &'a dyn Fn(&[bool]) -> PredictionModel;
pub type MakeTestForSeasonality<'a> =
    &'a dyn Fn(&SeasonalityTestInput<'_>) -> SeasonalityDecompositionTest;

/// A new value with the model's predictions at its time
pub struct AddValue<'a> {
    pub header: MessageHeader<'a>,
    pub time_shift: i64,
    pub value: f64,
    pub weights: SampleWeights,
    pub occupancy: f64,
    pub first_value_time: i64,
    pub trend: f64,
    pub seasonal: f64,
    pub calendar: f64,
    pub make_predictor: MakePredictor<'a>,
    pub make_filtered_predictor: MakeFilteredPredictor<'a>,
    pub make_test_for_seasonality: MakeTestForSeasonality<'a>,
}

impl AddValue<'_> {
    pub fn prediction(&self) -> f64 {
        self.trend + self.seasonal + self.calendar
    }
}

pub struct DetectedSeasonal<'a> {
    pub header: MessageHeader<'a>,
    pub decomposition: SeasonalDecomposition,
}

pub struct DetectedCalendar<'a> {
    pub header: MessageHeader<'a>,
    pub feature: CalendarFeature,
    pub time_zone_offset: i64,
}

pub struct DetectedTrend<'a> {
    pub header: MessageHeader<'a>,
    pub predictor: PredictionModel,
    pub component_change: &'a dyn Fn(Vec<MeanAccumulator>),
}

pub struct DetectedChangePoint<'a> {
    pub header: MessageHeader<'a>,
    pub change: ChangePoint,
}

pub enum Message<'a> {
    AddValue(AddValue<'a>),
    DetectedSeasonal(DetectedSeasonal<'a>),
    DetectedCalendar(DetectedCalendar<'a>),
    DetectedTrend(DetectedTrend<'a>),
    DetectedChangePoint(DetectedChangePoint<'a>),
}

impl<'a> Message<'a> {
    pub fn header(&self) -> &MessageHeader<'a> {
        match self {
            Self::AddValue(message) => &message.header,
            Self::DetectedSeasonal(message) => &message.header,
            Self::DetectedCalendar(message) => &message.header,
            Self::DetectedTrend(message) => &message.header,
            Self::DetectedChangePoint(message) => &message.header,
        }
    }

    pub fn time(&self) -> i64 {
        self.header().time
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddValue(_) => "add_value",
            Self::DetectedSeasonal(_) => "detected_seasonal",
            Self::DetectedCalendar(_) => "detected_calendar",
            Self::DetectedTrend(_) => "detected_trend",
            Self::DetectedChangePoint(_) => "detected_change_point",
        }
    }
}
