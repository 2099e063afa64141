//! Decomposition Core
//!
//! Online decomposition of a time series into trend, seasonal and calendar
//! components. Four handlers connected by a synchronous mediator test for
//! change points, seasonality and calendar effects and maintain the
//! additive model.

pub mod calendar_component;
pub mod calendar_test;
pub mod callbacks;
pub mod change_detection;
pub mod change_point_test;
pub mod checksum;
pub mod components;
pub mod decay_rate_controller;
pub mod decomposition;
pub mod expanding_window;
pub mod mediator;
pub mod message;
pub mod persist;
pub mod predictor;
pub mod regression;
pub mod sampling;
pub mod seasonal_component;
pub mod seasonality_decomposition;
pub mod state_machine;
pub mod stats;
pub mod trend_component;

// Re-export SPI contracts and models
pub use decomposition_spi::{
    AlwaysAllowAllocations, CalendarFeature, DecompositionError, DenyAllocations,
    MemoryCircuitBreaker, Result, SampleWeights, SeasonalTime, StatePersistInserter,
    StateRestoreTraverser, DAY, HOUR, MONTH, WEEK, YEAR,
};

// Re-export main types
pub use callbacks::{AnnotationCallback, CallbackGuard, ComponentChangeCallback};
pub use checksum::Checksum;
pub use decay_rate_controller::DecayRateController;
pub use decomposition::Decomposition;
pub use persist::StateTree;
pub use predictor::PredictionModel;
pub use stats::MeanAccumulator;
