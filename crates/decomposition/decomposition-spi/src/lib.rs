//! Decomposition Service Provider Interface
//!
//! Defines the contracts and plain models shared by the online time series
//! decomposition engine: the memory circuit breaker, the hierarchical state
//! persistence traits, sample weights, seasonal time windows and calendar
//! features.

pub mod contract;
pub mod error;
pub mod model;

// Re-export all public items at crate root for convenience
pub use contract::{
    restore_value, AlwaysAllowAllocations, DenyAllocations, MemoryCircuitBreaker,
    StatePersistInserter, StateRestoreTraverser,
};
pub use error::{DecompositionError, Result};
pub use model::{
    ceil, floor, intervals_crossed, month_of_year, CalendarFeature, SampleWeights, SeasonalTime,
    DAY, HOUR, MONTH, WEEK, WINDOW_ORIGIN, YEAR,
};
