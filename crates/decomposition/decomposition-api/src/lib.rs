//! Decomposition API
//!
//! **WARNING: This is an internal crate. Do not depend on it directly.**
//! **Use `decomposition-facade` instead for a stable public API.**
//!
//! Configuration types for the online time series decomposition engine.

mod config;

pub use config::{DecompositionConfig, FromConfig};

// Re-export SPI types
pub use decomposition_spi::{
    AlwaysAllowAllocations, CalendarFeature, DecompositionError, DenyAllocations,
    MemoryCircuitBreaker, Result, SampleWeights, SeasonalTime, StatePersistInserter,
    StateRestoreTraverser, DAY, HOUR, MONTH, WEEK, YEAR,
};

// Re-export the engine
pub use decomposition_core::{
    AnnotationCallback, CallbackGuard, Checksum, ComponentChangeCallback, DecayRateController,
    Decomposition, MeanAccumulator, PredictionModel, StateTree,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Checksum, FromConfig};
    pub use crate::{Decomposition, DecompositionConfig};
    pub use crate::{AlwaysAllowAllocations, MemoryCircuitBreaker, SampleWeights};
    pub use crate::{DecompositionError, Result};
}
