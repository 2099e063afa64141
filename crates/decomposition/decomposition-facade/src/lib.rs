//! Decomposition Facade
//!
//! Single entry point to the online time series decomposition engine:
//! - `Decomposition`, with value updates, predictions and persistence
//! - `DecompositionConfig` and `FromConfig` from API
//! - Contracts and models such as `MemoryCircuitBreaker` and `SampleWeights` from SPI

// Re-export everything from decomposition-api
pub use decomposition_api::*;

// Re-export prelude for convenience
pub use decomposition_api::prelude;
