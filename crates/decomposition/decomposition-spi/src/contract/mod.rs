//! Contract module containing trait definitions shared by the engine

mod memory_circuit_breaker;
mod state_persist;

pub use memory_circuit_breaker::{AlwaysAllowAllocations, DenyAllocations, MemoryCircuitBreaker};
pub use state_persist::{restore_value, StatePersistInserter, StateRestoreTraverser};
