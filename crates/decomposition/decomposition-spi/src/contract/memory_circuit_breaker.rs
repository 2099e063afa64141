//! Trait for memory pressure signalling

/// Queried before any operation which grows the engine's state.
///
/// When allocations are refused the engine keeps updating its bounded
/// state but skips creating new windows or components.
pub trait MemoryCircuitBreaker {
    /// Whether new allocations are currently permitted
    fn allocations_allowed(&self) -> bool;
}

/// Breaker which never trips
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllowAllocations;

impl MemoryCircuitBreaker for AlwaysAllowAllocations {
    fn allocations_allowed(&self) -> bool {
        true
    }
}

/// Breaker for a process sitting at its hard memory limit
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllocations;

impl MemoryCircuitBreaker for DenyAllocations {
    fn allocations_allowed(&self) -> bool {
        false
    }
}
