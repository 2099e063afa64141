//! Traits for hierarchical state persistence
//!
//! State is written as an ordered tree of tagged entries. Leaves hold
//! text values and inner nodes hold nested levels. Tags are short stable
//! strings and may repeat within a level.

use std::str::FromStr;

use crate::error::{DecompositionError, Result};

/// Write side of the state tree
pub trait StatePersistInserter {
    /// Append a leaf value under `tag`
    fn insert_value(&mut self, tag: &str, value: &str);

    /// Append a nested level under `tag`, filled in by `writer`
    fn insert_level(&mut self, tag: &str, writer: &mut dyn FnMut(&mut dyn StatePersistInserter));
}

/// Read side of the state tree
///
/// A traverser is positioned on one entry of one level at a time.
pub trait StateRestoreTraverser {
    /// Tag of the current entry, empty for an empty level
    fn name(&self) -> &str;

    /// Leaf value of the current entry, empty for levels
    fn value(&self) -> &str;

    /// Whether the current entry is a nested level
    fn has_sub_level(&self) -> bool;

    /// Advance to the next entry of this level, false at the end
    fn next(&mut self) -> bool;

    /// Descend into the current entry's nested level
    fn traverse_sub_level(
        &mut self,
        reader: &mut dyn FnMut(&mut dyn StateRestoreTraverser) -> Result<()>,
    ) -> Result<()>;
}

/// Parse the current leaf value as `T`.
pub fn restore_value<T: FromStr>(traverser: &dyn StateRestoreTraverser) -> Result<T> {
    traverser
        .value()
        .parse::<T>()
        .map_err(|_| DecompositionError::parse(traverser.name(), traverser.value()))
}
