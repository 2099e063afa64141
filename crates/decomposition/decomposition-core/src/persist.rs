//! JSON backed state tree
//!
//! Each level is an ordered array of `[tag, value]` pairs where the value
//! is either a string leaf or a nested level. Tag order and repeated tags
//! are preserved exactly, so persisting a restored state reproduces the
//! original document byte for byte.

use decomposition_spi::{
    DecompositionError, Result, StatePersistInserter, StateRestoreTraverser,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry(pub String, pub StateNode);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateNode {
    Value(String),
    Level(Vec<StateEntry>),
}

/// A complete persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTree {
    entries: Vec<StateEntry>,
}

impl StateTree {
    /// Build a document by running `writer` against an inserter.
    pub fn persist(writer: impl FnOnce(&mut dyn StatePersistInserter)) -> Self {
        let mut entries = Vec::new();
        writer(&mut JsonStateInserter {
            level: &mut entries,
        });
        Self { entries }
    }

    /// Run `reader` against a traverser positioned on the first entry.
    pub fn restore(
        &self,
        reader: impl FnOnce(&mut dyn StateRestoreTraverser) -> Result<()>,
    ) -> Result<()> {
        reader(&mut JsonStateTraverser::new(&self.entries))
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DecompositionError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DecompositionError::Serialization(e.to_string()))
    }
}

pub struct JsonStateInserter<'a> {
    level: &'a mut Vec<StateEntry>,
}

impl StatePersistInserter for JsonStateInserter<'_> {
    fn insert_value(&mut self, tag: &str, value: &str) {
        self.level
            .push(StateEntry(tag.to_string(), StateNode::Value(value.to_string())));
    }

    fn insert_level(&mut self, tag: &str, writer: &mut dyn FnMut(&mut dyn StatePersistInserter)) {
        let mut level = Vec::new();
        writer(&mut JsonStateInserter { level: &mut level });
        self.level
            .push(StateEntry(tag.to_string(), StateNode::Level(level)));
    }
}

pub struct JsonStateTraverser<'a> {
    level: &'a [StateEntry],
    position: usize,
}

impl<'a> JsonStateTraverser<'a> {
    pub fn new(level: &'a [StateEntry]) -> Self {
        Self { level, position: 0 }
    }
}

impl StateRestoreTraverser for JsonStateTraverser<'_> {
    fn name(&self) -> &str {
        self.level
            .get(self.position)
            .map(|entry| entry.0.as_str())
            .unwrap_or("")
    }

    fn value(&self) -> &str {
        match self.level.get(self.position) {
            Some(StateEntry(_, StateNode::Value(value))) => value.as_str(),
            _ => "",
        }
    }

    fn has_sub_level(&self) -> bool {
        matches!(
            self.level.get(self.position),
            Some(StateEntry(_, StateNode::Level(_)))
        )
    }

    fn next(&mut self) -> bool {
        if self.position + 1 < self.level.len() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn traverse_sub_level(
        &mut self,
        reader: &mut dyn FnMut(&mut dyn StateRestoreTraverser) -> Result<()>,
    ) -> Result<()> {
        let level = self.level;
        match level.get(self.position) {
            Some(StateEntry(_, StateNode::Level(entries))) => {
                reader(&mut JsonStateTraverser::new(entries))
            }
            _ => Err(DecompositionError::MissingValue(self.name().to_string())),
        }
    }
}
