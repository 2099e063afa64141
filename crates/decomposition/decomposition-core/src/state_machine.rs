//! Table driven finite state machines
//!
//! Each machine is a static alphabet, a static list of state names and a
//! transition table indexed `[symbol][state]`. Every table is total; a
//! state outside the table is treated as the machine's last (error) state,
//! whose column sends RESET back to a clean state.

use decomposition_spi::{
    restore_value, DecompositionError, Result, StatePersistInserter, StateRestoreTraverser,
};
use tracing::error;

use crate::checksum::Checksum;

const NAME_TAG: &str = "a";
const STATE_TAG: &str = "b";

/// Static description of one machine
#[derive(Debug)]
pub struct MachineDefinition {
    pub name: &'static str,
    pub alphabet: &'static [&'static str],
    pub states: &'static [&'static str],
    pub transitions: &'static [&'static [usize]],
}

// Change point test machine
pub const CD_TEST: usize = 0;
pub const CD_NOT_TESTING: usize = 1;
pub const CD_ERROR: usize = 2;
pub const CD_DISABLE: usize = 0;
pub const CD_RESET: usize = 1;

pub static CHANGE_DETECTOR_MACHINE: MachineDefinition = MachineDefinition {
    name: "change_detector_test",
    alphabet: &["DISABLE", "RESET"],
    states: &["TEST", "NOT_TESTING", "ERROR"],
    transitions: &[
        &[CD_NOT_TESTING, CD_NOT_TESTING, CD_ERROR],
        &[CD_TEST, CD_NOT_TESTING, CD_TEST],
    ],
};

// Seasonality test machine
pub const PT_INITIAL: usize = 0;
pub const PT_TEST: usize = 1;
pub const PT_NOT_TESTING: usize = 2;
pub const PT_ERROR: usize = 3;
pub const PT_NEW_VALUE: usize = 0;
pub const PT_RESET: usize = 1;

pub static SEASONALITY_TEST_MACHINE: MachineDefinition = MachineDefinition {
    name: "seasonality_test",
    alphabet: &["NEW_VALUE", "RESET"],
    states: &["INITIAL", "TEST", "NOT_TESTING", "ERROR"],
    transitions: &[
        &[PT_TEST, PT_TEST, PT_NOT_TESTING, PT_ERROR],
        &[PT_INITIAL, PT_INITIAL, PT_NOT_TESTING, PT_INITIAL],
    ],
};

// Calendar cyclic test machine
pub const CC_INITIAL: usize = 0;
pub const CC_TEST: usize = 1;
pub const CC_NOT_TESTING: usize = 2;
pub const CC_ERROR: usize = 3;
pub const CC_NEW_VALUE: usize = 0;
pub const CC_RESET: usize = 1;

pub static CALENDAR_TEST_MACHINE: MachineDefinition = MachineDefinition {
    name: "calendar_test",
    alphabet: &["NEW_VALUE", "RESET"],
    states: &["INITIAL", "TEST", "NOT_TESTING", "ERROR"],
    transitions: &[
        &[CC_TEST, CC_TEST, CC_NOT_TESTING, CC_ERROR],
        &[CC_INITIAL, CC_INITIAL, CC_NOT_TESTING, CC_INITIAL],
    ],
};

// Components machine
pub const SC_NEW_COMPONENTS: usize = 0;
pub const SC_NORMAL: usize = 1;
pub const SC_DISABLED: usize = 2;
pub const SC_ERROR: usize = 3;
pub const SC_ADDED_COMPONENTS: usize = 0;
pub const SC_INTERPOLATED: usize = 1;
pub const SC_RESET: usize = 2;

pub static COMPONENTS_MACHINE: MachineDefinition = MachineDefinition {
    name: "components",
    alphabet: &["ADDED_COMPONENTS", "INTERPOLATED", "RESET"],
    states: &["NEW_COMPONENTS", "NORMAL", "DISABLED", "ERROR"],
    transitions: &[
        &[SC_NEW_COMPONENTS, SC_NEW_COMPONENTS, SC_DISABLED, SC_ERROR],
        &[SC_NORMAL, SC_NORMAL, SC_DISABLED, SC_ERROR],
        &[SC_NORMAL, SC_NORMAL, SC_NORMAL, SC_NORMAL],
    ],
};

/// A running instance of a [`MachineDefinition`]
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    definition: &'static MachineDefinition,
    state: usize,
}

impl StateMachine {
    pub fn new(definition: &'static MachineDefinition, state: usize) -> Self {
        Self { definition, state }
    }

    pub fn state(&self) -> usize {
        self.state
    }

    pub fn state_name(&self) -> &'static str {
        self.definition
            .states
            .get(self.state)
            .copied()
            .unwrap_or("UNKNOWN")
    }

    pub fn symbol_name(&self, symbol: usize) -> &'static str {
        self.definition
            .alphabet
            .get(symbol)
            .copied()
            .unwrap_or("UNKNOWN")
    }

    /// Apply `symbol` and return the new state.
    pub fn apply(&mut self, symbol: usize) -> usize {
        let Some(row) = self.definition.transitions.get(symbol) else {
            error!(
                machine = self.definition.name,
                symbol, "Bad symbol for state machine"
            );
            return self.state;
        };
        let column = self.state.min(row.len() - 1);
        self.state = row[column];
        self.state
    }

    pub fn accept_persist_inserter(&self, inserter: &mut dyn StatePersistInserter) {
        inserter.insert_value(NAME_TAG, self.definition.name);
        inserter.insert_value(STATE_TAG, &self.state.to_string());
    }

    /// Restore the state. Out of range states are accepted; the owning
    /// handler resets on seeing them.
    pub fn accept_restore_traverser(&mut self, traverser: &mut dyn StateRestoreTraverser) -> Result<()> {
        loop {
            let name = traverser.name().to_string();
            match name.as_str() {
                NAME_TAG => {
                    if traverser.value() != self.definition.name {
                        return Err(DecompositionError::parse(NAME_TAG, traverser.value()));
                    }
                }
                STATE_TAG => self.state = restore_value(traverser)?,
                _ => {}
            }
            if !traverser.next() {
                break;
            }
        }
        Ok(())
    }
}

impl Checksum for StateMachine {
    fn checksum(&self, seed: u64) -> u64 {
        self.state.checksum(self.definition.name.checksum(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::StateTree;

    fn all_definitions() -> [&'static MachineDefinition; 4] {
        [
            &CHANGE_DETECTOR_MACHINE,
            &SEASONALITY_TEST_MACHINE,
            &CALENDAR_TEST_MACHINE,
            &COMPONENTS_MACHINE,
        ]
    }

    #[test]
    fn test_tables_are_total() {
        for definition in all_definitions() {
            assert_eq!(definition.transitions.len(), definition.alphabet.len());
            for row in definition.transitions {
                assert_eq!(row.len(), definition.states.len());
                assert!(row.iter().all(|state| *state < definition.states.len()));
            }
        }
    }

    #[test]
    fn test_change_detector_transitions() {
        let mut machine = StateMachine::new(&CHANGE_DETECTOR_MACHINE, CD_TEST);
        assert_eq!(machine.apply(CD_DISABLE), CD_NOT_TESTING);
        assert_eq!(machine.apply(CD_RESET), CD_NOT_TESTING);
        let mut machine = StateMachine::new(&CHANGE_DETECTOR_MACHINE, CD_ERROR);
        assert_eq!(machine.apply(CD_RESET), CD_TEST);
    }

    #[test]
    fn test_seasonality_transitions() {
        let mut machine = StateMachine::new(&SEASONALITY_TEST_MACHINE, PT_INITIAL);
        assert_eq!(machine.apply(PT_NEW_VALUE), PT_TEST);
        assert_eq!(machine.apply(PT_RESET), PT_INITIAL);
        let mut machine = StateMachine::new(&SEASONALITY_TEST_MACHINE, PT_NOT_TESTING);
        assert_eq!(machine.apply(PT_NEW_VALUE), PT_NOT_TESTING);
        assert_eq!(machine.apply(PT_RESET), PT_NOT_TESTING);
        let mut machine = StateMachine::new(&SEASONALITY_TEST_MACHINE, PT_ERROR);
        assert_eq!(machine.apply(PT_RESET), PT_INITIAL);
    }

    #[test]
    fn test_calendar_transitions() {
        let mut machine = StateMachine::new(&CALENDAR_TEST_MACHINE, CC_INITIAL);
        assert_eq!(machine.apply(CC_NEW_VALUE), CC_TEST);
        let mut machine = StateMachine::new(&CALENDAR_TEST_MACHINE, CC_ERROR);
        assert_eq!(machine.apply(CC_NEW_VALUE), CC_ERROR);
        assert_eq!(machine.apply(CC_RESET), CC_INITIAL);
    }

    #[test]
    fn test_components_transitions() {
        let mut machine = StateMachine::new(&COMPONENTS_MACHINE, SC_NORMAL);
        assert_eq!(machine.apply(SC_ADDED_COMPONENTS), SC_NEW_COMPONENTS);
        assert_eq!(machine.apply(SC_INTERPOLATED), SC_NORMAL);
        let mut machine = StateMachine::new(&COMPONENTS_MACHINE, SC_DISABLED);
        assert_eq!(machine.apply(SC_ADDED_COMPONENTS), SC_DISABLED);
        assert_eq!(machine.apply(SC_RESET), SC_NORMAL);
    }

    #[test]
    fn test_out_of_range_state_uses_error_column() {
        let mut machine = StateMachine::new(&COMPONENTS_MACHINE, 17);
        assert_eq!(machine.state_name(), "UNKNOWN");
        assert_eq!(machine.apply(SC_RESET), SC_NORMAL);
    }

    #[test]
    fn test_bad_symbol_is_ignored() {
        let mut machine = StateMachine::new(&CHANGE_DETECTOR_MACHINE, CD_TEST);
        assert_eq!(machine.apply(9), CD_TEST);
    }

    #[test]
    fn test_persist_round_trip() {
        let machine = StateMachine::new(&SEASONALITY_TEST_MACHINE, PT_NOT_TESTING);
        let tree = StateTree::persist(|inserter| machine.accept_persist_inserter(inserter));
        let mut restored = StateMachine::new(&SEASONALITY_TEST_MACHINE, PT_INITIAL);
        tree.restore(|traverser| restored.accept_restore_traverser(traverser))
            .unwrap();
        assert_eq!(restored.state(), PT_NOT_TESTING);
        assert_eq!(restored.checksum(0), machine.checksum(0));
    }

    #[test]
    fn test_restore_rejects_other_machine() {
        let machine = StateMachine::new(&CALENDAR_TEST_MACHINE, CC_TEST);
        let tree = StateTree::persist(|inserter| machine.accept_persist_inserter(inserter));
        let mut restored = StateMachine::new(&SEASONALITY_TEST_MACHINE, PT_INITIAL);
        assert!(tree
            .restore(|traverser| restored.accept_restore_traverser(traverser))
            .is_err());
    }
}
