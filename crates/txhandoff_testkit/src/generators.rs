//! Property-based test generators using proptest.
//!
//! Provides strategies for handoff scripts and transaction definitions.

use crate::scenario::{HandoffStep, Lending};
use proptest::prelude::*;
use std::time::Duration;
use txhandoff_core::{Propagation, TransactionDefinition};

/// Strategy for a single step involving workers `0..workers`.
pub fn handoff_step_strategy(workers: usize) -> impl Strategy<Value = HandoffStep> {
    let workers = workers.max(1);
    prop_oneof![
        4 => (0..workers).prop_map(HandoffStep::BeginChild),
        2 => (0..workers).prop_map(HandoffStep::EndChild),
        1 => Just(HandoffStep::Unsuspended),
    ]
}

/// Strategy for a script of up to `max_len` steps.
pub fn handoff_script_strategy(
    workers: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<HandoffStep>> {
    prop::collection::vec(handoff_step_strategy(workers), 0..=max_len)
}

/// Strategy for the lending mode.
pub fn lending_strategy() -> impl Strategy<Value = Lending> {
    prop_oneof![Just(Lending::Standalone), Just(Lending::Coordinated)]
}

/// Strategy for propagation behaviours.
pub fn propagation_strategy() -> impl Strategy<Value = Propagation> {
    prop_oneof![
        Just(Propagation::Required),
        Just(Propagation::Supports),
        Just(Propagation::Mandatory),
        Just(Propagation::RequiresNew),
        Just(Propagation::NotSupported),
        Just(Propagation::Never),
    ]
}

/// Strategy for transaction definitions with short or no timeouts.
pub fn transaction_definition_strategy() -> impl Strategy<Value = TransactionDefinition> {
    (
        propagation_strategy(),
        prop::option::of(1u64..10_000),
        any::<bool>(),
        prop::option::of("[a-z]{1,12}"),
    )
        .prop_map(|(propagation, timeout_ms, read_only, name)| TransactionDefinition {
            propagation,
            timeout: timeout_ms.map(Duration::from_millis),
            read_only,
            name,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn steps_stay_within_worker_range(script in handoff_script_strategy(3, 16)) {
            prop_assert!(script.len() <= 16);
            for step in script {
                match step {
                    HandoffStep::BeginChild(w) | HandoffStep::EndChild(w) => {
                        prop_assert!(w < 3);
                    }
                    HandoffStep::Unsuspended => {}
                }
            }
        }

        #[test]
        fn timeouts_are_positive(def in transaction_definition_strategy()) {
            if let Some(timeout) = def.timeout {
                prop_assert!(timeout >= Duration::from_millis(1));
            }
        }
    }
}
