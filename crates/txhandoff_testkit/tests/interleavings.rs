//! Property tests over random handoff interleavings.

use proptest::prelude::*;
use std::sync::OnceLock;
use txhandoff_core::{execute_in_transaction, InMemoryTransactionManager};
use txhandoff_testkit::prelude::*;

const WORKERS: usize = 3;

/// Workers are shared by all cases so that threads are reused across
/// independent handoffs, the way pooled threads are.
fn workers() -> &'static [WorkerThread] {
    static WORKERS_POOL: OnceLock<Vec<WorkerThread>> = OnceLock::new();
    WORKERS_POOL.get_or_init(|| spawn_workers("interleave", WORKERS))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn at_most_one_thread_sees_the_transaction(
        lending in lending_strategy(),
        script in handoff_script_strategy(WORKERS, 24),
    ) {
        let trace = run_script(lending, workers(), &script);
        prop_assert!(trace.max_concurrent_holders() <= 1);
    }

    #[test]
    fn holder_follows_the_latest_child_thread(
        lending in lending_strategy(),
        script in handoff_script_strategy(WORKERS, 24),
    ) {
        let trace = run_script(lending, workers(), &script);
        prop_assert_eq!(trace.first_divergence(), None);
        prop_assert_eq!(trace.final_holders(), &[Holder::Lender][..]);
    }

    #[test]
    fn units_of_work_never_leave_transactions_behind(
        definitions in prop::collection::vec(transaction_definition_strategy(), 1..8),
    ) {
        let manager = InMemoryTransactionManager::new();
        for definition in &definitions {
            // Mandatory fails without an ambient transaction; that is fine.
            let _ = execute_in_transaction(&manager, definition, |status| Ok(status.transaction()));
        }
        prop_assert_eq!(manager.active_count(), 0);
    }
}
