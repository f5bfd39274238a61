//! Scripted handoff interleavings.
//!
//! [`run_script`] lends a fresh transaction from the calling thread, replays
//! a sequence of [`HandoffStep`]s on a set of [`WorkerThread`]s, and after
//! every step asks each thread (lender and workers) whether it currently
//! sees the transaction. The resulting [`ScriptTrace`] is compared against
//! a simple model of who should hold it.

use crate::fixtures::TestHandoff;
use crate::worker::WorkerThread;
use std::sync::Arc;
use txhandoff_core::{
    ThreadConnectable, TransactionConnector, TransactionCoordinator, TransactionId,
    TransactionManager,
};

/// One action of a handoff script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStep {
    /// Worker `n` calls `begin_child_thread`.
    BeginChild(usize),
    /// Worker `n` calls `end_child_thread`.
    EndChild(usize),
    /// The lender looks up its transaction through `do_in_unsuspended_context`.
    Unsuspended,
}

/// How the lender lends its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lending {
    /// A connector suspends the transaction itself.
    Standalone,
    /// A coordinator suspends it; the connector links to the coordinator.
    Coordinated,
}

/// A thread that may see the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// The lender thread.
    Lender,
    /// Worker `n`.
    Worker(usize),
}

/// Observation taken after one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// The step; `None` for the final close.
    pub step: Option<HandoffStep>,
    /// Who should see the transaction, `None` if nobody.
    pub expected: Option<Holder>,
    /// Who reported seeing it.
    pub observed: Vec<Holder>,
    /// For [`HandoffStep::Unsuspended`]: whether the lookup saw the
    /// transaction, and whether it should have.
    pub unsuspended: Option<(bool, bool)>,
}

impl StepRecord {
    /// Returns true if the observation matches the model.
    pub fn matches(&self) -> bool {
        let holders_match = match self.expected {
            Some(holder) => self.observed == [holder],
            None => self.observed.is_empty(),
        };
        let lookup_matches = self
            .unsuspended
            .map_or(true, |(seen, expected)| seen == expected);
        holders_match && lookup_matches
    }
}

/// Observations of a whole script run.
#[derive(Debug, Clone, Default)]
pub struct ScriptTrace {
    /// The transaction that was lent.
    pub transaction: Option<TransactionId>,
    /// One record per step, plus one for the final close.
    pub records: Vec<StepRecord>,
}

impl ScriptTrace {
    /// Returns the largest number of threads that saw the transaction at
    /// the same observation point.
    pub fn max_concurrent_holders(&self) -> usize {
        self.records
            .iter()
            .map(|record| record.observed.len())
            .max()
            .unwrap_or(0)
    }

    /// Returns the first record that deviates from the model.
    pub fn first_divergence(&self) -> Option<&StepRecord> {
        self.records.iter().find(|record| !record.matches())
    }

    /// Returns who saw the transaction after the final close.
    pub fn final_holders(&self) -> &[Holder] {
        self.records
            .last()
            .map(|record| record.observed.as_slice())
            .unwrap_or(&[])
    }
}

/// Replays `script` against a fresh transaction lent from the calling
/// thread to `workers`.
///
/// Worker indices in `script` must be smaller than `workers.len()`.
pub fn run_script(lending: Lending, workers: &[WorkerThread], script: &[HandoffStep]) -> ScriptTrace {
    let handoff = TestHandoff::new();
    let status = handoff.begin();
    let transaction = status.transaction().expect("Transaction was not started");

    let coordinator = match lending {
        Lending::Standalone => None,
        Lending::Coordinated => Some(
            TransactionCoordinator::get_or_create(&handoff.context)
                .expect("Failed to create coordinator")
                .expect("Nothing to coordinate"),
        ),
    };
    let connector = Arc::new(
        TransactionConnector::begin(&handoff.context).expect("Failed to begin connector"),
    );

    let mut expected = None;
    let mut records = Vec::with_capacity(script.len() + 1);
    for step in script {
        let mut unsuspended = None;
        match *step {
            HandoffStep::BeginChild(index) => {
                let connector = Arc::clone(&connector);
                workers[index]
                    .run(move || connector.begin_child_thread())
                    .expect("begin_child_thread failed");
                expected = Some(Holder::Worker(index));
            }
            HandoffStep::EndChild(index) => {
                let connector = Arc::clone(&connector);
                workers[index].run(move || connector.end_child_thread());
            }
            HandoffStep::Unsuspended => {
                let manager = Arc::clone(&handoff.manager);
                let seen = handoff
                    .context
                    .do_in_unsuspended_context(|| manager.inner().active_transaction())
                    .expect("do_in_unsuspended_context failed");
                let should_see = lending == Lending::Coordinated && expected.is_none();
                unsuspended = Some((seen == Some(transaction), should_see));
            }
        }
        records.push(StepRecord {
            step: Some(*step),
            expected,
            observed: observe(&handoff, workers, transaction),
            unsuspended,
        });
    }

    connector.close().expect("Failed to close connector");
    if let Some(coordinator) = &coordinator {
        coordinator.close().expect("Failed to close coordinator");
    }
    records.push(StepRecord {
        step: None,
        expected: Some(Holder::Lender),
        observed: observe(&handoff, workers, transaction),
        unsuspended: None,
    });

    handoff
        .manager
        .commit(status)
        .expect("Failed to commit lent transaction");
    ScriptTrace {
        transaction: Some(transaction),
        records,
    }
}

fn observe(handoff: &TestHandoff, workers: &[WorkerThread], transaction: TransactionId) -> Vec<Holder> {
    let mut observed = Vec::new();
    if sees(handoff, transaction) {
        observed.push(Holder::Lender);
    }
    for (index, worker) in workers.iter().enumerate() {
        let manager = Arc::clone(&handoff.manager);
        let seen = worker.run(move || {
            manager
                .inner()
                .active_transaction()
                .expect("Failed to query transaction")
        });
        if seen == Some(transaction) {
            observed.push(Holder::Worker(index));
        }
    }
    observed
}

fn sees(handoff: &TestHandoff, transaction: TransactionId) -> bool {
    handoff
        .reference()
        .active_transaction()
        .expect("Failed to query transaction")
        == Some(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::spawn_workers;

    #[test]
    fn example_scenario_matches_model() {
        let workers = spawn_workers("scenario", 1);
        let trace = run_script(Lending::Standalone, &workers, &[HandoffStep::BeginChild(0)]);
        assert_eq!(trace.first_divergence(), None);
        assert_eq!(trace.records[0].observed, vec![Holder::Worker(0)]);
        assert_eq!(trace.final_holders(), &[Holder::Lender]);
    }

    #[test]
    fn coordinated_lookup_sees_suspended_transaction() {
        let workers = spawn_workers("scenario", 2);
        let trace = run_script(
            Lending::Coordinated,
            &workers,
            &[
                HandoffStep::Unsuspended,
                HandoffStep::BeginChild(1),
                HandoffStep::Unsuspended,
                HandoffStep::BeginChild(0),
            ],
        );
        assert_eq!(trace.first_divergence(), None);
        assert_eq!(trace.records[0].unsuspended, Some((true, true)));
        assert_eq!(trace.records[2].unsuspended, Some((false, false)));
        assert_eq!(trace.max_concurrent_holders(), 1);
    }
}
