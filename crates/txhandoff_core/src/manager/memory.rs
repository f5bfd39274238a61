//! In-memory transaction manager.

use super::definition::{Propagation, SuspendedTransaction, TransactionDefinition, TransactionStatus};
use super::{ThreadBinding, ThreadConnectable, TransactionManager};
use crate::config::ManagerConfig;
use crate::error::{HandoffError, HandoffResult};
use crate::types::{SuspendedResources, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tracing::{debug, trace};

/// Final or current state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Neither committed nor rolled back yet.
    Active,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

/// Suspension state handed out inside [`SuspendedResources`].
#[derive(Debug)]
struct BindingToken {
    transaction: TransactionId,
    generation: u64,
}

#[derive(Debug)]
struct TransactionRecord {
    bound_to: Option<ThreadId>,
    /// Bumped on every unbind; a holder is only valid for the latest one.
    generation: u64,
    rollback_only: bool,
    outcome: TransactionOutcome,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct ManagerState {
    transactions: HashMap<TransactionId, TransactionRecord>,
    threads: HashMap<ThreadId, TransactionId>,
}

impl ManagerState {
    fn record_mut(&mut self, transaction: TransactionId) -> HandoffResult<&mut TransactionRecord> {
        let record = self
            .transactions
            .get_mut(&transaction)
            .ok_or(HandoffError::UnknownTransaction { transaction })?;
        if record.outcome != TransactionOutcome::Active {
            return Err(HandoffError::TransactionCompleted { transaction });
        }
        Ok(record)
    }

    fn unbind(
        &mut self,
        transaction: TransactionId,
        thread: ThreadId,
    ) -> HandoffResult<SuspendedResources> {
        let record = self.record_mut(transaction)?;
        match record.bound_to {
            None => return Err(HandoffError::AlreadySuspended { transaction }),
            Some(owner) if owner != thread => {
                return Err(HandoffError::NotActiveOnThread { transaction })
            }
            Some(_) => {}
        }
        record.bound_to = None;
        record.generation += 1;
        let generation = record.generation;
        self.threads.remove(&thread);
        trace!(%transaction, ?thread, generation, "unbound transaction");
        Ok(SuspendedResources::new(BindingToken {
            transaction,
            generation,
        }))
    }

    fn bind(
        &mut self,
        transaction: TransactionId,
        resources: &SuspendedResources,
        thread: ThreadId,
    ) -> HandoffResult<()> {
        let token = resources
            .downcast_ref::<BindingToken>()
            .filter(|token| token.transaction == transaction)
            .ok_or(HandoffError::ResourceMismatch { transaction })?;
        if let Some(&bound) = self.threads.get(&thread) {
            if bound != transaction {
                return Err(HandoffError::ThreadAlreadyBound {
                    bound,
                    requested: transaction,
                });
            }
        }
        let record = self.record_mut(transaction)?;
        if token.generation != record.generation {
            return Err(HandoffError::ResourceMismatch { transaction });
        }
        // Attaching moves the transaction: it is never live on two threads.
        let previous = record.bound_to.replace(thread);
        if let Some(previous) = previous.filter(|previous| *previous != thread) {
            self.threads.remove(&previous);
        }
        self.threads.insert(thread, transaction);
        trace!(%transaction, ?thread, ?previous, "bound transaction");
        Ok(())
    }
}

/// A thread-aware transaction manager that keeps all state in memory.
///
/// Suitable for:
/// - Unit and integration tests of code that lends transactions
/// - Embedding where no external transaction manager exists
///
/// # Thread binding
///
/// Every transaction is attached to at most one thread. Resuming a
/// transaction on one thread detaches it from whichever thread held it
/// before. Each suspend hands out resources that are only valid until the
/// next suspend of the same transaction.
///
/// # Example
///
/// ```rust
/// use txhandoff_core::{
///     InMemoryTransactionManager, ThreadConnectable, TransactionDefinition, TransactionManager,
/// };
///
/// let manager = InMemoryTransactionManager::new();
/// let status = manager.begin(&TransactionDefinition::default()).unwrap();
/// let tx = manager.current_transaction().unwrap();
/// assert_eq!(status.transaction(), Some(tx));
/// manager.commit(status).unwrap();
/// assert!(manager.current_transaction().is_err());
/// ```
pub struct InMemoryTransactionManager {
    config: ManagerConfig,
    next_txid: AtomicU64,
    state: Mutex<ManagerState>,
}

impl Default for InMemoryTransactionManager {
    fn default() -> Self {
        Self::with_config(ManagerConfig::default())
    }
}

impl InMemoryTransactionManager {
    /// Creates a manager with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager with the given configuration.
    #[must_use]
    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            config,
            next_txid: AtomicU64::new(1),
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Returns the outcome of a transaction this manager started.
    #[must_use]
    pub fn outcome(&self, transaction: TransactionId) -> Option<TransactionOutcome> {
        self.state
            .lock()
            .transactions
            .get(&transaction)
            .map(|record| record.outcome)
    }

    /// Returns the thread the transaction is currently attached to.
    #[must_use]
    pub fn bound_thread(&self, transaction: TransactionId) -> Option<ThreadId> {
        self.state
            .lock()
            .transactions
            .get(&transaction)
            .and_then(|record| record.bound_to)
    }

    /// Returns true if the transaction has been marked rollback-only.
    #[must_use]
    pub fn is_rollback_only(&self, transaction: TransactionId) -> bool {
        self.state
            .lock()
            .transactions
            .get(&transaction)
            .is_some_and(|record| record.rollback_only)
    }

    /// Returns the number of transactions that have not completed.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state
            .lock()
            .transactions
            .values()
            .filter(|record| record.outcome == TransactionOutcome::Active)
            .count()
    }

    fn start(
        &self,
        state: &mut ManagerState,
        definition: &TransactionDefinition,
        thread: ThreadId,
    ) -> TransactionId {
        let transaction = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let deadline = definition
            .timeout
            .or(self.config.default_timeout)
            .map(|timeout| Instant::now() + timeout);
        state.transactions.insert(
            transaction,
            TransactionRecord {
                bound_to: Some(thread),
                generation: 0,
                rollback_only: false,
                outcome: TransactionOutcome::Active,
                deadline,
            },
        );
        state.threads.insert(thread, transaction);
        debug!(
            %transaction,
            ?thread,
            name = definition.name.as_deref(),
            "started transaction"
        );
        transaction
    }

    fn complete(&self, mut status: TransactionStatus, commit: bool) -> HandoffResult<()> {
        let thread = thread::current().id();
        let mut state = self.state.lock();
        let mut timed_out = None;

        if let Some(transaction) = status.transaction() {
            if status.is_new_transaction() {
                let record = state.record_mut(transaction)?;
                if record.bound_to != Some(thread) {
                    return Err(HandoffError::NotActiveOnThread { transaction });
                }
                let expired = record
                    .deadline
                    .is_some_and(|deadline| Instant::now() >= deadline);
                let roll_back =
                    !commit || status.is_rollback_only() || record.rollback_only || expired;
                record.outcome = if roll_back {
                    TransactionOutcome::RolledBack
                } else {
                    TransactionOutcome::Committed
                };
                record.bound_to = None;
                state.threads.remove(&thread);
                debug!(%transaction, outcome = ?record_outcome(roll_back), "completed transaction");
                if commit && expired {
                    timed_out = Some(transaction);
                }
            } else if !commit || status.is_rollback_only() {
                // Participants cannot finish the transaction, only doom it.
                state.record_mut(transaction)?.rollback_only = true;
                trace!(%transaction, "marked rollback-only by participant");
            }
        }

        if let Some(outer) = status.take_suspended() {
            state.bind(outer.transaction, &outer.resources, thread)?;
        }

        match timed_out {
            Some(transaction) => Err(HandoffError::TransactionTimedOut { transaction }),
            None => Ok(()),
        }
    }
}

fn record_outcome(rolled_back: bool) -> TransactionOutcome {
    if rolled_back {
        TransactionOutcome::RolledBack
    } else {
        TransactionOutcome::Committed
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn kind(&self) -> &str {
        &self.config.name
    }

    fn begin(&self, definition: &TransactionDefinition) -> HandoffResult<TransactionStatus> {
        let thread = thread::current().id();
        let mut state = self.state.lock();
        let current = state.threads.get(&thread).copied();

        let status = match (definition.propagation, current) {
            (Propagation::Required | Propagation::Supports | Propagation::Mandatory, Some(tx)) => {
                TransactionStatus::new(Some(tx), false, definition.clone())
            }
            (Propagation::Required | Propagation::RequiresNew, None) => {
                let tx = self.start(&mut state, definition, thread);
                TransactionStatus::new(Some(tx), true, definition.clone())
            }
            (Propagation::Supports | Propagation::NotSupported | Propagation::Never, None) => {
                TransactionStatus::new(None, false, definition.clone())
            }
            (Propagation::Mandatory, None) => {
                return Err(HandoffError::illegal_state(
                    "propagation Mandatory requires an active transaction",
                ))
            }
            (Propagation::Never, Some(tx)) => {
                return Err(HandoffError::illegal_state(format!(
                    "propagation Never, but {tx} is active"
                )))
            }
            (Propagation::RequiresNew, Some(outer)) => {
                let resources = state.unbind(outer, thread)?;
                let tx = self.start(&mut state, definition, thread);
                TransactionStatus::new(Some(tx), true, definition.clone()).with_suspended(Some(
                    SuspendedTransaction {
                        transaction: outer,
                        resources,
                    },
                ))
            }
            (Propagation::NotSupported, Some(outer)) => {
                let resources = state.unbind(outer, thread)?;
                TransactionStatus::new(None, false, definition.clone()).with_suspended(Some(
                    SuspendedTransaction {
                        transaction: outer,
                        resources,
                    },
                ))
            }
        };
        Ok(status)
    }

    fn commit(&self, status: TransactionStatus) -> HandoffResult<()> {
        self.complete(status, true)
    }

    fn rollback(&self, status: TransactionStatus) -> HandoffResult<()> {
        self.complete(status, false)
    }

    fn thread_binding(&self) -> Option<&dyn ThreadBinding> {
        Some(self)
    }
}

impl ThreadBinding for InMemoryTransactionManager {
    fn bound_transaction(&self) -> Option<TransactionId> {
        self.state.lock().threads.get(&thread::current().id()).copied()
    }

    fn is_active(&self, transaction: TransactionId) -> bool {
        self.outcome(transaction) == Some(TransactionOutcome::Active)
    }

    fn unbind(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources> {
        self.state.lock().unbind(transaction, thread::current().id())
    }

    fn bind(
        &self,
        transaction: TransactionId,
        resources: &SuspendedResources,
    ) -> HandoffResult<()> {
        self.state
            .lock()
            .bind(transaction, resources, thread::current().id())
    }
}

impl ThreadConnectable for InMemoryTransactionManager {
    fn current_transaction(&self) -> HandoffResult<TransactionId> {
        self.bound_transaction()
            .filter(|tx| self.is_active(*tx))
            .ok_or(HandoffError::NoActiveTransaction)
    }

    fn suspend_transaction(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources> {
        self.unbind(transaction)
    }

    fn resume_transaction(
        &self,
        transaction: TransactionId,
        resources: &SuspendedResources,
    ) -> HandoffResult<()> {
        self.bind(transaction, resources)
    }
}

impl std::fmt::Debug for InMemoryTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransactionManager")
            .field("kind", &self.config.name)
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn required() -> TransactionDefinition {
        TransactionDefinition::new(Propagation::Required)
    }

    #[test]
    fn begin_required_starts_transaction() {
        let tm = InMemoryTransactionManager::new();
        let status = tm.begin(&required()).unwrap();
        assert!(status.is_new_transaction());
        let tx = status.transaction().unwrap();
        assert_eq!(tm.current_transaction().unwrap(), tx);
        assert_eq!(tm.active_count(), 1);

        tm.commit(status).unwrap();
        assert_eq!(tm.outcome(tx), Some(TransactionOutcome::Committed));
        assert!(matches!(
            tm.current_transaction(),
            Err(HandoffError::NoActiveTransaction)
        ));
    }

    #[test]
    fn nested_required_joins() {
        let tm = InMemoryTransactionManager::new();
        let outer = tm.begin(&required()).unwrap();
        let inner = tm.begin(&required()).unwrap();
        assert!(!inner.is_new_transaction());
        assert_eq!(inner.transaction(), outer.transaction());

        tm.commit(inner).unwrap();
        assert_eq!(
            tm.outcome(outer.transaction().unwrap()),
            Some(TransactionOutcome::Active)
        );
        tm.commit(outer).unwrap();
    }

    #[test]
    fn participant_rollback_dooms_outer() {
        let tm = InMemoryTransactionManager::new();
        let outer = tm.begin(&required()).unwrap();
        let tx = outer.transaction().unwrap();
        let inner = tm.begin(&required()).unwrap();
        tm.rollback(inner).unwrap();
        assert!(tm.is_rollback_only(tx));

        // Commit of a doomed transaction rolls back without error.
        tm.commit(outer).unwrap();
        assert_eq!(tm.outcome(tx), Some(TransactionOutcome::RolledBack));
    }

    #[test]
    fn rollback_only_status_commit_rolls_back() {
        let tm = InMemoryTransactionManager::new();
        let mut status = tm.begin(&required()).unwrap();
        let tx = status.transaction().unwrap();
        status.set_rollback_only();
        tm.commit(status).unwrap();
        assert_eq!(tm.outcome(tx), Some(TransactionOutcome::RolledBack));
    }

    #[test]
    fn requires_new_suspends_and_restores_outer() {
        let tm = InMemoryTransactionManager::new();
        let outer = tm.begin(&required()).unwrap();
        let outer_tx = outer.transaction().unwrap();

        let inner = tm
            .begin(&TransactionDefinition::new(Propagation::RequiresNew))
            .unwrap();
        let inner_tx = inner.transaction().unwrap();
        assert_ne!(inner_tx, outer_tx);
        assert_eq!(tm.current_transaction().unwrap(), inner_tx);
        assert_eq!(tm.bound_thread(outer_tx), None);

        tm.commit(inner).unwrap();
        assert_eq!(tm.current_transaction().unwrap(), outer_tx);
        tm.commit(outer).unwrap();
    }

    #[test]
    fn not_supported_runs_without_transaction() {
        let tm = InMemoryTransactionManager::new();
        let outer = tm.begin(&required()).unwrap();
        let outer_tx = outer.transaction().unwrap();

        let inner = tm
            .begin(&TransactionDefinition::new(Propagation::NotSupported))
            .unwrap();
        assert!(!inner.has_transaction());
        assert!(tm.current_transaction().is_err());

        tm.commit(inner).unwrap();
        assert_eq!(tm.current_transaction().unwrap(), outer_tx);
        tm.rollback(outer).unwrap();
        assert_eq!(tm.outcome(outer_tx), Some(TransactionOutcome::RolledBack));
    }

    #[test]
    fn mandatory_and_never() {
        let tm = InMemoryTransactionManager::new();
        assert!(matches!(
            tm.begin(&TransactionDefinition::new(Propagation::Mandatory)),
            Err(HandoffError::IllegalTransactionState { .. })
        ));

        let status = tm.begin(&required()).unwrap();
        assert!(matches!(
            tm.begin(&TransactionDefinition::new(Propagation::Never)),
            Err(HandoffError::IllegalTransactionState { .. })
        ));
        tm.commit(status).unwrap();
    }

    #[test]
    fn expired_transaction_rolls_back_on_commit() {
        let tm = InMemoryTransactionManager::new();
        let status = tm.begin(&required().with_timeout(Duration::ZERO)).unwrap();
        let tx = status.transaction().unwrap();
        assert!(matches!(
            tm.commit(status),
            Err(HandoffError::TransactionTimedOut { .. })
        ));
        assert_eq!(tm.outcome(tx), Some(TransactionOutcome::RolledBack));
    }

    #[test]
    fn default_timeout_from_config() {
        let tm = InMemoryTransactionManager::with_config(
            ManagerConfig::new().default_timeout(Some(Duration::ZERO)),
        );
        let status = tm.begin(&required()).unwrap();
        assert!(tm.commit(status).is_err());
    }

    #[test]
    fn double_suspend_is_rejected() {
        let tm = InMemoryTransactionManager::new();
        let status = tm.begin(&required()).unwrap();
        let tx = status.transaction().unwrap();

        let resources = tm.suspend_transaction(tx).unwrap();
        assert!(matches!(
            tm.suspend_transaction(tx),
            Err(HandoffError::AlreadySuspended { .. })
        ));

        tm.resume_transaction(tx, &resources).unwrap();
        tm.commit(status).unwrap();
    }

    #[test]
    fn stale_resources_are_rejected() {
        let tm = InMemoryTransactionManager::new();
        let status = tm.begin(&required()).unwrap();
        let tx = status.transaction().unwrap();

        let first = tm.suspend_transaction(tx).unwrap();
        tm.resume_transaction(tx, &first).unwrap();
        let second = tm.suspend_transaction(tx).unwrap();

        assert!(matches!(
            tm.resume_transaction(tx, &first),
            Err(HandoffError::ResourceMismatch { .. })
        ));
        assert!(matches!(
            tm.resume_transaction(tx, &SuspendedResources::new(())),
            Err(HandoffError::ResourceMismatch { .. })
        ));
        tm.resume_transaction(tx, &second).unwrap();
        tm.commit(status).unwrap();
    }

    #[test]
    fn resume_moves_transaction_between_threads() {
        let tm = InMemoryTransactionManager::new();
        let status = tm.begin(&required()).unwrap();
        let tx = status.transaction().unwrap();
        let resources = tm.suspend_transaction(tx).unwrap();
        assert!(tm.current_transaction().is_err());

        let returned = thread::scope(|s| {
            s.spawn(|| {
                tm.resume_transaction(tx, &resources).unwrap();
                assert_eq!(tm.current_transaction().unwrap(), tx);
                assert_eq!(tm.bound_thread(tx), Some(thread::current().id()));
                tm.suspend_transaction(tx).unwrap()
            })
            .join()
            .unwrap()
        });

        assert!(matches!(
            tm.resume_transaction(tx, &resources),
            Err(HandoffError::ResourceMismatch { .. })
        ));
        tm.resume_transaction(tx, &returned).unwrap();
        assert_eq!(tm.current_transaction().unwrap(), tx);
        tm.commit(status).unwrap();
    }

    #[test]
    fn suspend_from_foreign_thread_is_rejected() {
        let tm = InMemoryTransactionManager::new();
        let status = tm.begin(&required()).unwrap();
        let tx = status.transaction().unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                assert!(matches!(
                    tm.suspend_transaction(tx),
                    Err(HandoffError::NotActiveOnThread { .. })
                ));
            });
        });
        tm.commit(status).unwrap();
    }

    #[test]
    fn resume_onto_busy_thread_is_rejected() {
        let tm = InMemoryTransactionManager::new();
        let first = tm.begin(&required()).unwrap();
        let first_tx = first.transaction().unwrap();
        let resources = tm.suspend_transaction(first_tx).unwrap();

        let second = tm.begin(&required()).unwrap();
        assert!(matches!(
            tm.resume_transaction(first_tx, &resources),
            Err(HandoffError::ThreadAlreadyBound { .. })
        ));
        tm.commit(second).unwrap();

        tm.resume_transaction(first_tx, &resources).unwrap();
        tm.commit(first).unwrap();
    }
}
