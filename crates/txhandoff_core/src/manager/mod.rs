//! Transaction manager capabilities.
//!
//! The handoff machinery talks to transaction managers through three
//! traits, leaves first:
//!
//! - [`TransactionManager`]: begin / commit / rollback. Every manager has it.
//! - [`ThreadBinding`]: the manager's own view of which transaction is
//!   attached to the calling thread, plus the raw detach/attach primitives.
//!   Optional; a manager exposes it through [`TransactionManager::thread_binding`].
//! - [`ThreadConnectable`]: "what is my transaction, suspend it, resume it
//!   here". Implemented natively, or synthesized from a [`ThreadBinding`] by
//!   [`ThreadConnectableManager`](crate::ThreadConnectableManager).

mod definition;
mod memory;

pub use definition::{
    Propagation, SuspendedTransaction, TransactionDefinition, TransactionStatus,
};
pub use memory::{InMemoryTransactionManager, TransactionOutcome};

use crate::error::{HandoffError, HandoffResult};
use crate::types::{SuspendedResources, TransactionId};
use std::sync::Arc;
use tracing::warn;

/// Thread-binding introspection of a transaction manager.
///
/// # Invariants
///
/// - A transaction is attached to at most one thread at a time.
/// - `unbind` leaves the calling thread without an attached transaction and
///   returns the resources needed to `bind` it again.
/// - `bind` fails if `resources` were not produced by the latest `unbind` of
///   the same transaction.
pub trait ThreadBinding: Send + Sync {
    /// Returns the transaction attached to the calling thread, if any.
    fn bound_transaction(&self) -> Option<TransactionId>;

    /// Returns true if the transaction has neither committed nor rolled back.
    fn is_active(&self, transaction: TransactionId) -> bool;

    /// Detaches `transaction` from the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is already detached or attached to another
    /// thread.
    fn unbind(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources>;

    /// Attaches `transaction` to the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if `resources` do not belong to `transaction` or the calling
    /// thread already runs a different transaction.
    fn bind(&self, transaction: TransactionId, resources: &SuspendedResources)
        -> HandoffResult<()>;
}

/// The minimal capability of a transaction manager.
pub trait TransactionManager: Send + Sync {
    /// Returns a short label identifying the manager implementation.
    fn kind(&self) -> &str;

    /// Starts a unit of work according to `definition`.
    ///
    /// # Errors
    ///
    /// Fails if the propagation is not allowed in the current state, or the
    /// manager cannot start a transaction.
    fn begin(&self, definition: &TransactionDefinition) -> HandoffResult<TransactionStatus>;

    /// Completes a unit of work.
    ///
    /// A rollback-only status is rolled back silently instead.
    ///
    /// # Errors
    ///
    /// Propagates manager failures.
    fn commit(&self, status: TransactionStatus) -> HandoffResult<()>;

    /// Rolls back a unit of work.
    ///
    /// # Errors
    ///
    /// Propagates manager failures.
    fn rollback(&self, status: TransactionStatus) -> HandoffResult<()>;

    /// Returns the manager's thread-binding introspection, if it has one.
    fn thread_binding(&self) -> Option<&dyn ThreadBinding> {
        None
    }
}

/// A transaction manager that can move its ambient transaction between
/// threads.
pub trait ThreadConnectable: TransactionManager {
    /// Returns the transaction of the calling thread.
    ///
    /// # Errors
    ///
    /// [`HandoffError::NoActiveTransaction`] if the calling thread has none
    /// and cannot inherit one.
    fn current_transaction(&self) -> HandoffResult<TransactionId>;

    /// Detaches `transaction` from the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not active on the calling thread or is
    /// already suspended.
    fn suspend_transaction(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources>;

    /// Re-attaches a suspended transaction to the calling thread.
    ///
    /// # Errors
    ///
    /// Fails if `resources` do not match `transaction`.
    fn resume_transaction(
        &self,
        transaction: TransactionId,
        resources: &SuspendedResources,
    ) -> HandoffResult<()>;

    /// Returns the transaction of the calling thread, or `None`.
    ///
    /// # Errors
    ///
    /// Propagates every failure other than "no active transaction".
    fn active_transaction(&self) -> HandoffResult<Option<TransactionId>> {
        match self.current_transaction() {
            Ok(transaction) => Ok(Some(transaction)),
            Err(HandoffError::NoActiveTransaction) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<M: TransactionManager + ?Sized> TransactionManager for Arc<M> {
    fn kind(&self) -> &str {
        (**self).kind()
    }

    fn begin(&self, definition: &TransactionDefinition) -> HandoffResult<TransactionStatus> {
        (**self).begin(definition)
    }

    fn commit(&self, status: TransactionStatus) -> HandoffResult<()> {
        (**self).commit(status)
    }

    fn rollback(&self, status: TransactionStatus) -> HandoffResult<()> {
        (**self).rollback(status)
    }

    fn thread_binding(&self) -> Option<&dyn ThreadBinding> {
        (**self).thread_binding()
    }
}

impl<M: ThreadConnectable + ?Sized> ThreadConnectable for Arc<M> {
    fn current_transaction(&self) -> HandoffResult<TransactionId> {
        (**self).current_transaction()
    }

    fn suspend_transaction(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources> {
        (**self).suspend_transaction(transaction)
    }

    fn resume_transaction(
        &self,
        transaction: TransactionId,
        resources: &SuspendedResources,
    ) -> HandoffResult<()> {
        (**self).resume_transaction(transaction, resources)
    }
}

/// Runs `f` as one unit of work.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If the
/// rollback fails as well, the error of `f` is returned and the rollback
/// failure is logged.
///
/// # Example
///
/// ```rust
/// use txhandoff_core::{execute_in_transaction, InMemoryTransactionManager, TransactionDefinition};
///
/// let manager = InMemoryTransactionManager::new();
/// let id = execute_in_transaction(&manager, &TransactionDefinition::default(), |status| {
///     Ok(status.transaction())
/// })
/// .unwrap();
/// assert!(id.is_some());
/// ```
pub fn execute_in_transaction<M, T, F>(
    manager: &M,
    definition: &TransactionDefinition,
    f: F,
) -> HandoffResult<T>
where
    M: TransactionManager + ?Sized,
    F: FnOnce(&mut TransactionStatus) -> HandoffResult<T>,
{
    let mut status = manager.begin(definition)?;
    match f(&mut status) {
        Ok(value) => {
            manager.commit(status)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = manager.rollback(status) {
                warn!(
                    manager = manager.kind(),
                    error = %rollback_err,
                    "rollback after failed unit of work also failed"
                );
            }
            Err(err)
        }
    }
}
