//! Thread-connectable decorator for plain transaction managers.
//!
//! [`ThreadConnectableManager`] gives [`ThreadConnectable`] semantics to a
//! manager that only implements [`TransactionManager`] but exposes its
//! [`ThreadBinding`]. All operations are forwarded unchanged except
//! "what is the current transaction": when the calling thread has no
//! transaction of its own, a transaction explicitly published to that
//! thread with [`join_parent_threads_transaction`] is returned instead.
//!
//! [`join_parent_threads_transaction`]: ThreadConnectableManager::join_parent_threads_transaction

use crate::error::{HandoffError, HandoffResult};
use crate::manager::{
    ThreadBinding, ThreadConnectable, TransactionDefinition, TransactionManager, TransactionStatus,
};
use crate::types::{SuspendedResources, TransactionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

/// Decorator that makes a [`TransactionManager`] thread-connectable.
pub struct ThreadConnectableManager<M: TransactionManager> {
    inner: M,
    /// Inherited transaction per calling thread.
    inherited: Mutex<HashMap<ThreadId, TransactionId>>,
}

impl<M: TransactionManager> ThreadConnectableManager<M> {
    /// Wraps `inner`.
    ///
    /// # Errors
    ///
    /// [`HandoffError::UnsupportedManagerKind`] if `inner` exposes no
    /// thread binding. This is a deployment error and is not retried.
    pub fn wrap(inner: M) -> HandoffResult<Self> {
        if inner.thread_binding().is_none() {
            return Err(HandoffError::unsupported_manager(inner.kind()));
        }
        debug!(kind = inner.kind(), "synthesized thread-connectable manager");
        Ok(Self {
            inner,
            inherited: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the wrapped manager.
    #[must_use]
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Publishes `transaction` to the calling thread.
    ///
    /// Until the returned guard is dropped (or
    /// [`leave_parent_threads_transaction`](Self::leave_parent_threads_transaction)
    /// is called), [`current_transaction`](ThreadConnectable::current_transaction)
    /// on this thread falls back to `transaction` when the thread has no
    /// transaction of its own.
    pub fn join_parent_threads_transaction(
        &self,
        transaction: TransactionId,
    ) -> InheritedTransaction<'_, M> {
        let thread = thread::current().id();
        self.inherited.lock().insert(thread, transaction);
        trace!(%transaction, ?thread, "joined parent thread's transaction");
        InheritedTransaction {
            manager: self,
            thread,
            transaction,
        }
    }

    /// Clears the inherited transaction of the calling thread.
    pub fn leave_parent_threads_transaction(&self) -> Option<TransactionId> {
        self.inherited.lock().remove(&thread::current().id())
    }

    /// Returns the inherited transaction of the calling thread.
    #[must_use]
    pub fn inherited_transaction(&self) -> Option<TransactionId> {
        self.inherited.lock().get(&thread::current().id()).copied()
    }

    fn binding(&self) -> HandoffResult<&dyn ThreadBinding> {
        self.inner
            .thread_binding()
            .ok_or_else(|| HandoffError::unsupported_manager(self.inner.kind()))
    }
}

impl<M: TransactionManager> TransactionManager for ThreadConnectableManager<M> {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn begin(&self, definition: &TransactionDefinition) -> HandoffResult<TransactionStatus> {
        self.inner.begin(definition)
    }

    fn commit(&self, status: TransactionStatus) -> HandoffResult<()> {
        self.inner.commit(status)
    }

    fn rollback(&self, status: TransactionStatus) -> HandoffResult<()> {
        self.inner.rollback(status)
    }

    fn thread_binding(&self) -> Option<&dyn ThreadBinding> {
        self.inner.thread_binding()
    }
}

impl<M: TransactionManager> ThreadConnectable for ThreadConnectableManager<M> {
    fn current_transaction(&self) -> HandoffResult<TransactionId> {
        let binding = self.binding()?;
        if let Some(own) = binding.bound_transaction() {
            if binding.is_active(own) {
                return Ok(own);
            }
        }
        match self.inherited_transaction() {
            Some(inherited) => {
                trace!(%inherited, "using parent thread's transaction");
                Ok(inherited)
            }
            None => Err(HandoffError::NoActiveTransaction),
        }
    }

    fn suspend_transaction(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources> {
        self.binding()?.unbind(transaction)
    }

    fn resume_transaction(
        &self,
        transaction: TransactionId,
        resources: &SuspendedResources,
    ) -> HandoffResult<()> {
        self.binding()?.bind(transaction, resources)
    }
}

impl<M: TransactionManager> std::fmt::Debug for ThreadConnectableManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadConnectableManager")
            .field("kind", &self.inner.kind())
            .field("inherited", &self.inherited.lock().len())
            .finish()
    }
}

/// Guard returned by
/// [`ThreadConnectableManager::join_parent_threads_transaction`].
///
/// Clears the inherited transaction of the joining thread when dropped.
#[must_use = "dropping the guard immediately leaves the parent transaction"]
pub struct InheritedTransaction<'a, M: TransactionManager> {
    manager: &'a ThreadConnectableManager<M>,
    thread: ThreadId,
    transaction: TransactionId,
}

impl<M: TransactionManager> InheritedTransaction<'_, M> {
    /// Returns the inherited transaction.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }
}

impl<M: TransactionManager> Drop for InheritedTransaction<'_, M> {
    fn drop(&mut self) {
        let mut inherited = self.manager.inherited.lock();
        if inherited.get(&self.thread) == Some(&self.transaction) {
            inherited.remove(&self.thread);
        }
    }
}
