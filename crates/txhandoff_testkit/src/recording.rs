//! Call-recording manager decorator.
//!
//! [`RecordingManager`] forwards every call to an inner manager and records
//! which operation was called, for which transaction, and from which thread.
//! Tests use it to assert on manager call sequences.

use parking_lot::Mutex;
use serde::Serialize;
use std::thread::{self, ThreadId};
use txhandoff_core::{
    HandoffResult, SuspendedResources, ThreadBinding, ThreadConnectable, TransactionDefinition,
    TransactionId, TransactionManager, TransactionStatus,
};

/// Manager operation recorded by [`RecordingManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallKind {
    /// `begin`
    Begin,
    /// `commit`
    Commit,
    /// `rollback`
    Rollback,
    /// `current_transaction`
    Current,
    /// `suspend_transaction`
    Suspend,
    /// `resume_transaction`
    Resume,
}

/// One recorded manager call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerCall {
    /// The operation.
    pub kind: CallKind,
    /// The transaction involved, if known.
    pub transaction: Option<TransactionId>,
    /// The calling thread.
    pub thread: ThreadId,
    /// Whether the call succeeded.
    pub ok: bool,
}

/// Decorator that records every manager call.
pub struct RecordingManager<M> {
    inner: M,
    calls: Mutex<Vec<ManagerCall>>,
}

impl<M> RecordingManager<M> {
    /// Wraps `inner`.
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the wrapped manager.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Returns a snapshot of all recorded calls.
    pub fn calls(&self) -> Vec<ManagerCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the number of successful calls of `kind` made from `thread`.
    pub fn count_on(&self, kind: CallKind, thread: ThreadId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.kind == kind && call.thread == thread && call.ok)
            .count()
    }

    /// Returns the number of successful calls of `kind` from any thread.
    pub fn count(&self, kind: CallKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.kind == kind && call.ok)
            .count()
    }

    /// Forgets all recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record<T>(
        &self,
        kind: CallKind,
        transaction: Option<TransactionId>,
        result: &HandoffResult<T>,
    ) {
        self.calls.lock().push(ManagerCall {
            kind,
            transaction,
            thread: thread::current().id(),
            ok: result.is_ok(),
        });
    }
}

impl<M: TransactionManager> TransactionManager for RecordingManager<M> {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn begin(&self, definition: &TransactionDefinition) -> HandoffResult<TransactionStatus> {
        let result = self.inner.begin(definition);
        let transaction = result.as_ref().ok().and_then(|status| status.transaction());
        self.record(CallKind::Begin, transaction, &result);
        result
    }

    fn commit(&self, status: TransactionStatus) -> HandoffResult<()> {
        let transaction = status.transaction();
        let result = self.inner.commit(status);
        self.record(CallKind::Commit, transaction, &result);
        result
    }

    fn rollback(&self, status: TransactionStatus) -> HandoffResult<()> {
        let transaction = status.transaction();
        let result = self.inner.rollback(status);
        self.record(CallKind::Rollback, transaction, &result);
        result
    }

    fn thread_binding(&self) -> Option<&dyn ThreadBinding> {
        self.inner.thread_binding()
    }
}

impl<M: ThreadConnectable> ThreadConnectable for RecordingManager<M> {
    fn current_transaction(&self) -> HandoffResult<TransactionId> {
        let result = self.inner.current_transaction();
        self.record(CallKind::Current, result.as_ref().ok().copied(), &result);
        result
    }

    fn suspend_transaction(&self, transaction: TransactionId) -> HandoffResult<SuspendedResources> {
        let result = self.inner.suspend_transaction(transaction);
        self.record(CallKind::Suspend, Some(transaction), &result);
        result
    }

    fn resume_transaction(
        &self,
        transaction: TransactionId,
        resources: &SuspendedResources,
    ) -> HandoffResult<()> {
        let result = self.inner.resume_transaction(transaction, resources);
        self.record(CallKind::Resume, Some(transaction), &result);
        result
    }
}
