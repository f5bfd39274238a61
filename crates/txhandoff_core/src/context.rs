//! Explicit handoff context.
//!
//! A [`HandoffContext`] owns everything the lending protocol shares between
//! threads: the transaction manager, the registry of open coordinators keyed
//! by lender thread, and the bookkeeping of which worker thread currently
//! works on behalf of which connector. Callers create one context per
//! manager and pass it to every operation; there is no process-global state.

use crate::config::HandoffConfig;
use crate::coordinator::TransactionCoordinator;
use crate::error::HandoffResult;
use crate::manager::ThreadConnectable;
use crate::types::ConnectorId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::trace;

/// Cleanup callback registered with
/// [`TransactionCoordinator::on_end_of_child_thread`].
pub(crate) type EndAction = Box<dyn FnOnce() + Send>;

pub(crate) struct ContextInner {
    manager: Arc<dyn ThreadConnectable>,
    config: HandoffConfig,
    coordinators: Mutex<HashMap<ThreadId, Arc<TransactionCoordinator>>>,
    /// Worker thread -> connector it currently works for.
    children: Mutex<HashMap<ThreadId, ConnectorId>>,
    end_actions: Mutex<HashMap<ConnectorId, Vec<EndAction>>>,
    next_connector: AtomicU64,
}

/// Shared state of the transaction lending protocol.
///
/// Cheap to clone; clones share the same registry.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use txhandoff_core::{HandoffConfig, HandoffContext, InMemoryTransactionManager};
///
/// let ctx = HandoffContext::new(
///     Arc::new(InMemoryTransactionManager::new()),
///     HandoffConfig::default(),
/// );
/// assert_eq!(ctx.open_coordinators(), 0);
/// ```
#[derive(Clone)]
pub struct HandoffContext {
    inner: Arc<ContextInner>,
}

impl HandoffContext {
    /// Creates a context around `manager`.
    pub fn new(manager: Arc<dyn ThreadConnectable>, config: HandoffConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                manager,
                config,
                coordinators: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
                end_actions: Mutex::new(HashMap::new()),
                next_connector: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the transaction manager.
    #[must_use]
    pub fn manager(&self) -> &dyn ThreadConnectable {
        self.inner.manager.as_ref()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HandoffConfig {
        &self.inner.config
    }

    /// Returns the open coordinator of the calling thread, if any.
    #[must_use]
    pub fn coordinator_for_current_thread(&self) -> Option<Arc<TransactionCoordinator>> {
        self.inner
            .coordinators
            .lock()
            .get(&thread::current().id())
            .cloned()
    }

    /// Returns the number of open coordinators across all threads.
    #[must_use]
    pub fn open_coordinators(&self) -> usize {
        self.inner.coordinators.lock().len()
    }

    /// Returns the connector the calling thread currently works for.
    #[must_use]
    pub fn connector_for_current_thread(&self) -> Option<ConnectorId> {
        self.inner
            .children
            .lock()
            .get(&thread::current().id())
            .copied()
    }

    /// Runs `action` with the calling thread's lent transaction temporarily
    /// resumed.
    ///
    /// Without an open coordinator on this thread the action simply runs.
    /// See [`TransactionCoordinator::do_in_unsuspended_context`].
    ///
    /// # Errors
    ///
    /// Propagates the error of `action`, or of the resume / re-suspend.
    pub fn do_in_unsuspended_context<T, F>(&self, action: F) -> HandoffResult<T>
    where
        F: FnOnce() -> HandoffResult<T>,
    {
        match self.coordinator_for_current_thread() {
            Some(coordinator) => coordinator.do_in_unsuspended_context(action),
            None => action(),
        }
    }

    pub(crate) fn manager_arc(&self) -> Arc<dyn ThreadConnectable> {
        Arc::clone(&self.inner.manager)
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<ContextInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn next_connector_id(&self) -> ConnectorId {
        ConnectorId::new(self.inner.next_connector.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register_coordinator(&self, coordinator: Arc<TransactionCoordinator>) {
        self.inner
            .coordinators
            .lock()
            .insert(coordinator.owner(), coordinator);
    }

    /// Removes the registry entry of `owner` if it still points at `coordinator`.
    pub(crate) fn remove_coordinator(&self, owner: ThreadId, coordinator: &TransactionCoordinator) {
        let mut coordinators = self.inner.coordinators.lock();
        if coordinators
            .get(&owner)
            .is_some_and(|registered| std::ptr::eq(registered.as_ref(), coordinator))
        {
            coordinators.remove(&owner);
        }
    }

    pub(crate) fn enter_child(&self, thread: ThreadId, connector: ConnectorId) {
        self.inner.children.lock().insert(thread, connector);
        trace!(%connector, ?thread, "thread entered handoff");
    }

    pub(crate) fn register_end_action(&self, action: EndAction) -> bool {
        let Some(connector) = self.connector_for_current_thread() else {
            return false;
        };
        self.inner
            .end_actions
            .lock()
            .entry(connector)
            .or_default()
            .push(action);
        true
    }

    /// Forgets every worker thread of `connector` and hands back its
    /// pending end-of-child-thread actions.
    pub(crate) fn release_connector(&self, connector: ConnectorId) -> Vec<EndAction> {
        self.inner
            .children
            .lock()
            .retain(|_, working_for| *working_for != connector);
        self.inner
            .end_actions
            .lock()
            .remove(&connector)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for HandoffContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffContext")
            .field("name", &self.inner.config.name)
            .field("manager", &self.inner.manager.kind())
            .field("open_coordinators", &self.open_coordinators())
            .finish_non_exhaustive()
    }
}
