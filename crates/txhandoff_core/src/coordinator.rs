//! Per-thread transaction coordinator.
//!
//! A [`TransactionCoordinator`] is created on a lender thread that expects to
//! hand its transaction to other threads more than once, for example a
//! streaming pipeline that may or may not process its output on a worker.
//! It suspends the transaction once, remembers the suspended resources, and
//! moves the transaction to whichever thread needs it:
//!
//! ```text
//!   lender ── get_or_create ──► suspended
//!   worker ── resume_in_child_thread ──► active on worker
//!   lender ── close ──► active on lender again
//! ```
//!
//! At most one open coordinator exists per thread and
//! [`HandoffContext`]; the context keeps the registry.

use crate::context::{ContextInner, HandoffContext};
use crate::error::{HandoffError, HandoffResult};
use crate::manager::ThreadConnectable;
use crate::types::{ConnectorId, SuspendedResources, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace};

#[derive(Debug)]
struct CoordinatorState {
    /// `None` once closed.
    transaction: Option<TransactionId>,
    resources: Option<SuspendedResources>,
    /// Thread the transaction is currently resumed on; `None` while suspended.
    resumed_on: Option<ThreadId>,
    last_in_thread: Option<ConnectorId>,
    /// Open linked connectors, oldest first.
    linked: Vec<ConnectorId>,
}

/// Keeps a lender thread's transaction suspended and moves it between
/// threads on request.
pub struct TransactionCoordinator {
    owner: ThreadId,
    manager: Arc<dyn ThreadConnectable>,
    context: Weak<ContextInner>,
    state: Mutex<CoordinatorState>,
}

impl TransactionCoordinator {
    /// Returns the open coordinator of the calling thread, creating one if
    /// the thread has an active transaction.
    ///
    /// A newly created coordinator suspends the transaction immediately.
    /// Returns `Ok(None)` if there is no coordinator and no transaction.
    ///
    /// # Errors
    ///
    /// Propagates failures of the manager while querying or suspending.
    pub fn get_or_create(context: &HandoffContext) -> HandoffResult<Option<Arc<Self>>> {
        if let Some(existing) = context.coordinator_for_current_thread() {
            return Ok(Some(existing));
        }
        let Some(transaction) = context.manager().active_transaction()? else {
            trace!("no transaction to coordinate");
            return Ok(None);
        };
        let resources = context.manager().suspend_transaction(transaction)?;
        let coordinator = Arc::new(Self {
            owner: thread::current().id(),
            manager: context.manager_arc(),
            context: context.downgrade(),
            state: Mutex::new(CoordinatorState {
                transaction: Some(transaction),
                resources: Some(resources),
                resumed_on: None,
                last_in_thread: None,
                linked: Vec::new(),
            }),
        });
        context.register_coordinator(Arc::clone(&coordinator));
        debug!(
            context = %context.config().name,
            %transaction,
            owner = ?coordinator.owner,
            "opened transaction coordinator"
        );
        Ok(Some(coordinator))
    }

    /// Suspends the transaction if it is currently resumed on the calling
    /// thread. Otherwise does nothing.
    ///
    /// # Errors
    ///
    /// Propagates failures of the manager.
    pub fn suspend_if_needed(&self) -> HandoffResult<()> {
        let mut state = self.state.lock();
        self.suspend_locked(&mut state)
    }

    /// Resumes the transaction on the calling thread.
    ///
    /// Without `force`, does nothing unless the transaction is suspended.
    /// With `force`, resumes even if the transaction is currently resumed
    /// on another thread; the transaction moves to the calling thread.
    ///
    /// # Errors
    ///
    /// Propagates failures of the manager.
    pub fn resume(&self, force: bool) -> HandoffResult<()> {
        let mut state = self.state.lock();
        self.resume_locked(&mut state, force).map(|_| ())
    }

    /// Resumes the transaction on behalf of `requester`.
    ///
    /// - On a thread other than the owner, the transaction is always resumed
    ///   (forcefully) on the calling thread.
    /// - On the owner thread, the transaction is resumed only if `requester`
    ///   is the connector registered as last in this thread. Requests of
    ///   earlier connectors are deferred so they cannot pull the transaction
    ///   away from a later one.
    ///
    /// Returns true if the transaction is now resumed on the calling thread
    /// because of this request. An authorised owner-thread request returns
    /// false when a worker still holds the transaction.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::IllegalTransactionState`] if the coordinator is
    ///   closed; its transaction is back on the owner for good.
    /// - Failures of the manager.
    pub fn resume_in_child_thread(&self, requester: ConnectorId) -> HandoffResult<bool> {
        let mut state = self.state.lock();
        if state.transaction.is_none() {
            return Err(HandoffError::illegal_state(format!(
                "coordinator of {:?} is closed; {requester} cannot resume its transaction",
                self.owner
            )));
        }
        if thread::current().id() != self.owner {
            return self.resume_locked(&mut state, true);
        }
        if state.last_in_thread == Some(requester) {
            return self.resume_locked(&mut state, false);
        }
        trace!(
            %requester,
            last_in_thread = ?state.last_in_thread,
            "deferring resume on owner thread"
        );
        Ok(false)
    }

    /// Records which connector is currently responsible for the owner
    /// thread.
    ///
    /// An already recorded connector is kept unless `override_existing` is
    /// set. Returns true if `target` was recorded.
    pub fn set_last_in_thread(&self, target: Option<ConnectorId>, override_existing: bool) -> bool {
        let mut state = self.state.lock();
        if state.last_in_thread.is_some() && !override_existing {
            return false;
        }
        state.last_in_thread = target;
        true
    }

    /// Records a newly opened linked connector as the most recent handoff
    /// and makes it last in thread.
    pub(crate) fn register_linked(&self, connector: ConnectorId) {
        let mut state = self.state.lock();
        state.linked.push(connector);
        state.last_in_thread = Some(connector);
    }

    /// Forgets a closed linked connector.
    ///
    /// If it was last in thread, the most recent connector still open takes
    /// over (or nobody, if none is left). Returns true if `connector` was
    /// last in thread.
    pub(crate) fn release_linked(&self, connector: ConnectorId) -> bool {
        let mut state = self.state.lock();
        state.linked.retain(|open| *open != connector);
        if state.last_in_thread != Some(connector) {
            return false;
        }
        state.last_in_thread = state.linked.last().copied();
        trace!(
            released = %connector,
            successor = ?state.last_in_thread,
            "handed over last-in-thread"
        );
        true
    }

    /// Hands the transaction back to the owner thread and closes the
    /// coordinator.
    ///
    /// Resumes the transaction on the owner unless it is already resumed
    /// there, then removes the coordinator from the context registry.
    /// Closing an already closed coordinator does nothing.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::WrongThread`] if called from a thread other than
    ///   the owner. No manager call is made in that case.
    /// - Failures of the manager while resuming; the coordinator then stays
    ///   open.
    pub fn close(&self) -> HandoffResult<()> {
        if thread::current().id() != self.owner {
            return Err(HandoffError::wrong_thread(
                "TransactionCoordinator::close",
                self.owner,
            ));
        }
        let transaction = {
            let mut state = self.state.lock();
            let Some(transaction) = state.transaction else {
                return Ok(());
            };
            if state.resumed_on != Some(self.owner) {
                self.resume_locked(&mut state, true)?;
            }
            state.transaction = None;
            state.resources = None;
            state.last_in_thread = None;
            state.linked.clear();
            transaction
        };
        if let Some(context) = HandoffContext::upgrade(&self.context) {
            context.remove_coordinator(self.owner, self);
        }
        debug!(%transaction, owner = ?self.owner, "closed transaction coordinator");
        Ok(())
    }

    /// Runs `action` with the transaction resumed on the calling thread.
    ///
    /// If the transaction was suspended, it is resumed before `action` and
    /// suspended again afterwards, also when `action` fails or panics. If it
    /// was already resumed (here or on another thread), `action` runs as is.
    ///
    /// # Errors
    ///
    /// Returns the error of `action` if it failed; otherwise the error of
    /// the resume or re-suspend, if any.
    pub fn do_in_unsuspended_context<T, F>(&self, action: F) -> HandoffResult<T>
    where
        F: FnOnce() -> HandoffResult<T>,
    {
        let resumed_here = {
            let mut state = self.state.lock();
            let suspended = state.transaction.is_some() && state.resumed_on.is_none();
            if suspended {
                self.resume_locked(&mut state, false)?;
            }
            suspended
        };
        if !resumed_here {
            return action();
        }

        let scope = UnsuspendedScope {
            coordinator: self,
            armed: true,
        };
        let result = action();
        let suspended = scope.finish();
        match (result, suspended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(suspend_err)) => {
                error!(error = %suspend_err, "re-suspend after failed action also failed");
                Err(err)
            }
        }
    }

    /// Registers `action` to run when the connector the calling thread works
    /// for is closed.
    ///
    /// Returns false, without registering, if the calling thread is not
    /// inside an active handoff.
    pub fn on_end_of_child_thread<F>(context: &HandoffContext, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        context.register_end_action(Box::new(action))
    }

    /// Returns the thread that created this coordinator.
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Returns the coordinated transaction, or `None` once closed.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.state.lock().transaction
    }

    /// Returns true if the transaction is currently suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        let state = self.state.lock();
        state.transaction.is_some() && state.resumed_on.is_none()
    }

    /// Returns the thread the transaction is currently resumed on.
    #[must_use]
    pub fn resumed_on(&self) -> Option<ThreadId> {
        self.state.lock().resumed_on
    }

    /// Returns the connector registered as last in the owner thread.
    #[must_use]
    pub fn last_in_thread(&self) -> Option<ConnectorId> {
        self.state.lock().last_in_thread
    }

    /// Returns true once the coordinator is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().transaction.is_none()
    }

    fn suspend_locked(&self, state: &mut MutexGuard<'_, CoordinatorState>) -> HandoffResult<()> {
        let Some(transaction) = state.transaction else {
            return Ok(());
        };
        let thread = thread::current().id();
        match state.resumed_on {
            Some(on) if on == thread => {
                let resources = self.manager.suspend_transaction(transaction)?;
                state.resources = Some(resources);
                state.resumed_on = None;
                trace!(%transaction, ?thread, "suspended coordinated transaction");
            }
            Some(on) => {
                trace!(%transaction, resumed_on = ?on, "transaction resumed elsewhere, not suspending");
            }
            None => {}
        }
        Ok(())
    }

    /// Returns true if the transaction was attached to the calling thread.
    fn resume_locked(
        &self,
        state: &mut MutexGuard<'_, CoordinatorState>,
        force: bool,
    ) -> HandoffResult<bool> {
        let Some(transaction) = state.transaction else {
            return Ok(false);
        };
        if state.resumed_on.is_some() && !force {
            return Ok(false);
        }
        let resources = state
            .resources
            .as_ref()
            .ok_or_else(|| HandoffError::illegal_state("coordinator holds no suspended resources"))?;
        self.manager.resume_transaction(transaction, resources)?;
        let thread = thread::current().id();
        let previous = state.resumed_on.replace(thread);
        trace!(%transaction, ?thread, ?previous, force, "resumed coordinated transaction");
        Ok(true)
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionCoordinator")
            .field("owner", &self.owner)
            .field("transaction", &state.transaction)
            .field("resumed_on", &state.resumed_on)
            .field("last_in_thread", &state.last_in_thread)
            .finish_non_exhaustive()
    }
}

/// Re-suspends on drop so a panicking action does not leave the
/// transaction attached.
struct UnsuspendedScope<'a> {
    coordinator: &'a TransactionCoordinator,
    armed: bool,
}

impl UnsuspendedScope<'_> {
    fn finish(mut self) -> HandoffResult<()> {
        self.armed = false;
        self.coordinator.suspend_if_needed()
    }
}

impl Drop for UnsuspendedScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.coordinator.suspend_if_needed() {
                error!(error = %err, "failed to re-suspend transaction while unwinding");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandoffConfig;
    use crate::manager::{InMemoryTransactionManager, TransactionDefinition, TransactionManager};

    fn setup() -> (Arc<InMemoryTransactionManager>, HandoffContext) {
        let manager = Arc::new(InMemoryTransactionManager::new());
        let ctx = HandoffContext::new(manager.clone(), HandoffConfig::default());
        (manager, ctx)
    }

    #[test]
    fn no_transaction_no_coordinator() {
        let (_manager, ctx) = setup();
        assert!(TransactionCoordinator::get_or_create(&ctx).unwrap().is_none());
        assert_eq!(ctx.open_coordinators(), 0);
    }

    #[test]
    fn get_or_create_suspends_and_reuses() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let tx = status.transaction().unwrap();

        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        assert_eq!(coordinator.transaction(), Some(tx));
        assert!(coordinator.is_suspended());
        assert!(manager.bound_thread(tx).is_none());

        let again = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        assert!(Arc::ptr_eq(&coordinator, &again));
        assert_eq!(ctx.open_coordinators(), 1);

        coordinator.close().unwrap();
        assert_eq!(manager.bound_thread(tx), Some(thread::current().id()));
        assert_eq!(ctx.open_coordinators(), 0);
        manager.commit(status).unwrap();
    }

    #[test]
    fn suspend_resume_cycle_on_owner() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let tx = status.transaction().unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();

        coordinator.resume(false).unwrap();
        assert_eq!(coordinator.resumed_on(), Some(thread::current().id()));
        // Non-forced resume of a resumed transaction is a no-op.
        coordinator.resume(false).unwrap();

        coordinator.suspend_if_needed().unwrap();
        assert!(coordinator.is_suspended());
        // Suspending a suspended transaction is a no-op.
        coordinator.suspend_if_needed().unwrap();
        assert!(manager.bound_thread(tx).is_none());

        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    }

    #[test]
    fn worker_resume_is_forced_and_close_brings_it_back() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let tx = status.transaction().unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        let requester = ConnectorId::new(1);

        thread::scope(|s| {
            s.spawn(|| {
                assert!(coordinator.resume_in_child_thread(requester).unwrap());
                assert_eq!(manager.current_transaction().unwrap(), tx);
                // The owner-side suspend does not touch a worker's transaction.
                coordinator.suspend_if_needed().unwrap();
            });
        });
        assert_ne!(coordinator.resumed_on(), Some(thread::current().id()));
        assert!(!coordinator.is_suspended());

        coordinator.close().unwrap();
        assert_eq!(manager.current_transaction().unwrap(), tx);
        manager.commit(status).unwrap();
    }

    #[test]
    fn owner_thread_resume_is_deferred_for_earlier_connectors() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        let first = ConnectorId::new(1);
        let second = ConnectorId::new(2);

        assert!(coordinator.set_last_in_thread(Some(second), false));
        assert!(!coordinator.set_last_in_thread(Some(first), false));
        assert_eq!(coordinator.last_in_thread(), Some(second));

        assert!(!coordinator.resume_in_child_thread(first).unwrap());
        assert!(coordinator.is_suspended());
        assert!(coordinator.resume_in_child_thread(second).unwrap());
        assert!(!coordinator.is_suspended());

        assert!(coordinator.set_last_in_thread(Some(first), true));
        assert!(!coordinator.release_linked(second));
        assert!(coordinator.release_linked(first));
        assert_eq!(coordinator.last_in_thread(), None);

        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    }

    #[test]
    fn closing_last_linked_connector_hands_over_to_previous() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        let (a, b, c) = (ConnectorId::new(1), ConnectorId::new(2), ConnectorId::new(3));
        coordinator.register_linked(a);
        coordinator.register_linked(b);
        coordinator.register_linked(c);
        assert_eq!(coordinator.last_in_thread(), Some(c));

        // Releasing a connector that is not last leaves the slot alone.
        assert!(!coordinator.release_linked(b));
        assert_eq!(coordinator.last_in_thread(), Some(c));

        assert!(coordinator.release_linked(c));
        assert_eq!(coordinator.last_in_thread(), Some(a));
        assert!(coordinator.resume_in_child_thread(a).unwrap());

        assert!(coordinator.release_linked(a));
        assert_eq!(coordinator.last_in_thread(), None);

        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    }

    #[test]
    fn owner_request_reports_no_resume_while_worker_holds_transaction() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let tx = status.transaction().unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        let last = ConnectorId::new(1);
        coordinator.register_linked(last);

        let worker = thread::scope(|s| {
            s.spawn(|| {
                assert!(coordinator.resume_in_child_thread(last).unwrap());
                thread::current().id()
            })
            .join()
            .unwrap()
        });

        assert!(!coordinator.resume_in_child_thread(last).unwrap());
        assert_eq!(coordinator.resumed_on(), Some(worker));
        assert_eq!(manager.bound_thread(tx), Some(worker));

        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    }

    #[test]
    fn resume_request_after_close_is_rejected() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();
        coordinator.close().unwrap();

        assert!(matches!(
            coordinator.resume_in_child_thread(ConnectorId::new(1)),
            Err(HandoffError::IllegalTransactionState { .. })
        ));
        manager.commit(status).unwrap();
    }

    #[test]
    fn close_from_foreign_thread_is_rejected() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let tx = status.transaction().unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                let err = coordinator.close().unwrap_err();
                assert!(matches!(err, HandoffError::WrongThread { .. }));
            });
        });
        assert!(!coordinator.is_closed());
        assert!(manager.bound_thread(tx).is_none());

        coordinator.close().unwrap();
        coordinator.close().unwrap();
        assert!(coordinator.is_closed());
        manager.commit(status).unwrap();
    }

    #[test]
    fn unsuspended_context_restores_suspension() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let tx = status.transaction().unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();

        let seen = coordinator
            .do_in_unsuspended_context(|| manager.current_transaction())
            .unwrap();
        assert_eq!(seen, tx);
        assert!(coordinator.is_suspended());

        let err = coordinator
            .do_in_unsuspended_context(|| -> HandoffResult<()> {
                Err(HandoffError::manager("boom"))
            })
            .unwrap_err();
        assert!(matches!(err, HandoffError::Manager { .. }));
        assert!(coordinator.is_suspended());

        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    }

    #[test]
    fn unsuspended_context_survives_panic() {
        let (manager, ctx) = setup();
        let status = manager.begin(&TransactionDefinition::default()).unwrap();
        let coordinator = TransactionCoordinator::get_or_create(&ctx).unwrap().unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            coordinator.do_in_unsuspended_context(|| -> HandoffResult<()> { panic!("action") })
        }));
        assert!(outcome.is_err());
        assert!(coordinator.is_suspended());

        coordinator.close().unwrap();
        manager.commit(status).unwrap();
    }

    #[test]
    fn end_of_child_thread_outside_handoff() {
        let (_manager, ctx) = setup();
        assert!(!TransactionCoordinator::on_end_of_child_thread(&ctx, || {}));
    }
}
