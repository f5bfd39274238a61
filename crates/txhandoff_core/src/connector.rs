//! Scoped transaction lending.
//!
//! A [`TransactionConnector`] lends the lender thread's transaction to work
//! running on other threads for the duration of one handoff:
//!
//! 1. The lender calls [`TransactionConnector::begin`]. The transaction is
//!    suspended, either by the connector itself or by the thread's open
//!    [`TransactionCoordinator`].
//! 2. Every worker calls [`begin_child_thread`](TransactionConnector::begin_child_thread)
//!    before touching transactional resources and
//!    [`end_child_thread`](TransactionConnector::end_child_thread) afterwards.
//! 3. The lender calls [`close`](TransactionConnector::close). The
//!    transaction is active on the lender again.
//!
//! Workers never complete the transaction; commit and rollback stay with
//! the lender.

use crate::context::HandoffContext;
use crate::coordinator::TransactionCoordinator;
use crate::error::{HandoffError, HandoffResult};
use crate::types::{ConnectorId, SuspendedResources, TransactionId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
struct ConnectorState {
    transaction: Option<TransactionId>,
    /// Present only when the connector suspended the transaction itself.
    resources: Option<SuspendedResources>,
    needs_resume_on_close: bool,
    closed: bool,
}

/// Lends a transaction from its creating thread to worker threads.
pub struct TransactionConnector {
    id: ConnectorId,
    owner: ThreadId,
    description: Option<String>,
    context: HandoffContext,
    coordinator: Option<Arc<TransactionCoordinator>>,
    state: Mutex<ConnectorState>,
}

impl TransactionConnector {
    /// Opens a handoff of the calling thread's transaction.
    ///
    /// - If the thread has an open coordinator, the connector links to it
    ///   and becomes last in thread, as the most recent handoff.
    /// - Otherwise, if the thread has an active transaction, the connector
    ///   suspends it and resumes it on close.
    /// - Otherwise the connector is inert: every later call is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates failures of the manager while querying or suspending.
    pub fn begin(context: &HandoffContext) -> HandoffResult<Self> {
        Self::open(context, None)
    }

    /// Like [`begin`](Self::begin), with a description used in logs.
    ///
    /// # Errors
    ///
    /// Propagates failures of the manager while querying or suspending.
    pub fn begin_with_description(
        context: &HandoffContext,
        description: impl Into<String>,
    ) -> HandoffResult<Self> {
        Self::open(context, Some(description.into()))
    }

    fn open(context: &HandoffContext, description: Option<String>) -> HandoffResult<Self> {
        let id = context.next_connector_id();
        let coordinator = context
            .coordinator_for_current_thread()
            .filter(|coordinator| !coordinator.is_closed());

        let state = match &coordinator {
            Some(coordinator) => {
                coordinator.register_linked(id);
                ConnectorState {
                    transaction: coordinator.transaction(),
                    resources: None,
                    needs_resume_on_close: false,
                    closed: false,
                }
            }
            None => match context.manager().active_transaction()? {
                Some(transaction) => {
                    let resources = context.manager().suspend_transaction(transaction)?;
                    ConnectorState {
                        transaction: Some(transaction),
                        resources: Some(resources),
                        needs_resume_on_close: true,
                        closed: false,
                    }
                }
                None => ConnectorState {
                    transaction: None,
                    resources: None,
                    needs_resume_on_close: false,
                    closed: false,
                },
            },
        };

        debug!(
            connector = %id,
            description = description.as_deref().unwrap_or(""),
            transaction = ?state.transaction,
            linked = coordinator.is_some(),
            "began transaction handoff"
        );
        Ok(Self {
            id,
            owner: thread::current().id(),
            description,
            context: context.clone(),
            coordinator,
            state: Mutex::new(state),
        })
    }

    /// Makes the lent transaction active on the calling thread.
    ///
    /// Inert connectors do nothing. When linked to a coordinator the
    /// request goes through
    /// [`TransactionCoordinator::resume_in_child_thread`], which may defer
    /// it on the owner thread.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::IllegalTransactionState`] if the connector or its
    ///   coordinator is already closed.
    /// - Failures of the manager while resuming.
    pub fn begin_child_thread(&self) -> HandoffResult<()> {
        let thread = thread::current().id();
        let state = self.state.lock();
        if state.closed {
            return Err(HandoffError::illegal_state(format!(
                "{} is closed; its transaction is back with the lender",
                self.id
            )));
        }
        let Some(transaction) = state.transaction else {
            trace!(connector = %self.id, "inert connector, nothing to lend");
            return Ok(());
        };

        match &self.coordinator {
            Some(coordinator) => {
                coordinator.resume_in_child_thread(self.id)?;
            }
            None => {
                let resources = state.resources.as_ref().ok_or_else(|| {
                    HandoffError::illegal_state("connector holds no suspended resources")
                })?;
                self.context
                    .manager()
                    .resume_transaction(transaction, resources)?;
            }
        }
        drop(state);

        self.context.enter_child(thread, self.id);
        trace!(connector = %self.id, %transaction, ?thread, "child thread began");
        Ok(())
    }

    /// Marks the end of a worker's use of the transaction.
    ///
    /// Deliberately does nothing: the transaction stays resumed on the
    /// worker until the lender closes the connector.
    pub fn end_child_thread(&self) {
        trace!(connector = %self.id, thread = ?thread::current().id(), "child thread ended");
    }

    /// Calls [`begin_child_thread`](Self::begin_child_thread) and returns a
    /// guard that calls [`end_child_thread`](Self::end_child_thread) when
    /// dropped.
    ///
    /// # Errors
    ///
    /// See [`begin_child_thread`](Self::begin_child_thread).
    pub fn enter_child_thread(&self) -> HandoffResult<ChildThreadScope<'_>> {
        self.begin_child_thread()?;
        Ok(ChildThreadScope { connector: self })
    }

    /// Closes the handoff and returns the transaction to the lender.
    ///
    /// Resumes the transaction on the lender if the connector suspended it,
    /// then runs the end-of-child-thread actions registered by its workers.
    /// A linked connector unregisters from its coordinator, handing
    /// last-in-thread to the most recent connector still open; the
    /// coordinator keeps the transaction. Closing twice does nothing.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::WrongThread`] if called from a thread other than
    ///   the lender. No manager call is made in that case.
    /// - Failures of the manager while resuming; the connector then stays
    ///   open.
    pub fn close(&self) -> HandoffResult<()> {
        if thread::current().id() != self.owner {
            return Err(HandoffError::wrong_thread(
                "TransactionConnector::close",
                self.owner,
            ));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if state.needs_resume_on_close {
                if let (Some(transaction), Some(resources)) =
                    (state.transaction, state.resources.as_ref())
                {
                    self.context
                        .manager()
                        .resume_transaction(transaction, resources)?;
                }
                state.needs_resume_on_close = false;
            }
            state.resources = None;
            state.closed = true;
        }

        if let Some(coordinator) = &self.coordinator {
            coordinator.release_linked(self.id);
        }
        let actions = self.context.release_connector(self.id);
        let pending = actions.len();
        for action in actions {
            action();
        }
        debug!(connector = %self.id, end_actions = pending, "closed transaction handoff");
        Ok(())
    }

    /// Returns the connector's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Returns the lender thread.
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Returns the description given at creation.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the lent transaction; `None` for inert connectors.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.state.lock().transaction
    }

    /// Returns true if there was no transaction to lend.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.state.lock().transaction.is_none()
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the coordinator this connector is linked to, if any.
    #[must_use]
    pub fn coordinator(&self) -> Option<&Arc<TransactionCoordinator>> {
        self.coordinator.as_ref()
    }
}

impl Drop for TransactionConnector {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.closed || state.transaction.is_none() {
            return;
        }
        if thread::current().id() != self.owner {
            warn!(
                connector = %self.id,
                "connector dropped off the lender thread without close"
            );
            return;
        }
        if !self.context.config().close_on_drop {
            warn!(connector = %self.id, "connector dropped without close");
            return;
        }
        if let Err(err) = self.close() {
            error!(connector = %self.id, error = %err, "failed to close connector on drop");
        }
    }
}

impl std::fmt::Debug for TransactionConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionConnector")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("description", &self.description)
            .field("transaction", &state.transaction)
            .field("linked", &self.coordinator.is_some())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`TransactionConnector::enter_child_thread`].
#[must_use = "dropping the scope immediately ends the child thread"]
pub struct ChildThreadScope<'a> {
    connector: &'a TransactionConnector,
}

impl ChildThreadScope<'_> {
    /// Returns the connector this scope belongs to.
    #[must_use]
    pub fn connector(&self) -> &TransactionConnector {
        self.connector
    }
}

impl Drop for ChildThreadScope<'_> {
    fn drop(&mut self) {
        self.connector.end_child_thread();
    }
}
