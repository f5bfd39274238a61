//! Worker lifecycle around a transaction handoff.
//!
//! A [`ThreadConnector`] is what code that hands work to another thread
//! usually holds: a streaming filter feeding a pipeline on a pool thread,
//! a parallel sender, a transformer running on a callback thread. It
//! combines a [`TransactionConnector`] with an optional
//! [`ThreadLifeCycleListener`] that is told about the child thread: when
//! it is announced on the lender, when it starts, how it ends, and whether
//! it was cancelled before it ever ran.
//!
//! ```text
//!   lender ── build ──────────► announced
//!   worker ── start_thread ───► running
//!   worker ── end_thread / abort_thread ──► finished
//!   lender ── close ──► transaction back on lender (cancel if never started)
//! ```

use crate::connector::TransactionConnector;
use crate::context::HandoffContext;
use crate::error::{HandoffError, HandoffResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

/// Observer of child threads started through a [`ThreadConnector`].
///
/// Request, result and error values pass through the listener, which may
/// replace them. The defaults hand them back unchanged.
pub trait ThreadLifeCycleListener: Send + Sync {
    /// Listener-specific token identifying one announced child thread.
    type Ref: Send + Sync;

    /// Called on the lender when a child thread is announced.
    ///
    /// Returning `None` opts out: the listener hears nothing more about
    /// this thread.
    fn announce_child_thread(&self, owner: &str, correlation_id: Option<&str>) -> Option<Self::Ref>;

    /// Called on the lender when an announced thread is closed without
    /// having started.
    fn cancel_child_thread(&self, reference: &Self::Ref);

    /// Called on the child thread once it has the transaction.
    fn thread_created<R>(&self, reference: &Self::Ref, request: R) -> R {
        let _ = reference;
        request
    }

    /// Called on the child thread when its work completed.
    fn thread_ended<R>(&self, reference: &Self::Ref, result: R) -> R {
        let _ = reference;
        result
    }

    /// Called on the child thread when its work failed.
    fn thread_aborted<E>(&self, reference: &Self::Ref, error: E) -> E {
        let _ = reference;
        error
    }
}

/// Listener that declines every announcement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoListener;

impl ThreadLifeCycleListener for NoListener {
    type Ref = ();

    fn announce_child_thread(&self, _owner: &str, _correlation_id: Option<&str>) -> Option<()> {
        None
    }

    fn cancel_child_thread(&self, _reference: &()) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Announced,
    Running(ThreadId),
    Finished,
}

/// Builder for [`ThreadConnector`].
pub struct ThreadConnectorBuilder<'a, L: ThreadLifeCycleListener = NoListener> {
    owner: String,
    description: Option<String>,
    correlation_id: Option<String>,
    context: Option<&'a HandoffContext>,
    listener: Option<Arc<L>>,
}

impl<'a> ThreadConnectorBuilder<'a, NoListener> {
    /// Starts a connector on behalf of `owner`, the component doing the
    /// handoff.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            description: None,
            correlation_id: None,
            context: None,
            listener: None,
        }
    }
}

impl<'a, L: ThreadLifeCycleListener> ThreadConnectorBuilder<'a, L> {
    /// Sets the description used for the transaction connector in logs.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the correlation id passed to the listener.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Lends the calling thread's transaction through `context`.
    ///
    /// Without a context the connector only reports lifecycle events.
    pub fn context(mut self, context: &'a HandoffContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the lifecycle listener.
    pub fn listener<M: ThreadLifeCycleListener>(
        self,
        listener: Arc<M>,
    ) -> ThreadConnectorBuilder<'a, M> {
        ThreadConnectorBuilder {
            owner: self.owner,
            description: self.description,
            correlation_id: self.correlation_id,
            context: self.context,
            listener: Some(listener),
        }
    }

    /// Announces the child thread and begins the transaction handoff.
    ///
    /// # Errors
    ///
    /// Propagates failures of [`TransactionConnector::begin`]. The
    /// announced thread is cancelled in that case.
    pub fn build(self) -> HandoffResult<ThreadConnector<L>> {
        let reference = self.listener.as_ref().and_then(|listener| {
            listener.announce_child_thread(&self.owner, self.correlation_id.as_deref())
        });

        let description = self
            .description
            .clone()
            .unwrap_or_else(|| self.owner.clone());
        let connector = match self.context {
            Some(context) => {
                match TransactionConnector::begin_with_description(context, description) {
                    Ok(connector) => Some(connector),
                    Err(err) => {
                        if let (Some(listener), Some(reference)) = (&self.listener, &reference) {
                            listener.cancel_child_thread(reference);
                        }
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        debug!(
            owner = %self.owner,
            correlation_id = self.correlation_id.as_deref().unwrap_or(""),
            announced = reference.is_some(),
            lending = connector.as_ref().is_some_and(|c| !c.is_inert()),
            "announced child thread"
        );
        Ok(ThreadConnector {
            owner: self.owner,
            lender: thread::current().id(),
            listener: self.listener,
            reference,
            connector,
            state: Mutex::new(ThreadState::Announced),
        })
    }
}

/// Connects a child thread to its lender: the transaction and the
/// lifecycle listener.
pub struct ThreadConnector<L: ThreadLifeCycleListener = NoListener> {
    owner: String,
    lender: ThreadId,
    listener: Option<Arc<L>>,
    reference: Option<L::Ref>,
    connector: Option<TransactionConnector>,
    state: Mutex<ThreadState>,
}

impl<L: ThreadLifeCycleListener> ThreadConnector<L> {
    /// Takes over the lent transaction on the calling thread and reports
    /// the start to the listener, which may replace `request`.
    ///
    /// # Errors
    ///
    /// See [`TransactionConnector::begin_child_thread`]. The listener is
    /// not told about a thread that could not start.
    pub fn start_thread<R>(&self, request: R) -> HandoffResult<R> {
        let thread = thread::current().id();
        {
            let mut state = self.state.lock();
            if let Some(connector) = &self.connector {
                connector.begin_child_thread()?;
            }
            *state = ThreadState::Running(thread);
        }
        trace!(owner = %self.owner, ?thread, "child thread started");
        Ok(match (&self.listener, &self.reference) {
            (Some(listener), Some(reference)) => listener.thread_created(reference, request),
            _ => request,
        })
    }

    /// Reports a completed child thread. The listener may replace
    /// `result`.
    pub fn end_thread<R>(&self, result: R) -> R {
        let result = match (&self.listener, &self.reference) {
            (Some(listener), Some(reference)) => listener.thread_ended(reference, result),
            _ => result,
        };
        self.finish("ended");
        result
    }

    /// Reports a failed child thread. The listener may replace `error`.
    pub fn abort_thread<E>(&self, error: E) -> E {
        let error = match (&self.listener, &self.reference) {
            (Some(listener), Some(reference)) => listener.thread_aborted(reference, error),
            _ => error,
        };
        self.finish("aborted");
        error
    }

    /// Ends the handoff on the lender.
    ///
    /// A thread that was announced but never started is cancelled with the
    /// listener. Closing twice does nothing more.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::WrongThread`] if called from a thread other than
    ///   the lender; nothing is cancelled or closed in that case.
    /// - Failures of [`TransactionConnector::close`].
    pub fn close(&self) -> HandoffResult<()> {
        if thread::current().id() != self.lender {
            return Err(HandoffError::wrong_thread("ThreadConnector::close", self.lender));
        }
        {
            let mut state = self.state.lock();
            if *state == ThreadState::Announced {
                if let (Some(listener), Some(reference)) = (&self.listener, &self.reference) {
                    listener.cancel_child_thread(reference);
                    debug!(owner = %self.owner, "cancelled child thread that never started");
                }
                *state = ThreadState::Finished;
            }
        }
        match &self.connector {
            Some(connector) => connector.close(),
            None => Ok(()),
        }
    }

    /// Returns the owner name given at creation.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the transaction connector; `None` if built without a
    /// context.
    #[must_use]
    pub fn connector(&self) -> Option<&TransactionConnector> {
        self.connector.as_ref()
    }

    /// Returns the thread currently running the work, if any.
    #[must_use]
    pub fn child_thread(&self) -> Option<ThreadId> {
        match *self.state.lock() {
            ThreadState::Running(thread) => Some(thread),
            ThreadState::Announced | ThreadState::Finished => None,
        }
    }

    /// Returns true once the child thread ended, aborted or was cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.state.lock() == ThreadState::Finished
    }

    fn finish(&self, how: &'static str) {
        if let Some(connector) = &self.connector {
            connector.end_child_thread();
        }
        *self.state.lock() = ThreadState::Finished;
        trace!(owner = %self.owner, thread = ?thread::current().id(), how, "child thread finished");
    }
}

impl<L: ThreadLifeCycleListener> std::fmt::Debug for ThreadConnector<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadConnector")
            .field("owner", &self.owner)
            .field("lender", &self.lender)
            .field("announced", &self.reference.is_some())
            .field("state", &*self.state.lock())
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}
