//! Test fixtures and handoff helpers.
//!
//! Provides a handoff context wired to a recording in-memory manager, and
//! helpers for the common "lend a transaction, then take it back" scenario.

use crate::recording::RecordingManager;
use std::sync::Arc;
use txhandoff_core::{
    HandoffConfig, HandoffContext, InMemoryTransactionManager, ThreadConnectable,
    TransactionConnector, TransactionDefinition, TransactionId, TransactionManager,
    TransactionStatus,
};

/// Manager type used by the fixtures.
pub type TestManager = RecordingManager<InMemoryTransactionManager>;

/// A handoff context over a recording in-memory manager.
pub struct TestHandoff {
    /// The recording manager.
    pub manager: Arc<TestManager>,
    /// The context wired to `manager`.
    pub context: HandoffContext,
}

impl TestHandoff {
    /// Creates a fixture with default configuration.
    pub fn new() -> Self {
        Self::with_config(HandoffConfig::new().name("test"))
    }

    /// Creates a fixture with the given configuration.
    pub fn with_config(config: HandoffConfig) -> Self {
        let manager = Arc::new(RecordingManager::new(InMemoryTransactionManager::new()));
        let context = HandoffContext::new(manager.clone(), config);
        Self { manager, context }
    }

    /// Begins a transaction on the calling thread.
    pub fn begin(&self) -> TransactionStatus {
        self.manager
            .begin(&TransactionDefinition::default())
            .expect("Failed to begin transaction")
    }

    /// Returns the calling thread's transaction, if any.
    pub fn current(&self) -> Option<TransactionId> {
        self.manager
            .active_transaction()
            .expect("Failed to query current transaction")
    }

    /// Returns the in-memory manager behind the recorder.
    pub fn reference(&self) -> &InMemoryTransactionManager {
        self.manager.inner()
    }
}

impl Default for TestHandoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a [`TestHandoff`] with default configuration.
pub fn lender_context() -> TestHandoff {
    TestHandoff::new()
}

/// Runs a test with a transaction lent through a fresh connector.
///
/// Begins a transaction on the calling thread, opens a connector, and calls
/// `f` with the fixture, the connector and the transaction. Afterwards the
/// connector is closed (if `f` did not close it) and the transaction is
/// committed on the calling thread.
///
/// # Example
///
/// ```rust,ignore
/// use txhandoff_testkit::with_lent_transaction;
///
/// #[test]
/// fn my_test() {
///     with_lent_transaction(|handoff, connector, tx| {
///         assert_eq!(connector.transaction(), Some(tx));
///         assert_eq!(handoff.current(), None);
///     });
/// }
/// ```
pub fn with_lent_transaction<F, R>(f: F) -> R
where
    F: FnOnce(&TestHandoff, &Arc<TransactionConnector>, TransactionId) -> R,
{
    let handoff = TestHandoff::new();
    let status = handoff.begin();
    let transaction = status.transaction().expect("Transaction was not started");
    let connector = Arc::new(
        TransactionConnector::begin(&handoff.context).expect("Failed to begin connector"),
    );

    let result = f(&handoff, &connector, transaction);

    connector.close().expect("Failed to close connector");
    handoff
        .manager
        .commit(status)
        .expect("Failed to commit lent transaction");
    result
}
