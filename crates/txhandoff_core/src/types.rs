//! Core type definitions for transactional handoff.

use std::any::Any;
use std::fmt;

/// Opaque handle identifying an in-flight transaction.
///
/// Handles are assigned by the transaction manager and never inspected by
/// the handoff machinery; they are only passed back to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier of a [`TransactionConnector`](crate::TransactionConnector).
///
/// Unique within one [`HandoffContext`](crate::HandoffContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectorId(pub u64);

impl ConnectorId {
    /// Creates a new connector ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector#{}", self.0)
    }
}

/// Manager-specific state captured when a transaction is suspended.
///
/// Required to resume the same transaction later. The content is owned by
/// the manager that produced it; everyone else treats it as opaque.
pub struct SuspendedResources {
    inner: Box<dyn Any + Send + Sync>,
}

impl SuspendedResources {
    /// Wraps manager-specific suspension state.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Box::new(value),
        }
    }

    /// Returns the wrapped state if it is of type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for SuspendedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedResources").finish_non_exhaustive()
    }
}
