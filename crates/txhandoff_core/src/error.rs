//! Error types for transactional handoff.

use crate::types::TransactionId;
use std::thread::ThreadId;
use thiserror::Error;

/// Result type for handoff operations.
pub type HandoffResult<T> = Result<T, HandoffError>;

/// Broad classification of a [`HandoffError`].
///
/// Nothing in this crate retries. The category tells surrounding code
/// whether a failure points at a bug, at a deployment problem, or at the
/// transactional resource itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Misuse of the API (wrong thread, double suspend, mismatched holder).
    Programming,
    /// The system was wired up with something it cannot work with.
    Configuration,
    /// Failure reported by the underlying transaction manager.
    Environmental,
}

/// Errors that can occur while lending a transaction between threads.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The calling thread has no transaction of its own and none to inherit.
    #[error("no active transaction on the calling thread")]
    NoActiveTransaction,

    /// An owner-only operation was invoked from another thread.
    #[error("{operation} must be called from {owner:?}, but was called from {caller:?}")]
    WrongThread {
        /// The operation that was rejected.
        operation: &'static str,
        /// The thread that created the object.
        owner: ThreadId,
        /// The thread that attempted the call.
        caller: ThreadId,
    },

    /// Suspend was called twice without an intervening resume.
    #[error("transaction {transaction} is already suspended")]
    AlreadySuspended {
        /// The transaction concerned.
        transaction: TransactionId,
    },

    /// Suspend was called on a thread the transaction is not attached to.
    #[error("transaction {transaction} is not active on the calling thread")]
    NotActiveOnThread {
        /// The transaction concerned.
        transaction: TransactionId,
    },

    /// The resource holder does not belong to the transaction being resumed.
    #[error("suspended resources do not match transaction {transaction}")]
    ResourceMismatch {
        /// The transaction concerned.
        transaction: TransactionId,
    },

    /// The calling thread already has a different transaction attached.
    #[error("cannot attach {requested}: thread already runs {bound}")]
    ThreadAlreadyBound {
        /// The transaction currently attached to the thread.
        bound: TransactionId,
        /// The transaction that was to be attached.
        requested: TransactionId,
    },

    /// The manager offers no thread-binding introspection to wrap.
    #[error("transaction manager kind '{kind}' cannot be made thread-connectable")]
    UnsupportedManagerKind {
        /// The kind reported by the manager.
        kind: String,
    },

    /// The requested propagation is not allowed in the current state.
    #[error("illegal transaction state: {message}")]
    IllegalTransactionState {
        /// Description of the violation.
        message: String,
    },

    /// The transaction outlived its timeout and was rolled back.
    #[error("transaction {transaction} timed out and was rolled back")]
    TransactionTimedOut {
        /// The transaction concerned.
        transaction: TransactionId,
    },

    /// The transaction was already committed or rolled back.
    #[error("transaction {transaction} is already completed")]
    TransactionCompleted {
        /// The transaction concerned.
        transaction: TransactionId,
    },

    /// The manager has no record of this transaction.
    #[error("unknown transaction {transaction}")]
    UnknownTransaction {
        /// The transaction concerned.
        transaction: TransactionId,
    },

    /// A propagation attribute could not be parsed.
    #[error("invalid propagation attribute '{value}'")]
    InvalidPropagation {
        /// The rejected attribute value.
        value: String,
    },

    /// Failure raised by the underlying transaction manager.
    #[error("transaction manager error: {message}")]
    Manager {
        /// Description of the failure.
        message: String,
    },
}

impl HandoffError {
    /// Creates a wrong-thread error for `operation` owned by `owner`.
    pub fn wrong_thread(operation: &'static str, owner: ThreadId) -> Self {
        Self::WrongThread {
            operation,
            owner,
            caller: std::thread::current().id(),
        }
    }

    /// Creates an illegal transaction state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalTransactionState {
            message: message.into(),
        }
    }

    /// Creates an unsupported manager kind error.
    pub fn unsupported_manager(kind: impl Into<String>) -> Self {
        Self::UnsupportedManagerKind { kind: kind.into() }
    }

    /// Creates a manager error.
    pub fn manager(message: impl Into<String>) -> Self {
        Self::Manager {
            message: message.into(),
        }
    }

    /// Returns the category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedManagerKind { .. } | Self::InvalidPropagation { .. } => {
                ErrorCategory::Configuration
            }
            Self::WrongThread { .. }
            | Self::AlreadySuspended { .. }
            | Self::NotActiveOnThread { .. }
            | Self::ResourceMismatch { .. }
            | Self::ThreadAlreadyBound { .. }
            | Self::IllegalTransactionState { .. }
            | Self::TransactionCompleted { .. }
            | Self::UnknownTransaction { .. } => ErrorCategory::Programming,
            Self::NoActiveTransaction | Self::TransactionTimedOut { .. } | Self::Manager { .. } => {
                ErrorCategory::Environmental
            }
        }
    }

    /// Returns true if this error must abort the unit of work outright.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Environmental)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        let owner = std::thread::current().id();
        assert_eq!(
            HandoffError::wrong_thread("close", owner).category(),
            ErrorCategory::Programming
        );
        assert_eq!(
            HandoffError::unsupported_manager("jdbc").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            HandoffError::manager("connection reset").category(),
            ErrorCategory::Environmental
        );
    }

    #[test]
    fn fatal_errors() {
        assert!(HandoffError::AlreadySuspended {
            transaction: TransactionId::new(1)
        }
        .is_fatal());
        assert!(HandoffError::unsupported_manager("x").is_fatal());
        assert!(!HandoffError::manager("broken pipe").is_fatal());
    }

    #[test]
    fn error_display() {
        let err = HandoffError::ResourceMismatch {
            transaction: TransactionId::new(7),
        };
        assert_eq!(
            err.to_string(),
            "suspended resources do not match transaction txn:7"
        );

        let err = HandoffError::unsupported_manager("opaque");
        assert!(err.to_string().contains("opaque"));
    }
}
