//! # txhandoff Core
//!
//! Lending a thread's transaction to other threads.
//!
//! Transaction managers bind the ambient transaction to the thread that
//! started it. When part of a unit of work has to run on another thread
//! (a streaming pipeline, a parallel sender, a callback pool), the work on
//! that thread would otherwise run outside the transaction. This crate
//! suspends the transaction on the lending thread, resumes it on the worker,
//! and gives it back to the lender when the handoff ends.
//!
//! ## Building blocks
//!
//! - [`HandoffContext`] - Shared registry of open coordinators and workers
//! - [`TransactionConnector`] - One scoped handoff from a lender thread
//! - [`TransactionCoordinator`] - Long-lived per-thread handoff that
//!   survives several connectors
//! - [`ThreadConnectable`] - Manager capability to suspend and resume the
//!   thread's transaction; synthesized for plain managers by
//!   [`ThreadConnectableManager`]
//! - [`ThreadConnector`] - A connector plus a [`ThreadLifeCycleListener`]
//!   told when the child thread is announced, starts, ends or is cancelled
//! - [`InMemoryTransactionManager`] - Thread-aware manager for tests and
//!   embedding
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use txhandoff_core::{
//!     HandoffConfig, HandoffContext, InMemoryTransactionManager, ThreadConnectable,
//!     TransactionConnector, TransactionDefinition, TransactionManager,
//! };
//!
//! let manager = Arc::new(InMemoryTransactionManager::new());
//! let ctx = HandoffContext::new(manager.clone(), HandoffConfig::default());
//!
//! let status = manager.begin(&TransactionDefinition::default()).unwrap();
//! let tx = status.transaction().unwrap();
//!
//! let connector = TransactionConnector::begin(&ctx).unwrap();
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         let _child = connector.enter_child_thread().unwrap();
//!         assert_eq!(manager.current_transaction().unwrap(), tx);
//!     });
//! });
//! connector.close().unwrap();
//!
//! manager.commit(status).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod context;
mod coordinator;
mod error;
mod manager;
mod synthesize;
mod thread_connector;
mod types;

pub use config::{HandoffConfig, ManagerConfig};
pub use connector::{ChildThreadScope, TransactionConnector};
pub use context::HandoffContext;
pub use coordinator::TransactionCoordinator;
pub use error::{ErrorCategory, HandoffError, HandoffResult};
pub use manager::{
    execute_in_transaction, InMemoryTransactionManager, Propagation, SuspendedTransaction,
    ThreadBinding, ThreadConnectable, TransactionDefinition, TransactionManager,
    TransactionOutcome, TransactionStatus,
};
pub use synthesize::{InheritedTransaction, ThreadConnectableManager};
pub use thread_connector::{
    NoListener, ThreadConnector, ThreadConnectorBuilder, ThreadLifeCycleListener,
};
pub use types::{ConnectorId, SuspendedResources, TransactionId};
