//! # txhandoff Testkit
//!
//! Test utilities for txhandoff.
//!
//! This crate provides:
//! - Fixtures wiring a recording manager into a handoff context
//! - A call-recording manager decorator
//! - Long-lived worker threads driven over a channel, for deterministic
//!   cross-thread interleavings and thread reuse
//! - Property-based test generators and a handoff script runner
//! - Stress testing utilities
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txhandoff_testkit::prelude::*;
//!
//! #[test]
//! fn lends_to_worker() {
//!     with_lent_transaction(|handoff, connector, tx| {
//!         let worker = WorkerThread::spawn("worker");
//!         let c = connector.clone();
//!         worker.run(move || c.begin_child_thread()).unwrap();
//!         // ... assertions
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod recording;
pub mod scenario;
pub mod stress;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::recording::*;
    pub use crate::scenario::*;
    pub use crate::stress::*;
    pub use crate::worker::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use recording::*;
pub use scenario::*;
pub use stress::*;
pub use worker::*;
