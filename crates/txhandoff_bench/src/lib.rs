//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::Rng;
use std::sync::Arc;
use txhandoff_core::{HandoffConfig, HandoffContext, InMemoryTransactionManager};

/// Creates an in-memory manager and a context around it.
pub fn fresh_context() -> (Arc<InMemoryTransactionManager>, HandoffContext) {
    let manager = Arc::new(InMemoryTransactionManager::new());
    let context = HandoffContext::new(manager.clone(), HandoffConfig::new().name("bench"));
    (manager, context)
}

/// Generates a random sequence of worker indices below `workers`.
pub fn random_worker_sequence(len: usize, workers: usize) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(0..workers.max(1))).collect()
}
