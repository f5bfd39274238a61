//! Stress tests for transaction handoff.
//!
//! These tests lend transactions to many workers at once, with random
//! jitter between steps, and verify that every transaction ends up back on
//! its lender and commits.

use crate::fixtures::TestHandoff;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use txhandoff_core::{
    HandoffResult, TransactionConnector, TransactionCoordinator, TransactionManager,
};

/// Outcome of a stress run, one entry per lend/return round.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    /// Rounds whose transaction came back to the lender and committed.
    pub passed: usize,
    /// Rounds with a failed step or a transaction left elsewhere.
    pub failed: usize,
    /// Wall-clock time of the whole run.
    pub duration: Duration,
}

impl StressReport {
    /// Total rounds run.
    #[must_use]
    pub fn rounds(&self) -> usize {
        self.passed + self.failed
    }

    /// Rounds completed per second.
    #[must_use]
    pub fn rounds_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.rounds() as f64 / secs
        } else {
            0.0
        }
    }

    /// Renders the report as JSON, for collecting runs across machines.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Failed to serialize stress report")
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of lend/return rounds.
    pub rounds: usize,
    /// Number of concurrent workers per round.
    pub workers: usize,
    /// Upper bound of the random pause before each worker step.
    pub max_jitter: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            rounds: 200,
            workers: 4,
            max_jitter: Duration::from_micros(200),
        }
    }
}

fn jitter(max: Duration) {
    let micros = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
    if micros == 0 {
        return;
    }
    let pause = rand::thread_rng().gen_range(0..=micros);
    thread::sleep(Duration::from_micros(pause));
}

/// Lends one transaction per round to `config.workers` concurrent workers.
///
/// A round succeeds if every step succeeds, the transaction is back on the
/// lender after close, and it commits.
pub fn stress_concurrent_lending(handoff: &TestHandoff, config: &StressConfig) -> StressReport {
    run_rounds(handoff, config, |handoff, config| {
        let status = handoff.begin();
        let transaction = status.transaction();
        let connector = TransactionConnector::begin(&handoff.context)?;
        let failures = lend_to_workers(&connector, config);
        connector.close()?;
        let returned = handoff.current() == transaction;
        handoff.manager.commit(status)?;
        Ok(failures == 0 && returned)
    })
}

/// Like [`stress_concurrent_lending`], but through a coordinator with a
/// fresh connector per round of workers.
pub fn stress_coordinated_lending(handoff: &TestHandoff, config: &StressConfig) -> StressReport {
    run_rounds(handoff, config, |handoff, config| {
        let status = handoff.begin();
        let transaction = status.transaction();
        let Some(coordinator) = TransactionCoordinator::get_or_create(&handoff.context)? else {
            return Ok(false);
        };
        let mut failures = 0;
        for _ in 0..2 {
            let connector = TransactionConnector::begin(&handoff.context)?;
            failures += lend_to_workers(&connector, config);
            connector.close()?;
        }
        coordinator.close()?;
        let returned = handoff.current() == transaction;
        let clean = handoff.context.open_coordinators() == 0;
        handoff.manager.commit(status)?;
        Ok(failures == 0 && returned && clean)
    })
}

fn lend_to_workers(connector: &TransactionConnector, config: &StressConfig) -> usize {
    let failures = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..config.workers {
            s.spawn(|| {
                jitter(config.max_jitter);
                if connector.begin_child_thread().is_err() {
                    failures.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                jitter(config.max_jitter);
                connector.end_child_thread();
            });
        }
    });
    failures.into_inner()
}

fn run_rounds<F>(handoff: &TestHandoff, config: &StressConfig, round: F) -> StressReport
where
    F: Fn(&TestHandoff, &StressConfig) -> HandoffResult<bool>,
{
    let start = Instant::now();
    let mut report = StressReport {
        passed: 0,
        failed: 0,
        duration: Duration::ZERO,
    };

    for _ in 0..config.rounds {
        match round(handoff, config) {
            Ok(true) => report.passed += 1,
            Ok(false) => report.failed += 1,
            Err(err) => {
                debug!(error = %err, "stress round failed");
                report.failed += 1;
            }
        }
    }

    report.duration = start.elapsed();
    debug!(
        passed = report.passed,
        failed = report.failed,
        rounds_per_second = report.rounds_per_second(),
        "stress run finished"
    );
    report
}
