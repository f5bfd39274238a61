//! Long-lived worker threads driven over a channel.
//!
//! A [`WorkerThread`] runs the closures it is given one at a time on the
//! same OS thread, in the order they are sent. Tests use it to place
//! individual handoff calls on a specific thread at a specific point of an
//! interleaving, and to simulate a pooled thread that is reused for
//! unrelated work.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send>;

/// A reusable worker thread executing closures on request.
pub struct WorkerThread {
    name: String,
    thread_id: ThreadId,
    sender: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns a worker thread named `name`.
    pub fn spawn(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("Failed to spawn worker thread");
        Self {
            name: name.to_string(),
            thread_id: handle.thread().id(),
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Returns the worker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the worker's thread identity.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Runs `f` on the worker and waits for its result.
    ///
    /// A panic inside `f` is re-raised on the calling thread; the worker
    /// itself stays usable.
    pub fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, result) = mpsc::channel::<Result<R, Box<dyn Any + Send>>>();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = reply.send(outcome);
        });
        self.sender
            .as_ref()
            .expect("Worker already shut down")
            .send(job)
            .expect("Worker thread exited");
        match result.recv().expect("Worker dropped the job") {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Stops the worker after its pending jobs and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

/// Spawns `count` workers named `{prefix}-{index}`.
pub fn spawn_workers(prefix: &str, count: usize) -> Vec<WorkerThread> {
    (0..count)
        .map(|index| WorkerThread::spawn(&format!("{prefix}-{index}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_jobs_on_the_same_thread() {
        let worker = WorkerThread::spawn("reused");
        let first = worker.run(|| thread::current().id());
        let second = worker.run(|| thread::current().id());
        assert_eq!(first, second);
        assert_eq!(first, worker.thread_id());
        assert_ne!(first, thread::current().id());
        assert_eq!(worker.run(|| 40 + 2), 42);
        worker.shutdown();
    }

    #[test]
    fn panics_are_reraised_and_worker_survives() {
        let worker = WorkerThread::spawn("panicky");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run(|| panic!("job failed"))));
        assert!(outcome.is_err());
        assert_eq!(worker.run(|| 1), 1);
    }

    #[test]
    fn spawn_workers_names_threads() {
        let workers = spawn_workers("pool", 2);
        assert_eq!(workers[1].name(), "pool-1");
        let name = workers[0].run(|| thread::current().name().map(str::to_string));
        assert_eq!(name.as_deref(), Some("pool-0"));
    }
}
