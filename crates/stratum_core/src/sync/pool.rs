//! # Worker Pool
//!
//! Fixed-size pool of worker threads fed through a crossbeam channel.
//!
//! A job is only queued once every handle it depends on has completed, so
//! a worker never blocks waiting on another job and the pool cannot
//! deadlock regardless of its size. A panicking job is caught, logged and
//! still releases its handle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use super::handle::{when_all, JobHandle};
use crate::error::{StoreError, StoreResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads.
pub struct JobPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    /// Starts `threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// [`StoreError::WorkerSpawn`] if a thread cannot be started.
    pub fn new(threads: usize) -> StoreResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let worker = std::thread::Builder::new()
                .name(format!("stratum-worker-{index}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .map_err(|e| StoreError::WorkerSpawn(e.to_string()))?;
            workers.push(worker);
        }
        tracing::info!(threads, "job pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Runs `run` on a worker once every dependency of `handle` has
    /// completed, then signals `handle`.
    pub fn submit(&self, handle: JobHandle, run: impl FnOnce() + Send + 'static) {
        let Some(sender) = self.sender.clone() else {
            handle.signal(true);
            return;
        };
        let deps = handle.dependencies();
        when_all(&deps, move || {
            let job = handle.clone();
            let task: Task = Box::new(move || {
                let outcome = catch_unwind(AssertUnwindSafe(run));
                if outcome.is_err() {
                    tracing::error!(job = %job.id(), "job panicked");
                }
                job.signal(outcome.is_err());
            });
            if sender.send(task).is_err() {
                tracing::error!(job = %handle.id(), "job pool shut down before job could run");
                handle.signal(true);
            }
        });
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            // Tasks catch their own panics, so a worker never unwinds.
            let _ = worker.join();
        }
        tracing::info!("job pool stopped");
    }
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool").field("threads", &self.workers.len()).finish()
    }
}
