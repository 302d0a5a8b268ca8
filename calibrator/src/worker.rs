//! Worker thread pool for metric computation
//!
//! Tasks go through a bounded channel to a fixed set of worker threads.
//! Each submission returns a [`TaskHandle`]; the caller decides from an
//! [`ExecutionMode`] whether to wait on it immediately or to let several
//! tasks overlap. A task that panics is caught at the task boundary and
//! reported through its handle, so the worker keeps serving the queue.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Whether callers wait for each task before dispatching the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum ExecutionMode {
    /// Tasks of successive grid points may overlap
    #[default]
    Concurrent,
    /// Every dispatched task is joined before the caller continues
    Sequential,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("worker pool shut down before the task completed")]
    Disconnected,
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Completion handle of one submitted task
pub struct TaskHandle<T> {
    receiver: Receiver<Result<T, TaskError>>,
    outcome: Option<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes
    pub fn wait(self) -> Result<T, TaskError> {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        self.receiver
            .recv()
            .unwrap_or(Err(TaskError::Disconnected))
    }

    /// Poll without blocking
    pub fn is_finished(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.outcome = Some(Err(TaskError::Disconnected));
                true
            }
        }
    }
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads sharing a queue of `queue_size` pending tasks
    pub fn new(num_workers: usize, queue_size: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(queue_size.max(1));

        let mut workers = Vec::new();
        for worker_id in 0..num_workers.max(1) {
            let receiver = receiver.clone();

            let handle = std::thread::spawn(move || {
                debug!("Metric worker {} started", worker_id);
                while let Ok(job) = receiver.recv() {
                    job();
                }
                debug!("Metric worker {} shutting down", worker_id);
            });

            workers.push(handle);
        }

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue `task`, blocking while the pending queue is full
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| TaskError::Panicked(panic_message(&payload)));
            let _ = result_tx.send(outcome);
        });

        match &self.sender {
            // a failed send drops the job and its result sender, which the
            // handle reports as Disconnected
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Worker pool is shut down, task dropped");
                }
            }
            None => warn!("Worker pool is shut down, task dropped"),
        }

        TaskHandle {
            receiver: result_rx,
            outcome: None,
        }
    }

    /// Submit `task` and, in sequential mode, wait for it before returning
    pub fn dispatch<T, F>(&self, mode: ExecutionMode, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut handle = self.submit(task);
        if mode == ExecutionMode::Sequential {
            let outcome = handle
                .receiver
                .recv()
                .unwrap_or(Err(TaskError::Disconnected));
            handle.outcome = Some(outcome);
        }
        handle
    }

    /// Stop accepting tasks, drain the queue and join every worker
    pub fn wait_for_completion(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        mem::drop(self.sender.take());

        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.join() {
                warn!("Metric worker {} panicked: {:?}", worker_id, e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_submit_returns_value() {
        let pool = WorkerPool::new(2, 4);
        let handle = pool.submit(|| 21 * 2);
        assert_eq!(handle.wait(), Ok(42));
    }

    #[test]
    fn test_panic_is_contained() {
        let pool = WorkerPool::new(1, 4);

        let failed = pool.submit(|| -> u32 { panic!("bad stack") });
        let after = pool.submit(|| 7u32);

        assert_eq!(failed.wait(), Err(TaskError::Panicked("bad stack".to_string())));
        assert_eq!(after.wait(), Ok(7));
    }

    #[test]
    fn test_sequential_dispatch_completes_before_return() {
        let pool = WorkerPool::new(2, 4);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let mut handle = pool.dispatch(ExecutionMode::Sequential, move || {
            std::thread::sleep(Duration::from_millis(20));
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_wait_for_completion_drains_queue() {
        let pool = WorkerPool::new(3, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = counter.clone();
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_for_completion();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
