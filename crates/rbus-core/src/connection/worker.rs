//! Worker pool running handlers and reply callbacks.
//!
//! A fixed number of tasks pull from one shared queue. Handler code is
//! user-supplied and synchronous, so every job runs under `catch_unwind`;
//! a panicking handler loses its own job but not the worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job that runs at most once, whoever picks it up.
pub(crate) struct Task {
    name: &'static str,
    job: Mutex<Option<Job>>,
}

impl Task {
    pub(crate) fn new(name: &'static str, job: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            name,
            job: Mutex::new(Some(Box::new(job))),
        })
    }

    /// Runs the job if nobody has yet. Returns `false` if it already ran.
    pub(crate) fn run(&self) -> bool {
        let Some(job) = lock(&self.job).take() else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(task = self.name, "task panicked");
        }
        true
    }
}

pub(crate) struct WorkerPool {
    sender: Mutex<Option<mpsc::UnboundedSender<Arc<Task>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `workers` tasks on the current runtime.
    pub(crate) fn spawn(workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Arc<Task>>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else {
                            break;
                        };
                        task.run();
                    }
                    debug!(worker, "worker exiting");
                })
            })
            .collect();
        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    /// Queues a job. Returns `false` once the pool is shut down.
    pub(crate) fn submit(&self, name: &'static str, job: impl FnOnce() + Send + 'static) -> bool {
        let task = Task::new(name, job);
        lock(&self.sender)
            .as_ref()
            .is_some_and(|sender| sender.send(task).is_ok())
    }

    /// Stops accepting jobs; workers exit after draining the queue.
    pub(crate) fn shutdown(&self) {
        lock(&self.sender).take();
    }

    /// Waits for every worker to exit.
    pub(crate) async fn join(&self) {
        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "worker join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_task_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::new("count", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.run());
        assert!(!task.run());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let task = Task::new("boom", || panic!("handler failure"));
        assert!(task.run());
    }

    #[tokio::test]
    async fn test_pool_drains_before_exit() {
        let pool = WorkerPool::spawn(3);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&count);
            assert!(pool.submit("count", move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.submit("boom", || panic!("ignored"));
        pool.shutdown();
        pool.join().await;
        assert_eq!(count.load(Ordering::SeqCst), 50);
        assert!(!pool.submit("late", || {}));
    }
}
